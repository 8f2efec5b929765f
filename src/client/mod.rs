pub mod registry;
pub mod session;

pub use registry::{SessionId, SessionRegistry};
pub use session::Session;
