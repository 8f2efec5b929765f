pub mod client;
pub mod core;
pub mod gateway;

pub use client::{Session, SessionId, SessionRegistry};
pub use core::{cache::SharedCache, config::ClientConfig, errors::ClientError, types::*};
pub use gateway::{DispatchEvent, EventContext, EventName, SessionState, SessionStatus};
