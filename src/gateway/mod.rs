pub mod codec;
pub mod dispatcher;
pub mod events;
pub mod heartbeat;
pub mod machine;
pub mod protocol;
pub mod session;
pub mod url;

pub use codec::GatewayCodec;
pub use dispatcher::{callback, CallbackTable, DispatchEvent, EventCallback, EventContext};
pub use events::EventName;
pub use machine::{SessionMachine, SessionState, SessionStatus};
pub use protocol::{CloseCode, GatewayPayload, OpCode};
pub use session::{GatewayHandle, GatewaySession, SessionCommand};
pub use url::GatewayUrlCache;
