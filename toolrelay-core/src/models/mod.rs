pub mod channel;
pub mod envelope;
pub mod frame;
pub mod id;

pub use envelope::{HeaderField, RequestEnvelope, ResponseEnvelope};
pub use frame::{CloseReason, ControlFrame, SessionNotice};
pub use id::{RequestId, SessionId};
