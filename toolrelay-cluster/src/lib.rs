pub mod broker;
pub mod error;
pub mod handler;
pub mod relay;
pub mod session;
pub mod stream;
pub mod transport;

pub use broker::{Broker, MemoryBroker, RedisBroker, SharedBroker, Subscription};
pub use error::{BrokerError, RelayError};
pub use handler::{ProtocolHandler, SessionContext, SharedHandler};
pub use relay::{PendingState, Relay, RelayResponse};
pub use session::{SessionInfo, SessionRegistry, SessionState};
pub use stream::{StreamConfig, StreamSession, StreamState};
pub use transport::{
    response_channel, CompletionError, LiveResponse, ResponseHandle, ResponseWriter,
    TransportKind, TransportRequest,
};
