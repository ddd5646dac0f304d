//! Session registry and the per-session request workers

mod registry;
mod worker;

pub use registry::{SessionInfo, SessionRegistry, SessionState};
