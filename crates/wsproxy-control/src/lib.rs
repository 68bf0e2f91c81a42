//! Session lifecycle and the process-wide session registry
pub mod hub;
pub mod session;

pub use hub::{Hub, HubError};
pub use session::{Session, SessionError, SessionState};
