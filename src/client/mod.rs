//! Session layer
//!
//! The public face of the crate: `SessionBuilder` configures a session
//! against a `ServerProfile`, `Session` runs the protocol.

pub mod builder;
pub mod error;
pub mod session;

pub use builder::{DEFAULT_REQUEST_TIMEOUT, ServerProfile, SessionBuilder, SessionConfig};
pub use error::SessionError;
pub use session::{Session, SessionState};
