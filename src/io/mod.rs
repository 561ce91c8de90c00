//! I/O layer - Generic abstractions for process management and transport
//!
//! This module provides fundamental I/O abstractions that are not specific
//! to any protocol:
//!
//! - **Transport**: Pure I/O layer for bidirectional byte-stream exchange
//! - **Process**: External process lifecycle management with stdio integration

pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use process::{ChildProcessManager, ProcessError, ProcessState, StopMode};
pub use transport::{MockTransport, StreamTransport, Transport};
