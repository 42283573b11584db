//! Common module
//!
//! This module contains shared errors and utility functions used throughout the application.

pub mod error;
pub mod log;
pub mod net;
pub mod shutdown;

// Re-export commonly used types and functions
pub use error::{TapError, Result};
pub use log::{init_logger, hex_dump};
pub use net::{bind_listener, parse_socket_addr};
pub use shutdown::{drain_tasks, shutdown_channel, ShutdownSignal, ShutdownTrigger};
