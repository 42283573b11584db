//! Session capture
//!
//! Every byte relayed by a session is also appended to that session's
//! capture artifact, a plain append-only file at `<capture_prefix><session id>`.
//! Both directions share the one artifact; within a direction bytes appear in
//! relay order.

mod memory;
mod sink;

pub use memory::MemoryCapture;
pub use sink::CaptureSink;

use std::fmt;

/// Direction of a relayed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Decrypted client bytes forwarded to the upstream
    ClientToUpstream,
    /// Decrypted upstream bytes forwarded to the client
    UpstreamToClient,
}

impl Direction {
    /// Both directions, client side first
    pub const ALL: [Direction; 2] = [Direction::ClientToUpstream, Direction::UpstreamToClient];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::ClientToUpstream => 0,
            Direction::UpstreamToClient => 1,
        }
    }

    /// Short label used in logs and metric names
    pub fn label(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client -> upstream"),
            Direction::UpstreamToClient => write!(f, "upstream -> client"),
        }
    }
}
