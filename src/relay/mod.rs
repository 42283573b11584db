//! TLS interception relay
//!
//! Each accepted client gets its own session: the relay opens a TLS
//! connection to the fixed upstream, terminates the client's handshake with
//! the configured identity, then pumps decrypted bytes between the two while
//! teeing them into the session's capture sink.

mod pump;
mod server;
mod session;

pub use pump::{pump_alternating, pump_duplex, ClosedBy, PumpOutcome, PumpSettings, RelayFailure, Step};
pub use server::{RelayContext, RelayServer};
pub use session::{Session, SessionId, SessionReport, SessionStage};
