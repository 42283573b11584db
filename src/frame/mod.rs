//! Companion frame protocol
//!
//! A plaintext side channel carrying `[u32 BE length][payload]` messages.
//! Only frame boundaries are located; payloads are handed on unparsed.

mod decoder;
mod handler;
mod server;

pub use decoder::{Frame, FrameDecoder, PREFIX_LEN};
pub use handler::{ForwardFrames, FrameEvent, FrameHandler, LogFrames};
pub use server::{serve_connection, FrameServer};
