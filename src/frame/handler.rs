//! Frame consumers

use bytes::Bytes;
use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::sync::mpsc;

use crate::common::hex_dump;
use super::Frame;

/// Receives what a frame connection produces
///
/// Called from the connection's task, so implementations must not block.
pub trait FrameHandler: Send + Sync {
    /// A companion device connected
    fn on_connect(&self, _peer: SocketAddr) {}

    /// A complete frame arrived
    fn on_frame(&self, peer: SocketAddr, frame: Frame);

    /// The stream ended partway through a payload
    fn on_length_mismatch(&self, peer: SocketAddr, declared: u32, partial: Bytes) {
        warn!(
            "{}: frame declared {} bytes but stream ended after {}",
            peer,
            declared,
            partial.len()
        );
    }

    /// The connection closed; `frames` is the number decoded
    fn on_disconnect(&self, _peer: SocketAddr, _frames: u64) {}
}

/// Logs each frame's size, with a hex dump at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFrames;

impl FrameHandler for LogFrames {
    fn on_connect(&self, peer: SocketAddr) {
        info!("Companion connected from {}", peer);
    }

    fn on_frame(&self, peer: SocketAddr, frame: Frame) {
        info!("{}: frame {} ({} bytes)", peer, frame.index(), frame.len());
        debug!("{}: {}", peer, hex_dump(frame.payload()));
    }

    fn on_disconnect(&self, peer: SocketAddr, frames: u64) {
        info!("Companion {} disconnected after {} frames", peer, frames);
    }
}

/// What [`ForwardFrames`] delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Connected(SocketAddr),
    Frame(SocketAddr, Frame),
    LengthMismatch { peer: SocketAddr, declared: u32, partial: Bytes },
    Disconnected { peer: SocketAddr, frames: u64 },
}

/// Forwards every event into a channel
///
/// Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ForwardFrames {
    sender: mpsc::UnboundedSender<FrameEvent>,
}

impl ForwardFrames {
    /// Handler plus the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FrameEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: FrameEvent) {
        if self.sender.send(event).is_err() {
            debug!("Frame event receiver dropped");
        }
    }
}

impl FrameHandler for ForwardFrames {
    fn on_connect(&self, peer: SocketAddr) {
        self.send(FrameEvent::Connected(peer));
    }

    fn on_frame(&self, peer: SocketAddr, frame: Frame) {
        self.send(FrameEvent::Frame(peer, frame));
    }

    fn on_length_mismatch(&self, peer: SocketAddr, declared: u32, partial: Bytes) {
        self.send(FrameEvent::LengthMismatch { peer, declared, partial });
    }

    fn on_disconnect(&self, peer: SocketAddr, frames: u64) {
        self.send(FrameEvent::Disconnected { peer, frames });
    }
}
