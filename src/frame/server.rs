//! Frame server
//!
//! Accepts plaintext companion connections and decodes each one in its own
//! task until end of stream or a fatal error. A connection that sends
//! nothing for the idle timeout is closed, so stalled clients release their
//! connection slot.

use log::{debug, error, info, warn};
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::common::{bind_listener, drain_tasks, Result, ShutdownSignal, TapError};
use crate::config::TapConfig;
use super::{FrameDecoder, FrameHandler};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listener for length-prefixed companion traffic
pub struct FrameServer {
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
    max_frame_len: usize,
    max_connections: usize,
    idle_timeout: Duration,
    shutdown_grace: Duration,
}

impl FrameServer {
    /// Bind `frame_listen` with limits from the configuration
    pub fn bind(config: &TapConfig, handler: Arc<dyn FrameHandler>) -> Result<Self> {
        let addr = config
            .frame_listen
            .ok_or_else(|| TapError::Config("frame_listen is not set".to_string()))?;
        let server = Self::from_listener(bind_listener(addr)?, handler)
            .with_max_frame_len(config.max_frame_len)
            .with_max_connections(config.max_frame_connections)
            .with_idle_timeout(config.frame_idle_timeout())
            .with_shutdown_grace(config.shutdown_grace());
        Ok(server)
    }

    /// Serve on an existing listener with default limits
    pub fn from_listener(listener: TcpListener, handler: Arc<dyn FrameHandler>) -> Self {
        let defaults = TapConfig::default();
        Self {
            listener,
            handler,
            max_frame_len: defaults.max_frame_len,
            max_connections: defaults.max_frame_connections,
            idle_timeout: defaults.frame_idle_timeout(),
            shutdown_grace: defaults.shutdown_grace(),
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, then drain open connections
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.max_connections));
        let mut tasks = JoinSet::new();

        info!(
            "Frame server listening on {} (max {} connections, max frame {} bytes, idle timeout {:?})",
            self.listener.local_addr()?,
            self.max_connections,
            self.max_frame_len,
            self.idle_timeout
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Frame connection task failed: {}", e);
                }
            }

            let permit = tokio::select! {
                _ = shutdown.wait() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting frame connection: {}", e);
                        sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&self.handler);
            let (max_frame_len, idle_timeout) = (self.max_frame_len, self.idle_timeout);
            tasks.spawn(async move {
                let _permit = permit;
                let served = serve_connection(stream, peer, handler.as_ref(), max_frame_len, idle_timeout).await;
                if let Err(e) = served {
                    warn!("Frame connection {} closed: {}", peer, e);
                }
            });
        }

        drop(self.listener);
        drain_tasks(tasks, self.shutdown_grace, "frame connection").await;
        Ok(())
    }
}

/// Decode one connection until end of stream
///
/// Length mismatches go to the handler and decoding continues. A read that
/// delivers nothing within `idle_timeout` ends the connection with
/// [`TapError::IoTimeout`]. Returns the number of frames decoded, or the
/// fatal error that ended the connection.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    handler: &dyn FrameHandler,
    max_frame_len: usize,
    idle_timeout: Duration,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    handler.on_connect(peer);
    let mut decoder = FrameDecoder::with_max_frame_len(stream, max_frame_len).with_read_timeout(idle_timeout);

    let result = loop {
        match decoder.next_frame().await {
            Ok(Some(frame)) => {
                counter!("companion_tap.frames.decoded").increment(1);
                handler.on_frame(peer, frame);
            }
            Ok(None) => break Ok(decoder.frames_decoded()),
            Err(TapError::FrameLengthMismatch { declared, partial }) => {
                counter!("companion_tap.frames.length_mismatch").increment(1);
                handler.on_length_mismatch(peer, declared, partial);
            }
            Err(e) => break Err(e),
        }
    };

    debug!("Frame connection {} finished after {} frames", peer, decoder.frames_decoded());
    handler.on_disconnect(peer, decoder.frames_decoded());
    result
}
