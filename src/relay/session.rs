//! Relay session lifecycle
//!
//! `UpstreamConnecting → UpstreamHandshaking → ClientHandshaking → Relaying → Closed`
//!
//! A failure in any state goes straight to `Closed`. Teardown happens in one
//! place, [`Session::teardown`], which runs once on every exit path and
//! releases both stream handles and the capture handle.

use log::{debug, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::capture::{CaptureSink, Direction};
use crate::common::{TapError, Result};
use crate::config::RelayMode;
use super::pump::{pump_alternating, pump_duplex, PumpOutcome, PumpSettings, Step};
use super::RelayContext;

/// Deadline for sending close_notify on teardown
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Process-local session identifier, also the capture artifact suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Diagnostic stage marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    UpstreamConnecting,
    UpstreamHandshaking,
    ClientHandshaking,
    Relaying(Option<Step>),
    Closed,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStage::UpstreamConnecting => write!(f, "upstream connecting"),
            SessionStage::UpstreamHandshaking => write!(f, "upstream handshaking"),
            SessionStage::ClientHandshaking => write!(f, "client handshaking"),
            SessionStage::Relaying(None) => write!(f, "relaying"),
            SessionStage::Relaying(Some(step)) => write!(f, "relaying ({})", step),
            SessionStage::Closed => write!(f, "closed"),
        }
    }
}

/// What a finished session reports to the accept loop
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    pub peer: SocketAddr,
    /// Stage the session was in when it ended
    pub final_stage: SessionStage,
    /// `Ok` when the relay ended by peer closure
    pub result: Result<PumpOutcome>,
    /// Bytes forwarded, indexed like [`Direction::ALL`]
    pub forwarded: [u64; 2],
    pub duration: Duration,
}

impl SessionReport {
    /// Whether the session reached the relaying stage
    pub fn relayed(&self) -> bool {
        matches!(self.final_stage, SessionStage::Relaying(_))
    }
}

/// One intercepted client connection
pub struct Session<C> {
    id: SessionId,
    peer: SocketAddr,
    stage: SessionStage,
    client: Option<SslStream<C>>,
    upstream: Option<SslStream<TcpStream>>,
    capture: CaptureSink,
    forwarded: [u64; 2],
    torn_down: bool,
}

impl<C> Session<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session; nothing is opened yet
    pub fn new(id: SessionId, peer: SocketAddr, capture: CaptureSink) -> Self {
        Self {
            id,
            peer,
            stage: SessionStage::UpstreamConnecting,
            client: None,
            upstream: None,
            capture,
            forwarded: [0; 2],
            torn_down: false,
        }
    }

    /// Run the session to completion
    ///
    /// Never returns an error: every failure is folded into the report.
    pub async fn run(mut self, ctx: &RelayContext, client: C) -> SessionReport {
        let started = Instant::now();

        let result = match self.establish(ctx, client).await {
            Ok(()) => self.relay(ctx).await,
            Err(e) => Err(e),
        };
        let final_stage = self.stage;

        match &result {
            Ok(outcome) => info!(
                "Session {} ({}) closed by {:?}: {} bytes up, {} bytes down",
                self.id,
                self.peer,
                outcome.closed_by,
                outcome.forwarded(Direction::ClientToUpstream),
                outcome.forwarded(Direction::UpstreamToClient),
            ),
            Err(e) => warn!("Session {} ({}) failed during {}: {}", self.id, self.peer, final_stage, e),
        }

        self.teardown().await;

        SessionReport {
            id: self.id,
            peer: self.peer,
            final_stage,
            result,
            forwarded: self.forwarded,
            duration: started.elapsed(),
        }
    }

    /// Connect upstream first, then accept the client
    ///
    /// An upstream failure aborts before the client handshake, so the client
    /// only sees its TCP connection close.
    async fn establish(&mut self, ctx: &RelayContext, client: C) -> Result<()> {
        self.stage = SessionStage::UpstreamConnecting;
        let tcp = ctx.connector.dial().await?;

        self.stage = SessionStage::UpstreamHandshaking;
        self.upstream = Some(ctx.connector.handshake(tcp).await?);
        debug!("Session {}: upstream {} ready", self.id, ctx.connector.target());

        self.stage = SessionStage::ClientHandshaking;
        self.client = Some(ctx.terminator.accept(client).await?);
        debug!("Session {}: client {} handshake complete", self.id, self.peer);

        Ok(())
    }

    async fn relay(&mut self, ctx: &RelayContext) -> Result<PumpOutcome> {
        let (client, upstream) = match (self.client.as_mut(), self.upstream.as_mut()) {
            (Some(client), Some(upstream)) => (client, upstream),
            _ => return Err(TapError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session streams not established",
            ))),
        };
        self.stage = SessionStage::Relaying(None);

        let settings = PumpSettings {
            chunk_size: ctx.config.chunk_size,
            io_timeout: ctx.config.io_timeout(),
        };
        let pumped = match ctx.config.relay_mode {
            RelayMode::Duplex => pump_duplex(client, upstream, &mut self.capture, settings).await,
            RelayMode::Alternating => pump_alternating(client, upstream, &mut self.capture, settings).await,
        };

        match pumped {
            Ok(outcome) => {
                self.forwarded = outcome.forwarded;
                Ok(outcome)
            }
            Err(failure) => {
                self.forwarded = failure.forwarded;
                self.stage = SessionStage::Relaying(Some(failure.step));
                Err(failure.error)
            }
        }
    }

    /// Release both stream handles and the capture handle
    ///
    /// Idempotent; the handles are taken out so they are closed only once.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.stage = SessionStage::Closed;

        if let Some(mut client) = self.client.take() {
            close_quietly(&mut client, "client", self.id).await;
        }
        if let Some(mut upstream) = self.upstream.take() {
            close_quietly(&mut upstream, "upstream", self.id).await;
        }
        self.capture.close().await;

        if let Some(path) = self.capture.path() {
            debug!(
                "Session {}: captured {} + {} bytes to {}",
                self.id,
                self.capture.captured(Direction::ClientToUpstream),
                self.capture.captured(Direction::UpstreamToClient),
                path.display()
            );
        }
    }
}

async fn close_quietly<S>(stream: &mut S, side: &str, id: SessionId)
where
    S: AsyncWrite + Unpin,
{
    match timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Session {}: {} shutdown: {}", id, side, e),
        Err(_) => debug!("Session {}: {} shutdown timed out", id, side),
    }
}
