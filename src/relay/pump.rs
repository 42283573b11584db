//! Byte pumps between the decrypted client and upstream streams
//!
//! Two strategies are provided:
//!
//! - [`pump_duplex`] runs each direction as its own read/write loop. A read
//!   only times out once the whole session has been idle for the deadline.
//! - [`pump_alternating`] alternates half-duplex drain phases. A phase ends
//!   when a read returns fewer bytes than the chunk size. That rule is a
//!   pacing approximation: a read that exactly fills the buffer looks like
//!   "more pending" and keeps the phase going, which can starve the other
//!   direction. Every read is bounded by the deadline.
//!
//! In both, bytes are appended to the capture sink as each write to the peer
//! completes, so the capture holds exactly what the peer accepted, even when
//! a write stalls partway through a chunk. When one direction of
//! [`pump_duplex`] ends, the other stops at its next read; a chunk it is
//! already writing is finished or timed out first.

use log::{debug, trace};
use metrics::counter;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, timeout_at, Instant};

use crate::capture::{CaptureSink, Direction};
use crate::common::TapError;

/// Fine-grained relay step, the stage marker while relaying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ClientRead,
    UpstreamWrite,
    UpstreamRead,
    ClientWrite,
}

impl Step {
    /// Human readable step name
    pub fn as_str(self) -> &'static str {
        match self {
            Step::ClientRead => "client read",
            Step::UpstreamWrite => "upstream write",
            Step::UpstreamRead => "upstream read",
            Step::ClientWrite => "client write",
        }
    }

    fn for_direction(direction: Direction) -> (Step, Step) {
        match direction {
            Direction::ClientToUpstream => (Step::ClientRead, Step::UpstreamWrite),
            Direction::UpstreamToClient => (Step::UpstreamRead, Step::ClientWrite),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which peer ended the relay by closing its side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Upstream,
}

/// Pump parameters shared by both strategies
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    /// Maximum bytes per read
    pub chunk_size: usize,
    /// Deadline for one read or write
    pub io_timeout: Duration,
}

/// Result of a relay that ended by peer closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    pub closed_by: ClosedBy,
    /// Bytes forwarded, indexed like [`Direction::ALL`]
    pub forwarded: [u64; 2],
}

impl PumpOutcome {
    /// Bytes forwarded in `direction`
    pub fn forwarded(&self, direction: Direction) -> u64 {
        self.forwarded[direction.index()]
    }
}

/// A relay that ended by error, with the step that failed
#[derive(Debug)]
pub struct RelayFailure {
    pub step: Step,
    pub error: TapError,
    /// Bytes forwarded before the failure
    pub forwarded: [u64; 2],
}

impl fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

/// Per-session counters and last-activity clock
struct Activity {
    last: StdMutex<Instant>,
    forwarded: [AtomicU64; 2],
}

impl Activity {
    fn new() -> Self {
        Self {
            last: StdMutex::new(Instant::now()),
            forwarded: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    fn last(&self) -> Instant {
        self.last.lock().map(|last| *last).unwrap_or_else(|_| Instant::now())
    }

    fn add(&self, direction: Direction, n: usize) {
        self.forwarded[direction.index()].fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> [u64; 2] {
        [
            self.forwarded[0].load(Ordering::Relaxed),
            self.forwarded[1].load(Ordering::Relaxed),
        ]
    }
}

fn timed_out(step: Step, after: Duration) -> TapError {
    TapError::IoTimeout { stage: step.as_str(), after }
}

async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], step: Step, after: Duration) -> Result<usize, TapError>
where
    R: AsyncRead + Unpin,
{
    match timeout(after, reader.read(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(timed_out(step, after)),
    }
}

/// Write `bytes` to the peer, capturing each slice the peer accepts
///
/// The whole chunk shares one deadline. On failure the bytes already written
/// stay counted and captured.
async fn write_captured<W>(
    writer: &mut W,
    bytes: &[u8],
    direction: Direction,
    capture: &Mutex<&mut CaptureSink>,
    activity: &Activity,
    step: Step,
    after: Duration,
) -> Result<(), TapError>
where
    W: AsyncWrite + Unpin,
{
    let deadline = Instant::now().checked_add(after);
    let mut written = 0;

    while written < bytes.len() {
        let n = match with_deadline(deadline, writer.write(&bytes[written..])).await {
            Some(Ok(0)) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(timed_out(step, after)),
        };
        activity.touch();
        activity.add(direction, n);
        record_forwarded(direction, n);
        capture.lock().await.append(direction, &bytes[written..written + n]).await;
        written += n;
    }

    match with_deadline(deadline, writer.flush()).await {
        Some(result) => Ok(result?),
        None => Err(timed_out(step, after)),
    }
}

/// Run `future` until `deadline`; no deadline means no limit
async fn with_deadline<F: std::future::Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

fn record_forwarded(direction: Direction, n: usize) {
    counter!("companion_tap.relay.bytes", "direction" => direction.label()).increment(n as u64);
}

/// Relay both directions concurrently until either peer closes or fails
pub async fn pump_duplex<C, U>(
    client: &mut C,
    upstream: &mut U,
    capture: &mut CaptureSink,
    settings: PumpSettings,
) -> Result<PumpOutcome, RelayFailure>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (client_reader, client_writer) = tokio::io::split(client);
    let (upstream_reader, upstream_writer) = tokio::io::split(upstream);
    let capture = Mutex::new(capture);
    let activity = Activity::new();
    let (stop, stopped) = watch::channel(false);

    let client_to_upstream = forward(
        client_reader,
        upstream_writer,
        Direction::ClientToUpstream,
        &capture,
        &activity,
        stopped.clone(),
        settings,
    );
    let upstream_to_client = forward(
        upstream_reader,
        client_writer,
        Direction::UpstreamToClient,
        &capture,
        &activity,
        stopped,
        settings,
    );
    tokio::pin!(client_to_upstream);
    tokio::pin!(upstream_to_client);

    let (result, closed_by) = tokio::select! {
        r = &mut client_to_upstream => (r, ClosedBy::Client),
        r = &mut upstream_to_client => (r, ClosedBy::Upstream),
    };

    // Let the other direction finish the chunk it is writing
    let _ = stop.send(true);
    let rest = match closed_by {
        ClosedBy::Client => upstream_to_client.await,
        ClosedBy::Upstream => client_to_upstream.await,
    };
    if let Err((step, error)) = rest {
        debug!("{} failed while stopping: {}", step, error);
    }

    let forwarded = activity.snapshot();
    match result {
        Ok(()) => Ok(PumpOutcome { closed_by, forwarded }),
        Err((step, error)) => Err(RelayFailure { step, error, forwarded }),
    }
}

/// One direction of [`pump_duplex`]
///
/// Returns when the reader reaches EOF, or when `stop` is raised while it
/// waits for a read.
async fn forward<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    capture: &Mutex<&mut CaptureSink>,
    activity: &Activity,
    mut stop: watch::Receiver<bool>,
    settings: PumpSettings,
) -> Result<(), (Step, TapError)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (read_step, write_step) = Step::for_direction(direction);
    let mut buf = vec![0u8; settings.chunk_size];

    loop {
        let n = loop {
            let deadline = activity.last().checked_add(settings.io_timeout);
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    trace!("{} stopped", direction);
                    return Ok(());
                }
                read = with_deadline(deadline, reader.read(&mut buf)) => match read {
                    Some(result) => break result.map_err(|e| (read_step, TapError::from(e)))?,
                    // The other direction moved data meanwhile; keep waiting
                    None if !idle_expired(activity, settings.io_timeout) => continue,
                    None => return Err((read_step, timed_out(read_step, settings.io_timeout))),
                },
            }
        };

        if n == 0 {
            debug!("{} reached end of stream", direction);
            return Ok(());
        }
        trace!("{}: {} bytes", direction, n);

        write_captured(&mut writer, &buf[..n], direction, capture, activity, write_step, settings.io_timeout)
            .await
            .map_err(|e| (write_step, e))?;
    }
}

fn idle_expired(activity: &Activity, io_timeout: Duration) -> bool {
    match activity.last().checked_add(io_timeout) {
        Some(deadline) => deadline <= Instant::now(),
        None => false,
    }
}

/// Relay with alternating half-duplex drain phases
pub async fn pump_alternating<C, U>(
    client: &mut C,
    upstream: &mut U,
    capture: &mut CaptureSink,
    settings: PumpSettings,
) -> Result<PumpOutcome, RelayFailure>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; settings.chunk_size];
    let capture = Mutex::new(capture);
    let activity = Activity::new();

    loop {
        for direction in Direction::ALL {
            let phase = match direction {
                Direction::ClientToUpstream => {
                    drain(&mut *client, &mut *upstream, direction, &mut buf, &capture, &activity, settings).await
                }
                Direction::UpstreamToClient => {
                    drain(&mut *upstream, &mut *client, direction, &mut buf, &capture, &activity, settings).await
                }
            };

            match phase {
                Ok(Phase::Drained) => {}
                Ok(Phase::Closed) => {
                    let closed_by = match direction {
                        Direction::ClientToUpstream => ClosedBy::Client,
                        Direction::UpstreamToClient => ClosedBy::Upstream,
                    };
                    return Ok(PumpOutcome { closed_by, forwarded: activity.snapshot() });
                }
                Err((step, error)) => {
                    return Err(RelayFailure { step, error, forwarded: activity.snapshot() });
                }
            }
        }
    }
}

enum Phase {
    /// A short read ended the phase
    Drained,
    /// The reader reached EOF
    Closed,
}

/// Forward reads from `reader` until a short read or EOF
async fn drain<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    buf: &mut [u8],
    capture: &Mutex<&mut CaptureSink>,
    activity: &Activity,
    settings: PumpSettings,
) -> Result<Phase, (Step, TapError)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (read_step, write_step) = Step::for_direction(direction);
    let mut bytes = 0usize;

    loop {
        let n = read_chunk(reader, buf, read_step, settings.io_timeout)
            .await
            .map_err(|e| (read_step, e))?;

        if n == 0 {
            debug!("{} reached end of stream", direction);
            return Ok(Phase::Closed);
        }

        write_captured(writer, &buf[..n], direction, capture, activity, write_step, settings.io_timeout)
            .await
            .map_err(|e| (write_step, e))?;
        bytes += n;

        if n < buf.len() {
            trace!("{} drained after {} bytes", direction, bytes);
            return Ok(Phase::Drained);
        }
    }
}
