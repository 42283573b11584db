//! Per-session capture sink

use log::{debug, warn};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{Direction, MemoryCapture};

enum Target {
    Disabled,
    File { path: PathBuf, file: Option<File> },
    Memory(MemoryCapture),
}

/// Append-only destination for one session's relayed bytes
///
/// The file is opened on the first append and kept open until [`close`] or
/// drop. A failing capture is logged once and then disabled for the rest of
/// the session; it never fails the relay.
///
/// [`close`]: CaptureSink::close
pub struct CaptureSink {
    target: Target,
    failed: bool,
    captured: [u64; 2],
}

impl CaptureSink {
    /// Sink that records nothing
    pub fn disabled() -> Self {
        Self::with_target(Target::Disabled)
    }

    /// Sink appending to `path`, created lazily
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_target(Target::File { path: path.into(), file: None })
    }

    /// Sink recording into memory
    pub fn memory(capture: MemoryCapture) -> Self {
        Self::with_target(Target::Memory(capture))
    }

    /// Sink at `<prefix><session id>`, or disabled without a prefix
    pub fn for_session(prefix: Option<&str>, session_id: impl std::fmt::Display) -> Self {
        match prefix {
            Some(prefix) => Self::file(format!("{}{}", prefix, session_id)),
            None => Self::disabled(),
        }
    }

    fn with_target(target: Target) -> Self {
        Self {
            target,
            failed: false,
            captured: [0; 2],
        }
    }

    /// Artifact path, if this sink writes to a file
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Whether bytes are still being recorded
    pub fn is_active(&self) -> bool {
        !self.failed && !matches!(self.target, Target::Disabled)
    }

    /// Bytes successfully captured for `direction`
    pub fn captured(&self, direction: Direction) -> u64 {
        self.captured[direction.index()]
    }

    /// Append a relayed chunk
    pub async fn append(&mut self, direction: Direction, bytes: &[u8]) {
        if bytes.is_empty() || self.failed {
            return;
        }

        let result = match &mut self.target {
            Target::Disabled => return,
            Target::Memory(capture) => {
                capture.record(direction, bytes);
                Ok(())
            }
            Target::File { path, file } => append_to_file(path, file, bytes).await,
        };

        match result {
            Ok(()) => self.captured[direction.index()] += bytes.len() as u64,
            Err(e) => {
                warn!(
                    "Capture to {} failed, disabling capture for this session: {}",
                    self.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    e
                );
                self.failed = true;
            }
        }
    }

    /// Flush and release the artifact
    pub async fn close(&mut self) {
        if let Target::File { path, file } = &mut self.target {
            if let Some(mut f) = file.take() {
                if let Err(e) = f.flush().await {
                    warn!("Failed to flush capture {}: {}", path.display(), e);
                }
                if let Err(e) = f.sync_data().await {
                    debug!("Failed to sync capture {}: {}", path.display(), e);
                }
            }
        }
    }
}

async fn append_to_file(path: &Path, file: &mut Option<File>, bytes: &[u8]) -> std::io::Result<()> {
    if file.is_none() {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let opened = OpenOptions::new().create(true).append(true).open(path).await?;
        debug!("Opened capture artifact {}", path.display());
        *file = Some(opened);
    }

    if let Some(f) = file.as_mut() {
        f.write_all(bytes).await?;
        f.flush().await?;
    }
    Ok(())
}
