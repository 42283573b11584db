//! Length-prefixed frame decoder
//!
//! Wire format: `[u32 big-endian length L][L payload bytes]`, repeated, with
//! no handshake and no delimiter. `L == 0` is an empty message.

use bytes::Bytes;
use futures::stream::{self, Stream};
use log::{debug, trace};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::common::{Result, TapError};

/// Size of the length prefix
pub const PREFIX_LEN: usize = 4;

/// One decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    index: u64,
    payload: Bytes,
}

impl Frame {
    /// Arrival position within its stream, starting at 0
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Pulls frames off a byte stream
///
/// Partial reads are reassembled for both the prefix and the payload, so the
/// stream may deliver a frame in arbitrary pieces.
pub struct FrameDecoder<R> {
    reader: R,
    max_frame_len: usize,
    read_timeout: Option<Duration>,
    next_index: u64,
}

impl<R> FrameDecoder<R>
where
    R: AsyncRead + Unpin,
{
    /// Decoder accepting payloads up to `u32::MAX` bytes
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_len(reader, u32::MAX as usize)
    }

    /// Decoder rejecting frames declared larger than `max_frame_len`
    pub fn with_max_frame_len(reader: R, max_frame_len: usize) -> Self {
        Self {
            reader,
            max_frame_len,
            read_timeout: None,
            next_index: 0,
        }
    }

    /// Fail a read that delivers nothing for `read_timeout`
    ///
    /// Expiry yields [`TapError::IoTimeout`], which is fatal.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` at end of stream, including when the stream ends
    /// partway through a prefix. A stream ending partway through a payload
    /// yields [`TapError::FrameLengthMismatch`] with the bytes obtained; the
    /// decoder stays usable and the following call reports end of stream.
    /// [`TapError::FrameTooLarge`] leaves the payload unread and is fatal.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let declared = match self.read_prefix().await? {
            Some(declared) => declared,
            None => return Ok(None),
        };

        if declared as usize > self.max_frame_len {
            return Err(TapError::FrameTooLarge { declared, max: self.max_frame_len });
        }

        let payload = if declared == 0 {
            Bytes::new()
        } else {
            self.read_payload(declared).await?
        };

        let index = self.next_index;
        self.next_index += 1;
        trace!("Frame {}: {} bytes", index, payload.len());
        Ok(Some(Frame { index, payload }))
    }

    async fn read_prefix(&mut self) -> Result<Option<u32>> {
        let mut prefix = [0u8; PREFIX_LEN];
        let mut filled = 0;

        while filled < PREFIX_LEN {
            let n = self.read_some(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled > 0 {
                    debug!("Stream ended inside a length prefix ({} of {} bytes)", filled, PREFIX_LEN);
                }
                return Ok(None);
            }
            filled += n;
        }

        Ok(Some(u32::from_be_bytes(prefix)))
    }

    async fn read_payload(&mut self, declared: u32) -> Result<Bytes> {
        let mut payload = vec![0u8; declared as usize];
        let mut filled = 0;

        while filled < payload.len() {
            let n = self.read_some(&mut payload[filled..]).await?;
            if n == 0 {
                payload.truncate(filled);
                return Err(TapError::FrameLengthMismatch {
                    declared,
                    partial: Bytes::from(payload),
                });
            }
            filled += n;
        }

        Ok(Bytes::from(payload))
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let after = match self.read_timeout {
            Some(after) => after,
            None => return Ok(self.reader.read(buf).await?),
        };
        match timeout(after, self.reader.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TapError::IoTimeout { stage: "frame read", after }),
        }
    }

    /// Frames decoded so far
    pub fn frames_decoded(&self) -> u64 {
        self.next_index
    }

    /// Consume the decoder as a stream of frames
    ///
    /// The stream ends at end of input or after yielding a fatal error.
    /// Length mismatches are yielded as `Err` items without ending it.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame>> {
        stream::unfold(Some(self), |state| async move {
            let mut decoder = state?;
            match decoder.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(decoder))),
                Ok(None) => None,
                Err(e) if e.is_recoverable() => Some((Err(e), Some(decoder))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
