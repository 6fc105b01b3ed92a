//! Length-prefixed byte-stream framing.
//!
//! A framed stream is the concatenation of `[u32 len][bytes]` elements
//! (big-endian length). Writers frame on append; readers stream one frame
//! at a time without loading the whole file.
//!
//! Three entry points:
//!
//! - [`to_bytes`] — frame an iterator of encodable items into one buffer.
//! - [`iter_frames`] — stream frames out of an in-memory slice.
//! - [`ByteStream`] — stream frames out of a file through a fixed-size
//!   read buffer, tolerating frames that straddle buffer boundaries. The
//!   file handle is released on drop.
//!
//! # Truncation semantics
//!
//! A stream that ends mid-length-prefix terminates cleanly (the trailing
//! bytes are an incomplete prefix of a frame that was never fully
//! written). A stream that ends mid-payload is corrupt and fails loudly
//! with [`FrameError::Truncated`].

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::trace;

use crate::encoding::{self, Encode};

const LEN_PREFIX_SIZE: usize = 4;

/// Errors produced while reading a framed stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding failure while framing an element.
    #[error("Encoding error: {0}")]
    Encoding(#[from] encoding::EncodingError),

    /// The stream ended in the middle of a frame payload.
    #[error("truncated frame: expected {expected} payload bytes, found {found}")]
    Truncated {
        /// Payload length announced by the prefix.
        expected: usize,
        /// Payload bytes actually present.
        found: usize,
    },

    /// A frame length exceeded the configured bound.
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
}

/// Frame every item of `items` into a single buffer.
pub fn to_bytes<T, I>(items: I) -> Result<Vec<u8>, FrameError>
where
    T: Encode,
    I: IntoIterator<Item = T>,
{
    let mut out = Vec::new();
    for item in items {
        let bytes = encoding::encode_to_vec(&item)?;
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Append one pre-encoded frame to `buf`.
pub fn push_frame(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

// ------------------------------------------------------------------------------------------------
// In-memory frame iterator
// ------------------------------------------------------------------------------------------------

/// Stream frames out of an in-memory slice.
///
/// Yields each frame's payload as a sub-slice; no copying.
pub fn iter_frames(buf: &[u8]) -> FrameIter<'_> {
    FrameIter { buf, offset: 0 }
}

/// Iterator over frames in a byte slice. See [`iter_frames`].
#[derive(Debug)]
pub struct FrameIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<&'a [u8], FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.buf.len() - self.offset;
        if remaining < LEN_PREFIX_SIZE {
            // an incomplete length prefix terminates the stream cleanly
            return None;
        }
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[self.offset..self.offset + LEN_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;
        let start = self.offset + LEN_PREFIX_SIZE;
        if self.buf.len() - start < len {
            self.offset = self.buf.len();
            return Some(Err(FrameError::Truncated {
                expected: len,
                found: self.buf.len() - start,
            }));
        }
        self.offset = start + len;
        Some(Ok(&self.buf[start..start + len]))
    }
}

// ------------------------------------------------------------------------------------------------
// File-backed frame stream
// ------------------------------------------------------------------------------------------------

/// Streaming reader over a framed file.
///
/// Reads the file through a fixed-size buffer, yielding each frame's
/// payload as an owned `Vec<u8>`. Frames may straddle buffer boundaries;
/// the reader carries the partial bytes over. Dropping the stream (or
/// calling [`ByteStream::close`]) releases the OS handle.
pub struct ByteStream {
    file: Option<File>,
    path: PathBuf,
    buffer: Vec<u8>,
    /// Unconsumed bytes carried over from previous reads.
    pending: Vec<u8>,
    /// Set once the file has been read to EOF.
    exhausted: bool,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("path", &self.path)
            .field("pending", &self.pending.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl ByteStream {
    /// Open a framed file for streaming with the given read-buffer size.
    pub fn open<P: AsRef<Path>>(path: P, buffer_size: usize) -> Result<ByteStream, FrameError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        trace!(path = %path.display(), buffer_size, "byte stream opened");
        Ok(ByteStream {
            file: Some(file),
            path,
            buffer: vec![0u8; buffer_size.max(LEN_PREFIX_SIZE)],
            pending: Vec::new(),
            exhausted: false,
        })
    }

    /// Release the underlying file handle. Further iteration yields only
    /// what is already buffered.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            trace!(path = %self.path.display(), "byte stream closed");
        }
        self.exhausted = true;
    }

    /// Pull more bytes from the file into `pending`. Returns false at EOF.
    fn refill(&mut self) -> Result<bool, FrameError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        let n = file.read(&mut self.buffer)?;
        if n == 0 {
            self.exhausted = true;
            self.file = None;
            return Ok(false);
        }
        self.pending.extend_from_slice(&self.buffer[..n]);
        Ok(true)
    }
}

impl Iterator for ByteStream {
    type Item = Result<Vec<u8>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Accumulate until a full length prefix is available.
        while self.pending.len() < LEN_PREFIX_SIZE {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    // trailing bytes shorter than a prefix: clean end
                    return None;
                }
                Err(e) => return Some(Err(e)),
            }
        }
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        prefix.copy_from_slice(&self.pending[..LEN_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;

        // Accumulate the payload, which may span several buffer reads.
        while self.pending.len() < LEN_PREFIX_SIZE + len {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    return Some(Err(FrameError::Truncated {
                        expected: len,
                        found: self.pending.len() - LEN_PREFIX_SIZE,
                    }));
                }
                Err(e) => return Some(Err(e)),
            }
        }

        let payload = self.pending[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len].to_vec();
        self.pending.drain(..LEN_PREFIX_SIZE + len);
        Some(Ok(payload))
    }
}
