//! Probabilistic membership over revision composites.
//!
//! Every sealed chunk carries a bloom filter keyed by the tag-collapsed
//! `(locator, key, value)` composite of each revision, so point reads can
//! skip chunks that definitely do not contain a triple.
//!
//! Filters are deterministic: all filters are seeded with a fixed key, so
//! two filters constructed with the same `(expected_insertions, fpp)`
//! parameters hash identically and are **compatible** — their serialized
//! forms can be merged bitwise to estimate the cardinality of a union or
//! intersection.
//!
//! [`JournaledBloom`] is the deferred-write variant: each insertion is
//! appended to a CRC-framed side log, and reopening the journal replays
//! the log into a fresh filter.
//!
//! # Concurrency
//!
//! [`BloomFilter`] is thread-safe: concurrent `put` and `might_contain`
//! are allowed during a chunk's mutable phase (writers take the write
//! lock, readers the read lock).

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::collections;

/// Default false-positive probability for chunk filters.
pub const DEFAULT_FPP: f64 = 0.03;

/// Fixed hash seed: what makes equal-parameter filters compatible.
const SEED: [u8; 32] = *b"chronicledb.bloom.seed.v1.......";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by bloom filter construction and persistence.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Underlying I/O error (journal variant).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Rejected construction parameters or malformed serialized bytes.
    #[error("invalid bloom filter: {0}")]
    Invalid(String),

    /// Journal frame failed its CRC check.
    #[error("bloom journal checksum mismatch")]
    ChecksumMismatch,

    /// Journal stream error.
    #[error("bloom journal frame error: {0}")]
    Frame(#[from] collections::FrameError),

    /// Attempted to merge filters with different parameters.
    #[error("incompatible bloom filters")]
    Incompatible,
}

// ------------------------------------------------------------------------------------------------
// Composites
// ------------------------------------------------------------------------------------------------

/// Build the filter key for a revision: the length-prefixed concatenation
/// of the tag-collapsed class bytes of locator, key, and value.
pub fn composite(locator: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + locator.len() + key.len() + value.len());
    for part in [locator, key, value] {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

// ------------------------------------------------------------------------------------------------
// BloomFilter
// ------------------------------------------------------------------------------------------------

/// A thread-safe bloom filter over revision composites.
pub struct BloomFilter {
    inner: RwLock<Bloom<Vec<u8>>>,
    expected_insertions: usize,
    fpp: f64,
    insertions: AtomicU64,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("expected_insertions", &self.expected_insertions)
            .field("fpp", &self.fpp)
            .field("insertions", &self.insertions.load(Ordering::Relaxed))
            .finish()
    }
}

impl BloomFilter {
    /// Create an empty filter sized for `expected_insertions` at the given
    /// false-positive probability.
    pub fn new(expected_insertions: usize, fpp: f64) -> Result<BloomFilter, BloomError> {
        let inner = Bloom::new_for_fp_rate_with_seed(expected_insertions.max(1), fpp, &SEED)
            .map_err(|e| BloomError::Invalid(e.to_string()))?;
        Ok(BloomFilter {
            inner: RwLock::new(inner),
            expected_insertions: expected_insertions.max(1),
            fpp,
            insertions: AtomicU64::new(0),
        })
    }

    /// Insert a composite.
    pub fn put(&self, composite: &[u8]) {
        if let Ok(mut guard) = self.inner.write() {
            guard.set(&composite.to_vec());
            self.insertions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Probabilistic membership test. `false` is authoritative.
    pub fn might_contain(&self, composite: &[u8]) -> bool {
        match self.inner.read() {
            Ok(guard) => guard.check(&composite.to_vec()),
            // poisoned lock: answer conservatively
            Err(_) => true,
        }
    }

    /// Number of `put` calls since construction (or journal replay).
    pub fn approximate_count(&self) -> u64 {
        self.insertions.load(Ordering::Relaxed)
    }

    /// Serialize the filter (parameters + bit array).
    pub fn to_bytes(&self) -> Result<Vec<u8>, BloomError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| BloomError::Invalid("poisoned filter lock".into()))?;
        let slice = guard.as_slice();
        let mut out = Vec::with_capacity(20 + slice.len());
        out.extend_from_slice(&(self.expected_insertions as u64).to_be_bytes());
        out.extend_from_slice(&self.fpp.to_bits().to_be_bytes());
        out.extend_from_slice(&self.insertions.load(Ordering::Relaxed).to_be_bytes());
        out.extend_from_slice(slice);
        Ok(out)
    }

    /// Reload a filter serialized by [`BloomFilter::to_bytes`].
    pub fn load(bytes: &[u8]) -> Result<BloomFilter, BloomError> {
        if bytes.len() < 24 {
            return Err(BloomError::Invalid("serialized filter too short".into()));
        }
        let expected = u64::from_be_bytes(bytes[0..8].try_into().map_err(io_unreachable)?) as usize;
        let fpp = f64::from_bits(u64::from_be_bytes(
            bytes[8..16].try_into().map_err(io_unreachable)?,
        ));
        let insertions = u64::from_be_bytes(bytes[16..24].try_into().map_err(io_unreachable)?);
        let inner =
            Bloom::from_slice(&bytes[24..]).map_err(|e| BloomError::Invalid(e.to_string()))?;
        Ok(BloomFilter {
            inner: RwLock::new(inner),
            expected_insertions: expected,
            fpp,
            insertions: AtomicU64::new(insertions),
        })
    }

    /// True when `other` was built with the same parameters (and therefore
    /// the same bit geometry and hash seed).
    pub fn is_compatible(&self, other: &BloomFilter) -> bool {
        self.expected_insertions == other.expected_insertions
            && self.fpp.to_bits() == other.fpp.to_bits()
    }

    /// Estimated cardinality of the union of two compatible filters,
    /// derived from the set-bit count of a bitwise-OR merged copy.
    pub fn estimate_union(&self, other: &BloomFilter) -> Result<u64, BloomError> {
        self.estimate_merged(other, |a, b| a | b)
    }

    /// Estimated cardinality of the intersection of two compatible
    /// filters, from a bitwise-AND merged copy.
    pub fn estimate_intersection(&self, other: &BloomFilter) -> Result<u64, BloomError> {
        self.estimate_merged(other, |a, b| a & b)
    }

    fn raw_slice(&self) -> Result<Vec<u8>, BloomError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| BloomError::Invalid("poisoned filter lock".into()))?;
        Ok(guard.as_slice().to_vec())
    }

    fn estimate_merged(
        &self,
        other: &BloomFilter,
        merge: fn(u8, u8) -> u8,
    ) -> Result<u64, BloomError> {
        if !self.is_compatible(other) {
            return Err(BloomError::Incompatible);
        }
        let a = self.raw_slice()?;
        let b = other.raw_slice()?;
        if a.len() != b.len() {
            return Err(BloomError::Incompatible);
        }
        // Compatible filters serialize an identical parameter header, so a
        // bitwise merge leaves the header intact; subtracting the set-bit
        // count of an empty filter isolates the bitmap population.
        let empty = BloomFilter::new(self.expected_insertions, self.fpp)?;
        let baseline: u64 = empty
            .raw_slice()?
            .iter()
            .map(|byte| byte.count_ones() as u64)
            .sum();
        let merged: u64 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| merge(*x, *y).count_ones() as u64)
            .sum();
        let set_bits = merged.saturating_sub(baseline);

        let guard = self
            .inner
            .read()
            .map_err(|_| BloomError::Invalid("poisoned filter lock".into()))?;
        let m = guard.len() as f64;
        let k = guard.number_of_hash_functions() as f64;
        if set_bits == 0 || m == 0.0 || k == 0.0 {
            return Ok(0);
        }
        let x = (set_bits as f64).min(m - 1.0);
        // n ≈ -(m/k) · ln(1 − X/m)
        let estimate = -(m / k) * (1.0 - x / m).ln();
        Ok(estimate.round() as u64)
    }
}

fn io_unreachable<E>(_: E) -> BloomError {
    BloomError::Invalid("internal: fixed-width slice conversion failed".into())
}

// ------------------------------------------------------------------------------------------------
// JournaledBloom
// ------------------------------------------------------------------------------------------------

const JOURNAL_CRC_SIZE: usize = 4;

/// Bloom filter with a deferred-write journal.
///
/// Insertions are recorded in an append-only side log
/// (`[u32 len][composite][u32 crc]` frames); reopening the journal replays
/// the log into a rebuilt filter. Replay stops cleanly at a torn tail
/// frame and fails loudly on mid-log corruption.
pub struct JournaledBloom {
    filter: BloomFilter,
    log: File,
    path: PathBuf,
}

impl std::fmt::Debug for JournaledBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournaledBloom")
            .field("path", &self.path)
            .field("filter", &self.filter)
            .finish()
    }
}

impl JournaledBloom {
    /// Open (or create) a journaled filter backed by `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        expected_insertions: usize,
        fpp: f64,
    ) -> Result<JournaledBloom, BloomError> {
        let path = path.as_ref().to_path_buf();
        let filter = BloomFilter::new(expected_insertions, fpp)?;

        let existing = path.exists();
        if existing {
            let mut replayed = 0u64;
            for frame in collections::ByteStream::open(&path, 64 * 1024)? {
                let frame = frame?;
                if frame.len() < JOURNAL_CRC_SIZE {
                    return Err(BloomError::ChecksumMismatch);
                }
                let (payload, crc_bytes) = frame.split_at(frame.len() - JOURNAL_CRC_SIZE);
                let stored = u32::from_be_bytes(
                    crc_bytes
                        .try_into()
                        .map_err(|_| BloomError::ChecksumMismatch)?,
                );
                let mut hasher = Crc32::new();
                hasher.update(payload);
                if hasher.finalize() != stored {
                    warn!(path = %path.display(), "bloom journal frame failed CRC");
                    return Err(BloomError::ChecksumMismatch);
                }
                filter.put(payload);
                replayed += 1;
            }
            debug!(path = %path.display(), replayed, "bloom journal replayed");
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(JournaledBloom { filter, log, path })
    }

    /// Insert a composite, recording it in the journal first.
    pub fn put(&mut self, composite: &[u8]) -> Result<(), BloomError> {
        let mut hasher = Crc32::new();
        hasher.update(composite);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(composite.len() + JOURNAL_CRC_SIZE);
        frame.extend_from_slice(composite);
        frame.extend_from_slice(&crc.to_be_bytes());

        let mut framed = Vec::with_capacity(frame.len() + 4);
        collections::push_frame(&mut framed, &frame);
        self.log.write_all(&framed)?;
        self.filter.put(composite);
        trace!(len = composite.len(), "bloom journal append");
        Ok(())
    }

    /// Flush the journal to disk.
    pub fn sync(&self) -> Result<(), BloomError> {
        self.log.sync_all()?;
        Ok(())
    }

    /// The in-memory filter.
    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
