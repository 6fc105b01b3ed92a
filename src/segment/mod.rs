//! Segments: the unit of transport and of crash-safe visibility.
//!
//! A segment is the coherent triple of chunks produced from one transport
//! batch — table, index, and corpus — plus a header recording the
//! ordinal, the version interval, and the checksum of each chunk file.
//!
//! # On-disk layout
//!
//! ```text
//! segments/
//!   seg-000000.hdr   header (this module), CRC-protected
//!   seg-000000.tbl   table chunk
//!   seg-000000.idx   index chunk
//!   seg-000000.cps   corpus chunk
//! ```
//!
//! # Visibility invariant
//!
//! A segment is fully visible or fully invisible. The builder seals and
//! fsyncs all three chunk files **before** writing the header; the header
//! write is the commit point. A crash mid-build leaves chunk files with no
//! header, which the recovery scan removes as orphans.
//!
//! # Startup recovery
//!
//! [`recover`] scans the segment directory, loads each header, and:
//!
//! - discards duplicates (same version range and chunk checksums as a
//!   segment already in the sequence), logging the discard;
//! - removes orphan chunk files that have no header;
//! - returns the surviving segments sorted by ordinal.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read as _, Write as _};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkError, Corpus, Index, Revision, SealOutcome, Table};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::value::Version;

const SEG_MAGIC: [u8; 4] = *b"CSEG";
const SEG_VERSION: u32 = 1;
const CRC_SIZE: usize = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment build, seal, and recovery.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Chunk-level failure.
    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Header failed validation.
    #[error("invalid segment header {path}: {detail}")]
    InvalidHeader {
        /// Header file.
        path: PathBuf,
        /// What failed.
        detail: String,
    },

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header structures
// ------------------------------------------------------------------------------------------------

/// Per-chunk metadata recorded in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    /// CRC32 of the sealed chunk file.
    pub crc: u32,
    /// Revisions in the chunk.
    pub revision_count: u64,
    /// Chunk file size in bytes.
    pub file_size: u64,
}

impl From<SealOutcome> for ChunkMeta {
    fn from(outcome: SealOutcome) -> Self {
        ChunkMeta {
            crc: outcome.crc,
            revision_count: outcome.revision_count,
            file_size: outcome.file_size,
        }
    }
}

impl Encode for ChunkMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.crc.encode_to(buf)?;
        self.revision_count.encode_to(buf)?;
        self.file_size.encode_to(buf)
    }
}

impl Decode for ChunkMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (revision_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (file_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                crc,
                revision_count,
                file_size,
            },
            off,
        ))
    }
}

/// Segment header: ordinal, version interval, and the chunk manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    magic: [u8; 4],
    version: u32,

    /// Transport batch ordinal. Segment publication order equals ordinal
    /// order.
    pub ordinal: u64,

    /// Smallest revision version in the segment.
    pub min_version: Version,

    /// Largest revision version in the segment.
    pub max_version: Version,

    /// Table chunk metadata.
    pub table: ChunkMeta,

    /// Index chunk metadata.
    pub index: ChunkMeta,

    /// Corpus chunk metadata.
    pub corpus: ChunkMeta,
}

impl SegmentHeader {
    /// The fingerprint used for duplicate detection: version range plus
    /// the three chunk checksums.
    pub fn fingerprint(&self) -> (Version, Version, u32, u32, u32) {
        (
            self.min_version,
            self.max_version,
            self.table.crc,
            self.index.crc,
            self.corpus.crc,
        )
    }
}

impl Encode for SegmentHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.ordinal.encode_to(buf)?;
        self.min_version.encode_to(buf)?;
        self.max_version.encode_to(buf)?;
        self.table.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.corpus.encode_to(buf)
    }
}

impl Decode for SegmentHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (ordinal, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_version, n) = Version::decode_from(&buf[off..])?;
        off += n;
        let (max_version, n) = Version::decode_from(&buf[off..])?;
        off += n;
        let (table, n) = ChunkMeta::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = ChunkMeta::decode_from(&buf[off..])?;
        off += n;
        let (corpus, n) = ChunkMeta::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                ordinal,
                min_version,
                max_version,
                table,
                index,
                corpus,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

fn file_stem(ordinal: u64) -> String {
    format!("seg-{ordinal:06}")
}

/// Path of a segment's header file.
pub fn header_path(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(format!("{}.hdr", file_stem(ordinal)))
}

fn table_path(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(format!("{}.tbl", file_stem(ordinal)))
}

fn index_path(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(format!("{}.idx", file_stem(ordinal)))
}

fn corpus_path(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(format!("{}.cps", file_stem(ordinal)))
}

// ------------------------------------------------------------------------------------------------
// Segment
// ------------------------------------------------------------------------------------------------

/// A published, immutable segment: header plus three loaded chunks.
pub struct Segment {
    header: SegmentHeader,
    table: Chunk<Table>,
    index: Chunk<Index>,
    corpus: Chunk<Corpus>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("ordinal", &self.header.ordinal)
            .field("min_version", &self.header.min_version)
            .field("max_version", &self.header.max_version)
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Transport batch ordinal.
    pub fn ordinal(&self) -> u64 {
        self.header.ordinal
    }

    /// The header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// The table chunk.
    pub fn table(&self) -> &Chunk<Table> {
        &self.table
    }

    /// The index chunk.
    pub fn index(&self) -> &Chunk<Index> {
        &self.index
    }

    /// The corpus chunk.
    pub fn corpus(&self) -> &Chunk<Corpus> {
        &self.corpus
    }

    /// Open a segment from its header file.
    ///
    /// Chunk checksum failures quarantine the affected chunk rather than
    /// failing the open; a missing or corrupt header fails the open.
    pub fn open(dir: &Path, ordinal: u64) -> Result<Segment, SegmentError> {
        let header = read_header(&header_path(dir, ordinal))?;
        if header.ordinal != ordinal {
            return Err(SegmentError::InvalidHeader {
                path: header_path(dir, ordinal),
                detail: format!(
                    "ordinal mismatch: file says {}, header says {}",
                    ordinal, header.ordinal
                ),
            });
        }
        let table = Chunk::load(table_path(dir, ordinal))?;
        let index = Chunk::load(index_path(dir, ordinal))?;
        let corpus = Chunk::load(corpus_path(dir, ordinal))?;
        Ok(Segment {
            header,
            table,
            index,
            corpus,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentBuilder
// ------------------------------------------------------------------------------------------------

/// Accumulates the revisions of one transport batch and seals them into a
/// published segment.
pub struct SegmentBuilder {
    ordinal: u64,
    table: Chunk<Table>,
    index: Chunk<Index>,
    corpus: Chunk<Corpus>,
    min_version: Version,
    max_version: Version,
}

impl std::fmt::Debug for SegmentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentBuilder")
            .field("ordinal", &self.ordinal)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .finish_non_exhaustive()
    }
}

impl SegmentBuilder {
    /// Start a builder for the given batch ordinal.
    pub fn new(ordinal: u64, expected_writes: usize, fpp: f64) -> Result<SegmentBuilder, SegmentError> {
        Ok(SegmentBuilder {
            ordinal,
            table: Chunk::mutable(expected_writes, fpp)?,
            index: Chunk::mutable(expected_writes, fpp)?,
            // a textual write fans out into several corpus revisions
            corpus: Chunk::mutable(expected_writes.saturating_mul(4).max(1), fpp)?,
            min_version: Version::MAX,
            max_version: 0,
        })
    }

    fn track(&mut self, version: Version) {
        self.min_version = self.min_version.min(version);
        self.max_version = self.max_version.max(version);
    }

    /// Insert a table revision.
    pub fn insert_table(&mut self, revision: Revision<Table>) -> Result<(), SegmentError> {
        self.track(revision.version);
        self.table.insert(revision)?;
        Ok(())
    }

    /// Insert an index revision.
    pub fn insert_index(&mut self, revision: Revision<Index>) -> Result<(), SegmentError> {
        self.track(revision.version);
        self.index.insert(revision)?;
        Ok(())
    }

    /// Insert a corpus revision.
    pub fn insert_corpus(&mut self, revision: Revision<Corpus>) -> Result<(), SegmentError> {
        self.track(revision.version);
        self.corpus.insert(revision)?;
        Ok(())
    }

    /// Seal the three chunks, then commit the segment by writing its
    /// header. Returns the loaded, readable segment.
    ///
    /// On any failure the partially-written files are removed so the
    /// batch can be retried without leaving debris.
    pub fn seal(mut self, dir: &Path) -> Result<Segment, SegmentError> {
        let ordinal = self.ordinal;
        match self.seal_inner(dir) {
            Ok(segment) => Ok(segment),
            Err(e) => {
                remove_segment_files(dir, ordinal);
                Err(e)
            }
        }
    }

    fn seal_inner(&mut self, dir: &Path) -> Result<Segment, SegmentError> {
        let table_meta: ChunkMeta = self.table.seal(table_path(dir, self.ordinal))?.into();
        let index_meta: ChunkMeta = self.index.seal(index_path(dir, self.ordinal))?.into();
        let corpus_meta: ChunkMeta = self.corpus.seal(corpus_path(dir, self.ordinal))?.into();

        let (min_version, max_version) = if self.min_version == Version::MAX {
            (0, 0)
        } else {
            (self.min_version, self.max_version)
        };
        let header = SegmentHeader {
            magic: SEG_MAGIC,
            version: SEG_VERSION,
            ordinal: self.ordinal,
            min_version,
            max_version,
            table: table_meta,
            index: index_meta,
            corpus: corpus_meta,
        };
        write_header(&header_path(dir, self.ordinal), &header)?;

        info!(
            ordinal = self.ordinal,
            min_version,
            max_version,
            table_revisions = table_meta.revision_count,
            index_revisions = index_meta.revision_count,
            corpus_revisions = corpus_meta.revision_count,
            "segment sealed"
        );
        Segment::open(dir, self.ordinal)
    }
}

fn remove_segment_files(dir: &Path, ordinal: u64) {
    for path in [
        header_path(dir, ordinal),
        table_path(dir, ordinal),
        index_path(dir, ordinal),
        corpus_path(dir, ordinal),
    ] {
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove partial segment file");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Header I/O
// ------------------------------------------------------------------------------------------------

fn write_header(path: &Path, header: &SegmentHeader) -> Result<(), SegmentError> {
    let bytes = encoding::encode_to_vec(header)?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&bytes)?;
    file.write_all(&crc.to_be_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_header(path: &Path) -> Result<SegmentHeader, SegmentError> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.len() < CRC_SIZE {
        return Err(SegmentError::InvalidHeader {
            path: path.to_path_buf(),
            detail: "header file too short".into(),
        });
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - CRC_SIZE);
    let stored = u32::from_be_bytes(crc_bytes.try_into().map_err(|_| {
        SegmentError::InvalidHeader {
            path: path.to_path_buf(),
            detail: "trailing checksum read".into(),
        }
    })?);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored {
        return Err(SegmentError::InvalidHeader {
            path: path.to_path_buf(),
            detail: "checksum mismatch".into(),
        });
    }
    let (header, _) = SegmentHeader::decode_from(body)?;
    if header.magic != SEG_MAGIC {
        return Err(SegmentError::InvalidHeader {
            path: path.to_path_buf(),
            detail: "bad magic".into(),
        });
    }
    if header.version != SEG_VERSION {
        return Err(SegmentError::InvalidHeader {
            path: path.to_path_buf(),
            detail: format!("unsupported version {}", header.version),
        });
    }
    Ok(header)
}

// ------------------------------------------------------------------------------------------------
// Recovery
// ------------------------------------------------------------------------------------------------

/// Scan the segment directory and open every valid segment.
///
/// See the [module docs](self) for the discard rules. The returned list
/// is sorted by ordinal.
pub fn recover(dir: &Path) -> Result<Vec<Segment>, SegmentError> {
    fs::create_dir_all(dir)?;

    let mut header_ordinals = Vec::new();
    let mut chunk_files: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_prefix("seg-") else {
            continue;
        };
        let Some((seq, ext)) = stem.split_once('.') else {
            continue;
        };
        let Ok(ordinal) = seq.parse::<u64>() else {
            continue;
        };
        match ext {
            "hdr" => header_ordinals.push(ordinal),
            "tbl" | "idx" | "cps" => chunk_files.push((ordinal, path)),
            _ => {}
        }
    }
    header_ordinals.sort_unstable();

    // Orphan chunk files (a crash between chunk writes leaves no header).
    let with_header: HashSet<u64> = header_ordinals.iter().copied().collect();
    for (ordinal, path) in chunk_files {
        if !with_header.contains(&ordinal) {
            warn!(path = %path.display(), "removing orphan chunk file (incomplete segment)");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "orphan removal failed");
            }
        }
    }

    let mut segments = Vec::new();
    let mut seen = HashSet::new();
    for ordinal in header_ordinals {
        let header = match read_header(&header_path(dir, ordinal)) {
            Ok(header) => header,
            Err(e) => {
                warn!(ordinal, error = %e, "discarding segment with unreadable header");
                continue;
            }
        };
        // Duplicate check first: a byte-identical copy under another name
        // carries the same version range and chunk checksums.
        if !seen.insert(header.fingerprint()) {
            info!(ordinal, "discarding duplicate segment");
            continue;
        }
        let segment = match Segment::open(dir, ordinal) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(ordinal, error = %e, "discarding unreadable segment");
                continue;
            }
        };
        segments.push(segment);
    }
    segments.sort_by_key(Segment::ordinal);
    debug!(count = segments.len(), "segment recovery complete");
    Ok(segments)
}
