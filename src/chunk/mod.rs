//! Immutable sorted revision runs, one per index flavor.
//!
//! A chunk is the on-disk unit of indexed storage: a sorted run of
//! [`Revision`]s of one flavor, together with a [`Manifest`] (sparse byte
//! ranges per locator and per `(locator, key)`) and a bloom filter over
//! revision composites.
//!
//! ## Flavors
//!
//! The three index types differ only in the types bound to locator, key,
//! and value; [`Flavor`] captures that statically:
//!
//! | Flavor   | Locator | Key    | Value      | answers                     |
//! |----------|---------|--------|------------|-----------------------------|
//! | [`Table`]  | `Id`    | `Text` | `Value`    | "fields of record R"        |
//! | [`Index`]  | `Text`  | `Value`| `Id`       | "records where K has V"     |
//! | [`Corpus`] | `Text`  | `Text` | `Position` | "where does term T occur"   |
//!
//! ## States
//!
//! `MUTABLE → SEALED → LOADED`. A mutable chunk accepts inserts into an
//! in-memory sorted set while growing its bloom filter; `seal` writes the
//! file below and transitions to sealed; `load` memory-maps a sealed file
//! for reading. Inserting after seal fails.
//!
//! # On-disk layout
//!
//! ```text
//! [u32 magic][u32 version_tag][u64 revision_count]
//! [REV_LEN][REV_BYTES]                    … revision stream, sorted
//! [manifest bytes]
//! [bloom bytes]
//! [u64 manifest_offset][u64 bloom_offset][u32 crc32]
//! ```
//!
//! All integers big-endian. The two offsets live in a fixed-size trailer
//! so the manifest and bloom regions can be located — and the revision
//! stream left untouched — when a chunk is opened. The CRC32 covers every
//! byte before it.
//!
//! # Failure semantics
//!
//! A checksum mismatch on open quarantines the chunk: membership tests
//! answer conservatively (`true`) and seeks fail with
//! [`ChunkError::Corruption`], while the rest of the database keeps
//! serving.

pub mod manifest;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::io::{self, Write as _};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bloom::{self, BloomError, BloomFilter};
use crate::collections::{self, FrameError};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::value::{Action, Id, Position, Text, Value, Version};

pub use manifest::{ByteRange, Manifest};

const CHUNK_MAGIC: u32 = 0x43484E4B; // "CHNK"
const CHUNK_VERSION_TAG: u32 = 1;
const CHUNK_HEADER_SIZE: usize = 4 + 4 + 8;
const CHUNK_TRAILER_SIZE: usize = 8 + 8 + 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by chunk operations.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Frame stream error.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Bloom filter error.
    #[error("Bloom error: {0}")]
    Bloom(#[from] BloomError),

    /// Detected corruption: checksum mismatch or malformed structure.
    #[error("corrupt chunk {path}: {detail}")]
    Corruption {
        /// Affected file.
        path: PathBuf,
        /// What failed.
        detail: String,
    },

    /// Insert attempted on a chunk that is no longer mutable.
    #[error("chunk is sealed")]
    Sealed,

    /// Read attempted on a chunk that is sealed but not loaded.
    #[error("chunk is not loaded")]
    NotLoaded,

    /// Two distinct revisions presented the same version for one
    /// composite. Versions are globally unique; this is always a bug or
    /// corruption upstream.
    #[error("duplicate revision at version {version}")]
    DuplicateRevision {
        /// The colliding version.
        version: Version,
    },

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Parts and flavors
// ------------------------------------------------------------------------------------------------

/// A type usable as a revision's locator, key, or value.
///
/// `Ord` must sort class-equal instances adjacently (see
/// [`crate::value::Value`]); `class_bytes` is the tag-collapsed key used
/// by manifests and bloom filters.
pub trait Part:
    Clone + Ord + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + Encode + Decode + 'static
{
    /// Tag-collapsed equality-class bytes.
    fn class_bytes(&self) -> Vec<u8>;
}

impl Part for Id {
    fn class_bytes(&self) -> Vec<u8> {
        Id::class_bytes(self)
    }
}

impl Part for Text {
    fn class_bytes(&self) -> Vec<u8> {
        Text::class_bytes(self)
    }
}

impl Part for Value {
    fn class_bytes(&self) -> Vec<u8> {
        Value::class_bytes(self)
    }
}

impl Part for Position {
    fn class_bytes(&self) -> Vec<u8> {
        Position::class_bytes(self)
    }
}

/// Static description of one index flavor: the types bound to locator,
/// key, and value. Implemented by the three uninhabited marker types
/// [`Table`], [`Index`], [`Corpus`]; all dispatch is static.
pub trait Flavor: 'static + Send + Sync {
    /// Primary grouping key of the chunk.
    type Locator: Part;
    /// Secondary key.
    type Key: Part;
    /// Stored value.
    type Value: Part;

    /// Flavor name, used in logs and file diagnostics.
    const NAME: &'static str;
}

/// Record-major flavor: `(record, field name, field value)`.
pub enum Table {}

impl Flavor for Table {
    type Locator = Id;
    type Key = Text;
    type Value = Value;
    const NAME: &'static str = "table";
}

/// Inverted flavor: `(field name, field value, record)`.
pub enum Index {}

impl Flavor for Index {
    type Locator = Text;
    type Key = Value;
    type Value = Id;
    const NAME: &'static str = "index";
}

/// Full-text flavor: `(field name, term, occurrence position)`.
pub enum Corpus {}

impl Flavor for Corpus {
    type Locator = Text;
    type Key = Text;
    type Value = Position;
    const NAME: &'static str = "corpus";
}

// ------------------------------------------------------------------------------------------------
// Revision
// ------------------------------------------------------------------------------------------------

/// A single versioned state-change event: the atomic unit of persistence.
///
/// Sorted by `(locator, key, value, version)`; two revisions never share a
/// version.
pub struct Revision<F: Flavor> {
    /// Primary grouping key.
    pub locator: F::Locator,
    /// Secondary key.
    pub key: F::Key,
    /// The value whose presence is toggled.
    pub value: F::Value,
    /// Commit version.
    pub version: Version,
    /// Whether the value becomes present or absent.
    pub action: Action,
}

impl<F: Flavor> Revision<F> {
    /// Construct a revision.
    pub fn new(
        locator: F::Locator,
        key: F::Key,
        value: F::Value,
        version: Version,
        action: Action,
    ) -> Revision<F> {
        Revision {
            locator,
            key,
            value,
            version,
            action,
        }
    }

    /// Bloom composite of this revision's `(locator, key, value)` classes.
    pub fn composite(&self) -> Vec<u8> {
        bloom::composite(
            &self.locator.class_bytes(),
            &self.key.class_bytes(),
            &self.value.class_bytes(),
        )
    }
}

impl<F: Flavor> Clone for Revision<F> {
    fn clone(&self) -> Self {
        Revision {
            locator: self.locator.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            action: self.action,
        }
    }
}

impl<F: Flavor> fmt::Debug for Revision<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Revision")
            .field("locator", &self.locator)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("version", &self.version)
            .field("action", &self.action)
            .finish()
    }
}

impl<F: Flavor> fmt::Display for Revision<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}/{} @{}",
            self.action, self.locator, self.key, self.value, self.version
        )
    }
}

impl<F: Flavor> PartialEq for Revision<F> {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.action == other.action
            && self.locator == other.locator
            && self.key == other.key
            && self.value == other.value
    }
}

impl<F: Flavor> Eq for Revision<F> {}

impl<F: Flavor> PartialOrd for Revision<F> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<F: Flavor> Ord for Revision<F> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.locator
            .cmp(&other.locator)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.action.cmp(&other.action))
    }
}

impl<F: Flavor> Encode for Revision<F> {
    /// `[u64 version][u8 action][u32 l_len][l][u32 k_len][k][u32 v_len][v]`
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.version.encode_to(buf)?;
        self.action.encode_to(buf)?;
        encoding::encode_to_vec(&self.locator)?.encode_to(buf)?;
        encoding::encode_to_vec(&self.key)?.encode_to(buf)?;
        encoding::encode_to_vec(&self.value)?.encode_to(buf)
    }
}

impl<F: Flavor> Decode for Revision<F> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (version, n) = Version::decode_from(&buf[off..])?;
        off += n;
        let (action, n) = Action::decode_from(&buf[off..])?;
        off += n;
        let (locator_bytes, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (key_bytes, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (value_bytes, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (locator, _) = F::Locator::decode_from(&locator_bytes)?;
        let (key, _) = F::Key::decode_from(&key_bytes)?;
        let (value, _) = F::Value::decode_from(&value_bytes)?;
        Ok((
            Revision {
                locator,
                key,
                value,
                version,
                action,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Chunk
// ------------------------------------------------------------------------------------------------

/// One sorted revision run. See the [module docs](self) for states,
/// layout, and failure semantics.
pub struct Chunk<F: Flavor> {
    inner: ChunkInner<F>,
}

enum ChunkInner<F: Flavor> {
    Mutable(MutableState<F>),
    Sealed { path: PathBuf },
    Loaded(LoadedState<F>),
}

struct MutableState<F: Flavor> {
    revisions: BTreeSet<Revision<F>>,
    bloom: BloomFilter,
}

struct LoadedState<F: Flavor> {
    path: PathBuf,
    mmap: Option<Mmap>,
    manifest: Manifest,
    bloom: Option<BloomFilter>,
    revision_count: u64,
    stream: ByteRange,
    quarantined: AtomicBool,
    _flavor: PhantomData<F>,
}

impl<F: Flavor> LoadedState<F> {
    fn readable(&self) -> Result<(&Mmap, &Path), ChunkError> {
        if self.quarantined.load(Ordering::Relaxed) {
            return Err(corruption(&self.path, "chunk is quarantined"));
        }
        match &self.mmap {
            Some(mmap) => Ok((mmap, &self.path)),
            None => Err(corruption(&self.path, "chunk is quarantined")),
        }
    }
}

/// Result of sealing a chunk: what the segment header records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealOutcome {
    /// CRC32 of the sealed file.
    pub crc: u32,
    /// Number of revisions written.
    pub revision_count: u64,
    /// Total file size in bytes.
    pub file_size: u64,
}

impl<F: Flavor> fmt::Debug for Chunk<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ChunkInner::Mutable(m) => f
                .debug_struct("Chunk")
                .field("flavor", &F::NAME)
                .field("state", &"mutable")
                .field("revisions", &m.revisions.len())
                .finish(),
            ChunkInner::Sealed { path } => f
                .debug_struct("Chunk")
                .field("flavor", &F::NAME)
                .field("state", &"sealed")
                .field("path", path)
                .finish(),
            ChunkInner::Loaded(l) => f
                .debug_struct("Chunk")
                .field("flavor", &F::NAME)
                .field("state", &"loaded")
                .field("path", &l.path)
                .field("revisions", &l.revision_count)
                .finish(),
        }
    }
}

impl<F: Flavor> Chunk<F> {
    /// Create an empty mutable chunk sized for `expected_insertions`.
    pub fn mutable(expected_insertions: usize, fpp: f64) -> Result<Chunk<F>, ChunkError> {
        Ok(Chunk {
            inner: ChunkInner::Mutable(MutableState {
                revisions: BTreeSet::new(),
                bloom: BloomFilter::new(expected_insertions, fpp)?,
            }),
        })
    }

    /// Insert a revision. Only valid while mutable.
    ///
    /// Revisions that fan out from one write legitimately share its
    /// version across *different* composites; a second revision for the
    /// **same** `(locator, key, value)` at an already-seen version is
    /// never legitimate and fails fast.
    pub fn insert(&mut self, revision: Revision<F>) -> Result<(), ChunkError> {
        let ChunkInner::Mutable(state) = &mut self.inner else {
            return Err(ChunkError::Sealed);
        };
        let mut twin = revision.clone();
        twin.action = twin.action.inverse();
        if state.revisions.contains(&revision) || state.revisions.contains(&twin) {
            return Err(ChunkError::DuplicateRevision {
                version: revision.version,
            });
        }
        state.bloom.put(&revision.composite());
        state.revisions.insert(revision);
        Ok(())
    }

    /// Number of revisions currently held (mutable) or recorded (loaded).
    pub fn revision_count(&self) -> u64 {
        match &self.inner {
            ChunkInner::Mutable(m) => m.revisions.len() as u64,
            ChunkInner::Sealed { .. } => 0,
            ChunkInner::Loaded(l) => l.revision_count,
        }
    }

    /// Write the chunk to `path`, fsync it, and transition to sealed.
    ///
    /// Builds the manifest while streaming the sorted revisions out, then
    /// appends the serialized manifest, the bloom filter, and the offset
    /// trailer with the file CRC.
    pub fn seal<P: AsRef<Path>>(&mut self, path: P) -> Result<SealOutcome, ChunkError> {
        let ChunkInner::Mutable(state) = &mut self.inner else {
            return Err(ChunkError::Sealed);
        };
        let path = path.as_ref();

        let mut buf = Vec::new();
        CHUNK_MAGIC.encode_to(&mut buf)?;
        CHUNK_VERSION_TAG.encode_to(&mut buf)?;
        (state.revisions.len() as u64).encode_to(&mut buf)?;

        let mut manifest = Manifest::new();
        for revision in &state.revisions {
            let start = buf.len() as u64;
            let frame = encoding::encode_to_vec(revision)?;
            collections::push_frame(&mut buf, &frame);
            manifest.note(
                &revision.locator.class_bytes(),
                &revision.key.class_bytes(),
                start,
                buf.len() as u64,
            );
        }
        let manifest_offset = buf.len() as u64;
        manifest.encode_to(&mut buf)?;
        let bloom_offset = buf.len() as u64;
        buf.extend_from_slice(&state.bloom.to_bytes()?);

        manifest_offset.encode_to(&mut buf)?;
        bloom_offset.encode_to(&mut buf)?;

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        crc.encode_to(&mut buf)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;

        let outcome = SealOutcome {
            crc,
            revision_count: state.revisions.len() as u64,
            file_size: buf.len() as u64,
        };
        debug!(
            flavor = F::NAME,
            path = %path.display(),
            revisions = outcome.revision_count,
            bytes = outcome.file_size,
            "chunk sealed"
        );
        self.inner = ChunkInner::Sealed {
            path: path.to_path_buf(),
        };
        Ok(outcome)
    }

    /// Memory-map a sealed chunk file and verify its checksum.
    ///
    /// On checksum or structure failure the chunk comes back
    /// **quarantined**: membership answers `true`, seeks fail with
    /// [`ChunkError::Corruption`], and the caller keeps serving other
    /// chunks.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Chunk<F>, ChunkError> {
        let path = path.as_ref().to_path_buf();
        match Self::try_load(&path) {
            Ok(chunk) => Ok(chunk),
            Err(ChunkError::Io(e)) => Err(ChunkError::Io(e)),
            Err(e) => {
                warn!(flavor = F::NAME, path = %path.display(), error = %e, "chunk quarantined");
                Ok(Chunk {
                    inner: ChunkInner::Loaded(LoadedState {
                        path,
                        mmap: None,
                        manifest: Manifest::new(),
                        bloom: None,
                        revision_count: 0,
                        stream: ByteRange { start: 0, end: 0 },
                        quarantined: AtomicBool::new(true),
                        _flavor: PhantomData,
                    }),
                })
            }
        }
    }

    fn try_load(path: &Path) -> Result<Chunk<F>, ChunkError> {
        let file = File::open(path)?;
        // SAFETY: the file is sealed and never modified after seal; the
        // map is dropped before any compaction could unlink it.
        let mmap = unsafe { Mmap::map(&file)? };
        let bytes: &[u8] = &mmap;

        if bytes.len() < CHUNK_HEADER_SIZE + CHUNK_TRAILER_SIZE {
            return Err(corruption(path, "file shorter than header + trailer"));
        }

        let body_end = bytes.len() - 4;
        let stored_crc = u32::from_be_bytes(
            bytes[body_end..]
                .try_into()
                .map_err(|_| corruption(path, "trailer read"))?,
        );
        let mut hasher = Crc32::new();
        hasher.update(&bytes[..body_end]);
        if hasher.finalize() != stored_crc {
            return Err(corruption(path, "checksum mismatch"));
        }

        let (magic, _) = u32::decode_from(&bytes[0..])?;
        if magic != CHUNK_MAGIC {
            return Err(corruption(path, "bad magic"));
        }
        let (version_tag, _) = u32::decode_from(&bytes[4..])?;
        if version_tag != CHUNK_VERSION_TAG {
            return Err(corruption(
                path,
                &format!("unsupported version tag {version_tag}"),
            ));
        }
        let (revision_count, _) = u64::decode_from(&bytes[8..])?;

        let trailer = bytes.len() - CHUNK_TRAILER_SIZE;
        let (manifest_offset, _) = u64::decode_from(&bytes[trailer..])?;
        let (bloom_offset, _) = u64::decode_from(&bytes[trailer + 8..])?;
        if manifest_offset > bloom_offset
            || bloom_offset > trailer as u64
            || manifest_offset < CHUNK_HEADER_SIZE as u64
        {
            return Err(corruption(path, "inconsistent region offsets"));
        }

        let (manifest, _) =
            Manifest::decode_from(&bytes[manifest_offset as usize..bloom_offset as usize])?;
        let bloom = BloomFilter::load(&bytes[bloom_offset as usize..trailer])?;

        trace!(
            flavor = F::NAME,
            path = %path.display(),
            revisions = revision_count,
            locators = manifest.locator_count(),
            "chunk loaded"
        );
        Ok(Chunk {
            inner: ChunkInner::Loaded(LoadedState {
                path: path.to_path_buf(),
                mmap: Some(mmap),
                manifest,
                bloom: Some(bloom),
                revision_count,
                stream: ByteRange {
                    start: CHUNK_HEADER_SIZE as u64,
                    end: manifest_offset,
                },
                quarantined: AtomicBool::new(false),
                _flavor: PhantomData,
            }),
        })
    }

    /// True when the chunk was quarantined on load.
    pub fn is_quarantined(&self) -> bool {
        match &self.inner {
            ChunkInner::Loaded(l) => l.quarantined.load(Ordering::Relaxed),
            _ => false,
        }
    }

    /// Bloom-gated membership test for a `(locator, key, value)` triple.
    ///
    /// `false` is authoritative; `true` may be a false positive. A
    /// quarantined chunk always answers `true`.
    pub fn might_contain(&self, locator: &F::Locator, key: &F::Key, value: &F::Value) -> bool {
        let composite = bloom::composite(
            &locator.class_bytes(),
            &key.class_bytes(),
            &value.class_bytes(),
        );
        match &self.inner {
            ChunkInner::Mutable(m) => m.bloom.might_contain(&composite),
            ChunkInner::Sealed { .. } => false,
            ChunkInner::Loaded(l) => match &l.bloom {
                Some(bloom) if !l.quarantined.load(Ordering::Relaxed) => {
                    bloom.might_contain(&composite)
                }
                _ => true,
            },
        }
    }

    /// All revisions of `locator`, in storage order.
    pub fn seek(&self, locator: &F::Locator) -> Result<ChunkScan<'_, F>, ChunkError> {
        let class = locator.class_bytes();
        let class_for_filter = class.clone();
        self.scan(
            |manifest| manifest.lookup_locator(&class),
            move |rev| rev.locator.class_bytes() == class_for_filter,
        )
    }

    /// All revisions of `(locator, key)`, in storage order.
    pub fn seek_key(
        &self,
        locator: &F::Locator,
        key: &F::Key,
    ) -> Result<ChunkScan<'_, F>, ChunkError> {
        let locator_class = locator.class_bytes();
        let key_class = key.class_bytes();
        let locator_class_for_filter = locator_class.clone();
        let key_class_for_filter = key_class.clone();
        self.scan(
            |manifest| manifest.lookup_key(&locator_class, &key_class),
            move |rev| {
                rev.locator.class_bytes() == locator_class_for_filter
                    && rev.key.class_bytes() == key_class_for_filter
            },
        )
    }

    /// Every revision in storage order.
    pub fn iterate(&self) -> Result<ChunkScan<'_, F>, ChunkError> {
        match &self.inner {
            ChunkInner::Mutable(m) => Ok(ChunkScan::Memory {
                iter: Box::new(m.revisions.iter().cloned().map(Ok)),
            }),
            ChunkInner::Sealed { .. } => Err(ChunkError::NotLoaded),
            ChunkInner::Loaded(l) => {
                let (mmap, path) = l.readable()?;
                Ok(ChunkScan::Disk {
                    frames: collections::iter_frames(
                        &mmap[l.stream.start as usize..l.stream.end as usize],
                    ),
                    path,
                })
            }
        }
    }

    /// Seek plumbing: the manifest range constrains disk I/O; an absent
    /// entry means the chunk holds nothing for the target and yields an
    /// empty scan.
    fn scan<'a>(
        &'a self,
        range_of: impl FnOnce(&Manifest) -> Option<ByteRange>,
        filter: impl Fn(&Revision<F>) -> bool + 'a,
    ) -> Result<ChunkScan<'a, F>, ChunkError> {
        match &self.inner {
            ChunkInner::Mutable(m) => Ok(ChunkScan::Memory {
                iter: Box::new(
                    m.revisions
                        .iter()
                        .filter(move |rev| filter(rev))
                        .cloned()
                        .map(Ok),
                ),
            }),
            ChunkInner::Sealed { .. } => Err(ChunkError::NotLoaded),
            ChunkInner::Loaded(l) => {
                let (mmap, path) = l.readable()?;
                let range = match range_of(&l.manifest) {
                    Some(range) if !range.is_empty() => range,
                    _ => ByteRange { start: 0, end: 0 },
                };
                Ok(ChunkScan::Disk {
                    frames: collections::iter_frames(
                        &mmap[range.start as usize..range.end as usize],
                    ),
                    path,
                })
            }
        }
    }

    /// The loaded manifest (loaded chunks only).
    pub fn manifest(&self) -> Option<&Manifest> {
        match &self.inner {
            ChunkInner::Loaded(l) if !l.quarantined.load(Ordering::Relaxed) => Some(&l.manifest),
            _ => None,
        }
    }

    /// File path (sealed or loaded chunks).
    pub fn path(&self) -> Option<&Path> {
        match &self.inner {
            ChunkInner::Mutable(_) => None,
            ChunkInner::Sealed { path } => Some(path),
            ChunkInner::Loaded(l) => Some(&l.path),
        }
    }
}

/// Lazy revision scan over a chunk, from memory or from the mapped file.
pub enum ChunkScan<'a, F: Flavor> {
    /// Scan over a mutable chunk's in-memory set.
    Memory {
        /// Filtered, cloned revisions.
        iter: Box<dyn Iterator<Item = Result<Revision<F>, ChunkError>> + 'a>,
    },
    /// Scan over a byte range of the mapped file.
    Disk {
        /// Frame iterator over the manifest-selected range.
        frames: collections::FrameIter<'a>,
        /// Chunk path, for corruption diagnostics.
        path: &'a Path,
    },
}

impl<'a, F: Flavor> Iterator for ChunkScan<'a, F> {
    type Item = Result<Revision<F>, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ChunkScan::Memory { iter } => iter.next(),
            ChunkScan::Disk { frames, path } => {
                let frame = match frames.next()? {
                    Ok(frame) => frame,
                    Err(e) => {
                        return Some(Err(corruption(path, &format!("frame error: {e}"))));
                    }
                };
                match Revision::<F>::decode_from(frame) {
                    Ok((revision, _)) => Some(Ok(revision)),
                    Err(e) => Some(Err(corruption(path, &format!("revision decode: {e}")))),
                }
            }
        }
    }
}

fn corruption(path: &Path, detail: &str) -> ChunkError {
    ChunkError::Corruption {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}
