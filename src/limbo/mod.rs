//! Limbo: the durable, ordered, queryable write buffer.
//!
//! Limbo is both the write-ahead log and the freshest queryable store.
//! Every accepted write is appended to the active page file and fsynced
//! **before** the acknowledgement returns; an in-memory mirror of each
//! page serves reads. When the active page reaches its size threshold it
//! rotates: a fresh head page takes over and the full page becomes a
//! transport candidate with the next batch ordinal.
//!
//! # On-disk layout
//!
//! ```text
//! buffer/
//!   page-000000.lmb
//!   page-000001.lmb   ← head (highest sequence accepts writes)
//! ```
//!
//! Each page: `[u32 magic][u32 page_seq][u32 crc]` followed by write
//! records framed as `[u32 len][write bytes][u32 crc]` with the CRC over
//! `len ‖ bytes`. Per-record CRCs detect torn writes anywhere in a page,
//! not just at the tail.
//!
//! # Recovery
//!
//! Pages replay in sequence order. A torn record at the tail of the
//! highest-sequence page is truncated away (the write was never
//! acknowledged); a bad record anywhere else is corruption and fails the
//! open. All pages below the highest sequence become transport candidates
//! again.
//!
//! # Transport handshake
//!
//! [`Limbo::next_batch`] hands out the oldest rotated page as a
//! [`Batch`]; after the consumer has durably indexed it,
//! [`Limbo::confirm_transported`] deletes the page file. A crash between
//! the two replays the batch, which downstream deduplication absorbs.
//!
//! # Backpressure
//!
//! Rotated pages queueing past the soft cap log a warning; past the hard
//! cap, writers get [`LimboError::Overloaded`] and no state changes.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::chunk::{Corpus, Index, Revision, Table};
use crate::encoding;
use crate::query::tokenize::tokenize;
use crate::record::Record;
use crate::value::{Id, Position, Text, Value, Version, Write};

const PAGE_MAGIC: u32 = 0x434C4D42; // "CLMB"
const U32_SIZE: usize = 4;
const PAGE_HEADER_SIZE: u64 = 12;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by Limbo operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LimboError {
    /// Underlying I/O error. On the append path this means the write was
    /// **not** acknowledged.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] encoding::EncodingError),

    /// A page failed validation away from the reclaimable tail.
    #[error("corrupt limbo page {path}: {detail}")]
    Corruption {
        /// Affected page file.
        path: PathBuf,
        /// What failed.
        detail: String,
    },

    /// The rotated-page queue reached the hard cap.
    #[error("limbo overloaded: {pending} pages awaiting transport")]
    Overloaded {
        /// Pages queued for transport.
        pending: usize,
    },

    /// A single write exceeded the configured wire-size limit.
    #[error("write of {0} bytes exceeds the record size limit")]
    WriteTooLarge(usize),

    /// Internal invariant violation (poisoned lock, ordinal mismatch).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// When appends reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every write record.
    PerWrite,
    /// fsync once per append call: a multi-write commit shares one sync.
    Group,
}

/// Limbo tuning knobs.
#[derive(Debug, Clone)]
pub struct LimboConfig {
    /// Page rotation threshold in bytes.
    pub page_size: usize,

    /// Durability policy for appends.
    pub fsync_policy: FsyncPolicy,

    /// Rotated-page count that triggers a latency warning.
    pub soft_page_cap: usize,

    /// Rotated-page count at which writers receive
    /// [`LimboError::Overloaded`].
    pub hard_page_cap: usize,

    /// Maximum encoded size of one write.
    pub max_write_size: u32,
}

impl Default for LimboConfig {
    fn default() -> Self {
        LimboConfig {
            page_size: 8 * 1024 * 1024,
            fsync_policy: FsyncPolicy::Group,
            soft_page_cap: 8,
            hard_page_cap: 64,
            max_write_size: 1024 * 1024,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Batch
// ------------------------------------------------------------------------------------------------

/// One transport unit: the writes of a single rotated page, oldest first,
/// tagged with the segment ordinal they will seal into.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Segment ordinal this batch transports into.
    pub ordinal: u64,

    /// Writes in insertion order.
    pub writes: Vec<Write>,
}

// ------------------------------------------------------------------------------------------------
// Pages
// ------------------------------------------------------------------------------------------------

struct HeadPage {
    seq: u64,
    path: PathBuf,
    file: File,
    writes: Vec<Write>,
    bytes: u64,
}

struct RotatedPage {
    seq: u64,
    ordinal: u64,
    path: PathBuf,
    writes: Vec<Write>,
}

struct LimboInner {
    head: HeadPage,
    /// Oldest first.
    rotated: VecDeque<RotatedPage>,
    next_ordinal: u64,
    last_version: Version,
}

// ------------------------------------------------------------------------------------------------
// Limbo
// ------------------------------------------------------------------------------------------------

/// The durable write buffer. See the [module docs](self).
pub struct Limbo {
    dir: PathBuf,
    config: LimboConfig,
    inner: Mutex<LimboInner>,
}

impl std::fmt::Debug for Limbo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limbo")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Limbo {
    /// Open (or create) the buffer directory, replaying existing pages.
    ///
    /// `first_ordinal` is the next segment ordinal (recovered pages queue
    /// for transport starting there). Returns the buffer and the largest
    /// version seen during replay.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        config: LimboConfig,
        first_ordinal: u64,
    ) -> Result<(Limbo, Version), LimboError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut seqs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(seq) = name
                .strip_prefix("page-")
                .and_then(|s| s.strip_suffix(".lmb"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();

        let mut max_version: Version = 0;
        let mut rotated = VecDeque::new();
        let mut next_ordinal = first_ordinal;
        let mut head: Option<HeadPage> = None;

        let count = seqs.len();
        for (i, seq) in seqs.iter().copied().enumerate() {
            let is_last = i + 1 == count;
            let path = page_path(&dir, seq);
            let (writes, end_offset) = replay_page(&path, seq, is_last, &config)?;
            for w in &writes {
                max_version = max_version.max(w.version);
            }
            if is_last {
                let file = OpenOptions::new().append(true).open(&path)?;
                head = Some(HeadPage {
                    seq,
                    path,
                    file,
                    writes,
                    bytes: end_offset,
                });
            } else {
                info!(seq, ordinal = next_ordinal, writes = writes.len(), "recovered rotated page");
                rotated.push_back(RotatedPage {
                    seq,
                    ordinal: next_ordinal,
                    path,
                    writes,
                });
                next_ordinal += 1;
            }
        }

        let head = match head {
            Some(head) => head,
            None => create_page(&dir, 0)?,
        };

        info!(
            dir = %dir.display(),
            head_seq = head.seq,
            rotated = rotated.len(),
            max_version,
            "limbo opened"
        );
        Ok((
            Limbo {
                dir,
                config,
                inner: Mutex::new(LimboInner {
                    head,
                    rotated,
                    next_ordinal,
                    last_version: max_version,
                }),
            },
            max_version,
        ))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LimboInner>, LimboError> {
        self.inner
            .lock()
            .map_err(|_| LimboError::Internal("limbo lock poisoned".into()))
    }

    /// Append pre-versioned writes, making them durable before returning.
    ///
    /// All writes of one call land in the same page in order (one group
    /// under [`FsyncPolicy::Group`]). Returns `true` when the head page
    /// rotated, which is the transporter's wake signal.
    pub fn insert(&self, writes: &[Write]) -> Result<bool, LimboError> {
        if writes.is_empty() {
            return Ok(false);
        }
        let mut inner = self.lock()?;

        if inner.rotated.len() >= self.config.hard_page_cap {
            return Err(LimboError::Overloaded {
                pending: inner.rotated.len(),
            });
        }

        for write in writes {
            if write.version <= inner.last_version {
                return Err(LimboError::Internal(format!(
                    "version {} is not greater than the last accepted version {}",
                    write.version, inner.last_version
                )));
            }
            let bytes = encoding::encode_to_vec(write)?;
            if bytes.len() > self.config.max_write_size as usize {
                return Err(LimboError::WriteTooLarge(bytes.len()));
            }
            let frame = frame_record(&bytes);
            inner.head.file.write_all(&frame)?;
            if matches!(self.config.fsync_policy, FsyncPolicy::PerWrite) {
                inner.head.file.sync_all()?;
            }
            inner.head.bytes += frame.len() as u64;
            inner.last_version = write.version;
            inner.head.writes.push(write.clone());
            trace!(version = write.version, "limbo append");
        }
        if matches!(self.config.fsync_policy, FsyncPolicy::Group) {
            inner.head.file.sync_all()?;
        }

        let mut rotated = false;
        if inner.head.bytes >= self.config.page_size as u64 {
            self.rotate_locked(&mut inner)?;
            rotated = true;
        }
        Ok(rotated)
    }

    fn rotate_locked(&self, inner: &mut LimboInner) -> Result<(), LimboError> {
        inner.head.file.sync_all()?;
        let next_seq = inner.head.seq + 1;
        let new_head = create_page(&self.dir, next_seq)?;
        let old = std::mem::replace(&mut inner.head, new_head);

        let ordinal = inner.next_ordinal;
        inner.next_ordinal += 1;
        debug!(
            seq = old.seq,
            ordinal,
            writes = old.writes.len(),
            "limbo page rotated"
        );
        inner.rotated.push_back(RotatedPage {
            seq: old.seq,
            ordinal,
            path: old.path,
            writes: old.writes,
        });
        if inner.rotated.len() >= self.config.soft_page_cap {
            warn!(
                pending = inner.rotated.len(),
                "limbo transport is falling behind"
            );
        }
        Ok(())
    }

    /// Rotate the head page even below the size threshold, so everything
    /// buffered becomes transportable. No-op on an empty head page.
    pub fn rotate_head(&self) -> Result<bool, LimboError> {
        let mut inner = self.lock()?;
        if inner.head.writes.is_empty() {
            return Ok(false);
        }
        self.rotate_locked(&mut inner)?;
        Ok(true)
    }

    /// True when at least one rotated page awaits transport.
    pub fn can_transport(&self) -> bool {
        self.lock().map(|i| !i.rotated.is_empty()).unwrap_or(false)
    }

    /// Snapshot the oldest rotated page as a transport batch.
    pub fn next_batch(&self) -> Option<Batch> {
        let inner = self.lock().ok()?;
        inner.rotated.front().map(|page| Batch {
            ordinal: page.ordinal,
            writes: page.writes.clone(),
        })
    }

    /// Complete the transport handshake: drop the oldest rotated page and
    /// delete its file. `ordinal` must match the batch handed out by
    /// [`Limbo::next_batch`].
    pub fn confirm_transported(&self, ordinal: u64) -> Result<(), LimboError> {
        let mut inner = self.lock()?;
        let Some(front) = inner.rotated.front() else {
            return Err(LimboError::Internal(
                "transport confirmation with no rotated pages".into(),
            ));
        };
        if front.ordinal != ordinal {
            return Err(LimboError::Internal(format!(
                "transport confirmation out of order: expected ordinal {}, got {ordinal}",
                front.ordinal
            )));
        }
        let page = inner
            .rotated
            .pop_front()
            .ok_or_else(|| LimboError::Internal("rotated queue emptied concurrently".into()))?;
        drop(inner);
        if let Err(e) = fs::remove_file(&page.path) {
            warn!(path = %page.path.display(), error = %e, "failed to delete transported page");
        }
        debug!(seq = page.seq, ordinal, "transported page deleted");
        Ok(())
    }

    /// Number of rotated pages awaiting transport.
    pub fn pending_pages(&self) -> usize {
        self.lock().map(|i| i.rotated.len()).unwrap_or(0)
    }

    /// Every buffered write in insertion order: rotated pages oldest
    /// first, then the head page.
    pub fn iterator(&self) -> Vec<Write> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for page in &inner.rotated {
            out.extend(page.writes.iter().cloned());
        }
        out.extend(inner.head.writes.iter().cloned());
        out
    }

    /// Buffered writes passing `filter`, in insertion order.
    pub fn writes_matching(&self, filter: impl Fn(&Write) -> bool) -> Vec<Write> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for page in &inner.rotated {
            out.extend(page.writes.iter().filter(|w| filter(w)).cloned());
        }
        out.extend(inner.head.writes.iter().filter(|w| filter(w)).cloned());
        out
    }

    // --------------------------------------------------------------------------------------------
    // Overlay queries: apply buffered writes on top of a segment-derived
    // base view.
    // --------------------------------------------------------------------------------------------

    /// Apply buffered table revisions of the view's record to `view`.
    pub fn overlay_table(&self, view: &mut Record<Table>) {
        let record = *view.locator();
        for write in self.writes_matching(|w| w.record == record) {
            let revision = Revision::<Table>::new(
                write.record,
                write.key.clone(),
                write.value.clone(),
                write.version,
                write.action,
            );
            // same-version duplicates are the same revision seen through
            // a second path; append skips them
            let _ = view.append(revision);
        }
    }

    /// Apply buffered index revisions of the view's key to `view`.
    pub fn overlay_index(&self, view: &mut Record<Index>) {
        let key = view.locator().clone();
        for write in self.writes_matching(|w| w.key == key) {
            let revision = Revision::<Index>::new(
                write.key.clone(),
                write.value.clone(),
                write.record,
                write.version,
                write.action,
            );
            let _ = view.append(revision);
        }
    }

    /// Apply buffered corpus revisions of the view's key to `view`,
    /// tokenizing string values the same way the transporter does.
    pub fn overlay_corpus(&self, view: &mut Record<Corpus>) {
        let key = view.locator().clone();
        for write in self.writes_matching(|w| w.key == key) {
            let Value::String(text) = &write.value else {
                continue;
            };
            for (index, token) in tokenize(text.as_str()).into_iter().enumerate() {
                let revision = Revision::<Corpus>::new(
                    write.key.clone(),
                    token,
                    Position {
                        record: write.record,
                        index: index as u32,
                    },
                    write.version,
                    write.action,
                );
                let _ = view.append(revision);
            }
        }
    }

    /// Add every buffered record id to `out`.
    pub fn inventory_into(&self, out: &mut std::collections::BTreeSet<Id>) {
        for write in self.iterator() {
            out.insert(write.record);
        }
    }

    /// Field names buffered for `record` (before parity resolution).
    pub fn keys_touched(&self, record: Id) -> Vec<Text> {
        self.writes_matching(|w| w.record == record)
            .into_iter()
            .map(|w| w.key)
            .collect()
    }

    /// Sync the head page file.
    pub fn sync(&self) -> Result<(), LimboError> {
        let inner = self.lock()?;
        inner.head.file.sync_all()?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Page I/O
// ------------------------------------------------------------------------------------------------

fn page_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("page-{seq:06}.lmb"))
}

fn create_page(dir: &Path, seq: u64) -> Result<HeadPage, LimboError> {
    let path = page_path(dir, seq);
    let mut file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)?;

    let mut header = Vec::with_capacity(PAGE_HEADER_SIZE as usize);
    header.extend_from_slice(&PAGE_MAGIC.to_be_bytes());
    header.extend_from_slice(&(seq as u32).to_be_bytes());
    let mut hasher = Crc32::new();
    hasher.update(&header);
    header.extend_from_slice(&hasher.finalize().to_be_bytes());
    file.write_all(&header)?;
    file.sync_all()?;

    debug!(path = %path.display(), seq, "limbo page created");
    Ok(HeadPage {
        seq,
        path,
        file,
        writes: Vec::new(),
        bytes: PAGE_HEADER_SIZE,
    })
}

/// `[u32 len][bytes][u32 crc]` with the CRC over `len ‖ bytes`.
fn frame_record(bytes: &[u8]) -> Vec<u8> {
    let len = (bytes.len() as u32).to_be_bytes();
    let mut hasher = Crc32::new();
    hasher.update(&len);
    hasher.update(bytes);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(bytes.len() + 2 * U32_SIZE);
    frame.extend_from_slice(&len);
    frame.extend_from_slice(bytes);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Replay one page file. Returns the decoded writes and the byte offset
/// at which appending may resume.
///
/// A torn record at the tail of the highest-sequence page (`reclaim_tail`)
/// is truncated away; any failure elsewhere is corruption.
fn replay_page(
    path: &Path,
    expected_seq: u64,
    reclaim_tail: bool,
    config: &LimboConfig,
) -> Result<(Vec<Write>, u64), LimboError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.len() < PAGE_HEADER_SIZE as usize {
        return Err(corrupt(path, "page shorter than header"));
    }
    let magic = u32::from_be_bytes(slice4(&bytes[0..4], path)?);
    let seq = u32::from_be_bytes(slice4(&bytes[4..8], path)?);
    let stored_crc = u32::from_be_bytes(slice4(&bytes[8..12], path)?);
    let mut hasher = Crc32::new();
    hasher.update(&bytes[0..8]);
    if magic != PAGE_MAGIC || hasher.finalize() != stored_crc {
        return Err(corrupt(path, "bad page header"));
    }
    if seq as u64 != expected_seq {
        return Err(corrupt(
            path,
            &format!("sequence mismatch: file named {expected_seq}, header says {seq}"),
        ));
    }

    let mut writes = Vec::new();
    let mut offset = PAGE_HEADER_SIZE as usize;
    loop {
        if offset == bytes.len() {
            break;
        }
        match read_record(&bytes[offset..], config, path) {
            Ok(Some((write, consumed))) => {
                writes.push(write);
                offset += consumed;
            }
            Ok(None) | Err(_) if reclaim_tail => {
                warn!(
                    path = %path.display(),
                    offset,
                    "truncating torn tail record on active page"
                );
                file.set_len(offset as u64)?;
                file.seek(SeekFrom::End(0))?;
                file.sync_all()?;
                break;
            }
            Ok(None) => {
                return Err(corrupt(path, "truncated record in rotated page"));
            }
            Err(e) => return Err(e),
        }
    }
    debug!(path = %path.display(), writes = writes.len(), "page replayed");
    Ok((writes, offset as u64))
}

/// Decode one record frame. `Ok(None)` means the frame is incomplete
/// (torn write); errors mean structural corruption.
fn read_record(
    buf: &[u8],
    config: &LimboConfig,
    path: &Path,
) -> Result<Option<(Write, usize)>, LimboError> {
    if buf.len() < U32_SIZE {
        return Ok(None);
    }
    let len_bytes: [u8; 4] = buf[..U32_SIZE]
        .try_into()
        .map_err(|_| corrupt(path, "length prefix read"))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > config.max_write_size as usize {
        return Err(corrupt(
            path,
            &format!("record length {len} exceeds the write size limit"),
        ));
    }
    let total = U32_SIZE + len + U32_SIZE;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = &buf[U32_SIZE..U32_SIZE + len];
    let stored_crc = u32::from_be_bytes(
        buf[U32_SIZE + len..total]
            .try_into()
            .map_err(|_| corrupt(path, "record checksum read"))?,
    );
    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(corrupt(path, "record checksum mismatch"));
    }
    let (write, _) = encoding::decode_from_slice::<Write>(payload)
        .map_err(|e| corrupt(path, &format!("record decode: {e}")))?;
    Ok(Some((write, total)))
}

fn corrupt(path: &Path, detail: &str) -> LimboError {
    LimboError::Corruption {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn slice4(bytes: &[u8], path: &Path) -> Result<[u8; 4], LimboError> {
    bytes
        .try_into()
        .map_err(|_| corrupt(path, "fixed-width field read"))
}
