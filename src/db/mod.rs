//! The database facade: lifecycle, recovery, and composition.
//!
//! [`Db`] wires the subsystems together: Limbo (durable write buffer),
//! the published segment list, the transporter worker, the monotonic
//! version clock, and a bounded cache of record views.
//!
//! ## Read path
//!
//! Every read materializes (or reuses from cache) a [`Record`] view that
//! merges the limbo overlay with segment chunk seeks, then answers at the
//! requested version. Views hold the complete history of their locator,
//! so one cached view serves reads at any snapshot.
//!
//! View builders apply the limbo overlay **before** scanning segments:
//! a batch being transported is visible in its page until after its
//! segment is published, so overlay-then-scan can only observe a write
//! twice (absorbed by identity deduplication), never zero times.
//!
//! ## Write path
//!
//! [`Db::accept`] validates the ADD/REMOVE alternation invariant, assigns
//! a version under the commit lock, appends to Limbo (durable before the
//! acknowledgement), re-appends into any cached views, and wakes the
//! transporter when a page rotated.
//!
//! ## Recovery
//!
//! [`Db::start`] recovers segments (dropping duplicates and incomplete
//! triples), replays limbo pages (rotated pages queue for transport
//! again), seeds the version clock past everything recovered, and starts
//! the transporter.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::atomic::{AtomicError, AtomicOperation, Transaction};
use crate::chunk::{ChunkError, Corpus, Index, Revision, Table};
use crate::limbo::{FsyncPolicy, Limbo, LimboConfig, LimboError};
use crate::query::{self, Criteria, NavStrategy, QueryError};
use crate::record::Record;
use crate::segment::{self, Segment, SegmentError};
use crate::transport::{TransportContext, TransportError, Transporter};
use crate::value::{Action, Id, Position, Text, Value, Version, Write};

const BUFFER_DIR: &str = "buffer";
const SEGMENTS_DIR: &str = "segments";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// The public error taxonomy. Internal subsystem errors are folded into
/// these kinds; OS-level detail never crosses this boundary unwrapped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Checksum mismatch or structural damage in a chunk or page. The
    /// affected artifact is quarantined; unaffected data keeps serving.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A write could not be made durable; it was **not** acknowledged.
    #[error("durability failure: {0}")]
    Durability(String),

    /// Optimistic validation failed; the operation may be retried.
    #[error("atomic operation must retry")]
    Retry,

    /// Unrecoverable commit precondition failure.
    #[error("atomic operation failed: {0}")]
    Fail(String),

    /// Limbo back-pressure hard cap reached; retry later.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Malformed value, illegal key, or unparsable criteria. No state
    /// changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation on a stopped database.
    #[error("database is stopped")]
    Stopped,
}

impl From<LimboError> for DbError {
    fn from(e: LimboError) -> Self {
        match e {
            LimboError::Io(io) => DbError::Durability(io.to_string()),
            LimboError::Corruption { .. } => DbError::Corruption(e.to_string()),
            LimboError::Overloaded { .. } => DbError::Overloaded(e.to_string()),
            LimboError::WriteTooLarge(_) => DbError::InvalidArgument(e.to_string()),
            LimboError::Encoding(_) => DbError::Internal(e.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<ChunkError> for DbError {
    fn from(e: ChunkError) -> Self {
        match e {
            ChunkError::Corruption { .. } => DbError::Corruption(e.to_string()),
            ChunkError::Io(io) => DbError::Corruption(io.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<SegmentError> for DbError {
    fn from(e: SegmentError) -> Self {
        match e {
            SegmentError::Chunk(chunk) => chunk.into(),
            SegmentError::InvalidHeader { .. } => DbError::Corruption(e.to_string()),
            SegmentError::Io(io) => DbError::Corruption(io.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<TransportError> for DbError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Limbo(inner) => inner.into(),
            TransportError::Segment(inner) => inner.into(),
            TransportError::Internal(msg) => DbError::Internal(msg),
        }
    }
}

impl From<QueryError> for DbError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidCriteria(msg) => DbError::InvalidArgument(msg),
            QueryError::Store(inner) => match inner.downcast::<DbError>() {
                Ok(db) => *db,
                Err(other) => DbError::Internal(other.to_string()),
            },
        }
    }
}

impl From<AtomicError> for DbError {
    fn from(e: AtomicError) -> Self {
        match e {
            AtomicError::Retry => DbError::Retry,
            AtomicError::Fail(msg) => DbError::Fail(msg),
            AtomicError::Query(q) => q.into(),
            AtomicError::Db(inner) => *inner,
            AtomicError::Finished => {
                DbError::Internal("atomic operation already finished".into())
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Database tuning knobs. Passed to [`Db::start`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Limbo page rotation threshold in bytes.
    pub limbo_page_size: usize,

    /// Durability policy for limbo appends.
    pub fsync_policy: FsyncPolicy,

    /// Bloom filter false-positive probability for new chunks.
    pub bloom_fpp: f64,

    /// Record-view cache capacity in entries.
    pub record_cache_capacity: usize,

    /// Rotated-page count that logs a latency warning.
    pub limbo_soft_page_cap: usize,

    /// Rotated-page count at which writers get
    /// [`DbError::Overloaded`].
    pub limbo_hard_page_cap: usize,

    /// Maximum encoded size of one write.
    pub max_write_size: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            limbo_page_size: 8 * 1024 * 1024,
            fsync_policy: FsyncPolicy::Group,
            bloom_fpp: crate::bloom::DEFAULT_FPP,
            record_cache_capacity: 100_000,
            limbo_soft_page_cap: 8,
            limbo_hard_page_cap: 64,
            max_write_size: 1024 * 1024,
        }
    }
}

impl DbConfig {
    fn validate(&self) -> Result<(), DbError> {
        if self.limbo_page_size < 4096 {
            return Err(DbError::InvalidArgument(
                "limbo_page_size must be at least 4096 bytes".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.bloom_fpp) || self.bloom_fpp <= 0.0 {
            return Err(DbError::InvalidArgument(
                "bloom_fpp must be in (0, 1)".into(),
            ));
        }
        if self.record_cache_capacity == 0 {
            return Err(DbError::InvalidArgument(
                "record_cache_capacity must be positive".into(),
            ));
        }
        if self.limbo_hard_page_cap < self.limbo_soft_page_cap {
            return Err(DbError::InvalidArgument(
                "limbo_hard_page_cap must be >= limbo_soft_page_cap".into(),
            ));
        }
        Ok(())
    }

    fn limbo(&self) -> LimboConfig {
        LimboConfig {
            page_size: self.limbo_page_size,
            fsync_policy: self.fsync_policy,
            soft_page_cap: self.limbo_soft_page_cap,
            hard_page_cap: self.limbo_hard_page_cap,
            max_write_size: self.max_write_size,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Version clock
// ------------------------------------------------------------------------------------------------

/// Strictly monotonic commit-version source:
/// `microseconds-since-epoch << 16`, bumped past the last issued value.
#[derive(Debug)]
struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    fn seeded(floor: Version) -> VersionClock {
        VersionClock {
            last: AtomicU64::new(floor),
        }
    }

    fn next(&self) -> Version {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_micros() as u64) << 16)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = wall.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Db
// ------------------------------------------------------------------------------------------------

type CacheKey = (Id, Option<Text>);
type CachedView = Arc<RwLock<Record<Table>>>;

/// The database. See the [module docs](self).
pub struct Db {
    root: PathBuf,
    config: DbConfig,
    limbo: Arc<Limbo>,
    segments: Arc<RwLock<Vec<Segment>>>,
    clock: VersionClock,
    /// Serializes version assignment, validation, and limbo appends.
    commit_lock: Mutex<()>,
    cache: Mutex<LruCache<CacheKey, CachedView>>,
    transport_ctx: Arc<TransportContext>,
    transporter: Mutex<Option<Transporter>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("root", &self.root)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Open (or create) a database rooted at `root` and start its
    /// transporter.
    pub fn start<P: AsRef<Path>>(root: P, config: DbConfig) -> Result<Db, DbError> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| DbError::Durability(e.to_string()))?;

        // 1. Segments: validate headers, drop duplicates and incomplete
        //    triples, sort by ordinal.
        let segments = segment::recover(&root.join(SEGMENTS_DIR))?;
        let next_ordinal = segments.last().map(|s| s.ordinal() + 1).unwrap_or(0);
        let segment_floor = segments
            .iter()
            .map(|s| s.header().max_version)
            .max()
            .unwrap_or(0);

        // 2. Limbo: replay pages; rotated pages queue for transport again.
        let (limbo, limbo_floor) =
            Limbo::open(root.join(BUFFER_DIR), config.limbo(), next_ordinal)?;

        let limbo = Arc::new(limbo);
        let segments = Arc::new(RwLock::new(segments));
        let transport_ctx = Arc::new(TransportContext {
            limbo: Arc::clone(&limbo),
            segments: Arc::clone(&segments),
            segments_dir: root.join(SEGMENTS_DIR),
            bloom_fpp: config.bloom_fpp,
            pass_lock: Mutex::new(()),
        });

        // 3. Transporter worker.
        let transporter = Transporter::spawn(Arc::clone(&transport_ctx))?;

        let cache_capacity = NonZeroUsize::new(config.record_cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        let db = Db {
            clock: VersionClock::seeded(segment_floor.max(limbo_floor)),
            commit_lock: Mutex::new(()),
            cache: Mutex::new(LruCache::new(cache_capacity)),
            transporter: Mutex::new(Some(transporter)),
            running: AtomicBool::new(true),
            limbo,
            segments,
            transport_ctx,
            config,
            root,
        };
        info!(root = %db.root.display(), "database started");
        Ok(db)
    }

    /// Stop the database: final transport drain, then worker shutdown.
    /// Idempotent.
    pub fn stop(&self) -> Result<(), DbError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut slot) = self.transporter.lock()
            && let Some(mut transporter) = slot.take()
        {
            transporter.shutdown();
        }
        self.limbo.sync()?;
        info!(root = %self.root.display(), "database stopped");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), DbError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Stopped)
        }
    }

    /// The database root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mint the next commit version. Callers must hold the commit lock.
    pub(crate) fn next_version(&self) -> Version {
        self.clock.next()
    }

    /// The commit lock guarding validation + version assignment + append.
    pub(crate) fn commit_lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, DbError> {
        self.commit_lock
            .lock()
            .map_err(|_| DbError::Internal("commit lock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Write surface
    // --------------------------------------------------------------------------------------------

    /// Accept one write: validate, assign a version, append durably.
    ///
    /// Violations of the ADD/REMOVE alternation (adding a present value,
    /// removing an absent one) are rejected with
    /// [`DbError::InvalidArgument`] and change nothing.
    pub fn accept(&self, write: Write) -> Result<Version, DbError> {
        self.ensure_running()?;
        validate_key(&write.key)?;
        let _commit = self.commit_lock()?;
        self.check_parity(&write)?;
        let versions = self.apply_writes(vec![write])?;
        versions
            .first()
            .copied()
            .ok_or_else(|| DbError::Internal("accept produced no version".into()))
    }

    /// Convenience ADD: `Ok(true)` on success, `Ok(false)` when the value
    /// is already present.
    pub fn add(&self, key: Text, value: Value, record: Id) -> Result<bool, DbError> {
        match self.accept(Write::add(key, value, record)) {
            Ok(_) => Ok(true),
            Err(DbError::InvalidArgument(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Convenience REMOVE: `Ok(true)` on success, `Ok(false)` when the
    /// value is absent.
    pub fn remove(&self, key: Text, value: Value, record: Id) -> Result<bool, DbError> {
        match self.accept(Write::remove(key, value, record)) {
            Ok(_) => Ok(true),
            Err(DbError::InvalidArgument(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Enforce strict ADD/REMOVE alternation for the write's exact
    /// triple. Caller holds the commit lock.
    fn check_parity(&self, write: &Write) -> Result<(), DbError> {
        let present = self
            .base_select(write.record, &write.key, Version::MAX)?
            .contains(&write.value);
        match write.action {
            Action::Add if present => Err(DbError::InvalidArgument(format!(
                "{} already present for {}/{}",
                write.value, write.record, write.key
            ))),
            Action::Remove if !present => Err(DbError::InvalidArgument(format!(
                "{} not present for {}/{}",
                write.value, write.record, write.key
            ))),
            _ => Ok(()),
        }
    }

    /// Version and append a validated batch, then refresh cached views
    /// and wake the transporter on rotation. Caller holds the commit
    /// lock.
    pub(crate) fn apply_writes(&self, mut writes: Vec<Write>) -> Result<Vec<Version>, DbError> {
        let mut versions = Vec::with_capacity(writes.len());
        for write in &mut writes {
            write.version = self.clock.next();
            versions.push(write.version);
        }
        let rotated = self.limbo.insert(&writes)?;
        for write in &writes {
            self.refresh_cached_views(write);
        }
        if rotated
            && let Ok(slot) = self.transporter.lock()
            && let Some(transporter) = slot.as_ref()
        {
            transporter.wake();
        }
        Ok(versions)
    }

    /// Re-append a freshly accepted write into any cached views of its
    /// record.
    fn refresh_cached_views(&self, write: &Write) {
        let Ok(cache) = self.cache.lock() else {
            return;
        };
        for key in [None, Some(write.key.clone())] {
            if let Some(view) = cache.peek(&(write.record, key)).cloned()
                && let Ok(mut guard) = view.write()
            {
                let revision = Revision::<Table>::new(
                    write.record,
                    write.key.clone(),
                    write.value.clone(),
                    write.version,
                    write.action,
                );
                let _ = guard.append(revision);
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // View construction
    // --------------------------------------------------------------------------------------------

    /// Fetch or build the table view of `(record, key)`.
    ///
    /// A `None` key asks for the full view; a cached partial of the same
    /// record is promoted (the partial entries are retired).
    fn table_view(&self, record: Id, key: Option<&Text>) -> Result<CachedView, DbError> {
        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| DbError::Internal("record cache lock poisoned".into()))?;
            // a full view answers partial questions too
            if let Some(view) = cache.get(&(record, None)) {
                return Ok(Arc::clone(view));
            }
            if let Some(k) = key
                && let Some(view) = cache.get(&(record, Some(k.clone())))
            {
                return Ok(Arc::clone(view));
            }
        }
        self.build_table_view(record, key)
    }

    fn build_table_view(&self, record: Id, key: Option<&Text>) -> Result<CachedView, DbError> {
        let shape_key = key.cloned();
        let view = Arc::new(RwLock::new(match &shape_key {
            Some(k) => Record::partial(record, k.clone()),
            None => Record::full(record),
        }));

        // Take the fill lock first, then publish: concurrent accepts and
        // readers that hit the cache block on the view lock until the
        // fill completes; identity dedup absorbs overlap with the limbo
        // overlay below.
        let mut guard = view
            .write()
            .map_err(|_| DbError::Internal("record view lock poisoned".into()))?;
        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| DbError::Internal("record cache lock poisoned".into()))?;
            if shape_key.is_none() {
                // full view supersedes partials of the same record
                let partial_keys: Vec<CacheKey> = cache
                    .iter()
                    .map(|(k, _)| k.clone())
                    .filter(|(id, k)| *id == record && k.is_some())
                    .collect();
                for stale in partial_keys {
                    cache.pop(&stale);
                }
            }
            cache.put((record, shape_key.clone()), Arc::clone(&view));
        }

        // limbo first: a transporting batch is in its page until after
        // segment publication, so this order never loses a write
        self.limbo.overlay_table(&mut guard);

        let segments = self.read_segments()?;
        for segment in segments.iter() {
            let scan = match key {
                Some(k) => segment.table().seek_key(&record, k)?,
                None => segment.table().seek(&record)?,
            };
            for revision in scan {
                let revision = revision?;
                guard
                    .append(revision)
                    .map_err(|e| DbError::Internal(e.to_string()))?;
            }
        }
        drop(guard);
        drop(segments);
        Ok(view)
    }

    /// Build the (uncached) inverted view of `key`, optionally restricted
    /// to one value class.
    fn index_view(&self, key: &Text, value: Option<&Value>) -> Result<Record<Index>, DbError> {
        let mut view = match value {
            Some(v) => Record::partial(key.clone(), v.clone()),
            None => Record::full(key.clone()),
        };
        self.limbo.overlay_index(&mut view);
        let segments = self.read_segments()?;
        for segment in segments.iter() {
            let scan = match value {
                Some(v) => segment.index().seek_key(key, v)?,
                None => segment.index().seek(key)?,
            };
            for revision in scan {
                let revision = revision?;
                view.append(revision)
                    .map_err(|e| DbError::Internal(e.to_string()))?;
            }
        }
        Ok(view)
    }

    /// Build the (uncached) corpus view of `key`.
    fn corpus_view(&self, key: &Text) -> Result<Record<Corpus>, DbError> {
        let mut view = Record::full(key.clone());
        self.limbo.overlay_corpus(&mut view);
        let segments = self.read_segments()?;
        for segment in segments.iter() {
            for revision in segment.corpus().seek(key)? {
                let revision = revision?;
                view.append(revision)
                    .map_err(|e| DbError::Internal(e.to_string()))?;
            }
        }
        Ok(view)
    }

    fn read_segments(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<Segment>>, DbError> {
        self.segments
            .read()
            .map_err(|_| DbError::Internal("segment list lock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Base read primitives (snapshot-scoped, no overlay): the foundation
    // for the public reads, the query Reader, and atomic validation.
    // --------------------------------------------------------------------------------------------

    pub(crate) fn base_select(
        &self,
        record: Id,
        key: &Text,
        at: Version,
    ) -> Result<BTreeSet<Value>, DbError> {
        let view = self.table_view(record, Some(key))?;
        let guard = view
            .read()
            .map_err(|_| DbError::Internal("record view lock poisoned".into()))?;
        Ok(guard.get_at(key, at))
    }

    pub(crate) fn base_describe(&self, record: Id, at: Version) -> Result<BTreeSet<Text>, DbError> {
        let view = self.table_view(record, None)?;
        let guard = view
            .read()
            .map_err(|_| DbError::Internal("record view lock poisoned".into()))?;
        Ok(guard.describe_at(at))
    }

    pub(crate) fn base_browse_record(
        &self,
        record: Id,
        at: Version,
    ) -> Result<BTreeMap<Text, BTreeSet<Value>>, DbError> {
        let view = self.table_view(record, None)?;
        let guard = view
            .read()
            .map_err(|_| DbError::Internal("record view lock poisoned".into()))?;
        Ok(guard.browse_at(at))
    }

    pub(crate) fn base_index_lookup(
        &self,
        key: &Text,
        value: &Value,
        at: Version,
    ) -> Result<BTreeSet<Id>, DbError> {
        Ok(self.index_view(key, Some(value))?.get_at(value, at))
    }

    pub(crate) fn base_index_browse(
        &self,
        key: &Text,
        at: Version,
    ) -> Result<BTreeMap<Value, BTreeSet<Id>>, DbError> {
        Ok(self.index_view(key, None)?.browse_at(at))
    }

    pub(crate) fn base_corpus(
        &self,
        key: &Text,
        at: Version,
    ) -> Result<BTreeMap<Text, BTreeSet<Position>>, DbError> {
        Ok(self.corpus_view(key)?.browse_at(at))
    }

    pub(crate) fn base_inventory(&self, at: Version) -> Result<BTreeSet<Id>, DbError> {
        let mut out = BTreeSet::new();
        if at == Version::MAX {
            self.limbo.inventory_into(&mut out);
        } else {
            // historical inventory: only ids first written at or before `at`
            out.extend(
                self.limbo
                    .writes_matching(|w| w.version <= at)
                    .into_iter()
                    .map(|w| w.record),
            );
        }
        let segments = self.read_segments()?;
        for segment in segments.iter() {
            if at == Version::MAX {
                if let Some(manifest) = segment.table().manifest() {
                    for class in manifest.locator_classes() {
                        if let Some(id) = id_from_class(class) {
                            out.insert(id);
                        }
                    }
                } else {
                    return Err(DbError::Corruption(format!(
                        "table chunk of segment {} is quarantined",
                        segment.ordinal()
                    )));
                }
            } else {
                if segment.header().min_version > at {
                    continue;
                }
                for revision in segment.table().iterate()? {
                    let revision = revision?;
                    if revision.version <= at {
                        out.insert(revision.locator);
                    }
                }
            }
        }
        Ok(out)
    }

    // --------------------------------------------------------------------------------------------
    // Public read surface
    // --------------------------------------------------------------------------------------------

    /// Values of `key` in `record`, at `at` (or the latest state).
    pub fn select(
        &self,
        record: Id,
        key: &Text,
        at: Option<Version>,
    ) -> Result<BTreeSet<Value>, DbError> {
        self.ensure_running()?;
        self.base_select(record, key, at.unwrap_or(Version::MAX))
    }

    /// Keys of `record` currently holding at least one value.
    pub fn describe(&self, record: Id, at: Option<Version>) -> Result<BTreeSet<Text>, DbError> {
        self.ensure_running()?;
        self.base_describe(record, at.unwrap_or(Version::MAX))
    }

    /// Mapping key → values for one record.
    pub fn browse_record(
        &self,
        record: Id,
        at: Option<Version>,
    ) -> Result<BTreeMap<Text, BTreeSet<Value>>, DbError> {
        self.ensure_running()?;
        self.base_browse_record(record, at.unwrap_or(Version::MAX))
    }

    /// Mapping value → records for one key. A dotted key browses the
    /// navigation path (leaf value → origin records).
    pub fn browse_key(
        &self,
        key: &Text,
        at: Option<Version>,
    ) -> Result<BTreeMap<Value, BTreeSet<Id>>, DbError> {
        self.ensure_running()?;
        let at = at.unwrap_or(Version::MAX);
        if key.contains('.') {
            let path: Vec<Text> = key.split('.').map(Text::new).collect();
            let reader = DbReader { db: self, at };
            return Ok(query::browse_navigation(&reader, &path)?);
        }
        self.base_index_browse(key, at)
    }

    /// True when `record`'s `key` holds a value class-equal to `value`.
    pub fn verify(
        &self,
        record: Id,
        key: &Text,
        value: &Value,
        at: Option<Version>,
    ) -> Result<bool, DbError> {
        let class = value.class_bytes();
        Ok(self
            .select(record, key, at)?
            .iter()
            .any(|v| v.class_bytes() == class))
    }

    /// Records satisfying `criteria` at `at`.
    pub fn find(&self, criteria: &Criteria, at: Option<Version>) -> Result<BTreeSet<Id>, DbError> {
        self.find_with_strategy(criteria, at, NavStrategy::Auto)
    }

    /// [`Db::find`] with a pinned navigation strategy.
    pub fn find_with_strategy(
        &self,
        criteria: &Criteria,
        at: Option<Version>,
        strategy: NavStrategy,
    ) -> Result<BTreeSet<Id>, DbError> {
        self.ensure_running()?;
        let reader = DbReader {
            db: self,
            at: at.unwrap_or(Version::MAX),
        };
        Ok(query::find_with_strategy(&reader, criteria, strategy)?)
    }

    /// Full-text infix search over `key`.
    pub fn search(
        &self,
        key: &Text,
        query_text: &str,
        at: Option<Version>,
    ) -> Result<BTreeSet<Id>, DbError> {
        self.ensure_running()?;
        let reader = DbReader {
            db: self,
            at: at.unwrap_or(Version::MAX),
        };
        Ok(query::search(&reader, key, query_text)?)
    }

    /// The value set of `(record, key)` after each revision in
    /// `[from, to]`.
    pub fn chronologize(
        &self,
        record: Id,
        key: &Text,
        from: Version,
        to: Version,
    ) -> Result<BTreeMap<Version, BTreeSet<Value>>, DbError> {
        self.ensure_running()?;
        let view = self.table_view(record, Some(key))?;
        let guard = view
            .read()
            .map_err(|_| DbError::Internal("record view lock poisoned".into()))?;
        Ok(guard.chronologize(key, from, to))
    }

    /// The full revision history of `record`: version → description.
    pub fn audit(&self, record: Id) -> Result<BTreeMap<Version, String>, DbError> {
        self.ensure_running()?;
        let mut out = BTreeMap::new();
        for write in self.limbo.writes_matching(|w| w.record == record) {
            out.insert(write.version, write.to_string());
        }
        let segments = self.read_segments()?;
        for segment in segments.iter() {
            for revision in segment.table().seek(&record)? {
                let revision = revision?;
                out.insert(revision.version, revision.to_string());
            }
        }
        Ok(out)
    }

    /// Every record id ever written.
    pub fn inventory(&self) -> Result<BTreeSet<Id>, DbError> {
        self.ensure_running()?;
        self.base_inventory(Version::MAX)
    }

    // --------------------------------------------------------------------------------------------
    // Atomic operations, transactions, sync
    // --------------------------------------------------------------------------------------------

    /// Begin an optimistic atomic operation at the current snapshot.
    pub fn start_atomic(&self) -> Result<AtomicOperation<'_>, DbError> {
        self.ensure_running()?;
        Ok(AtomicOperation::begin(self))
    }

    /// Begin a transaction at the current snapshot.
    pub fn start_transaction(&self) -> Result<Transaction<'_>, DbError> {
        self.ensure_running()?;
        Ok(Transaction::begin(self))
    }

    /// The snapshot version new operations would observe.
    pub fn current_version(&self) -> Version {
        self.clock.last.load(Ordering::SeqCst)
    }

    /// Force-transport everything buffered: rotate the head page, then
    /// drain every rotated page on the calling thread.
    pub fn sync(&self) -> Result<usize, DbError> {
        self.ensure_running()?;
        self.limbo.rotate_head()?;
        Ok(self.transport_ctx.drain_all()?)
    }

    /// Rotated pages awaiting transport.
    pub fn pending_transport_pages(&self) -> usize {
        self.limbo.pending_pages()
    }

    /// Published segment count.
    pub fn segment_count(&self) -> usize {
        self.read_segments().map(|s| s.len()).unwrap_or(0)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "database stop failed during drop");
        }
        debug!(root = %self.root.display(), "database dropped; segment maps released");
    }
}

// ------------------------------------------------------------------------------------------------
// Query reader
// ------------------------------------------------------------------------------------------------

/// Snapshot-scoped [`query::Reader`] over the database.
pub(crate) struct DbReader<'db> {
    pub(crate) db: &'db Db,
    pub(crate) at: Version,
}

impl query::Reader for DbReader<'_> {
    fn select(&self, record: Id, key: &Text) -> Result<BTreeSet<Value>, QueryError> {
        self.db
            .base_select(record, key, self.at)
            .map_err(QueryError::store)
    }

    fn index_lookup(&self, key: &Text, value: &Value) -> Result<BTreeSet<Id>, QueryError> {
        self.db
            .base_index_lookup(key, value, self.at)
            .map_err(QueryError::store)
    }

    fn index_browse(&self, key: &Text) -> Result<BTreeMap<Value, BTreeSet<Id>>, QueryError> {
        self.db
            .base_index_browse(key, self.at)
            .map_err(QueryError::store)
    }

    fn corpus_positions(
        &self,
        key: &Text,
    ) -> Result<BTreeMap<Text, BTreeSet<Position>>, QueryError> {
        self.db.base_corpus(key, self.at).map_err(QueryError::store)
    }

    fn inventory(&self) -> Result<BTreeSet<Id>, QueryError> {
        self.db.base_inventory(self.at).map_err(QueryError::store)
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Keys must be non-empty and must not contain the navigation separator.
pub(crate) fn validate_key(key: &Text) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    if key.contains('.') {
        return Err(DbError::InvalidArgument(format!(
            "key {key:?} must not contain '.' (reserved for navigation)"
        )));
    }
    Ok(())
}

fn id_from_class(class: &[u8]) -> Option<Id> {
    let bytes: [u8; 8] = class.try_into().ok()?;
    Some(Id(u64::from_be_bytes(bytes)))
}
