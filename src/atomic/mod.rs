//! Optimistic atomic operations and transactions.
//!
//! An [`AtomicOperation`] pins a snapshot version and records two sets:
//!
//! - a **read set** of primitive observations (value sets, index maps,
//!   corpus maps, inventory) captured *pure* — the database state at the
//!   snapshot, before any overlay;
//! - a **write set** of unversioned writes, applied as an overlay to the
//!   operation's own reads (read-your-writes).
//!
//! Because the overlay is a deterministic function of the pure state, the
//! commit protocol only has to re-check the pure observations: take the
//! database commit lock, re-evaluate every read against the live state,
//! and abort with [`AtomicError::Retry`] on any deviation. On success,
//! every queued write receives a fresh version and lands in Limbo in
//! order — the same durable append path as a plain write.
//!
//! A REMOVE whose target is absent once earlier queued writes are applied
//! is unrecoverable and fails with [`AtomicError::Fail`].
//!
//! [`execute_with_retry`] re-runs a closure until its commit sticks; it
//! never caps retries — cancellation belongs to the caller.
//!
//! ## Transactions
//!
//! A [`Transaction`] composes atomics: each inner atomic validates
//! against the transaction's snapshot plus the writes of previously
//! committed inner atomics (never the live database), and its read and
//! write sets fold into the transaction. Committing the transaction
//! validates the combined read set against the live database and applies
//! all writes as one Limbo append sequence.
//!
//! Navigation traversals evaluate through the operation's
//! [`query::Reader`] implementation, so every intermediate read lands in
//! the read set automatically.


use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, trace};

use crate::db::{Db, DbError, validate_key};
use crate::query::{self, Criteria, QueryError};
use crate::query::tokenize::tokenize;
use crate::value::{Action, Id, Position, Text, Value, Version, Write};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by atomic operations and transactions.
#[derive(Debug, Error)]
pub enum AtomicError {
    /// Optimistic validation failed; re-run the routine.
    #[error("read set violated; retry")]
    Retry,

    /// Unrecoverable commit precondition (REMOVE of an absent value).
    #[error("atomic failure: {0}")]
    Fail(String),

    /// The operation already committed or aborted.
    #[error("atomic operation already finished")]
    Finished,

    /// Query evaluation failure.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Db(Box<DbError>),
}

impl From<DbError> for AtomicError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Retry => AtomicError::Retry,
            DbError::Fail(msg) => AtomicError::Fail(msg),
            other => AtomicError::Db(Box::new(other)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Read checks
// ------------------------------------------------------------------------------------------------

/// One recorded observation: what was read and the pure (overlay-free)
/// result at the snapshot.
#[derive(Debug, Clone)]
enum ReadCheck {
    Select {
        record: Id,
        key: Text,
        observed: BTreeSet<Value>,
    },
    BrowseRecord {
        record: Id,
        observed: BTreeMap<Text, BTreeSet<Value>>,
    },
    IndexBrowse {
        key: Text,
        observed: BTreeMap<Value, BTreeSet<Id>>,
    },
    Corpus {
        key: Text,
        observed: BTreeMap<Text, BTreeSet<Position>>,
    },
    Inventory {
        observed: BTreeSet<Id>,
    },
}

impl ReadCheck {
    /// Does the live database still show the recorded observation?
    fn still_holds(&self, db: &Db) -> Result<bool, DbError> {
        let now = Version::MAX;
        Ok(match self {
            ReadCheck::Select {
                record,
                key,
                observed,
            } => db.base_select(*record, key, now)? == *observed,
            ReadCheck::BrowseRecord { record, observed } => {
                db.base_browse_record(*record, now)? == *observed
            }
            ReadCheck::IndexBrowse { key, observed } => {
                db.base_index_browse(key, now)? == *observed
            }
            ReadCheck::Corpus { key, observed } => db.base_corpus(key, now)? == *observed,
            ReadCheck::Inventory { observed } => db.base_inventory(now)? == *observed,
        })
    }

    /// Does the observation, viewed through `new` writes, still equal the
    /// view through `old` writes? Detects intra-transaction conflicts
    /// without touching the database.
    fn overlay_still_holds(&self, old: &[Write], new: &[Write]) -> bool {
        match self {
            ReadCheck::Select {
                record,
                key,
                observed,
            } => {
                let mut a = observed.clone();
                let mut b = observed.clone();
                overlay_select(&mut a, old, *record, key);
                overlay_select(&mut b, new, *record, key);
                a == b
            }
            ReadCheck::BrowseRecord { record, observed } => {
                let mut a = observed.clone();
                let mut b = observed.clone();
                overlay_browse_record(&mut a, old, *record);
                overlay_browse_record(&mut b, new, *record);
                a == b
            }
            ReadCheck::IndexBrowse { key, observed } => {
                let mut a = observed.clone();
                let mut b = observed.clone();
                overlay_index_browse(&mut a, old, key);
                overlay_index_browse(&mut b, new, key);
                a == b
            }
            ReadCheck::Corpus { key, observed } => {
                let mut a = observed.clone();
                let mut b = observed.clone();
                overlay_corpus(&mut a, old, key);
                overlay_corpus(&mut b, new, key);
                a == b
            }
            ReadCheck::Inventory { observed } => {
                let mut a = observed.clone();
                let mut b = observed.clone();
                overlay_inventory(&mut a, old);
                overlay_inventory(&mut b, new);
                a == b
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Overlay helpers
// ------------------------------------------------------------------------------------------------

fn overlay_select(set: &mut BTreeSet<Value>, writes: &[Write], record: Id, key: &Text) {
    for w in writes {
        if w.record != record || w.key != *key {
            continue;
        }
        match w.action {
            Action::Add => {
                set.insert(w.value.clone());
            }
            Action::Remove => {
                set.remove(&w.value);
            }
        }
    }
}

fn overlay_browse_record(
    map: &mut BTreeMap<Text, BTreeSet<Value>>,
    writes: &[Write],
    record: Id,
) {
    for w in writes {
        if w.record != record {
            continue;
        }
        match w.action {
            Action::Add => {
                map.entry(w.key.clone()).or_default().insert(w.value.clone());
            }
            Action::Remove => {
                if let Some(values) = map.get_mut(&w.key) {
                    values.remove(&w.value);
                    if values.is_empty() {
                        map.remove(&w.key);
                    }
                }
            }
        }
    }
}

fn overlay_index_browse(map: &mut BTreeMap<Value, BTreeSet<Id>>, writes: &[Write], key: &Text) {
    for w in writes {
        if w.key != *key {
            continue;
        }
        match w.action {
            Action::Add => {
                map.entry(w.value.clone()).or_default().insert(w.record);
            }
            Action::Remove => {
                if let Some(ids) = map.get_mut(&w.value) {
                    ids.remove(&w.record);
                    if ids.is_empty() {
                        map.remove(&w.value);
                    }
                }
            }
        }
    }
}

fn overlay_corpus(map: &mut BTreeMap<Text, BTreeSet<Position>>, writes: &[Write], key: &Text) {
    for w in writes {
        if w.key != *key {
            continue;
        }
        let Value::String(text) = &w.value else {
            continue;
        };
        for (index, token) in tokenize(text.as_str()).into_iter().enumerate() {
            let position = Position {
                record: w.record,
                index: index as u32,
            };
            match w.action {
                Action::Add => {
                    map.entry(token).or_default().insert(position);
                }
                Action::Remove => {
                    if let Some(positions) = map.get_mut(&token) {
                        positions.remove(&position);
                        if positions.is_empty() {
                            map.remove(&token);
                        }
                    }
                }
            }
        }
    }
}

fn overlay_inventory(set: &mut BTreeSet<Id>, writes: &[Write]) {
    for w in writes {
        set.insert(w.record);
    }
}

// ------------------------------------------------------------------------------------------------
// AtomicOperation
// ------------------------------------------------------------------------------------------------

/// A snapshot-isolated read/write set. See the [module docs](self).
pub struct AtomicOperation<'db> {
    db: &'db Db,
    snapshot: Version,
    /// Writes of previously committed inner atomics (transactions only).
    base: Vec<Write>,
    /// The enclosing transaction's accumulator, when nested.
    txn: Option<&'db Mutex<TxnState>>,
    reads: RefCell<Vec<ReadCheck>>,
    writes: Vec<Write>,
    finished: bool,
}

impl std::fmt::Debug for AtomicOperation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("snapshot", &self.snapshot)
            .field("reads", &self.reads.borrow().len())
            .field("writes", &self.writes.len())
            .field("nested", &self.txn.is_some())
            .finish()
    }
}

impl<'db> AtomicOperation<'db> {
    pub(crate) fn begin(db: &'db Db) -> AtomicOperation<'db> {
        AtomicOperation {
            db,
            snapshot: db.current_version(),
            base: Vec::new(),
            txn: None,
            reads: RefCell::new(Vec::new()),
            writes: Vec::new(),
            finished: false,
        }
    }

    fn begin_nested(
        db: &'db Db,
        snapshot: Version,
        base: Vec<Write>,
        txn: &'db Mutex<TxnState>,
    ) -> AtomicOperation<'db> {
        AtomicOperation {
            db,
            snapshot,
            base,
            txn: Some(txn),
            reads: RefCell::new(Vec::new()),
            writes: Vec::new(),
            finished: false,
        }
    }

    /// The snapshot version this operation observes.
    pub fn snapshot(&self) -> Version {
        self.snapshot
    }

    fn ensure_open(&self) -> Result<(), AtomicError> {
        if self.finished {
            Err(AtomicError::Finished)
        } else {
            Ok(())
        }
    }

    /// The overlay visible to this operation's reads: transaction base
    /// first, then own queued writes.
    fn overlay(&self) -> Vec<Write> {
        let mut all = self.base.clone();
        all.extend(self.writes.iter().cloned());
        all
    }

    // ------------------------------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------------------------------

    /// Values of `key` in `record`, with queued writes applied.
    pub fn select(&self, record: Id, key: &Text) -> Result<BTreeSet<Value>, AtomicError> {
        self.ensure_open()?;
        let mut result = self.db.base_select(record, key, self.snapshot)?;
        self.reads.borrow_mut().push(ReadCheck::Select {
            record,
            key: key.clone(),
            observed: result.clone(),
        });
        overlay_select(&mut result, &self.overlay(), record, key);
        Ok(result)
    }

    /// Mapping key → values for one record, with queued writes applied.
    pub fn browse(&self, record: Id) -> Result<BTreeMap<Text, BTreeSet<Value>>, AtomicError> {
        self.ensure_open()?;
        let mut result = self.db.base_browse_record(record, self.snapshot)?;
        self.reads.borrow_mut().push(ReadCheck::BrowseRecord {
            record,
            observed: result.clone(),
        });
        overlay_browse_record(&mut result, &self.overlay(), record);
        Ok(result)
    }

    /// Keys of `record` currently holding at least one value.
    pub fn describe(&self, record: Id) -> Result<BTreeSet<Text>, AtomicError> {
        Ok(self.browse(record)?.into_keys().collect())
    }

    /// True when `record`'s `key` holds a value class-equal to `value`.
    pub fn verify(&self, record: Id, key: &Text, value: &Value) -> Result<bool, AtomicError> {
        let class = value.class_bytes();
        Ok(self
            .select(record, key)?
            .iter()
            .any(|v| v.class_bytes() == class))
    }

    /// Records satisfying `criteria` in this operation's view.
    pub fn find(&self, criteria: &Criteria) -> Result<BTreeSet<Id>, AtomicError> {
        self.ensure_open()?;
        Ok(query::find(self, criteria)?)
    }

    /// Full-text infix search in this operation's view.
    pub fn search(&self, key: &Text, query_text: &str) -> Result<BTreeSet<Id>, AtomicError> {
        self.ensure_open()?;
        Ok(query::search(self, key, query_text)?)
    }

    // ------------------------------------------------------------------------------------------
    // Write surface
    // ------------------------------------------------------------------------------------------

    /// Queue an ADD. `Ok(false)` when the exact value is already present
    /// in this operation's view.
    pub fn add(&mut self, key: Text, value: Value, record: Id) -> Result<bool, AtomicError> {
        self.ensure_open()?;
        validate_key(&key)?;
        if self.select(record, &key)?.contains(&value) {
            return Ok(false);
        }
        self.writes.push(Write::add(key, value, record));
        Ok(true)
    }

    /// Queue a REMOVE. `Ok(false)` when the exact value is absent in this
    /// operation's view.
    pub fn remove(&mut self, key: Text, value: Value, record: Id) -> Result<bool, AtomicError> {
        self.ensure_open()?;
        validate_key(&key)?;
        if !self.select(record, &key)?.contains(&value) {
            return Ok(false);
        }
        self.writes.push(Write::remove(key, value, record));
        Ok(true)
    }

    /// Pin the whole record in the read set without changing anything.
    pub fn touch(&mut self, record: Id) -> Result<(), AtomicError> {
        self.browse(record).map(|_| ())
    }

    // ------------------------------------------------------------------------------------------
    // Commit / abort
    // ------------------------------------------------------------------------------------------

    /// Validate the read set and apply the write set. Consumes the
    /// operation; on [`AtomicError::Retry`] the caller starts over.
    pub fn commit(mut self) -> Result<Vec<Version>, AtomicError> {
        self.ensure_open()?;
        self.finished = true;

        if let Some(txn) = self.txn {
            // commit into the enclosing transaction, serialized by its lock
            let mut state = txn
                .lock()
                .map_err(|_| AtomicError::Db(Box::new(DbError::Internal(
                    "transaction lock poisoned".into(),
                ))))?;
            for check in self.reads.borrow().iter() {
                if !check.overlay_still_holds(&self.base, &state.writes) {
                    debug!("nested atomic read set violated inside transaction");
                    return Err(AtomicError::Retry);
                }
            }
            state.writes.append(&mut self.writes);
            state.reads.append(&mut self.reads.borrow_mut());
            trace!(total_writes = state.writes.len(), "nested atomic folded into transaction");
            return Ok(Vec::new());
        }

        let _commit = self.db.commit_lock()?;
        for check in self.reads.borrow().iter() {
            if !check.still_holds(self.db)? {
                debug!(snapshot = self.snapshot, "atomic read set violated");
                return Err(AtomicError::Retry);
            }
        }
        check_queue_parity(self.db, &self.writes)?;
        let writes = std::mem::take(&mut self.writes);
        let versions = self.db.apply_writes(writes)?;
        debug!(
            snapshot = self.snapshot,
            committed = versions.len(),
            "atomic committed"
        );
        Ok(versions)
    }

    /// Discard the operation.
    pub fn abort(mut self) {
        self.finished = true;
        self.writes.clear();
        self.reads.borrow_mut().clear();
    }
}

/// Simulate applying queued writes over the live state, rejecting any
/// write that violates ADD/REMOVE alternation.
fn check_queue_parity(db: &Db, writes: &[Write]) -> Result<(), AtomicError> {
    let mut state: HashMap<(Id, Text), BTreeSet<Value>> = HashMap::new();
    for write in writes {
        let cell = (write.record, write.key.clone());
        if !state.contains_key(&cell) {
            state.insert(
                cell.clone(),
                db.base_select(write.record, &write.key, Version::MAX)?,
            );
        }
        let values = state
            .get_mut(&cell)
            .ok_or_else(|| AtomicError::Fail("parity state lookup failed".into()))?;
        match write.action {
            Action::Add => {
                if !values.insert(write.value.clone()) {
                    return Err(AtomicError::Fail(format!(
                        "add of already-present {} for {}/{}",
                        write.value, write.record, write.key
                    )));
                }
            }
            Action::Remove => {
                if !values.remove(&write.value) {
                    return Err(AtomicError::Fail(format!(
                        "remove of absent {} for {}/{}",
                        write.value, write.record, write.key
                    )));
                }
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Reader impl: find/search/navigation run inside the operation's view and
// record every primitive observation on the way.
// ------------------------------------------------------------------------------------------------

impl query::Reader for AtomicOperation<'_> {
    fn select(&self, record: Id, key: &Text) -> Result<BTreeSet<Value>, QueryError> {
        AtomicOperation::select(self, record, key).map_err(QueryError::store)
    }

    fn index_lookup(&self, key: &Text, value: &Value) -> Result<BTreeSet<Id>, QueryError> {
        // exact answers require the full inverted map: removal of one
        // variant must not hide a still-present class-equal variant
        let browse = query::Reader::index_browse(self, key)?;
        let class = value.class_bytes();
        let mut out = BTreeSet::new();
        for (stored, ids) in browse {
            if stored.class_bytes() == class {
                out.extend(ids);
            }
        }
        Ok(out)
    }

    fn index_browse(&self, key: &Text) -> Result<BTreeMap<Value, BTreeSet<Id>>, QueryError> {
        let mut result = self
            .db
            .base_index_browse(key, self.snapshot)
            .map_err(QueryError::store)?;
        self.reads.borrow_mut().push(ReadCheck::IndexBrowse {
            key: key.clone(),
            observed: result.clone(),
        });
        overlay_index_browse(&mut result, &self.overlay(), key);
        Ok(result)
    }

    fn corpus_positions(
        &self,
        key: &Text,
    ) -> Result<BTreeMap<Text, BTreeSet<Position>>, QueryError> {
        let mut result = self
            .db
            .base_corpus(key, self.snapshot)
            .map_err(QueryError::store)?;
        self.reads.borrow_mut().push(ReadCheck::Corpus {
            key: key.clone(),
            observed: result.clone(),
        });
        overlay_corpus(&mut result, &self.overlay(), key);
        Ok(result)
    }

    fn inventory(&self) -> Result<BTreeSet<Id>, QueryError> {
        let mut result = self
            .db
            .base_inventory(self.snapshot)
            .map_err(QueryError::store)?;
        self.reads.borrow_mut().push(ReadCheck::Inventory {
            observed: result.clone(),
        });
        overlay_inventory(&mut result, &self.overlay());
        Ok(result)
    }
}

// ------------------------------------------------------------------------------------------------
// execute_with_retry
// ------------------------------------------------------------------------------------------------

/// Run `routine` inside fresh atomic operations until a commit succeeds.
///
/// Retries indefinitely on [`AtomicError::Retry`]; any other error (and
/// any error returned by the routine itself) surfaces. Cancellation is
/// the caller's responsibility — return an error from the routine to stop.
pub fn execute_with_retry<T, F>(db: &Db, mut routine: F) -> Result<T, DbError>
where
    F: FnMut(&mut AtomicOperation<'_>) -> Result<T, AtomicError>,
{
    loop {
        let mut atomic = db.start_atomic()?;
        match routine(&mut atomic) {
            Ok(value) => match atomic.commit() {
                Ok(_) => return Ok(value),
                Err(AtomicError::Retry) => continue,
                Err(e) => return Err(e.into()),
            },
            Err(AtomicError::Retry) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Transaction
// ------------------------------------------------------------------------------------------------

pub(crate) struct TxnState {
    reads: Vec<ReadCheck>,
    writes: Vec<Write>,
}

/// A multi-statement transaction composing atomic operations.
///
/// Inner atomics validate against the transaction's snapshot plus its
/// accumulated writes; [`Transaction::commit`] validates the combined
/// read set against the live database and applies every write as one
/// append sequence.
pub struct Transaction<'db> {
    db: &'db Db,
    snapshot: Version,
    state: Mutex<TxnState>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db Db) -> Transaction<'db> {
        Transaction {
            db,
            snapshot: db.current_version(),
            state: Mutex::new(TxnState {
                reads: Vec::new(),
                writes: Vec::new(),
            }),
        }
    }

    /// The snapshot version the transaction observes.
    pub fn snapshot(&self) -> Version {
        self.snapshot
    }

    /// Begin an inner atomic whose base view is the transaction's
    /// snapshot plus its accumulated writes.
    pub fn start_atomic(&self) -> Result<AtomicOperation<'_>, AtomicError> {
        let base = {
            let state = self
                .state
                .lock()
                .map_err(|_| AtomicError::Db(Box::new(DbError::Internal(
                    "transaction lock poisoned".into(),
                ))))?;
            state.writes.clone()
        };
        Ok(AtomicOperation::begin_nested(
            self.db,
            self.snapshot,
            base,
            &self.state,
        ))
    }

    /// Validate every inner read against the live database and apply all
    /// accumulated writes.
    pub fn commit(self) -> Result<Vec<Version>, AtomicError> {
        let state = self
            .state
            .into_inner()
            .map_err(|_| AtomicError::Db(Box::new(DbError::Internal(
                "transaction lock poisoned".into(),
            ))))?;

        let _commit = self.db.commit_lock()?;
        for check in &state.reads {
            if !check.still_holds(self.db)? {
                debug!(snapshot = self.snapshot, "transaction read set violated");
                return Err(AtomicError::Retry);
            }
        }
        check_queue_parity(self.db, &state.writes)?;
        let versions = self.db.apply_writes(state.writes)?;
        debug!(
            snapshot = self.snapshot,
            committed = versions.len(),
            "transaction committed"
        );
        Ok(versions)
    }

    /// Discard the transaction and everything queued inside it.
    pub fn abort(self) {}
}
