//! The transporter: background drain of Limbo into segments.
//!
//! One worker per database. The worker parks on a channel and wakes when
//! a limbo page rotates (or on a timer as a safety net); each pass drains
//! every rotated page, oldest first, one segment per batch:
//!
//! 1. Snapshot the next [`Batch`] from Limbo.
//! 2. Fan every write out into one table revision, one index revision,
//!    and — for string values — one corpus revision per token.
//! 3. Seal the chunk triple and the segment (chunks fsynced before the
//!    header: the header write is the visibility commit point).
//! 4. Append the segment to the shared list under the write lock,
//!    asserting ordinal continuity.
//! 5. Confirm the transport so Limbo deletes the drained page.
//!
//! A failure before step 4 leaves no published state (partial files are
//! removed by the segment builder) and the batch is retried on the next
//! pass. The page is only deleted after publication, so a crash between
//! steps 4 and 5 replays the batch; view-level identity deduplication
//! absorbs the overlap.

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::chunk::{Corpus, Index, Revision, Table};
use crate::limbo::{Batch, Limbo, LimboError};
use crate::query::tokenize::tokenize;
use crate::segment::{Segment, SegmentBuilder, SegmentError};
use crate::value::{Position, Value};

/// Idle wake-up period: catches missed signals and drains after bursts.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// Pause before retrying a failed batch.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by transport passes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Limbo hand-off failure.
    #[error("Limbo error: {0}")]
    Limbo(#[from] LimboError),

    /// Segment build or seal failure.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Ordering violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// TransportContext
// ------------------------------------------------------------------------------------------------

/// Everything a transport pass needs, shared between the background
/// worker and synchronous drains ([`crate::db::Db::sync`]).
pub struct TransportContext {
    /// The write buffer being drained.
    pub limbo: Arc<Limbo>,

    /// The database's published segment list.
    pub segments: Arc<RwLock<Vec<Segment>>>,

    /// Directory segments seal into.
    pub segments_dir: PathBuf,

    /// Bloom false-positive probability for new chunks.
    pub bloom_fpp: f64,

    /// Serializes transport passes between the worker and `sync()`.
    pub pass_lock: Mutex<()>,
}

impl TransportContext {
    /// Drain at most one batch. Returns `true` when a segment was
    /// published.
    pub fn drain_one(&self) -> Result<bool, TransportError> {
        let _pass = self
            .pass_lock
            .lock()
            .map_err(|_| TransportError::Internal("transport pass lock poisoned".into()))?;

        let Some(batch) = self.limbo.next_batch() else {
            return Ok(false);
        };
        self.check_ordinal(&batch)?;

        let segment = build_segment(&batch, &self.segments_dir, self.bloom_fpp)?;

        {
            let mut segments = self
                .segments
                .write()
                .map_err(|_| TransportError::Internal("segment list lock poisoned".into()))?;
            if let Some(last) = segments.last()
                && segment.ordinal() != last.ordinal() + 1
            {
                return Err(TransportError::Internal(format!(
                    "segment ordinal {} does not follow {}",
                    segment.ordinal(),
                    last.ordinal()
                )));
            }
            segments.push(segment);
        }

        self.limbo.confirm_transported(batch.ordinal)?;
        debug!(ordinal = batch.ordinal, writes = batch.writes.len(), "batch transported");
        Ok(true)
    }

    /// Drain every pending batch. Returns the number of segments
    /// published.
    pub fn drain_all(&self) -> Result<usize, TransportError> {
        let mut published = 0;
        while self.drain_one()? {
            published += 1;
        }
        Ok(published)
    }

    fn check_ordinal(&self, batch: &Batch) -> Result<(), TransportError> {
        let segments = self
            .segments
            .read()
            .map_err(|_| TransportError::Internal("segment list lock poisoned".into()))?;
        if let Some(last) = segments.last()
            && batch.ordinal != last.ordinal() + 1
        {
            return Err(TransportError::Internal(format!(
                "batch ordinal {} does not follow published segment {}",
                batch.ordinal,
                last.ordinal()
            )));
        }
        Ok(())
    }
}

/// Fan a batch's writes out into the three chunk flavors and seal.
fn build_segment(
    batch: &Batch,
    dir: &std::path::Path,
    fpp: f64,
) -> Result<Segment, TransportError> {
    let mut builder = SegmentBuilder::new(batch.ordinal, batch.writes.len().max(1), fpp)?;
    for write in &batch.writes {
        builder.insert_table(Revision::<Table>::new(
            write.record,
            write.key.clone(),
            write.value.clone(),
            write.version,
            write.action,
        ))?;
        builder.insert_index(Revision::<Index>::new(
            write.key.clone(),
            write.value.clone(),
            write.record,
            write.version,
            write.action,
        ))?;
        if let Value::String(text) = &write.value {
            for (index, token) in tokenize(text.as_str()).into_iter().enumerate() {
                builder.insert_corpus(Revision::<Corpus>::new(
                    write.key.clone(),
                    token,
                    Position {
                        record: write.record,
                        index: index as u32,
                    },
                    write.version,
                    write.action,
                ))?;
            }
        }
    }
    trace!(ordinal = batch.ordinal, "segment build complete, sealing");
    Ok(builder.seal(dir)?)
}

// ------------------------------------------------------------------------------------------------
// Transporter worker
// ------------------------------------------------------------------------------------------------

enum Signal {
    Wake,
    Shutdown,
}

/// Handle to the background transport worker.
pub struct Transporter {
    handle: Option<JoinHandle<()>>,
    tx: Sender<Signal>,
}

impl std::fmt::Debug for Transporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transporter")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Transporter {
    /// Spawn the worker thread.
    pub fn spawn(ctx: Arc<TransportContext>) -> Result<Transporter, TransportError> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("chronicle-transport".into())
            .spawn(move || worker_loop(&ctx, &rx))
            .map_err(|e| TransportError::Internal(format!("transporter spawn failed: {e}")))?;
        Ok(Transporter {
            handle: Some(handle),
            tx,
        })
    }

    /// Nudge the worker (called after a page rotation).
    pub fn wake(&self) {
        let _ = self.tx.send(Signal::Wake);
    }

    /// Stop the worker after a final drain.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Signal::Shutdown);
            if handle.join().is_err() {
                error!("transporter thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Transporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(ctx: &TransportContext, rx: &Receiver<Signal>) {
    info!("transporter started");
    loop {
        let signal = rx.recv_timeout(IDLE_TICK);
        match signal {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                if let Err(e) = ctx.drain_all() {
                    error!(error = %e, "final transport drain failed");
                }
                break;
            }
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = ctx.drain_all() {
                    error!(error = %e, "transport pass failed; will retry");
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    info!("transporter stopped");
}
