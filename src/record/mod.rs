//! Per-locator merged revision views.
//!
//! A [`Record`] materializes everything known about one locator by merging
//! revisions from any number of sources: segment chunk seeks first, then
//! the limbo overlay, in insertion order. The view keeps the **complete**
//! revision history and answers both current and historical questions by
//! filtering on version at read time, which is what makes cached views
//! reusable across snapshots.
//!
//! ## Shapes
//!
//! A `Full` view holds every key of the locator; a `Partial` view holds a
//! single key and is the default cache unit. Appends outside a partial
//! view's key are ignored (`Ok(false)`), so one revision stream can feed
//! views of either shape.
//!
//! ## Presence rule
//!
//! Presence is tracked per exact `(key, value)` pair: the action sequence
//! of a triple strictly alternates, so a pair is present iff its last
//! action ≤ the read version is `Add`. Read-side matching then collapses
//! tag classes: `get` unions pairs whose key is class-equal to the probe,
//! which is how both variants of a numeric collision stay visible.
//!
//! ## Version discipline
//!
//! Versions are globally unique. A revision whose version is already in
//! the view is the same revision arriving through a second path (a write
//! observed in both a just-published segment and a not-yet-deleted limbo
//! page) and is skipped. Two *different* revisions sharing a version are
//! corruption and fail fast upstream.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use thiserror::Error;

use crate::chunk::{Flavor, Part, Revision};
use crate::value::{Action, Version};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by record view operations.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A revision for a different locator was appended.
    #[error("revision locator does not match view locator")]
    WrongLocator,
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// View shape: all keys, or a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape<K> {
    /// Every key of the locator.
    Full,
    /// Only the named key.
    Partial(K),
}

/// A merged, versioned view over one locator. See the
/// [module docs](self).
pub struct Record<F: Flavor> {
    locator: F::Locator,
    shape: Shape<F::Key>,
    /// All appended revisions, sorted by version.
    revisions: Vec<Revision<F>>,
    /// Revision identities already incorporated:
    /// `(key class, value class, version)`.
    seen: HashSet<(Vec<u8>, Vec<u8>, Version)>,
    max_version: Option<Version>,
}

impl<F: Flavor> fmt::Debug for Record<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("locator", &self.locator)
            .field("shape", &match &self.shape {
                Shape::Full => "full".to_string(),
                Shape::Partial(k) => format!("partial({k:?})"),
            })
            .field("revisions", &self.revisions.len())
            .finish()
    }
}

impl<F: Flavor> Record<F> {
    /// An empty full view of `locator`.
    pub fn full(locator: F::Locator) -> Record<F> {
        Record {
            locator,
            shape: Shape::Full,
            revisions: Vec::new(),
            seen: HashSet::new(),
            max_version: None,
        }
    }

    /// An empty partial view of `(locator, key)`.
    pub fn partial(locator: F::Locator, key: F::Key) -> Record<F> {
        Record {
            locator,
            shape: Shape::Partial(key),
            revisions: Vec::new(),
            seen: HashSet::new(),
            max_version: None,
        }
    }

    /// The view's locator.
    pub fn locator(&self) -> &F::Locator {
        &self.locator
    }

    /// The view's shape.
    pub fn shape(&self) -> &Shape<F::Key> {
        &self.shape
    }

    /// True for partial views.
    pub fn is_partial(&self) -> bool {
        matches!(self.shape, Shape::Partial(_))
    }

    /// Number of revisions held.
    pub fn revision_count(&self) -> usize {
        self.revisions.len()
    }

    /// Largest version in the view, if any.
    pub fn max_version(&self) -> Option<Version> {
        self.max_version
    }

    /// Append one revision.
    ///
    /// Returns `Ok(true)` when the revision was incorporated, `Ok(false)`
    /// when it was skipped: outside a partial view's key, or an identity
    /// already present (the same revision arriving through a second
    /// path).
    pub fn append(&mut self, revision: Revision<F>) -> Result<bool, RecordError> {
        if revision.locator.class_bytes() != self.locator.class_bytes() {
            return Err(RecordError::WrongLocator);
        }
        if let Shape::Partial(key) = &self.shape
            && revision.key.class_bytes() != key.class_bytes()
        {
            return Ok(false);
        }
        let identity = (
            revision.key.class_bytes(),
            revision.value.class_bytes(),
            revision.version,
        );
        if !self.seen.insert(identity) {
            return Ok(false);
        }
        self.max_version = Some(self.max_version.unwrap_or(0).max(revision.version));
        // revisions arrive mostly version-ordered; insert-sorted keeps
        // the scan paths simple
        let at = self
            .revisions
            .partition_point(|r| r.version < revision.version);
        self.revisions.insert(at, revision);
        Ok(true)
    }

    /// Walk revisions up to `at`, tracking presence per exact
    /// `(key, value)` pair. `key_class` limits the walk to one key class.
    fn presence(
        &self,
        key_class: Option<&[u8]>,
        at: Version,
    ) -> HashMap<(F::Key, F::Value), bool> {
        let mut state: HashMap<(F::Key, F::Value), bool> = HashMap::new();
        for revision in &self.revisions {
            if revision.version > at {
                break;
            }
            if let Some(class) = key_class
                && revision.key.class_bytes() != class
            {
                continue;
            }
            let present = matches!(revision.action, Action::Add);
            state.insert((revision.key.clone(), revision.value.clone()), present);
        }
        state
    }

    /// Values of `key` present at the latest version.
    pub fn get(&self, key: &F::Key) -> BTreeSet<F::Value> {
        self.get_at(key, Version::MAX)
    }

    /// Values of `key` present at version `at` (inclusive).
    pub fn get_at(&self, key: &F::Key, at: Version) -> BTreeSet<F::Value> {
        let class = key.class_bytes();
        self.presence(Some(&class), at)
            .into_iter()
            .filter_map(|((_, value), present)| present.then_some(value))
            .collect()
    }

    /// True when `key` currently holds a value class-equal to `value`.
    pub fn verify(&self, key: &F::Key, value: &F::Value) -> bool {
        self.verify_at(key, value, Version::MAX)
    }

    /// Historical [`Record::verify`].
    pub fn verify_at(&self, key: &F::Key, value: &F::Value, at: Version) -> bool {
        let class = value.class_bytes();
        self.get_at(key, at)
            .iter()
            .any(|v| v.class_bytes() == class)
    }

    /// Keys currently holding at least one value.
    pub fn describe(&self) -> BTreeSet<F::Key> {
        self.describe_at(Version::MAX)
    }

    /// Historical [`Record::describe`].
    pub fn describe_at(&self, at: Version) -> BTreeSet<F::Key> {
        self.presence(None, at)
            .into_iter()
            .filter_map(|((key, _), present)| present.then_some(key))
            .collect()
    }

    /// Mapping key → present values at the latest version.
    pub fn browse(&self) -> BTreeMap<F::Key, BTreeSet<F::Value>> {
        self.browse_at(Version::MAX)
    }

    /// Historical [`Record::browse`].
    pub fn browse_at(&self, at: Version) -> BTreeMap<F::Key, BTreeSet<F::Value>> {
        let mut out: BTreeMap<F::Key, BTreeSet<F::Value>> = BTreeMap::new();
        for ((key, value), present) in self.presence(None, at) {
            if present {
                out.entry(key).or_default().insert(value);
            }
        }
        out
    }

    /// For each revision of `key` whose version lies in `[from, to]`, the
    /// materialized value set immediately after that revision applied.
    pub fn chronologize(
        &self,
        key: &F::Key,
        from: Version,
        to: Version,
    ) -> BTreeMap<Version, BTreeSet<F::Value>> {
        let class = key.class_bytes();
        let mut state: HashMap<(F::Key, F::Value), bool> = HashMap::new();
        let mut out = BTreeMap::new();
        for revision in &self.revisions {
            if revision.version > to {
                break;
            }
            if revision.key.class_bytes() != class {
                continue;
            }
            let present = matches!(revision.action, Action::Add);
            state.insert((revision.key.clone(), revision.value.clone()), present);
            if revision.version >= from {
                let snapshot: BTreeSet<F::Value> = state
                    .iter()
                    .filter_map(|((_, value), on)| on.then(|| value.clone()))
                    .collect();
                out.insert(revision.version, snapshot);
            }
        }
        out
    }

    /// True when no value of any key is present at the latest version.
    pub fn is_empty(&self) -> bool {
        self.presence(None, Version::MAX)
            .values()
            .all(|present| !present)
    }

    /// Promote a partial view into an empty full view of the same
    /// locator, ready to be rebuilt from the sources.
    pub fn promote(self) -> Record<F> {
        Record::full(self.locator)
    }
}
