//! Sparse block index for a sealed chunk.
//!
//! While a chunk's sorted revision stream is being written, the manifest
//! records, for every distinct locator and every distinct `(locator, key)`
//! pair, the byte range `[start, end)` covering all of their revisions.
//! Seeks then touch only the relevant slice of the file.
//!
//! Entries are keyed by **tag-collapsed class bytes**, so two values that
//! collapse to the same equality class (`18:int` / `18.0:double`) share a
//! single combined range. The chunk sort order places class-equal values
//! adjacently, which keeps every class range contiguous.
//!
//! The manifest serializes into its own region of the chunk file and is
//! decoded from the memory map on open, without touching the revision
//! stream.

use std::collections::BTreeMap;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// A half-open byte range `[start, end)` inside a chunk's revision stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte of the range.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
}

impl ByteRange {
    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True when the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// The block index of one chunk. See the [module docs](self).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// locator class → range over every revision of that locator.
    locators: BTreeMap<Vec<u8>, ByteRange>,

    /// (locator class, key class) → range over that key's revisions.
    keys: BTreeMap<(Vec<u8>, Vec<u8>), ByteRange>,
}

impl Manifest {
    /// An empty manifest.
    pub fn new() -> Manifest {
        Manifest::default()
    }

    /// Record that the revision frame occupying `[start, end)` belongs to
    /// the given locator and key classes.
    ///
    /// Frames must be appended in stream order; an existing entry is
    /// extended to cover the new frame.
    pub fn note(&mut self, locator_class: &[u8], key_class: &[u8], start: u64, end: u64) {
        self.locators
            .entry(locator_class.to_vec())
            .and_modify(|r| r.end = r.end.max(end))
            .or_insert(ByteRange { start, end });
        self.keys
            .entry((locator_class.to_vec(), key_class.to_vec()))
            .and_modify(|r| r.end = r.end.max(end))
            .or_insert(ByteRange { start, end });
    }

    /// Byte range of every revision with the given locator class.
    pub fn lookup_locator(&self, locator_class: &[u8]) -> Option<ByteRange> {
        self.locators.get(locator_class).copied()
    }

    /// Byte range of every revision with the given locator and key
    /// classes.
    pub fn lookup_key(&self, locator_class: &[u8], key_class: &[u8]) -> Option<ByteRange> {
        self.keys
            .get(&(locator_class.to_vec(), key_class.to_vec()))
            .copied()
    }

    /// All distinct locator classes, in sorted order.
    pub fn locator_classes(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.locators.keys()
    }

    /// All distinct `(locator, key)` class pairs, in sorted order.
    pub fn key_classes(&self) -> impl Iterator<Item = &(Vec<u8>, Vec<u8>)> {
        self.keys.keys()
    }

    /// Number of distinct locators.
    pub fn locator_count(&self) -> usize {
        self.locators.len()
    }

    /// True when no ranges have been recorded.
    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Serialization
// ------------------------------------------------------------------------------------------------

struct LocatorEntry {
    class: Vec<u8>,
    start: u64,
    end: u64,
}

struct KeyEntry {
    locator: Vec<u8>,
    key: Vec<u8>,
    start: u64,
    end: u64,
}

impl Encode for LocatorEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.class.encode_to(buf)?;
        self.start.encode_to(buf)?;
        self.end.encode_to(buf)
    }
}

impl Decode for LocatorEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (class, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (start, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (end, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { class, start, end }, off))
    }
}

impl Encode for KeyEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.locator.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.start.encode_to(buf)?;
        self.end.encode_to(buf)
    }
}

impl Decode for KeyEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (locator, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (start, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (end, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                locator,
                key,
                start,
                end,
            },
            off,
        ))
    }
}

impl Encode for Manifest {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let locators: Vec<LocatorEntry> = self
            .locators
            .iter()
            .map(|(class, r)| LocatorEntry {
                class: class.clone(),
                start: r.start,
                end: r.end,
            })
            .collect();
        let keys: Vec<KeyEntry> = self
            .keys
            .iter()
            .map(|((locator, key), r)| KeyEntry {
                locator: locator.clone(),
                key: key.clone(),
                start: r.start,
                end: r.end,
            })
            .collect();
        encoding::encode_vec(&locators, buf)?;
        encoding::encode_vec(&keys, buf)
    }
}

impl Decode for Manifest {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (locators, n) = encoding::decode_vec::<LocatorEntry>(&buf[off..])?;
        off += n;
        let (keys, n) = encoding::decode_vec::<KeyEntry>(&buf[off..])?;
        off += n;
        let mut manifest = Manifest::new();
        for e in locators {
            manifest.locators.insert(
                e.class,
                ByteRange {
                    start: e.start,
                    end: e.end,
                },
            );
        }
        for e in keys {
            manifest.keys.insert(
                (e.locator, e.key),
                ByteRange {
                    start: e.start,
                    end: e.end,
                },
            );
        }
        Ok((manifest, off))
    }
}
