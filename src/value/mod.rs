//! Typed value model: identifiers, interned text, tagged values, positions.
//!
//! Everything a revision can carry lives here, together with the two
//! relations the storage layer is built on:
//!
//! 1. **Canonical total order.** [`Value`] implements `Ord` so that numeric
//!    kinds (`Int32`, `Int64`, `Float32`, `Float64`) compare by magnitude
//!    regardless of tag, and non-numeric kinds compare by class rank then
//!    payload. Sorted chunk streams, manifest ranges, and range operators
//!    all rely on this order.
//! 2. **Tag-collapsed equality classes.** [`Value::class_bytes`] maps every
//!    value to the byte key of its equality class: `18:int` and
//!    `18.0:double` share a class, as do `"foo":string` and `"foo":tag`.
//!    Bloom filters, manifest entries, and read-side matching key on
//!    classes, while storage preserves the original tag.
//!
//! `Ord` stays consistent with the (structural) `Eq`: class-equal values
//! with different tags compare adjacent but not equal, so both variants of
//! a numeric collision survive in a sorted set and land in one manifest
//! range.
//!
//! # Text interning
//!
//! [`Text`] wraps `Arc<str>` behind a process-wide, size-bounded intern
//! cache. Hot field names and search terms are deduplicated; once the cache
//! is full, new strings are simply left uninterned. Equality is always by
//! content, so eviction and cache misses never change semantics.


use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock};

use crate::encoding::{Decode, Encode, EncodingError};

/// A commit timestamp. Strictly monotonic across a database.
pub type Version = u64;

/// Version value meaning "not yet assigned" (writes queued in an atomic
/// operation carry this until commit).
pub const UNASSIGNED: Version = 0;

// ------------------------------------------------------------------------------------------------
// Id
// ------------------------------------------------------------------------------------------------

/// A record identifier: an unsigned 64-bit integer, globally unique within
/// one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub u64);

impl Id {
    /// The tag-collapsed class key of this identifier (its big-endian bytes).
    pub fn class_bytes(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Id {
    fn from(raw: u64) -> Self {
        Id(raw)
    }
}

impl Encode for Id {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)
    }
}

impl Decode for Id {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, n) = u64::decode_from(buf)?;
        Ok((Id(raw), n))
    }
}

// ------------------------------------------------------------------------------------------------
// Text
// ------------------------------------------------------------------------------------------------

/// Upper bound on the number of distinct strings held by the intern cache.
const INTERN_CAPACITY: usize = 8192;

fn intern_cache() -> &'static Mutex<HashMap<Box<str>, Text>> {
    static CACHE: OnceLock<Mutex<HashMap<Box<str>, Text>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Canonical UTF-8 string used for field names and search terms.
///
/// Cheap to clone (`Arc<str>`); hot instances are deduplicated through a
/// bounded intern cache. Equality, ordering, and hashing are all by
/// content.
#[derive(Debug, Clone)]
pub struct Text(Arc<str>);

impl Text {
    /// Create a `Text`, consulting the intern cache.
    pub fn new(s: &str) -> Text {
        if let Ok(mut cache) = intern_cache().lock() {
            if let Some(hit) = cache.get(s) {
                return hit.clone();
            }
            let text = Text(Arc::from(s));
            if cache.len() < INTERN_CAPACITY {
                cache.insert(Box::from(s), text.clone());
            }
            return text;
        }
        Text(Arc::from(s))
    }

    /// The underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The tag-collapsed class key of this text (its UTF-8 bytes).
    pub fn class_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl Deref for Text {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Text {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Text {}

impl PartialOrd for Text {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Text {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Hash for Text {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Text {
    fn from(s: &str) -> Self {
        Text::new(s)
    }
}

impl From<String> for Text {
    fn from(s: String) -> Self {
        Text::new(&s)
    }
}

impl Encode for Text {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_str().encode_to(buf)
    }
}

impl Decode for Text {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (s, n) = String::decode_from(buf)?;
        Ok((Text::new(&s), n))
    }
}

// ------------------------------------------------------------------------------------------------
// Position
// ------------------------------------------------------------------------------------------------

/// Location of one term occurrence: which record, and at which token index
/// within the tokenized field value. The value type of corpus revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// The record containing the term.
    pub record: Id,

    /// Zero-based token index of the occurrence.
    pub index: u32,
}

impl Position {
    /// The class key of a position: record bytes then index bytes.
    pub fn class_bytes(&self) -> Vec<u8> {
        let mut out = self.record.0.to_be_bytes().to_vec();
        out.extend_from_slice(&self.index.to_be_bytes());
        out
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.record, self.index)
    }
}

impl Encode for Position {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.record.encode_to(buf)?;
        self.index.encode_to(buf)
    }
}

impl Decode for Position {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (record, n) = Id::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { record, index }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Action
// ------------------------------------------------------------------------------------------------

/// The two revision actions. For any `(locator, key, value)` triple the
/// action sequence strictly alternates, starting with `Add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    /// The value becomes present.
    Add,
    /// The value becomes absent.
    Remove,
}

impl Action {
    /// The action that undoes this one.
    pub fn inverse(self) -> Action {
        match self {
            Action::Add => Action::Remove,
            Action::Remove => Action::Add,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => f.write_str("ADD"),
            Action::Remove => f.write_str("REMOVE"),
        }
    }
}

impl Encode for Action {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            Action::Add => 1,
            Action::Remove => 2,
        };
        tag.encode_to(buf)
    }
}

impl Decode for Action {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        let action = match tag {
            1 => Action::Add,
            2 => Action::Remove,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Action",
                });
            }
        };
        Ok((action, n))
    }
}

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// Storage wire tags for [`Value`] variants. Stable; never renumber.
mod tag {
    pub const BOOL: u8 = 0x01;
    pub const INT32: u8 = 0x02;
    pub const INT64: u8 = 0x03;
    pub const FLOAT32: u8 = 0x04;
    pub const FLOAT64: u8 = 0x05;
    pub const STRING: u8 = 0x06;
    pub const LINK: u8 = 0x07;
    pub const TAG: u8 = 0x08;
    pub const TIMESTAMP: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
}

/// Class ranks: the coarse grouping used both for cross-class ordering and
/// as the first byte of every class key.
mod class {
    pub const BOOL: u8 = 1;
    pub const NUMBER: u8 = 2;
    pub const TEXTUAL: u8 = 3;
    pub const LINK: u8 = 4;
    pub const TIMESTAMP: u8 = 5;
    pub const NULL: u8 = 6;
}

/// A tagged, dynamically-typed value stored in a record field.
///
/// Storage preserves the original tag; indexing collapses numerically equal
/// values (and `String`/`Tag` pairs) into one equality class. See the
/// [module docs](self) for the ordering rules.
#[derive(Debug, Clone)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit IEEE-754 float.
    Float32(f32),
    /// 64-bit IEEE-754 float.
    Float64(f64),
    /// UTF-8 string.
    String(Text),
    /// Link to another record.
    Link(Id),
    /// A tag: textual, class-equal to `String`, but kept out of full-text
    /// indexing.
    Tag(Text),
    /// Microseconds since the UNIX epoch.
    Timestamp(u64),
    /// Explicit null.
    Null,
}

impl Value {
    /// Storage wire tag of this variant.
    pub fn wire_tag(&self) -> u8 {
        match self {
            Value::Bool(_) => tag::BOOL,
            Value::Int32(_) => tag::INT32,
            Value::Int64(_) => tag::INT64,
            Value::Float32(_) => tag::FLOAT32,
            Value::Float64(_) => tag::FLOAT64,
            Value::String(_) => tag::STRING,
            Value::Link(_) => tag::LINK,
            Value::Tag(_) => tag::TAG,
            Value::Timestamp(_) => tag::TIMESTAMP,
            Value::Null => tag::NULL,
        }
    }

    /// True for the four numeric variants.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Int32(_) | Value::Int64(_) | Value::Float32(_) | Value::Float64(_)
        )
    }

    /// Class rank (coarse cross-class ordering group).
    fn class_rank(&self) -> u8 {
        match self {
            Value::Bool(_) => class::BOOL,
            Value::Int32(_) | Value::Int64(_) | Value::Float32(_) | Value::Float64(_) => {
                class::NUMBER
            }
            Value::String(_) | Value::Tag(_) => class::TEXTUAL,
            Value::Link(_) => class::LINK,
            Value::Timestamp(_) => class::TIMESTAMP,
            Value::Null => class::NULL,
        }
    }

    /// Canonical `f64` magnitude of a numeric variant. `-0.0` is folded
    /// into `0.0` so the two zeros share a class.
    fn numeric_key(&self) -> Option<f64> {
        let raw = match self {
            Value::Int32(v) => *v as f64,
            Value::Int64(v) => *v as f64,
            Value::Float32(v) => *v as f64,
            Value::Float64(v) => *v,
            _ => return None,
        };
        Some(if raw == 0.0 { 0.0 } else { raw })
    }

    /// Exact `i64` payload of an integer variant.
    fn integer_key(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw bit pattern used as the final structural tiebreaker.
    fn payload_bits(&self) -> u64 {
        match self {
            Value::Bool(v) => *v as u64,
            Value::Int32(v) => *v as u32 as u64,
            Value::Int64(v) => *v as u64,
            Value::Float32(v) => v.to_bits() as u64,
            Value::Float64(v) => v.to_bits(),
            Value::Link(id) => id.0,
            Value::Timestamp(v) => *v,
            Value::String(_) | Value::Tag(_) | Value::Null => 0,
        }
    }

    /// The byte key of this value's tag-collapsed equality class.
    ///
    /// Two values with equal class bytes are indistinguishable to `verify`,
    /// `find … EQUALS`, bloom filters, and manifest lookups.
    pub fn class_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.class_rank()];
        match self {
            Value::Bool(v) => out.push(*v as u8),
            Value::Int32(_) | Value::Int64(_) | Value::Float32(_) | Value::Float64(_) => {
                // numeric_key is Some for every numeric variant
                let key = self.numeric_key().unwrap_or(f64::NAN);
                let canonical = if key.is_nan() { f64::NAN } else { key };
                out.extend_from_slice(&canonical.to_bits().to_be_bytes());
            }
            Value::String(t) | Value::Tag(t) => out.extend_from_slice(t.as_bytes()),
            Value::Link(id) => out.extend_from_slice(&id.0.to_be_bytes()),
            Value::Timestamp(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Null => {}
        }
        out
    }

    /// Class equality: the relation used by read-side matching.
    pub fn class_eq(&self, other: &Value) -> bool {
        self.class_bytes() == other.class_bytes()
    }

    /// True when both values belong to the same coarse class (numbers
    /// with numbers, textual with textual, …). Ordering operators only
    /// relate same-kind values.
    pub fn same_kind(&self, other: &Value) -> bool {
        self.class_rank() == other.class_rank()
    }

    /// Textual payload of `String` and `Tag` variants.
    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Value::String(t) | Value::Tag(t) => Some(t),
            _ => None,
        }
    }

    /// Canonical cross-tag comparison (class ordering without the
    /// structural tiebreakers). Class-equal values compare `Equal` here.
    pub fn class_cmp(&self, other: &Value) -> Ordering {
        let rank = self.class_rank().cmp(&other.class_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            _ if self.is_numeric() && other.is_numeric() => {
                let (a, b) = (
                    self.numeric_key().unwrap_or(f64::NAN),
                    other.numeric_key().unwrap_or(f64::NAN),
                );
                match a.total_cmp(&b) {
                    Ordering::Equal => match (self.integer_key(), other.integer_key()) {
                        (Some(x), Some(y)) => x.cmp(&y),
                        _ => Ordering::Equal,
                    },
                    unequal => unequal,
                }
            }
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a) | Value::Tag(a), Value::String(b) | Value::Tag(b)) => a.cmp(b),
            (Value::Link(a), Value::Link(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Null, Value::Null) => Ordering::Equal,
            // unreachable: equal ranks always land in one arm above
            _ => Ordering::Equal,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.wire_tag() == other.wire_tag()
            && self.payload_bits() == other.payload_bits()
            && match (self, other) {
                (Value::String(a), Value::String(b)) | (Value::Tag(a), Value::Tag(b)) => a == b,
                _ => true,
            }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.wire_tag().hash(state);
        match self {
            Value::String(t) | Value::Tag(t) => t.hash(state),
            _ => self.payload_bits().hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// Total order: canonical class comparison first, then tag rank, then
    /// raw payload bits. Class-equal values with different tags are
    /// adjacent but distinct, so `Ord` stays consistent with the
    /// structural `Eq`.
    fn cmp(&self, other: &Self) -> Ordering {
        self.class_cmp(other)
            .then_with(|| self.wire_tag().cmp(&other.wire_tag()))
            .then_with(|| self.payload_bits().cmp(&other.payload_bits()))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}L"),
            Value::Float32(v) => write!(f, "{v}F"),
            Value::Float64(v) => write!(f, "{v}D"),
            Value::String(t) => write!(f, "\"{t}\""),
            Value::Link(id) => write!(f, "@{id}"),
            Value::Tag(t) => write!(f, "`{t}`"),
            Value::Timestamp(v) => write!(f, "|{v}|"),
            Value::Null => f.write_str("null"),
        }
    }
}

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.wire_tag().encode_to(buf)?;
        match self {
            Value::Bool(v) => v.encode_to(buf),
            Value::Int32(v) => v.encode_to(buf),
            Value::Int64(v) => v.encode_to(buf),
            Value::Float32(v) => v.encode_to(buf),
            Value::Float64(v) => v.encode_to(buf),
            Value::String(t) | Value::Tag(t) => t.encode_to(buf),
            Value::Link(id) => id.encode_to(buf),
            Value::Timestamp(v) => v.encode_to(buf),
            Value::Null => Ok(()),
        }
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (wire, mut off) = u8::decode_from(buf)?;
        let value = match wire {
            tag::BOOL => {
                let (v, n) = bool::decode_from(&buf[off..])?;
                off += n;
                Value::Bool(v)
            }
            tag::INT32 => {
                let (v, n) = i32::decode_from(&buf[off..])?;
                off += n;
                Value::Int32(v)
            }
            tag::INT64 => {
                let (v, n) = i64::decode_from(&buf[off..])?;
                off += n;
                Value::Int64(v)
            }
            tag::FLOAT32 => {
                let (v, n) = f32::decode_from(&buf[off..])?;
                off += n;
                Value::Float32(v)
            }
            tag::FLOAT64 => {
                let (v, n) = f64::decode_from(&buf[off..])?;
                off += n;
                Value::Float64(v)
            }
            tag::STRING => {
                let (t, n) = Text::decode_from(&buf[off..])?;
                off += n;
                Value::String(t)
            }
            tag::LINK => {
                let (id, n) = Id::decode_from(&buf[off..])?;
                off += n;
                Value::Link(id)
            }
            tag::TAG => {
                let (t, n) = Text::decode_from(&buf[off..])?;
                off += n;
                Value::Tag(t)
            }
            tag::TIMESTAMP => {
                let (v, n) = u64::decode_from(&buf[off..])?;
                off += n;
                Value::Timestamp(v)
            }
            tag::NULL => Value::Null,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Value",
                });
            }
        };
        Ok((value, off))
    }
}

// Conversions for ergonomic call sites.

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Text::new(v))
    }
}

impl From<Id> for Value {
    fn from(v: Id) -> Self {
        Value::Link(v)
    }
}

// ------------------------------------------------------------------------------------------------
// Write
// ------------------------------------------------------------------------------------------------

/// A revision in pre-index form: what a client submits and what Limbo
/// stores. The transporter later fans each write out into table, index,
/// and corpus revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    /// Whether the value becomes present or absent.
    pub action: Action,

    /// The field name.
    pub key: Text,

    /// The field value.
    pub value: Value,

    /// The record being mutated.
    pub record: Id,

    /// Commit version; [`UNASSIGNED`] until the write reaches Limbo.
    pub version: Version,
}

impl Write {
    /// An `ADD` write, version unassigned.
    pub fn add(key: Text, value: Value, record: Id) -> Write {
        Write {
            action: Action::Add,
            key,
            value,
            record,
            version: UNASSIGNED,
        }
    }

    /// A `REMOVE` write, version unassigned.
    pub fn remove(key: Text, value: Value, record: Id) -> Write {
        Write {
            action: Action::Remove,
            key,
            value,
            record,
            version: UNASSIGNED,
        }
    }

    /// Same write with the inverse action.
    pub fn inverse(&self) -> Write {
        Write {
            action: self.action.inverse(),
            key: self.key.clone(),
            value: self.value.clone(),
            record: self.record,
            version: UNASSIGNED,
        }
    }
}

impl fmt::Display for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} AS {} IN {} @{}",
            self.action, self.key, self.value, self.record, self.version
        )
    }
}

impl Encode for Write {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.version.encode_to(buf)?;
        self.action.encode_to(buf)?;
        self.record.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)
    }
}

impl Decode for Write {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (version, n) = Version::decode_from(&buf[off..])?;
        off += n;
        let (action, n) = Action::decode_from(&buf[off..])?;
        off += n;
        let (record, n) = Id::decode_from(&buf[off..])?;
        off += n;
        let (key, n) = Text::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = Value::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                action,
                key,
                value,
                record,
                version,
            },
            off,
        ))
    }
}
