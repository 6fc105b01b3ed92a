//! # chronicledb
//!
//! An embeddable, **versioned, transactional record store** built on a
//! log-structured, multi-index storage engine. Writes are totally
//! ordered, durable, and immediately queryable; a background transporter
//! indexes them into immutable on-disk segments supporting point, range,
//! navigation, and full-text queries at arbitrary historical versions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                           Db                               │
//! │  ┌──────────────┐   transport   ┌───────────────────────┐  │
//! │  │    Limbo      │ ───────────► │       Segments        │  │
//! │  │  (durable,    │   batches    │  table / index /      │  │
//! │  │   queryable   │              │  corpus chunks with   │  │
//! │  │   WAL pages)  │              │  manifests + blooms   │  │
//! │  └──────┬───────┘              └──────────┬────────────┘  │
//! │         │          merge (Record views)    │               │
//! │         └──────────────┬───────────────────┘               │
//! │                        ▼                                   │
//! │     select / browse / find / search / verify / audit       │
//! │                                                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Atomic operations: snapshot + read/write sets with  │  │
//! │  │  optimistic validation; transactions compose them    │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Facade — lifecycle, recovery, reads, writes, cache |
//! | [`value`] | Typed values, identifiers, interned text, positions |
//! | [`encoding`] | Hand-written, byte-stable binary wire format |
//! | [`collections`] | Length-prefixed frame streams |
//! | [`limbo`] | Durable, queryable write buffer (the write-ahead log) |
//! | [`chunk`] | Immutable sorted revision runs + manifests + blooms |
//! | [`segment`] | Chunk triples with atomic visibility and recovery |
//! | [`transport`] | Background drain of Limbo into segments |
//! | [`record`] | Per-locator merged views with historical reads |
//! | [`atomic`] | Optimistic atomic operations and transactions |
//! | [`query`] | Criteria AST, navigation traversal, infix search |
//! | [`bloom`] | Probabilistic membership over revision composites |
//!
//! ## Key guarantees
//!
//! - **Durability** — every write is fsynced into a Limbo page before the
//!   acknowledgement returns.
//! - **Total order** — commit versions are strictly monotonic; segment
//!   publication follows batch order exactly.
//! - **Atomic visibility** — a segment is fully visible or fully
//!   invisible; crashes never expose partial triples.
//! - **History** — revisions are never destroyed in place; every read
//!   has a historical variant at an arbitrary version.
//! - **Snapshot isolation** — atomic operations validate their read sets
//!   optimistically at commit and retry on conflict.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chronicledb::{Criteria, Db, DbConfig, Id, Operator, Text, Value};
//!
//! let db = Db::start("/tmp/my_store", DbConfig::default()).unwrap();
//!
//! let jeff = Id(1);
//! db.add(Text::new("name"), Value::from("jeff"), jeff).unwrap();
//! db.add(Text::new("age"), Value::from(42), jeff).unwrap();
//!
//! // point read
//! let names = db.select(jeff, &Text::new("name"), None).unwrap();
//!
//! // declarative query
//! let criteria = Criteria::leaf("age", Operator::GreaterThan, vec![Value::from(21)]);
//! let adults = db.find(&criteria, None).unwrap();
//!
//! // full-text search
//! db.add(Text::new("bio"), Value::from("writes storage engines"), jeff).unwrap();
//! let hits = db.search(&Text::new("bio"), "storage", None).unwrap();
//!
//! db.stop().unwrap();
//! ```

pub mod atomic;
pub mod bloom;
pub mod chunk;
pub mod collections;
pub mod db;
pub mod encoding;
pub mod limbo;
pub mod query;
pub mod record;
pub mod segment;
pub mod transport;
pub mod value;

pub use atomic::{AtomicError, AtomicOperation, Transaction, execute_with_retry};
pub use db::{Db, DbConfig, DbError};
pub use limbo::FsyncPolicy;
pub use query::{Criteria, NavStrategy, Operator};
pub use value::{Action, Id, Position, Text, Value, Version, Write};
