use crate::db::{Db, DbConfig};
use crate::value::{Id, Text, Value};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a database with default configuration.
pub fn open(path: &Path) -> Db {
    init_tracing();
    Db::start(path, DbConfig::default()).unwrap()
}

/// Configuration with the smallest allowed page so writes rotate (and
/// transport) quickly.
pub fn small_page_config() -> DbConfig {
    init_tracing();
    DbConfig {
        limbo_page_size: 4096,
        ..DbConfig::default()
    }
}

/// Shorthand for an ADD through the convenience surface.
pub fn add(db: &Db, record: u64, key: &str, value: Value) {
    assert!(db.add(Text::new(key), value, Id(record)).unwrap());
}
