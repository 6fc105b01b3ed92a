use crate::limbo::{FsyncPolicy, Limbo, LimboConfig};
use crate::value::{Action, Id, Text, Value, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config that never rotates on its own.
pub fn big_page_config() -> LimboConfig {
    init_tracing();
    LimboConfig {
        page_size: 64 * 1024 * 1024,
        fsync_policy: FsyncPolicy::Group,
        soft_page_cap: 8,
        hard_page_cap: 64,
        max_write_size: 1024 * 1024,
    }
}

/// Config that rotates after a handful of writes.
pub fn tiny_page_config() -> LimboConfig {
    init_tracing();
    LimboConfig {
        page_size: 256,
        fsync_policy: FsyncPolicy::Group,
        soft_page_cap: 8,
        hard_page_cap: 16,
        max_write_size: 64 * 1024,
    }
}

/// Open a limbo with batch ordinals starting at zero.
pub fn open(dir: &Path, config: LimboConfig) -> (Limbo, u64) {
    Limbo::open(dir, config, 0).unwrap()
}

/// A versioned ADD write.
pub fn add(version: u64, record: u64, key: &str, value: i64) -> Write {
    Write {
        action: Action::Add,
        key: Text::new(key),
        value: Value::Int64(value),
        record: Id(record),
        version,
    }
}
