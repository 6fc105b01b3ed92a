//! Corruption handling: a damaged chunk quarantines instead of taking
//! the database down.

#[cfg(test)]
mod tests {
    use crate::chunk::{Chunk, ChunkError, Revision, Table};
    use crate::value::{Action, Id, Text, Value};
    use tempfile::TempDir;

    fn sealed_chunk_path(tmp: &TempDir) -> std::path::PathBuf {
        let path = tmp.path().join("chunk.tbl");
        let mut chunk = Chunk::<Table>::mutable(16, 0.03).unwrap();
        for i in 1..=10u64 {
            chunk
                .insert(Revision::new(
                    Id(i),
                    Text::new("k"),
                    Value::Int64(i as i64),
                    i,
                    Action::Add,
                ))
                .unwrap();
        }
        chunk.seal(&path).unwrap();
        path
    }

    /// # Scenario
    /// A flipped byte in the revision stream fails the whole-file CRC;
    /// the chunk loads quarantined, answers membership conservatively,
    /// and fails seeks with `Corruption` instead of panicking.
    #[test]
    fn flipped_byte_quarantines() {
        let tmp = TempDir::new().unwrap();
        let path = sealed_chunk_path(&tmp);

        let mut bytes = std::fs::read(&path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let loaded = Chunk::<Table>::load(&path).unwrap();
        assert!(loaded.is_quarantined());
        assert!(loaded.might_contain(&Id(1), &Text::new("k"), &Value::Int64(1)));
        assert!(matches!(
            loaded.seek(&Id(1)),
            Err(ChunkError::Corruption { .. })
        ));
        assert!(matches!(
            loaded.iterate(),
            Err(ChunkError::Corruption { .. })
        ));
    }

    #[test]
    fn truncated_file_quarantines() {
        let tmp = TempDir::new().unwrap();
        let path = sealed_chunk_path(&tmp);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let loaded = Chunk::<Table>::load(&path).unwrap();
        assert!(loaded.is_quarantined());
    }

    #[test]
    fn tiny_file_quarantines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tiny.tbl");
        std::fs::write(&path, b"short").unwrap();
        let loaded = Chunk::<Table>::load(&path).unwrap();
        assert!(loaded.is_quarantined());
    }

    #[test]
    fn missing_file_is_io_not_quarantine() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.tbl");
        assert!(matches!(
            Chunk::<Table>::load(&path),
            Err(ChunkError::Io(_))
        ));
    }
}
