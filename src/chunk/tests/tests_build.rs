//! Chunk lifecycle: mutable inserts, seal, load, seek.

#[cfg(test)]
mod tests {
    use crate::chunk::{Chunk, ChunkError, Index, Revision, Table};
    use crate::value::{Action, Id, Text, Value};
    use tempfile::TempDir;

    fn rev(record: u64, key: &str, value: i32, version: u64) -> Revision<Table> {
        Revision::new(
            Id(record),
            Text::new(key),
            Value::Int32(value),
            version,
            Action::Add,
        )
    }

    /// # Scenario
    /// Revisions inserted out of order come back in `(locator, key,
    /// value, version)` order after seal + load.
    #[test]
    fn seal_and_load_round_trip_sorted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("chunk.tbl");

        let mut chunk = Chunk::<Table>::mutable(16, 0.03).unwrap();
        chunk.insert(rev(2, "b", 9, 4)).unwrap();
        chunk.insert(rev(1, "a", 7, 1)).unwrap();
        chunk.insert(rev(1, "b", 3, 2)).unwrap();
        chunk.insert(rev(1, "a", 7, 3)).unwrap();

        let outcome = chunk.seal(&path).unwrap();
        assert_eq!(outcome.revision_count, 4);
        assert!(path.exists());

        let loaded = Chunk::<Table>::load(&path).unwrap();
        assert!(!loaded.is_quarantined());
        assert_eq!(loaded.revision_count(), 4);

        let all: Vec<Revision<Table>> =
            loaded.iterate().unwrap().collect::<Result<_, _>>().unwrap();
        let order: Vec<(u64, String, u64)> = all
            .iter()
            .map(|r| (r.locator.0, r.key.to_string(), r.version))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, "a".into(), 1),
                (1, "a".into(), 3),
                (1, "b".into(), 2),
                (2, "b".into(), 4),
            ]
        );
    }

    #[test]
    fn seek_uses_manifest_ranges() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("chunk.tbl");

        let mut chunk = Chunk::<Table>::mutable(64, 0.03).unwrap();
        for record in 1..=5u64 {
            for (i, key) in ["x", "y"].iter().enumerate() {
                chunk
                    .insert(rev(record, key, record as i32, record * 10 + i as u64))
                    .unwrap();
            }
        }
        chunk.seal(&path).unwrap();
        let loaded = Chunk::<Table>::load(&path).unwrap();

        let hits: Vec<Revision<Table>> = loaded
            .seek(&Id(3))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r.locator == Id(3)));

        let keyed: Vec<Revision<Table>> = loaded
            .seek_key(&Id(3), &Text::new("y"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(keyed.len(), 1);
        assert_eq!(keyed[0].key, Text::new("y"));

        // absent locator yields an empty scan, not an error
        let misses: Vec<_> = loaded.seek(&Id(99)).unwrap().collect();
        assert!(misses.is_empty());
    }

    #[test]
    fn bloom_gates_membership() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("chunk.tbl");

        let mut chunk = Chunk::<Table>::mutable(16, 0.01).unwrap();
        chunk.insert(rev(1, "k", 5, 1)).unwrap();
        chunk.seal(&path).unwrap();
        let loaded = Chunk::<Table>::load(&path).unwrap();

        assert!(loaded.might_contain(&Id(1), &Text::new("k"), &Value::Int32(5)));
        // numeric collision: 5.0 shares the class of 5
        assert!(loaded.might_contain(&Id(1), &Text::new("k"), &Value::Float64(5.0)));
    }

    #[test]
    fn insert_after_seal_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("chunk.tbl");

        let mut chunk = Chunk::<Table>::mutable(4, 0.03).unwrap();
        chunk.insert(rev(1, "k", 1, 1)).unwrap();
        chunk.seal(&path).unwrap();
        assert!(matches!(
            chunk.insert(rev(1, "k", 2, 2)),
            Err(ChunkError::Sealed)
        ));
    }

    #[test]
    fn duplicate_composite_version_fails_fast() {
        let mut chunk = Chunk::<Table>::mutable(4, 0.03).unwrap();
        chunk.insert(rev(1, "k", 1, 7)).unwrap();
        // identical composite at the same version, either action
        assert!(matches!(
            chunk.insert(rev(1, "k", 1, 7)),
            Err(ChunkError::DuplicateRevision { version: 7 })
        ));
        let mut removed = rev(1, "k", 1, 7);
        removed.action = Action::Remove;
        assert!(matches!(
            chunk.insert(removed),
            Err(ChunkError::DuplicateRevision { version: 7 })
        ));
        // same composite at a different version is legitimate
        chunk.insert(rev(1, "k", 1, 8)).unwrap();
    }

    #[test]
    fn fanout_revisions_may_share_a_version() {
        // one write fans out into several corpus revisions with its version
        let mut chunk = Chunk::<Index>::mutable(4, 0.03).unwrap();
        chunk
            .insert(Revision::new(
                Text::new("k"),
                Value::Int32(1),
                Id(1),
                7,
                Action::Add,
            ))
            .unwrap();
        chunk
            .insert(Revision::new(
                Text::new("k"),
                Value::Int32(2),
                Id(1),
                7,
                Action::Add,
            ))
            .unwrap();
        assert_eq!(chunk.revision_count(), 2);
    }

    #[test]
    fn empty_chunk_seals_and_loads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.tbl");
        let mut chunk = Chunk::<Table>::mutable(1, 0.03).unwrap();
        let outcome = chunk.seal(&path).unwrap();
        assert_eq!(outcome.revision_count, 0);

        let loaded = Chunk::<Table>::load(&path).unwrap();
        assert_eq!(loaded.revision_count(), 0);
        assert!(loaded.iterate().unwrap().next().is_none());
    }
}
