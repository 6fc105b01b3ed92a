//! Building and sealing segments: the chunk triple, the header commit
//! point, and cleanup after failed seals.

#[cfg(test)]
mod tests {
    use crate::chunk::{Corpus, Index, Revision, Table};
    use crate::segment::{Segment, SegmentBuilder};
    use crate::value::{Action, Id, Position, Text, Value};
    use tempfile::TempDir;

    fn build_segment(dir: &std::path::Path, ordinal: u64, base_version: u64) -> Segment {
        let mut builder = SegmentBuilder::new(ordinal, 8, 0.03).unwrap();
        for i in 0..4u64 {
            let version = base_version + i;
            builder
                .insert_table(Revision::<Table>::new(
                    Id(i),
                    Text::new("name"),
                    Value::from("someone"),
                    version,
                    Action::Add,
                ))
                .unwrap();
            builder
                .insert_index(Revision::<Index>::new(
                    Text::new("name"),
                    Value::from("someone"),
                    Id(i),
                    version,
                    Action::Add,
                ))
                .unwrap();
            builder
                .insert_corpus(Revision::<Corpus>::new(
                    Text::new("name"),
                    Text::new("someone"),
                    Position {
                        record: Id(i),
                        index: 0,
                    },
                    version,
                    Action::Add,
                ))
                .unwrap();
        }
        builder.seal(dir).unwrap()
    }

    #[test]
    fn seal_produces_readable_triple() {
        let tmp = TempDir::new().unwrap();
        let segment = build_segment(tmp.path(), 0, 100);

        assert_eq!(segment.ordinal(), 0);
        assert_eq!(segment.header().min_version, 100);
        assert_eq!(segment.header().max_version, 103);
        assert_eq!(segment.header().table.revision_count, 4);
        assert_eq!(segment.header().index.revision_count, 4);
        assert_eq!(segment.header().corpus.revision_count, 4);

        for ext in ["hdr", "tbl", "idx", "cps"] {
            assert!(tmp.path().join(format!("seg-000000.{ext}")).exists());
        }

        let hits: Vec<_> = segment
            .table()
            .seek(&Id(2))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn reopen_by_ordinal_matches_sealed_state() {
        let tmp = TempDir::new().unwrap();
        let sealed = build_segment(tmp.path(), 3, 50);
        let reopened = Segment::open(tmp.path(), 3).unwrap();
        assert_eq!(reopened.header(), sealed.header());
    }

    #[test]
    fn empty_batch_seals_with_zero_range() {
        let tmp = TempDir::new().unwrap();
        let builder = SegmentBuilder::new(0, 1, 0.03).unwrap();
        let segment = builder.seal(tmp.path()).unwrap();
        assert_eq!(segment.header().min_version, 0);
        assert_eq!(segment.header().max_version, 0);
        assert_eq!(segment.header().table.revision_count, 0);
    }
}
