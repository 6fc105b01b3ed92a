//! The deferred-write variant: insertions recorded in a CRC-framed side
//! log replay into a fresh filter on reopen.

#[cfg(test)]
mod tests {
    use crate::bloom::{BloomError, JournaledBloom, composite};
    use tempfile::TempDir;

    fn key(i: u32) -> Vec<u8> {
        composite(b"l", b"k", &i.to_be_bytes())
    }

    #[test]
    fn reopen_replays_the_log() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("filter.blog");

        {
            let mut journaled = JournaledBloom::open(&path, 1000, 0.03).unwrap();
            for i in 0..250 {
                journaled.put(&key(i)).unwrap();
            }
            journaled.sync().unwrap();
        }

        let reopened = JournaledBloom::open(&path, 1000, 0.03).unwrap();
        assert_eq!(reopened.filter().approximate_count(), 250);
        for i in 0..250 {
            assert!(reopened.filter().might_contain(&key(i)));
        }
    }

    #[test]
    fn appending_after_reopen_extends_the_log() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("filter.blog");

        {
            let mut journaled = JournaledBloom::open(&path, 1000, 0.03).unwrap();
            journaled.put(&key(1)).unwrap();
            journaled.sync().unwrap();
        }
        {
            let mut journaled = JournaledBloom::open(&path, 1000, 0.03).unwrap();
            journaled.put(&key(2)).unwrap();
            journaled.sync().unwrap();
        }

        let final_state = JournaledBloom::open(&path, 1000, 0.03).unwrap();
        assert!(final_state.filter().might_contain(&key(1)));
        assert!(final_state.filter().might_contain(&key(2)));
        assert_eq!(final_state.filter().approximate_count(), 2);
    }

    #[test]
    fn corrupted_log_fails_loudly() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("filter.blog");

        {
            let mut journaled = JournaledBloom::open(&path, 1000, 0.03).unwrap();
            for i in 0..10 {
                journaled.put(&key(i)).unwrap();
            }
            journaled.sync().unwrap();
        }

        // flip a payload byte in the middle of the log
        let mut bytes = std::fs::read(&path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let result = JournaledBloom::open(&path, 1000, 0.03);
        assert!(matches!(
            result,
            Err(BloomError::ChecksumMismatch) | Err(BloomError::Frame(_))
        ));
    }
}
