//! Manifest range bookkeeping and serialization.

#[cfg(test)]
mod tests {
    use crate::chunk::manifest::Manifest;
    use crate::encoding::{decode_from_slice, encode_to_vec};
    use crate::value::Value;

    #[test]
    fn ranges_extend_in_stream_order() {
        let mut manifest = Manifest::new();
        manifest.note(b"alpha", b"k1", 0, 10);
        manifest.note(b"alpha", b"k1", 10, 25);
        manifest.note(b"alpha", b"k2", 25, 40);
        manifest.note(b"beta", b"k1", 40, 60);

        let alpha = manifest.lookup_locator(b"alpha").unwrap();
        assert_eq!((alpha.start, alpha.end), (0, 40));
        let alpha_k1 = manifest.lookup_key(b"alpha", b"k1").unwrap();
        assert_eq!((alpha_k1.start, alpha_k1.end), (0, 25));
        let beta = manifest.lookup_locator(b"beta").unwrap();
        assert_eq!((beta.start, beta.end), (40, 60));
        assert!(manifest.lookup_locator(b"gamma").is_none());
        assert!(manifest.lookup_key(b"alpha", b"k9").is_none());
    }

    #[test]
    fn tag_collapsed_keys_share_one_range() {
        // 18:int and 18.0:double collapse to one class
        let int_class = Value::Int32(18).class_bytes();
        let double_class = Value::Float64(18.0).class_bytes();
        assert_eq!(int_class, double_class);

        let mut manifest = Manifest::new();
        manifest.note(b"key", &int_class, 0, 10);
        manifest.note(b"key", &double_class, 10, 20);

        let range = manifest.lookup_key(b"key", &int_class).unwrap();
        assert_eq!((range.start, range.end), (0, 20));
        assert_eq!(manifest.key_classes().count(), 1);
    }

    #[test]
    fn serialization_round_trips() {
        let mut manifest = Manifest::new();
        for i in 0u32..20 {
            let locator = format!("loc-{}", i % 4);
            manifest.note(
                locator.as_bytes(),
                &i.to_be_bytes(),
                (i * 10) as u64,
                ((i + 1) * 10) as u64,
            );
        }
        let bytes = encode_to_vec(&manifest).unwrap();
        let (decoded, consumed) = decode_from_slice::<Manifest>(&bytes).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.locator_count(), 4);
    }
}
