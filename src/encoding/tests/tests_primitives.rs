//! Round-trip and wire-format tests for primitive encodings.
//!
//! Every multi-byte integer must serialize big-endian; floats serialize
//! as raw IEEE-754 bit patterns so NaN payloads survive.

#[cfg(test)]
mod tests {
    use crate::encoding::{Decode, Encode, EncodingError, decode_from_slice, encode_to_vec};

    fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = encode_to_vec(&value).unwrap();
        let (decoded, consumed) = decode_from_slice::<T>(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn unsigned_round_trips() {
        round_trip(0u8);
        round_trip(255u8);
        round_trip(0u32);
        round_trip(u32::MAX);
        round_trip(0u64);
        round_trip(u64::MAX);
    }

    #[test]
    fn signed_round_trips() {
        round_trip(i32::MIN);
        round_trip(-1i32);
        round_trip(i64::MIN);
        round_trip(i64::MAX);
    }

    #[test]
    fn floats_round_trip_bit_exact() {
        round_trip(0.0f32);
        round_trip(-0.0f64);
        round_trip(f32::INFINITY);
        round_trip(f64::NEG_INFINITY);

        // NaN payload survives
        let nan = f64::from_bits(0x7FF8_0000_0000_1234);
        let bytes = encode_to_vec(&nan).unwrap();
        let (decoded, _) = decode_from_slice::<f64>(&bytes).unwrap();
        assert_eq!(decoded.to_bits(), nan.to_bits());
    }

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(encode_to_vec(&0x0102_0304u32).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            encode_to_vec(&0x0102_0304_0506_0708u64).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn bool_rejects_other_bytes() {
        round_trip(true);
        round_trip(false);
        let err = bool::decode_from(&[2]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidBool(2)));
    }

    #[test]
    fn option_round_trips() {
        round_trip(Some(42u64));
        round_trip(Option::<u64>::None);
        let err = Option::<u64>::decode_from(&[9]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidTag { .. }));
    }

    #[test]
    fn fixed_arrays_have_no_prefix() {
        let arr = [1u8, 2, 3, 4];
        assert_eq!(encode_to_vec(&arr).unwrap(), vec![1, 2, 3, 4]);
        round_trip(arr);
    }
}
