//! Length-prefixed byte vectors, strings, and struct vectors.

#[cfg(test)]
mod tests {
    use crate::encoding::{
        Decode, Encode, decode_from_slice, decode_vec, encode_to_vec, encode_vec,
    };

    #[test]
    fn byte_vectors_round_trip() {
        for data in [vec![], vec![0u8], vec![7u8; 1000]] {
            let bytes = encode_to_vec(&data).unwrap();
            assert_eq!(&bytes[..4], &(data.len() as u32).to_be_bytes());
            let (decoded, consumed) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
            assert_eq!(decoded, data);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn strings_round_trip() {
        for s in ["", "plain", "uni→code ☃"] {
            let owned = s.to_string();
            let bytes = encode_to_vec(&owned).unwrap();
            let (decoded, _) = decode_from_slice::<String>(&bytes).unwrap();
            assert_eq!(decoded, owned);
        }
    }

    #[test]
    fn str_and_slice_encode_like_owned() {
        let owned = encode_to_vec(&String::from("abc")).unwrap();
        let borrowed = encode_to_vec(&"abc").unwrap();
        assert_eq!(owned, borrowed);

        let vec_form = encode_to_vec(&vec![1u8, 2, 3]).unwrap();
        let slice_form = encode_to_vec(&&[1u8, 2, 3][..]).unwrap();
        assert_eq!(vec_form, slice_form);
    }

    #[test]
    fn struct_vectors_round_trip() {
        #[derive(Debug, PartialEq)]
        struct Pair {
            a: u32,
            b: String,
        }
        impl Encode for Pair {
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), crate::encoding::EncodingError> {
                self.a.encode_to(buf)?;
                self.b.encode_to(buf)
            }
        }
        impl Decode for Pair {
            fn decode_from(
                buf: &[u8],
            ) -> Result<(Self, usize), crate::encoding::EncodingError> {
                let (a, mut off) = u32::decode_from(buf)?;
                let (b, n) = String::decode_from(&buf[off..])?;
                off += n;
                Ok((Pair { a, b }, off))
            }
        }

        let items = vec![
            Pair { a: 1, b: "x".into() },
            Pair { a: 2, b: "yy".into() },
        ];
        let mut buf = Vec::new();
        encode_vec(&items, &mut buf).unwrap();
        let (decoded, consumed) = decode_vec::<Pair>(&buf).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(consumed, buf.len());
    }
}
