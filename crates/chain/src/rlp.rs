//! Just enough RLP to assemble an EIP-1559 transaction payload: unsigned
//! integers, byte strings and lists. Decoding is not needed here.

use ethereum_types::U256;

/// Appends the RLP encoding of a byte string.
pub fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        buf.push(bytes[0]);
        return;
    }
    encode_length_prefix(buf, bytes.len(), 0x80);
    buf.extend_from_slice(bytes);
}

/// Appends a big-endian integer with leading zeros stripped; zero encodes
/// as the empty string.
pub fn encode_u64(buf: &mut Vec<u8>, value: u64) {
    let be = value.to_be_bytes();
    let start = be.iter().position(|b| *b != 0).unwrap_or(be.len());
    encode_bytes(buf, &be[start..]);
}

pub fn encode_u256(buf: &mut Vec<u8>, value: U256) {
    let be = value.to_big_endian();
    let start = be.iter().position(|b| *b != 0).unwrap_or(be.len());
    encode_bytes(buf, &be[start..]);
}

/// Wraps an already-encoded payload in a list header.
pub fn wrap_list(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    encode_length_prefix(&mut out, payload.len(), 0xc0);
    out.extend_from_slice(payload);
    out
}

fn encode_length_prefix(buf: &mut Vec<u8>, len: usize, offset: u8) {
    if len < 56 {
        buf.push(offset + len as u8);
    } else {
        let be = len.to_be_bytes();
        let start = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
        let len_bytes = &be[start..];
        buf.push(offset + 55 + len_bytes.len() as u8);
        buf.extend_from_slice(len_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(input: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_bytes(&mut buf, input);
        buf
    }

    #[test]
    fn canonical_string_vectors() {
        assert_eq!(bytes(b""), vec![0x80]);
        assert_eq!(bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(bytes(&[0x00]), vec![0x00]);
        assert_eq!(bytes(&[0x7f]), vec![0x7f]);
        assert_eq!(bytes(&[0x80]), vec![0x81, 0x80]);
    }

    #[test]
    fn long_string_gets_length_of_length_header() {
        let input = vec![b'a'; 56];
        let encoded = bytes(&input);
        assert_eq!(encoded[0], 0xb8);
        assert_eq!(encoded[1], 56);
        assert_eq!(&encoded[2..], input.as_slice());
    }

    #[test]
    fn canonical_integer_vectors() {
        let mut buf = Vec::new();
        encode_u64(&mut buf, 0);
        assert_eq!(buf, vec![0x80]);

        let mut buf = Vec::new();
        encode_u64(&mut buf, 15);
        assert_eq!(buf, vec![0x0f]);

        let mut buf = Vec::new();
        encode_u64(&mut buf, 1024);
        assert_eq!(buf, vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn u256_strips_leading_zeros() {
        let mut buf = Vec::new();
        encode_u256(&mut buf, U256::from(1024));
        assert_eq!(buf, vec![0x82, 0x04, 0x00]);

        let mut buf = Vec::new();
        encode_u256(&mut buf, U256::zero());
        assert_eq!(buf, vec![0x80]);
    }

    #[test]
    fn canonical_list_vectors() {
        // [] and ["cat", "dog"]
        assert_eq!(wrap_list(&[]), vec![0xc0]);
        let mut payload = Vec::new();
        encode_bytes(&mut payload, b"cat");
        encode_bytes(&mut payload, b"dog");
        let encoded = wrap_list(&payload);
        assert_eq!(
            encoded,
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
    }
}
