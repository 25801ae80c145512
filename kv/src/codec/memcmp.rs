//! Memory-comparable encodings (component C1): encode primitives to byte
//! sequences whose lexicographic order matches value order, so ordered KV
//! scans over encoded keys come back in logical order for free.
//!
//! Layout follows the classic group-encoding scheme for byte strings: the
//! value is split into 8-byte groups, each padded with `0x00` and followed
//! by a marker byte `0xFF - padCount`. A marker below `0xFF` ends the value,
//! which is what makes the encoding composable inside a larger key.

use crate::error::{CResult, Error};

const GROUP_SIZE: usize = 8;
const MARKER: u8 = 0xFF;
const PAD: u8 = 0x00;

/// Encodes a u64 to 8 big-endian bytes, appended to `buf`.
pub fn encode_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Descending variant: bitwise-complements the ascending encoding.
pub fn encode_u64_desc(buf: &mut Vec<u8>, v: u64) {
    encode_u64(buf, !v);
}

pub fn decode_u64(buf: &[u8]) -> CResult<(u64, &[u8])> {
    if buf.len() < 8 {
        return Err(Error::InsufficientBytes);
    }
    let (head, rest) = buf.split_at(8);
    let v = u64::from_be_bytes(head.try_into().unwrap());
    Ok((v, rest))
}

pub fn decode_u64_desc(buf: &[u8]) -> CResult<(u64, &[u8])> {
    let (v, rest) = decode_u64(buf)?;
    Ok((!v, rest))
}

/// Encodes an i64 by flipping the sign bit so negative values sort below
/// positive ones under unsigned big-endian comparison.
pub fn encode_i64(buf: &mut Vec<u8>, v: i64) {
    encode_u64(buf, (v as u64) ^ (1u64 << 63));
}

pub fn encode_i64_desc(buf: &mut Vec<u8>, v: i64) {
    encode_u64_desc(buf, (v as u64) ^ (1u64 << 63));
}

pub fn decode_i64(buf: &[u8]) -> CResult<(i64, &[u8])> {
    let (u, rest) = decode_u64(buf)?;
    Ok(((u ^ (1u64 << 63)) as i64, rest))
}

pub fn decode_i64_desc(buf: &[u8]) -> CResult<(i64, &[u8])> {
    let (u, rest) = decode_u64_desc(buf)?;
    Ok(((u ^ (1u64 << 63)) as i64, rest))
}

pub fn encode_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn encode_u8_desc(buf: &mut Vec<u8>, v: u8) {
    buf.push(!v);
}

pub fn decode_u8(buf: &[u8]) -> CResult<(u8, &[u8])> {
    match buf.split_first() {
        Some((b, rest)) => Ok((*b, rest)),
        None => Err(Error::InsufficientBytes),
    }
}

pub fn decode_u8_desc(buf: &[u8]) -> CResult<(u8, &[u8])> {
    let (v, rest) = decode_u8(buf)?;
    Ok((!v, rest))
}

/// Length in bytes of `encode_bytes(data)` for a `data` of length `n`,
/// without actually encoding it. Used to pre-size buffers.
pub fn encoded_bytes_length(n: usize) -> usize {
    (n / GROUP_SIZE + 1) * (GROUP_SIZE + 1)
}

/// Encodes `data` as memory-comparable groups, appended to `buf`. Always
/// emits at least one group, so empty input still produces 9 bytes.
pub fn encode_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    let start = buf.len();
    buf.reserve(encoded_bytes_length(data.len()));

    let mut idx = 0;
    loop {
        let remain = data.len() - idx;
        if remain >= GROUP_SIZE {
            buf.extend_from_slice(&data[idx..idx + GROUP_SIZE]);
            buf.push(MARKER);
            idx += GROUP_SIZE;
            if remain == GROUP_SIZE {
                // exact multiple: still need a terminating (possibly all-pad) group
                buf.extend_from_slice(&[PAD; GROUP_SIZE]);
                buf.push(MARKER - GROUP_SIZE as u8);
                break;
            }
        } else {
            buf.extend_from_slice(&data[idx..]);
            let pad_count = GROUP_SIZE - remain;
            buf.extend(std::iter::repeat(PAD).take(pad_count));
            buf.push(MARKER - pad_count as u8);
            break;
        }
    }
    debug_assert_eq!(buf.len() - start, encoded_bytes_length(data.len()));
}

/// Descending variant: bitwise-complements every byte emitted by `encode_bytes`.
pub fn encode_bytes_desc(buf: &mut Vec<u8>, data: &[u8]) {
    let start = buf.len();
    encode_bytes(buf, data);
    for b in &mut buf[start..] {
        *b = !*b;
    }
}

fn decode_bytes_impl(buf: &[u8], reverse: bool) -> CResult<(Vec<u8>, &[u8])> {
    let mut out = Vec::with_capacity(buf.len());
    let mut rest = buf;
    loop {
        if rest.len() < GROUP_SIZE + 1 {
            return Err(Error::InsufficientBytes);
        }
        let group = &rest[..GROUP_SIZE];
        let marker = rest[GROUP_SIZE];
        rest = &rest[GROUP_SIZE + 1..];

        let pad_count = if reverse { marker } else { MARKER - marker } as usize;
        if pad_count > GROUP_SIZE {
            return Err(Error::CodecCorrupt(format!("invalid marker byte {:#x}", marker)));
        }
        let real_size = GROUP_SIZE - pad_count;
        out.extend_from_slice(&group[..real_size]);

        if pad_count != 0 {
            let pad_byte = if reverse { MARKER } else { PAD };
            if group[real_size..].iter().any(|b| *b != pad_byte) {
                return Err(Error::CodecCorrupt("invalid padding byte".to_string()));
            }
            break;
        }
    }
    if reverse {
        for b in &mut out {
            *b = !*b;
        }
    }
    Ok((out, rest))
}

/// Decodes a value previously written by `encode_bytes`, returning the value
/// and whatever bytes remain after it (so callers can decode further values
/// composed into the same buffer).
pub fn decode_bytes(buf: &[u8]) -> CResult<(Vec<u8>, &[u8])> {
    decode_bytes_impl(buf, false)
}

pub fn decode_bytes_desc(buf: &[u8]) -> CResult<(Vec<u8>, &[u8])> {
    decode_bytes_impl(buf, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_roundtrip_and_order() {
        for (a, b) in [(0u64, 1u64), (100, 200), (u64::MAX - 1, u64::MAX)] {
            let mut ea = Vec::new();
            let mut eb = Vec::new();
            encode_u64(&mut ea, a);
            encode_u64(&mut eb, b);
            assert!(ea < eb);
            assert_eq!(decode_u64(&ea).unwrap().0, a);
            assert_eq!(decode_u64(&eb).unwrap().0, b);
        }
    }

    #[test]
    fn u64_desc_order_reverses() {
        let mut ea = Vec::new();
        let mut eb = Vec::new();
        encode_u64_desc(&mut ea, 5);
        encode_u64_desc(&mut eb, 10);
        assert!(ea > eb);
        assert_eq!(decode_u64_desc(&ea).unwrap().0, 5);
    }

    #[test]
    fn i64_roundtrip_and_order() {
        for (a, b) in [(-5i64, 5i64), (i64::MIN, 0), (0, i64::MAX), (-100, -1)] {
            let mut ea = Vec::new();
            let mut eb = Vec::new();
            encode_i64(&mut ea, a);
            encode_i64(&mut eb, b);
            assert!(ea < eb, "{} should sort before {}", a, b);
            assert_eq!(decode_i64(&ea).unwrap().0, a);
            assert_eq!(decode_i64(&eb).unwrap().0, b);
        }
    }

    #[test]
    fn bytes_roundtrip_empty_and_nonempty() {
        for data in [&b""[..], b"a", b"12345678", b"123456789", b"x".repeat(37).as_slice()] {
            let mut buf = Vec::new();
            encode_bytes(&mut buf, data);
            assert_eq!(buf.len(), encoded_bytes_length(data.len()));
            let (decoded, rest) = decode_bytes(&buf).unwrap();
            assert_eq!(decoded, data);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn empty_bytes_is_one_full_pad_group_with_marker_0xf7() {
        let mut buf = Vec::new();
        encode_bytes(&mut buf, b"");
        assert_eq!(buf, vec![0, 0, 0, 0, 0, 0, 0, 0, 0xF7]);
    }

    #[test]
    fn bytes_order_matches_value_order() {
        let values: Vec<&[u8]> = vec![b"", b"a", b"aa", b"ab", b"b", b"\xff", b"\xff\xff"];
        for w in values.windows(2) {
            let mut ea = Vec::new();
            let mut eb = Vec::new();
            encode_bytes(&mut ea, w[0]);
            encode_bytes(&mut eb, w[1]);
            assert!(ea < eb, "{:?} should sort before {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn bytes_desc_reverses_order() {
        let mut ea = Vec::new();
        let mut eb = Vec::new();
        encode_bytes_desc(&mut ea, b"a");
        encode_bytes_desc(&mut eb, b"b");
        assert!(ea > eb);
        assert_eq!(decode_bytes_desc(&ea).unwrap().0, b"a");
    }

    #[test]
    fn composition_decodes_left_to_right_with_no_leftover() {
        let mut buf = Vec::new();
        encode_bytes(&mut buf, b"col");
        encode_u64(&mut buf, 42);
        encode_i64(&mut buf, -7);
        encode_bytes(&mut buf, b"");

        let (v1, rest) = decode_bytes(&buf).unwrap();
        assert_eq!(v1, b"col");
        let (v2, rest) = decode_u64(rest).unwrap();
        assert_eq!(v2, 42);
        let (v3, rest) = decode_i64(rest).unwrap();
        assert_eq!(v3, -7);
        let (v4, rest) = decode_bytes(rest).unwrap();
        assert_eq!(v4, b"");
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_input_is_codec_corrupt() {
        let mut buf = Vec::new();
        encode_bytes(&mut buf, b"hello world");
        buf.truncate(buf.len() - 1);
        assert!(matches!(decode_bytes(&buf), Err(Error::InsufficientBytes)));
    }
}
