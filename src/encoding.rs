//! Internal key schemas for the compound datatypes.
//!
//! Compound entries are logged under composite keys so one flat keyspace
//! per datatype can carry every field, element and member:
//!
//! - hash field:  `user_key | 0xFE | field`
//! - set member:  `user_key | 0xFE | member`
//! - zset entry:  `user_key | 0xFE | score(8-byte order-preserving) | member`
//! - list element: `seq:u32 LE | user_key`
//!
//! The `0xFE` separator means hash/set/zset user keys must not contain
//! that byte; list keys carry no such restriction because the sequence
//! prefix has a fixed width.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Separator between a user key and the field/member part.
pub const SEPARATOR: u8 = 0xFE;

/// A fresh list starts with `head = INITIAL_LIST_SEQ` and
/// `tail = INITIAL_LIST_SEQ + 1`; live sequences sit strictly between
/// them, so length is `tail - head - 1`.
pub const INITIAL_LIST_SEQ: u32 = 1 << 31;

/// Encoded width of a zset score.
pub const SCORE_SIZE: usize = 8;

/// `user_key | 0xFE | member` for hash fields and set members.
pub fn member_key(user_key: &[u8], member: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + 1 + member.len());
    key.extend_from_slice(user_key);
    key.push(SEPARATOR);
    key.extend_from_slice(member);
    key
}

/// Splits an internal key at the first separator into
/// `(user_key, member)`.
pub fn split_member_key(internal: &[u8]) -> Result<(&[u8], &[u8])> {
    let sep = internal
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or_else(|| Error::Corrupt("internal key missing separator".into()))?;
    Ok((&internal[..sep], &internal[sep + 1..]))
}

/// `seq:u32 LE | user_key` for list elements.
pub fn list_key(user_key: &[u8], seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + user_key.len());
    key.extend_from_slice(&seq.to_le_bytes());
    key.extend_from_slice(user_key);
    key
}

/// Splits a list element key into `(user_key, seq)`.
pub fn split_list_key(internal: &[u8]) -> Result<(&[u8], u32)> {
    if internal.len() < 4 {
        return Err(Error::Corrupt("list element key too short".into()));
    }
    let seq = LittleEndian::read_u32(&internal[..4]);
    Ok((&internal[4..], seq))
}

/// List metadata value: `head_seq:u32 LE | tail_seq:u32 LE`.
pub fn list_meta_value(head_seq: u32, tail_seq: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    LittleEndian::write_u32(&mut buf[..4], head_seq);
    LittleEndian::write_u32(&mut buf[4..], tail_seq);
    buf
}

/// Decodes a list metadata value into `(head_seq, tail_seq)`.
pub fn decode_list_meta(value: &[u8]) -> Result<(u32, u32)> {
    if value.len() < 8 {
        return Err(Error::Corrupt("list meta value too short".into()));
    }
    Ok((
        LittleEndian::read_u32(&value[..4]),
        LittleEndian::read_u32(&value[4..8]),
    ))
}

/// `user_key | 0xFE | score | member` for zset entries. Scores are
/// encoded so byte order equals numeric order; members break score ties
/// lexicographically for free.
pub fn zset_key(user_key: &[u8], score: f64, member: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + 1 + SCORE_SIZE + member.len());
    key.extend_from_slice(user_key);
    key.push(SEPARATOR);
    key.extend_from_slice(&encode_score(score));
    key.extend_from_slice(member);
    key
}

/// Splits the part of a zset internal key after the separator into
/// `(score, member)`.
pub fn split_zset_suffix(suffix: &[u8]) -> Result<(f64, &[u8])> {
    if suffix.len() < SCORE_SIZE {
        return Err(Error::Corrupt("zset key missing score".into()));
    }
    Ok((decode_score(&suffix[..SCORE_SIZE]), &suffix[SCORE_SIZE..]))
}

/// Order-preserving f64 encoding: flip the sign bit of non-negatives,
/// flip every bit of negatives, store big-endian. Total order over the
/// result matches numeric order.
pub fn encode_score(score: f64) -> [u8; SCORE_SIZE] {
    let bits = score.to_bits();
    let ordered = if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    let mut buf = [0u8; SCORE_SIZE];
    BigEndian::write_u64(&mut buf, ordered);
    buf
}

pub fn decode_score(buf: &[u8]) -> f64 {
    let ordered = BigEndian::read_u64(buf);
    let bits = if ordered & (1 << 63) != 0 {
        ordered ^ (1 << 63)
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_key_roundtrip() {
        let key = member_key(b"profile", b"name");
        let (user, member) = split_member_key(&key).unwrap();
        assert_eq!(user, b"profile");
        assert_eq!(member, b"name");

        assert!(split_member_key(b"no-separator").is_err());
    }

    #[test]
    fn test_list_key_roundtrip() {
        let key = list_key(b"queue", INITIAL_LIST_SEQ + 3);
        let (user, seq) = split_list_key(&key).unwrap();
        assert_eq!(user, b"queue");
        assert_eq!(seq, INITIAL_LIST_SEQ + 3);
    }

    #[test]
    fn test_list_meta_roundtrip() {
        let value = list_meta_value(INITIAL_LIST_SEQ - 2, INITIAL_LIST_SEQ + 5);
        let (head, tail) = decode_list_meta(&value).unwrap();
        assert_eq!(head, INITIAL_LIST_SEQ - 2);
        assert_eq!(tail, INITIAL_LIST_SEQ + 5);
    }

    #[test]
    fn test_score_encoding_preserves_order() {
        let scores = [
            f64::NEG_INFINITY,
            -1e300,
            -2.5,
            -1.0,
            -0.0,
            0.0,
            0.25,
            1.0,
            2.5,
            1e300,
            f64::INFINITY,
        ];
        for pair in scores.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(
                encode_score(a) <= encode_score(b),
                "{a} should encode <= {b}"
            );
        }
        for score in scores {
            assert_eq!(decode_score(&encode_score(score)), score);
        }
    }

    #[test]
    fn test_zset_key_ties_break_on_member() {
        let a = zset_key(b"board", 7.0, b"alice");
        let b = zset_key(b"board", 7.0, b"bob");
        assert!(a < b);

        let (score, member) = split_zset_suffix(split_member_key(&a).unwrap().1).unwrap();
        assert_eq!(score, 7.0);
        assert_eq!(member, b"alice");
    }
}
