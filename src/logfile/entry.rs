//! On-disk entry codec.
//!
//! Every mutation is persisted as one immutable, CRC-protected entry:
//!
//! ```text
//! +--------+-------+------------------+----------------+------------------+-----+-------+
//! |crc32:4 |type:1 | expire_at:varint | key_size:varint| value_size:varint| key | value |
//! +--------+-------+------------------+----------------+------------------+-----+-------+
//! ```
//!
//! - Multi-byte fixed-width integers are little-endian.
//! - `expire_at`, `key_size` and `value_size` are LEB128 varints.
//! - The CRC32 covers everything after the checksum field.
//!
//! Entries are self-delimiting: a reader positioned at an entry boundary
//! can decode it and advance without any external index.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Upper bound of the encoded header: crc + type + three 10-byte varints.
pub const MAX_HEADER_SIZE: usize = 4 + 1 + 10 + 10 + 10;

/// Location of an entry on disk. Stable for the life of its segment;
/// the merge invalidates positions only after repointing the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub file_id: u32,
    pub offset: u64,
    pub size: u32,
}

/// Kind tag persisted in every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// Insert or overwrite.
    Put,
    /// Tombstone.
    Delete,
    /// List head/tail sequence record, keyed by the user key.
    ListMeta,
    /// Whole-key deadline for a compound key.
    Expire,
    /// Opens a batch; entries up to the matching commit are provisional.
    BatchBegin,
    /// Seals a batch.
    BatchCommit,
}

impl EntryType {
    fn tag(self) -> u8 {
        match self {
            EntryType::Put => 1,
            EntryType::Delete => 2,
            EntryType::ListMeta => 3,
            EntryType::Expire => 4,
            EntryType::BatchBegin => 5,
            EntryType::BatchCommit => 6,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(EntryType::Put),
            2 => Ok(EntryType::Delete),
            3 => Ok(EntryType::ListMeta),
            4 => Ok(EntryType::Expire),
            5 => Ok(EntryType::BatchBegin),
            6 => Ok(EntryType::BatchCommit),
            n => Err(Error::Corrupt(format!("invalid entry type tag {n}"))),
        }
    }
}

/// One decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub entry_type: EntryType,
    /// Epoch-second deadline; 0 means no expiry.
    pub expire_at: u64,
}

impl Entry {
    pub fn new(key: Vec<u8>, value: Vec<u8>, entry_type: EntryType) -> Self {
        Self {
            key,
            value,
            entry_type,
            expire_at: 0,
        }
    }

    pub fn with_expire(key: Vec<u8>, value: Vec<u8>, entry_type: EntryType, expire_at: u64) -> Self {
        Self {
            key,
            value,
            entry_type,
            expire_at,
        }
    }

    /// Size of this entry once encoded.
    pub fn encoded_size(&self) -> u64 {
        let header = 4
            + 1
            + varint_len(self.expire_at)
            + varint_len(self.key.len() as u64)
            + varint_len(self.value.len() as u64);
        (header + self.key.len() + self.value.len()) as u64
    }

    /// Encodes the entry into its on-disk representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size() as usize);
        buf.extend_from_slice(&[0u8; 4]);
        buf.push(self.entry_type.tag());
        put_varint(&mut buf, self.expire_at);
        put_varint(&mut buf, self.key.len() as u64);
        put_varint(&mut buf, self.value.len() as u64);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = CRC32.checksum(&buf[4..]);
        LittleEndian::write_u32(&mut buf[..4], crc);
        buf
    }

    /// Decodes one entry from the start of `buf`, returning it and its
    /// on-disk size. Fails with `Corrupt` on a truncated header, bad type
    /// tag, short payload or CRC mismatch.
    pub fn decode(buf: &[u8]) -> Result<(Entry, u64)> {
        let header = EntryHeader::decode(buf)?;
        let total = header.total_size() as usize;
        if buf.len() < total {
            return Err(Error::Corrupt("truncated entry payload".into()));
        }
        if CRC32.checksum(&buf[4..total]) != header.crc {
            return Err(Error::Corrupt("entry checksum mismatch".into()));
        }

        let pos = header.header_size;
        let key = buf[pos..pos + header.key_size].to_vec();
        let value = buf[pos + header.key_size..total].to_vec();
        Ok((
            Entry {
                key,
                value,
                entry_type: header.entry_type,
                expire_at: header.expire_at,
            },
            total as u64,
        ))
    }
}

/// Parsed fixed part of an entry, used to learn the payload size before
/// the payload itself has been read.
pub(crate) struct EntryHeader {
    pub crc: u32,
    pub entry_type: EntryType,
    pub expire_at: u64,
    pub header_size: usize,
    pub key_size: usize,
    pub value_size: usize,
}

impl EntryHeader {
    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 5 {
            return Err(Error::Corrupt("truncated entry header".into()));
        }
        let crc = LittleEndian::read_u32(&buf[..4]);
        let entry_type = EntryType::from_tag(buf[4])?;

        let mut pos = 5;
        let expire_at = get_varint(buf, &mut pos)?;
        let key_size = get_varint(buf, &mut pos)? as usize;
        let value_size = get_varint(buf, &mut pos)? as usize;

        Ok(Self {
            crc,
            entry_type,
            expire_at,
            header_size: pos,
            key_size,
            value_size,
        })
    }

    pub(crate) fn total_size(&self) -> u64 {
        (self.header_size + self.key_size + self.value_size) as u64
    }
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::Corrupt("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(Error::Corrupt("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
