//! WAL Entry Types
//!
//! Entries carry an opaque payload whose prefix the replication core must
//! understand: a 64-bit big-endian timestamp, a 32-bit big-endian dimension
//! map length, and the dimension map itself. Everything after that is
//! table payload and passes through untouched.

use bytes::{BufMut, Bytes, BytesMut};

use super::Offset;
use crate::error::{Error, Result};

/// One replicated log entry, tagged with its stream and offset
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Stream the entry was read from
    pub stream: String,
    /// Opaque payload (timestamp + dimension map + table payload)
    pub data: Bytes,
    /// Offset the entry was read at
    pub offset: Offset,
}

/// Byte width of the timestamp prefix
const TIMESTAMP_WIDTH: usize = 8;
/// Byte width of the dimension map length field
const DIMS_LEN_WIDTH: usize = 4;

/// View over the dimension map portion of an entry payload
///
/// The map encodes `[u16 key_len][key][u16 value_len][value]` pairs with
/// keys sorted byte-wise, so the raw slice is a canonical representation
/// of its contents.
#[derive(Debug, Clone, Copy)]
pub struct DimensionMap<'a> {
    raw: &'a [u8],
}

impl<'a> DimensionMap<'a> {
    /// Look up a dimension's value bytes
    pub fn get(&self, name: &str) -> Option<&'a [u8]> {
        let wanted = name.as_bytes();
        let mut iter = DimensionIter { raw: self.raw };
        iter.find(|(key, _)| *key == wanted).map(|(_, value)| value)
    }

    /// Look up a dimension's value as UTF-8
    pub fn get_str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    /// The raw encoded map, used when hashing over all dimensions
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }

    /// Iterate over `(key, value)` pairs in encoded order
    pub fn iter(&self) -> impl Iterator<Item = (&'a [u8], &'a [u8])> {
        DimensionIter { raw: self.raw }
    }
}

struct DimensionIter<'a> {
    raw: &'a [u8],
}

impl<'a> Iterator for DimensionIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let key = take_field(&mut self.raw)?;
        let value = take_field(&mut self.raw)?;
        Some((key, value))
    }
}

fn take_field<'a>(raw: &mut &'a [u8]) -> Option<&'a [u8]> {
    if raw.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    if raw.len() < 2 + len {
        return None;
    }
    let field = &raw[2..2 + len];
    *raw = &raw[2 + len..];
    Some(field)
}

/// Encode dimension pairs into the canonical map form (keys sorted)
pub fn encode_dimensions(pairs: &[(&str, &[u8])]) -> Vec<u8> {
    let mut sorted: Vec<(&str, &[u8])> = pairs.to_vec();
    sorted.sort_by_key(|(key, _)| *key);

    let mut out = Vec::new();
    for (key, value) in sorted {
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Build a full entry payload from its parts
pub fn encode_payload(ts: u64, dims: &[u8], payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(TIMESTAMP_WIDTH + DIMS_LEN_WIDTH + dims.len() + payload.len());
    out.put_u64(ts);
    out.put_u32(dims.len() as u32);
    out.put_slice(dims);
    out.put_slice(payload);
    out.freeze()
}

/// Parse the dimension map prefix out of an entry payload
pub fn parse_dimensions(data: &[u8]) -> Result<DimensionMap<'_>> {
    let header = TIMESTAMP_WIDTH + DIMS_LEN_WIDTH;
    if data.len() < header {
        return Err(Error::MalformedEntry(format!(
            "payload too short for header: {} bytes",
            data.len()
        )));
    }
    let dims_len = u32::from_be_bytes([
        data[TIMESTAMP_WIDTH],
        data[TIMESTAMP_WIDTH + 1],
        data[TIMESTAMP_WIDTH + 2],
        data[TIMESTAMP_WIDTH + 3],
    ]) as usize;
    if data.len() < header + dims_len {
        return Err(Error::MalformedEntry(format!(
            "dimension map truncated: want {} bytes, have {}",
            dims_len,
            data.len() - header
        )));
    }
    Ok(DimensionMap {
        raw: &data[header..header + dims_len],
    })
}
