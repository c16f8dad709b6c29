//! Snapshot File Format
//!
//! A snapshot is the whole keyspace written as one big-endian byte stream:
//!
//! ```text
//! magic    "EMBR"                                   4 bytes
//! version  u32
//! written  i64   ms since epoch
//! strings  u32 count, count × [0x01][key][value]
//! lists    u32 count, count × [0x02][key][u32 n][item × n]
//! expiries u32 count, count × [0x03][key][i64 expires_at_ms]
//! ```
//!
//! Every `key`, `value` and `item` is a `u32` length followed by that many
//! bytes. The reader yields records one at a time so a loader can apply what
//! it decoded before hitting a corrupt or truncated tail.

use crate::storage::KeyspaceImage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"EMBR";
pub const VERSION: u32 = 1;

/// Record type markers
pub mod marker {
    pub const STRING: u8 = 0x01;
    pub const LIST: u8 = 0x02;
    pub const EXPIRY: u8 = 0x03;
}

/// Errors found while decoding a snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("not a snapshot file (bad magic)")]
    BadMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("unexpected record marker {found:#04x}, expected {expected:#04x}")]
    UnexpectedMarker { expected: u8, found: u8 },

    #[error("snapshot truncated while reading {0}")]
    Truncated(&'static str),
}

/// Fixed header at the start of every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    /// When the snapshot was written, ms since epoch
    pub written_at: i64,
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRecord {
    String { key: Bytes, value: Bytes },
    List { key: Bytes, items: Vec<Bytes> },
    Expiry { key: Bytes, expires_at: i64 },
}

/// Encodes a keyspace image.
pub fn encode(image: &KeyspaceImage, written_at: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(estimate_size(image));

    buf.put_slice(MAGIC);
    buf.put_u32(VERSION);
    buf.put_i64(written_at);

    buf.put_u32(image.strings.len() as u32);
    for (key, value) in &image.strings {
        buf.put_u8(marker::STRING);
        put_blob(&mut buf, key);
        put_blob(&mut buf, value);
    }

    buf.put_u32(image.lists.len() as u32);
    for (key, items) in &image.lists {
        buf.put_u8(marker::LIST);
        put_blob(&mut buf, key);
        buf.put_u32(items.len() as u32);
        for item in items {
            put_blob(&mut buf, item);
        }
    }

    buf.put_u32(image.expires.len() as u32);
    for (key, expires_at) in &image.expires {
        buf.put_u8(marker::EXPIRY);
        put_blob(&mut buf, key);
        buf.put_i64(*expires_at);
    }

    buf.freeze()
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn estimate_size(image: &KeyspaceImage) -> usize {
    let strings: usize = image
        .strings
        .iter()
        .map(|(k, v)| 9 + k.len() + v.len())
        .sum();
    let lists: usize = image
        .lists
        .iter()
        .map(|(k, items)| 9 + k.len() + items.iter().map(|i| 4 + i.len()).sum::<usize>())
        .sum();
    let expires: usize = image.expires.iter().map(|(k, _)| 13 + k.len()).sum();
    28 + strings + lists + expires
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Strings,
    Lists,
    Expiries,
    Done,
}

impl Section {
    fn next(self) -> Self {
        match self {
            Section::Strings => Section::Lists,
            Section::Lists => Section::Expiries,
            Section::Expiries | Section::Done => Section::Done,
        }
    }
}

/// Streaming snapshot decoder.
///
/// # Example
///
/// ```
/// use emberkv::persistence::snapshot::{encode, SnapshotReader, SnapshotRecord};
/// use emberkv::storage::KeyspaceImage;
/// use bytes::Bytes;
///
/// let image = KeyspaceImage {
///     strings: vec![(Bytes::from("k"), Bytes::from("v"))],
///     ..Default::default()
/// };
/// let mut reader = SnapshotReader::new(encode(&image, 0)).unwrap();
/// assert_eq!(
///     reader.next_record().unwrap(),
///     Some(SnapshotRecord::String { key: Bytes::from("k"), value: Bytes::from("v") })
/// );
/// assert_eq!(reader.next_record().unwrap(), None);
/// ```
#[derive(Debug)]
pub struct SnapshotReader {
    buf: Bytes,
    header: SnapshotHeader,
    section: Section,
    /// Records left in the current section; `None` until its count is read
    remaining: Option<u32>,
}

impl SnapshotReader {
    /// Validates the header and positions the reader at the first section.
    pub fn new(mut buf: Bytes) -> Result<Self, SnapshotError> {
        need(&buf, 4, "magic")?;
        if &buf[..4] != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        buf.advance(4);

        need(&buf, 4, "version")?;
        let version = buf.get_u32();
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        need(&buf, 8, "timestamp")?;
        let written_at = buf.get_i64();

        Ok(Self {
            buf,
            header: SnapshotHeader { version, written_at },
            section: Section::Strings,
            remaining: None,
        })
    }

    pub fn header(&self) -> SnapshotHeader {
        self.header
    }

    /// Decodes the next record, or `None` once all three sections are read.
    pub fn next_record(&mut self) -> Result<Option<SnapshotRecord>, SnapshotError> {
        loop {
            if self.section == Section::Done {
                return Ok(None);
            }

            let remaining = match self.remaining {
                Some(n) => n,
                None => {
                    need(&self.buf, 4, "section count")?;
                    self.buf.get_u32()
                }
            };

            if remaining == 0 {
                self.section = self.section.next();
                self.remaining = None;
                continue;
            }

            self.remaining = Some(remaining - 1);
            return self.read_record().map(Some);
        }
    }

    fn read_record(&mut self) -> Result<SnapshotRecord, SnapshotError> {
        let expected = match self.section {
            Section::Strings => marker::STRING,
            Section::Lists => marker::LIST,
            Section::Expiries | Section::Done => marker::EXPIRY,
        };

        need(&self.buf, 1, "record marker")?;
        let found = self.buf.get_u8();
        if found != expected {
            return Err(SnapshotError::UnexpectedMarker { expected, found });
        }

        let key = self.read_blob("key")?;
        match found {
            marker::STRING => {
                let value = self.read_blob("string value")?;
                Ok(SnapshotRecord::String { key, value })
            }
            marker::LIST => {
                need(&self.buf, 4, "list length")?;
                let len = self.buf.get_u32() as usize;
                // Each item takes at least its 4-byte length prefix.
                let mut items = Vec::with_capacity(len.min(self.buf.remaining() / 4));
                for _ in 0..len {
                    items.push(self.read_blob("list item")?);
                }
                Ok(SnapshotRecord::List { key, items })
            }
            _ => {
                need(&self.buf, 8, "expiry instant")?;
                let expires_at = self.buf.get_i64();
                Ok(SnapshotRecord::Expiry { key, expires_at })
            }
        }
    }

    fn read_blob(&mut self, what: &'static str) -> Result<Bytes, SnapshotError> {
        need(&self.buf, 4, what)?;
        let len = self.buf.get_u32() as usize;
        need(&self.buf, len, what)?;
        Ok(self.buf.split_to(len))
    }
}

#[inline]
fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), SnapshotError> {
    if buf.remaining() < n {
        Err(SnapshotError::Truncated(what))
    } else {
        Ok(())
    }
}
