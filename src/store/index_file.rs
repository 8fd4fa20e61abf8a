//! Binary format of the HNSW index file.
//!
//! Header (29 bytes):
//! - version: u8 (1)
//! - dimensions: u32 (little-endian)
//! - max_elements: u64 (little-endian)
//! - entry_count: u64 (little-endian)
//! - body_checksum: u32 (CRC32 of every entry byte)
//! - header_checksum: u32 (CRC32 of the header fields before it)
//!
//! Entries (repeated, in graph insertion order):
//! - label: u32 (little-endian)
//! - flags: u8 (bit 0 = tombstoned)
//! - vector: [f32; dimensions] (little-endian)
//!
//! The graph itself is not serialized. Loading replays the inserts in the
//! stored order, which rebuilds the same graph because construction is
//! seeded.

use std::io::{Cursor, Read};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + dimensions(4) + max_elements(8) + entry_count(8) + body_checksum(4) + header_checksum(4)
const HEADER_SIZE: usize = 29;

const FLAG_DELETED: u8 = 0b0000_0001;

#[derive(Debug, thiserror::Error)]
pub enum IndexFileError {
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// One graph slot.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub label: u32,
    pub deleted: bool,
    pub vector: Vec<f32>,
}

/// Everything needed to rebuild a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSnapshot {
    pub dimensions: usize,
    pub max_elements: usize,
    pub entries: Vec<IndexEntry>,
}

impl IndexSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        let entry_size = 4 + 1 + 4 * self.dimensions;
        let mut body = Vec::with_capacity(entry_size * self.entries.len());

        for entry in &self.entries {
            body.extend_from_slice(&entry.label.to_le_bytes());
            body.push(if entry.deleted { FLAG_DELETED } else { 0 });
            for value in &entry.vector {
                body.extend_from_slice(&value.to_le_bytes());
            }
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&(self.dimensions as u32).to_le_bytes());
        out.extend_from_slice(&(self.max_elements as u64).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        let header_checksum = crc32fast::hash(&out[0..HEADER_SIZE - 4]);
        out.extend_from_slice(&header_checksum.to_le_bytes());

        out.extend_from_slice(&body);
        out
    }

    /// Decode and validate an index file.
    ///
    /// # Arguments
    /// * `bytes` - Raw file contents
    /// * `expected_dimensions` - Dimensionality the caller is configured for
    pub fn decode(bytes: &[u8], expected_dimensions: usize) -> Result<Self, IndexFileError> {
        if bytes.len() < HEADER_SIZE {
            return Err(IndexFileError::InvalidFormat(format!(
                "file is {} bytes, header needs {HEADER_SIZE}",
                bytes.len()
            )));
        }

        let (header, body) = bytes.split_at(HEADER_SIZE);
        let mut reader = Cursor::new(header);

        let version = read_u8(&mut reader)?;
        if version > FORMAT_VERSION {
            return Err(IndexFileError::VersionMismatch(version, FORMAT_VERSION));
        }

        let dimensions = read_u32(&mut reader)? as usize;
        let max_elements = read_u64(&mut reader)? as usize;
        let entry_count = read_u64(&mut reader)? as usize;
        let body_checksum = read_u32(&mut reader)?;
        let header_checksum = read_u32(&mut reader)?;

        if crc32fast::hash(&header[0..HEADER_SIZE - 4]) != header_checksum {
            return Err(IndexFileError::ChecksumMismatch);
        }
        if crc32fast::hash(body) != body_checksum {
            return Err(IndexFileError::ChecksumMismatch);
        }

        if dimensions != expected_dimensions {
            return Err(IndexFileError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let entry_size = 4 + 1 + 4 * dimensions;
        let expected_len = entry_size.checked_mul(entry_count).ok_or_else(|| {
            IndexFileError::InvalidFormat(format!("entry count {entry_count} is out of range"))
        })?;
        if body.len() != expected_len {
            return Err(IndexFileError::InvalidFormat(format!(
                "expected {expected_len} entry bytes for {entry_count} entries, found {}",
                body.len()
            )));
        }

        let mut reader = Cursor::new(body);
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let label = read_u32(&mut reader)?;
            let flags = read_u8(&mut reader)?;
            let mut vector = Vec::with_capacity(dimensions);
            for _ in 0..dimensions {
                let mut float_bytes = [0u8; 4];
                read_exact(&mut reader, &mut float_bytes)?;
                vector.push(f32::from_le_bytes(float_bytes));
            }
            entries.push(IndexEntry {
                label,
                deleted: flags & FLAG_DELETED != 0,
                vector,
            });
        }

        Ok(Self {
            dimensions,
            max_elements,
            entries,
        })
    }
}

fn read_exact(reader: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), IndexFileError> {
    reader
        .read_exact(buf)
        .map_err(|e| IndexFileError::InvalidFormat(format!("truncated file: {e}")))
}

fn read_u8(reader: &mut Cursor<&[u8]>) -> Result<u8, IndexFileError> {
    let mut buf = [0u8; 1];
    read_exact(reader, &mut buf)?;
    Ok(buf[0])
}

fn read_u32(reader: &mut Cursor<&[u8]>) -> Result<u32, IndexFileError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut Cursor<&[u8]>) -> Result<u64, IndexFileError> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
