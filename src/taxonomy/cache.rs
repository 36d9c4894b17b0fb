//! Binary storage for taxonomy label vectors.
//!
//! File format: label_embeddings.bin
//!
//! Header (79 bytes):
//! - version: u8 (1)
//! - fingerprint: [u8; 32] (SHA256 of the taxonomy file)
//! - model_id: [u8; 32] (SHA256 of the model key)
//! - dimensions: u16 (little-endian)
//! - parent_count: u32 (little-endian)
//! - child_count: u32 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Body:
//! - child_parent: [u32; child_count]
//! - parent rows: [[f32; dimensions]; parent_count]
//! - child rows: [[f32; dimensions]; child_count]

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::LabelEmbeddings;

const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 79;
const CHECKSUM_OFFSET: usize = 75;

#[derive(Debug, thiserror::Error)]
pub enum LabelCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Taxonomy fingerprint mismatch")]
    FingerprintMismatch,

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[derive(Debug)]
struct Header {
    fingerprint: [u8; 32],
    model_id: [u8; 32],
    dimensions: u16,
    parent_count: u32,
    child_count: u32,
}

pub struct LabelCacheStorage {
    path: PathBuf,
}

impl LabelCacheStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(
        &self,
        expected_fingerprint: &[u8; 32],
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<LabelEmbeddings, LabelCacheError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;

        if header.fingerprint != *expected_fingerprint {
            return Err(LabelCacheError::FingerprintMismatch);
        }
        if header.model_id != *expected_model_id {
            return Err(LabelCacheError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(LabelCacheError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        let parent_count = header.parent_count as usize;
        let child_count = header.child_count as usize;
        let dims = header.dimensions as usize;

        let mut child_parent = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let idx = read_u32(&mut reader)? as usize;
            if idx >= parent_count {
                return Err(LabelCacheError::InvalidFormat(format!(
                    "child parent index {idx} out of range"
                )));
            }
            child_parent.push(idx);
        }

        let parents = read_rows(&mut reader, parent_count, dims)?;
        let children = read_rows(&mut reader, child_count, dims)?;

        Ok(LabelEmbeddings {
            dimensions: dims,
            parents,
            children,
            child_parent,
        })
    }

    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        embeddings: &LabelEmbeddings,
        fingerprint: &[u8; 32],
        model_id: &[u8; 32],
    ) -> Result<(), LabelCacheError> {
        let temp_path = self.path.with_extension("tmp");

        if let Err(e) = write_to_file(&temp_path, embeddings, fingerprint, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn write_to_file(
    path: &Path,
    embeddings: &LabelEmbeddings,
    fingerprint: &[u8; 32],
    model_id: &[u8; 32],
) -> Result<(), LabelCacheError> {
    let dimensions = u16::try_from(embeddings.dimensions).map_err(|_| {
        LabelCacheError::InvalidFormat(format!("{} dimensions do not fit", embeddings.dimensions))
    })?;

    if embeddings.child_parent.len() != embeddings.children.len() {
        return Err(LabelCacheError::InvalidFormat(
            "child parent index length differs from child rows".to_string(),
        ));
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut header = [0u8; HEADER_SIZE];
    header[0] = FORMAT_VERSION;
    header[1..33].copy_from_slice(fingerprint);
    header[33..65].copy_from_slice(model_id);
    header[65..67].copy_from_slice(&dimensions.to_le_bytes());
    header[67..71].copy_from_slice(&(embeddings.parents.len() as u32).to_le_bytes());
    header[71..75].copy_from_slice(&(embeddings.children.len() as u32).to_le_bytes());
    let checksum = crc32fast::hash(&header[0..CHECKSUM_OFFSET]);
    header[CHECKSUM_OFFSET..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header)?;

    for &idx in &embeddings.child_parent {
        writer.write_all(&(idx as u32).to_le_bytes())?;
    }

    for row in embeddings.parents.iter().chain(embeddings.children.iter()) {
        if row.len() != embeddings.dimensions {
            return Err(LabelCacheError::DimensionMismatch {
                expected: embeddings.dimensions,
                got: row.len(),
            });
        }
        for &value in row {
            writer.write_all(&value.to_le_bytes())?;
        }
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, LabelCacheError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(LabelCacheError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored = u32::from_le_bytes([bytes[75], bytes[76], bytes[77], bytes[78]]);
    if stored != crc32fast::hash(&bytes[0..CHECKSUM_OFFSET]) {
        return Err(LabelCacheError::ChecksumMismatch);
    }

    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&bytes[1..33]);
    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[33..65]);

    Ok(Header {
        fingerprint,
        model_id,
        dimensions: u16::from_le_bytes([bytes[65], bytes[66]]),
        parent_count: u32::from_le_bytes([bytes[67], bytes[68], bytes[69], bytes[70]]),
        child_count: u32::from_le_bytes([bytes[71], bytes[72], bytes[73], bytes[74]]),
    })
}

fn read_u32(reader: &mut impl Read) -> Result<u32, LabelCacheError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_rows(
    reader: &mut impl Read,
    count: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, LabelCacheError> {
    let mut rows = Vec::with_capacity(count);
    let mut buf = [0u8; 4];
    for _ in 0..count {
        let mut row = Vec::with_capacity(dims);
        for _ in 0..dims {
            reader.read_exact(&mut buf)?;
            row.push(f32::from_le_bytes(buf));
        }
        rows.push(row);
    }
    Ok(rows)
}
