use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use icebox_treehash::{HashSummary, TreeHasher, hash_reader};

use crate::TransferError;
use crate::session::{Part, part_count};

// ---------------------------------------------------------------------------
// Whole-file helpers
// ---------------------------------------------------------------------------

/// Tree hash and linear hash of an entire file.
pub fn hash_file(path: &Path) -> Result<HashSummary, TransferError> {
    let file = File::open(path)?;
    Ok(hash_reader(io::BufReader::new(file))?)
}

/// Tree hash and linear hash of `len` bytes starting at `offset`.
pub fn hash_file_range(path: &Path, offset: u64, len: u64) -> Result<HashSummary, TransferError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(hash_reader(file.take(len))?)
}

// ---------------------------------------------------------------------------
// PartReader
// ---------------------------------------------------------------------------

/// Random-access reader over the fixed-size parts of a source file.
pub struct PartReader {
    file: File,
    part_size: u64,
    file_size: u64,
    path: PathBuf,
}

impl PartReader {
    /// Opens `path` for reading in `part_size` units.
    pub fn open(path: &Path, part_size: u64) -> Result<Self, TransferError> {
        if part_size == 0 {
            return Err(TransferError::InvalidPartSize(part_size));
        }
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            part_size,
            file_size,
            path: path.to_path_buf(),
        })
    }

    /// Number of parts the file splits into.
    pub fn part_count(&self) -> usize {
        part_count(self.file_size, self.part_size)
    }

    /// Byte range of part `index`; only the last part may be short.
    pub fn part_range(&self, index: usize) -> Result<Range<u64>, TransferError> {
        let count = self.part_count();
        if index >= count {
            return Err(TransferError::PartOutOfRange { index, count });
        }
        let start = index as u64 * self.part_size;
        let end = (start + self.part_size).min(self.file_size);
        Ok(start..end)
    }

    /// Reads the bytes of part `index`.
    pub fn read_part(&mut self, index: usize) -> Result<Vec<u8>, TransferError> {
        let range = self.part_range(index)?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        self.file.seek(SeekFrom::Start(range.start))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Streams part `index` through `hasher` and returns its fingerprints.
    ///
    /// The hasher is reset afterwards so the caller can reuse it for the
    /// next part.
    pub fn hash_part(&mut self, index: usize, hasher: &mut TreeHasher) -> Result<Part, TransferError> {
        let range = self.part_range(index)?;
        let len = range.end - range.start;
        self.file.seek(SeekFrom::Start(range.start))?;

        hasher.reset();
        let copied = io::copy(&mut (&mut self.file).take(len), hasher)?;
        if copied != len {
            return Err(TransferError::SourceChanged(format!(
                "{}: part {index} is {copied} bytes, expected {len}",
                self.path.display()
            )));
        }

        let summary = hasher.summary();
        let part = Part {
            hash: summary.linear_hash,
            tree_hash: summary.tree_hash,
            uploaded: false,
        };
        hasher.reset();
        Ok(part)
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// ArchiveWriter
// ---------------------------------------------------------------------------

/// Append-only sink for a downloaded archive.
///
/// Only verified windows are appended, in increasing offset order; nothing
/// is ever written out of order or overwritten.
pub struct ArchiveWriter {
    file: File,
    path: PathBuf,
    written: u64,
}

impl ArchiveWriter {
    /// Creates `path`, truncating any previous content, and any missing
    /// parent directories. The file is opened in append mode.
    pub fn create(path: &Path) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        file.set_len(0)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    /// Appends a verified window.
    pub fn append(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes appended so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes to disk and re-reads the whole file from the start,
    /// returning its fingerprints.
    pub fn verify(&mut self) -> Result<HashSummary, TransferError> {
        self.file.flush()?;
        self.file.sync_all()?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(hash_reader(io::BufReader::new(&mut self.file))?)
    }
}
