use std::io::{self, Read};

use sha2::{Digest, Sha256};

use crate::{BLOCK_SIZE, TreeHash};

// ---------------------------------------------------------------------------
// TreeHasher
// ---------------------------------------------------------------------------

/// Incremental tree-hash accumulator.
///
/// Accepts writes of any size and re-chunks them into [`BLOCK_SIZE`] blocks.
/// Call [`close`](Self::close) once all data for the unit has been written;
/// any partial trailing bytes form the final block. Call
/// [`reset`](Self::reset) before hashing the next unit.
pub struct TreeHasher {
    blocks: Vec<TreeHash>,
    pending: Vec<u8>,
    linear: Sha256,
    len: u64,
    closed: Option<Closed>,
}

#[derive(Clone, Copy)]
struct Closed {
    root: TreeHash,
    linear: TreeHash,
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            pending: Vec::with_capacity(BLOCK_SIZE),
            linear: Sha256::new(),
            len: 0,
            closed: None,
        }
    }

    /// Feeds bytes into the current unit.
    ///
    /// Must not be called between [`close`](Self::close) and
    /// [`reset`](Self::reset).
    pub fn write(&mut self, mut data: &[u8]) {
        debug_assert!(self.closed.is_none(), "write after close without reset");
        self.linear.update(data);
        self.len += data.len() as u64;

        if !self.pending.is_empty() {
            let take = (BLOCK_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == BLOCK_SIZE {
                self.blocks.push(TreeHash::of(&self.pending));
                self.pending.clear();
            }
        }

        // Whole blocks straight from the caller's buffer.
        while data.len() >= BLOCK_SIZE {
            self.blocks.push(TreeHash::of(&data[..BLOCK_SIZE]));
            data = &data[BLOCK_SIZE..];
        }

        self.pending.extend_from_slice(data);
    }

    /// Freezes the block sequence and returns the root fingerprint.
    ///
    /// Calling `close` again before `reset` returns the same root.
    pub fn close(&mut self) -> TreeHash {
        self.finish().root
    }

    /// Closes the unit and returns its root, linear hash and length.
    pub fn summary(&mut self) -> HashSummary {
        let closed = self.finish();
        HashSummary {
            tree_hash: closed.root,
            linear_hash: closed.linear,
            len: self.len,
        }
    }

    fn finish(&mut self) -> Closed {
        if let Some(closed) = self.closed {
            return closed;
        }
        if !self.pending.is_empty() || self.blocks.is_empty() {
            self.blocks.push(TreeHash::of(&self.pending));
            self.pending.clear();
        }
        let linear = TreeHash::from_bytes(std::mem::take(&mut self.linear).finalize().into());
        let closed = Closed {
            root: fold(&self.blocks),
            linear,
        };
        self.closed = Some(closed);
        closed
    }

    /// Fingerprint of the most recently completed block.
    ///
    /// For a unit that fits in one block this is also the unit's root.
    pub fn hash(&self) -> Option<TreeHash> {
        self.blocks.last().copied()
    }

    /// Root fingerprint, available once the unit is closed.
    pub fn tree_hash(&self) -> Option<TreeHash> {
        self.closed.map(|c| c.root)
    }

    /// Plain SHA-256 of every byte in the unit, available once closed.
    pub fn linear_hash(&self) -> Option<TreeHash> {
        self.closed.map(|c| c.linear)
    }

    /// Per-block fingerprints completed so far, in offset order.
    pub fn blocks(&self) -> &[TreeHash] {
        &self.blocks
    }

    /// Number of bytes written to the current unit.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clears all state for the next unit, keeping allocated buffers.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.pending.clear();
        self.linear = Sha256::new();
        self.len = 0;
        self.closed = None;
    }
}

impl io::Write for TreeHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TreeHasher::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tree folding
// ---------------------------------------------------------------------------

/// Pairs adjacent nodes left to right until one remains. An odd trailing
/// node is carried up unchanged.
fn fold(nodes: &[TreeHash]) -> TreeHash {
    let mut level = nodes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => TreeHash::pair(left, right),
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
    }
    level[0]
}

/// Combines the roots of consecutive segments into the root of the whole.
///
/// The result equals the whole-object root only when every segment except
/// the last covers a power-of-two number of blocks, which is why multipart
/// part sizes are restricted to 1 MiB × 2^n. Returns `None` for no roots.
pub fn combine(roots: &[TreeHash]) -> Option<TreeHash> {
    if roots.is_empty() {
        None
    } else {
        Some(fold(roots))
    }
}

// ---------------------------------------------------------------------------
// Reader helper
// ---------------------------------------------------------------------------

/// Digests of a fully consumed reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSummary {
    pub tree_hash: TreeHash,
    pub linear_hash: TreeHash,
    pub len: u64,
}

/// Reads `reader` to the end and returns its tree and linear hashes.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<HashSummary> {
    let mut hasher = TreeHasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.summary())
}
