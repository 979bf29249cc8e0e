//! Per-direction IO buffer with multiple independent readers (component C1).
//!
//! A `IoBuffer` is a circular queue of fixed-size blocks with one writer
//! cursor and up to 255 reader cursors. Every cursor is a plain `usize`
//! offset modulo the buffer's current capacity — never a pointer — which is
//! what lets [`IoBuffer::expand_with`] grow the buffer without invalidating
//! any outstanding reader.
//!
//! The buffer never frees a block early: growing only ever appends blocks
//! (possibly after copying a writer's in-flight prefix into a fresh one, see
//! `expand_with`), and the whole block vector is dropped together with the
//! buffer.

use crate::error::{Error, Result};

/// Hard ceiling on concurrently registered readers (reader slots are a
/// `u8` index in the wire/debug representation, and 255 is already far more
/// than any connection needs — client, origin, and origin-to-cache).
pub const MAX_READERS: usize = 255;

/// Opaque handle to a registered reader. Only valid for the `IoBuffer` that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(usize);

#[derive(Debug)]
pub struct IoBuffer {
    block_size: usize,
    blocks: Vec<Box<[u8]>>,
    capacity: usize,
    writer: usize,
    readers: Vec<Option<usize>>,
    free_slots: Vec<usize>,
}

impl IoBuffer {
    /// Creates a buffer with `n_blocks` blocks of `block_size` bytes each.
    pub fn new(block_size: usize, n_blocks: usize) -> IoBuffer {
        assert!(block_size > 0, "block_size must be non-zero");
        assert!(n_blocks > 0, "n_blocks must be non-zero");
        let blocks = (0..n_blocks)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();
        IoBuffer {
            block_size,
            blocks,
            capacity: block_size * n_blocks,
            writer: 0,
            readers: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn reader_offset(&self, id: ReaderId) -> usize {
        self.readers[id.0].expect("reader slot not registered")
    }

    /// Bytes the writer is currently ahead of `offset`, going forward around
    /// the ring (i.e. how many bytes the writer would have to emit before it
    /// caught up with a cursor sitting at `offset`).
    fn backward_distance(&self, offset: usize) -> usize {
        if offset <= self.writer {
            self.writer - offset
        } else {
            (self.capacity - offset) + self.writer
        }
    }

    fn slowest_reader_distance(&self) -> Option<usize> {
        self.readers
            .iter()
            .flatten()
            .map(|&off| self.backward_distance(off))
            .max()
    }

    /// "places the reader at the minimum of existing readers' offsets
    /// ... fails if 255 readers are already live."
    pub fn register_reader(&mut self) -> Result<ReaderId> {
        let live = self.readers.iter().filter(|r| r.is_some()).count();
        if live >= MAX_READERS {
            return Err(Error::new_io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "too many registered readers",
            )));
        }
        let start = self
            .readers
            .iter()
            .flatten()
            .copied()
            .min()
            .unwrap_or(self.writer);
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.readers[slot] = Some(start);
            slot
        } else {
            self.readers.push(Some(start));
            self.readers.len() - 1
        };
        Ok(ReaderId(slot))
    }

    /// Frees the slot for reuse. Callers are responsible for the
    /// discipline that at least one reader remains registered whenever
    /// there are unconsumed written bytes.
    pub fn unregister_reader(&mut self, id: ReaderId) {
        self.readers[id.0] = None;
        self.free_slots.push(id.0);
    }

    /// Current writable window. Zero when no readers are registered or the
    /// writer is one byte behind the nearest reader ahead of it.
    pub fn writable_bytes(&self) -> usize {
        match self.slowest_reader_distance() {
            None => 0,
            Some(dist) => self.capacity.saturating_sub(dist).saturating_sub(1),
        }
    }

    /// Bytes available to read for reader `id`: distance from its cursor to
    /// the writer, going forward around the ring.
    pub fn readable_bytes(&self, id: ReaderId) -> usize {
        let off = self.reader_offset(id);
        if off <= self.writer {
            self.writer - off
        } else {
            (self.capacity - off) + self.writer
        }
    }

    fn block_of(&self, offset: usize) -> (usize, usize) {
        (offset / self.block_size, offset % self.block_size)
    }

    /// A contiguous span the writer may fill next, bounded by both the
    /// writable window and the current block boundary — stopping at either
    /// the logical end or a block boundary, whichever comes first.
    pub fn write_span(&mut self) -> &mut [u8] {
        let writable = self.writable_bytes();
        let (blk, intra) = self.block_of(self.writer);
        let in_block = self.block_size - intra;
        let len = writable.min(in_block);
        &mut self.blocks[blk][intra..intra + len]
    }

    /// Advances the writer by `n` bytes (`n <= writable_bytes()`).
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.writable_bytes(),
            "commit({}) exceeds writable_bytes({})",
            n,
            self.writable_bytes()
        );
        self.writer = (self.writer + n) % self.capacity;
    }

    /// A contiguous span of unread bytes for reader `id`, bounded by the
    /// current block boundary.
    pub fn read_span(&self, id: ReaderId) -> &[u8] {
        let readable = self.readable_bytes(id);
        let off = self.reader_offset(id);
        let (blk, intra) = self.block_of(off);
        let in_block = self.block_size - intra;
        let len = readable.min(in_block);
        &self.blocks[blk][intra..intra + len]
    }

    /// Copies up to `max_len` unread bytes for reader `id` into a fresh
    /// `Vec`, without advancing the reader's cursor. Unlike [`read_span`],
    /// which stops at a block boundary, this walks as many blocks as needed
    /// — used where a caller (the cache-compare step) needs to look at
    /// buffered bytes that may span more than one block before deciding
    /// whether to consume them.
    pub fn peek_to_vec(&self, id: ReaderId, max_len: usize) -> Vec<u8> {
        let mut remaining = self.readable_bytes(id).min(max_len);
        let mut out = Vec::with_capacity(remaining);
        let mut off = self.reader_offset(id);
        while remaining > 0 {
            let (blk, intra) = self.block_of(off);
            let in_block = self.block_size - intra;
            let len = remaining.min(in_block);
            out.extend_from_slice(&self.blocks[blk][intra..intra + len]);
            off = (off + len) % self.capacity;
            remaining -= len;
        }
        out
    }

    /// Advances reader `id`'s cursor by `n` bytes (`n <= readable_bytes(id)`).
    pub fn consume(&mut self, id: ReaderId, n: usize) {
        assert!(
            n <= self.readable_bytes(id),
            "consume({}) exceeds readable_bytes",
            n
        );
        let off = self.readers[id.0].expect("reader slot not registered");
        self.readers[id.0] = Some((off + n) % self.capacity);
    }

    /// Grows the buffer by at least `n_bytes`, preserving every outstanding
    /// cursor's logical byte stream without ever invalidating a cursor.
    pub fn expand_with(&mut self, n_bytes: usize) {
        if n_bytes == 0 {
            return;
        }
        let n_new = (n_bytes + self.block_size - 1) / self.block_size;
        let (wblk, wintra) = self.block_of(self.writer);

        let shares_block_with_ahead_reader = self.readers.iter().flatten().any(|&off| {
            off > self.writer && self.block_of(off).0 == wblk
        });

        let mut new_blocks: Vec<Box<[u8]>> = Vec::with_capacity(self.blocks.len() + n_new + 1);
        let mut inserted_bytes;

        if wintra > 0 && shares_block_with_ahead_reader {
            // Split: copy the writer's already-written prefix into a fresh
            // block, insert the new capacity, then keep the old block
            // (still holding the trailing reader's unread tail) afterwards.
            new_blocks.extend(self.blocks.drain(..wblk));
            let mut prefix = vec![0u8; self.block_size].into_boxed_slice();
            prefix[..wintra].copy_from_slice(&self.blocks[0][..wintra]);
            new_blocks.push(prefix);
            for _ in 0..n_new {
                new_blocks.push(vec![0u8; self.block_size].into_boxed_slice());
            }
            new_blocks.push(self.blocks.remove(0));
            new_blocks.extend(self.blocks.drain(..));
            inserted_bytes = (n_new + 1) * self.block_size;
        } else {
            // Simple case: splice fresh blocks in right after the writer's
            // current block (or right before it, if the writer hasn't
            // written anything into it yet this lap).
            let insert_at = if wintra == 0 { wblk } else { wblk + 1 };
            new_blocks.extend(self.blocks.drain(..insert_at));
            for _ in 0..n_new {
                new_blocks.push(vec![0u8; self.block_size].into_boxed_slice());
            }
            new_blocks.extend(self.blocks.drain(..));
            inserted_bytes = n_new * self.block_size;
        }
        let _ = &mut inserted_bytes;

        let writer = self.writer;
        for slot in self.readers.iter_mut() {
            if let Some(off) = slot {
                if *off > writer {
                    *off += inserted_bytes;
                }
            }
        }

        self.blocks = new_blocks;
        self.capacity = self.blocks.len() * self.block_size;
    }
}
