// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

/// A contiguous, owned byte region with head/tail cursors.
///
/// `head` marks the first valid byte, `tail` the position one past the
/// last valid byte; `head <= tail <= capacity` is maintained by every
/// operation. Reserving head space lets a caller fill the body of a packet
/// first and prepend the header afterwards, once the total length is known.
#[derive(Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Buffer {
    /// Allocate a new buffer with `cap` bytes of storage and nothing valid
    /// in it yet.
    pub fn new(cap: usize) -> Self {
        Self {
            storage: vec![0; cap],
            head: 0,
            tail: 0,
        }
    }

    /// Capacity of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of valid bytes currently held (`tail - head`).
    pub fn count(&self) -> usize {
        self.tail - self.head
    }

    /// Whether the buffer has no room left to grow (`tail == capacity`).
    pub fn is_full(&self) -> bool {
        self.tail == self.storage.len()
    }

    /// Move `head` (and `tail`, so the valid region stays empty) forward by
    /// `n` bytes, reserving room for a header a caller will write in later
    /// via [`Buffer::prepend`]. Panics if `n` would push `head` past the
    /// end of storage.
    pub fn reserve_head(&mut self, n: usize) {
        assert!(self.head + n <= self.storage.len(), "reserve_head overflow");
        self.head += n;
        self.tail = self.head;
    }

    /// Append `bytes` to the valid region, advancing `tail`. Panics if
    /// there isn't enough capacity left.
    pub fn append(&mut self, bytes: &[u8]) {
        let end = self.tail + bytes.len();
        assert!(end <= self.storage.len(), "append overflow");
        self.storage[self.tail..end].copy_from_slice(bytes);
        self.tail = end;
    }

    /// Write `bytes` immediately before the current `head`, then move
    /// `head` back to cover them. Used to prepend a packet header into
    /// space reserved earlier by [`Buffer::reserve_head`].
    ///
    /// Panics if `bytes.len()` is larger than the currently reserved head
    /// room.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.head, "prepend exceeds reserved head room");
        let start = self.head - bytes.len();
        self.storage[start..self.head].copy_from_slice(bytes);
        self.head = start;
    }

    /// The valid region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.head..self.tail]
    }

    /// The valid region as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.tail]
    }

    /// The writable region beyond `tail`, up to `capacity`. Used by
    /// `Socket::doio` to hand the kernel somewhere to read into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.tail..]
    }

    /// Record that `n` more bytes were written into the spare region
    /// (advances `tail`). Panics if that would overrun capacity.
    pub fn advance_tail(&mut self, n: usize) {
        let end = self.tail + n;
        assert!(end <= self.storage.len(), "advance_tail overflow");
        self.tail = end;
    }

    /// Take ownership of the buffer's contents as an owned `Vec<u8>`
    /// holding exactly the valid region.
    pub fn take(self) -> Vec<u8> {
        self.storage[self.head..self.tail].to_vec()
    }

    /// Build a buffer whose valid region is exactly `bytes`, with no head
    /// room reserved.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let tail = bytes.len();
        Self {
            storage: bytes,
            head: 0,
            tail,
        }
    }
}
