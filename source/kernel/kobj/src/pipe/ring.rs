// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity byte ring used by pipes
//! OWNERS: @kernel-ipc-team
//! INVARIANTS: 0 <= len <= capacity; bytes leave in the order they entered

/// Circular byte buffer with separate read and write positions.
pub(crate) struct PipeBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    len: usize,
}

impl PipeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: vec![0; capacity].into_boxed_slice(), read_pos: 0, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Copies as much of `src` as fits; returns the number of bytes taken.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free());
        let cap = self.capacity();
        let write_pos = (self.read_pos + self.len) % cap.max(1);
        let first = n.min(cap - write_pos);
        self.data[write_pos..write_pos + first].copy_from_slice(&src[..first]);
        self.data[..n - first].copy_from_slice(&src[first..n]);
        self.len += n;
        n
    }

    /// Moves up to `dst.len()` bytes out; returns the number copied.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        let cap = self.capacity();
        let first = n.min(cap - self.read_pos);
        dst[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        dst[first..n].copy_from_slice(&self.data[..n - first]);
        self.read_pos = (self.read_pos + n) % cap.max(1);
        self.len -= n;
        n
    }
}
