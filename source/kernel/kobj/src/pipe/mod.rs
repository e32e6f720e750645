// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unidirectional byte pipes with blocking read/write
//! OWNERS: @kernel-ipc-team
//! STATUS: Functional
//! PUBLIC API: PipePair; (crate) PipeCb, create/read/write/close_reader/close_writer
//! DEPENDS_ON: pipe::ring, stream, sync::CondVar
//! INVARIANTS: A pipe is freed exactly when both ends are closed; closing an end
//!             twice is a no-op
//!
//! A writer blocks only while the ring is full and a reader remains. A reader
//! blocks only while the ring is empty and a writer remains. End-of-stream is an
//! empty ring with the writer gone.

mod ring;
#[cfg(test)]
mod tests_prop;

use std::sync::Arc;

use log::{debug, trace};

use crate::arena::arena_key;
use crate::error::{fatal, KResult, KernelError};
use crate::kernel::{KernelGuard, KernelState};
use crate::stream::{self, FcbId, StreamOps};
use crate::sync::CondVar;
use crate::types::{Fid, Pid};

pub(crate) use ring::PipeBuffer;

arena_key!(pub(crate) PipeId);

/// Handles returned by `CreatePipe`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PipePair {
    pub read: Fid,
    pub write: Fid,
}

/// Pipe control block.
pub(crate) struct PipeCb {
    buffer: PipeBuffer,
    reader: Option<FcbId>,
    writer: Option<FcbId>,
    has_data: CondVar,
    has_space: CondVar,
}

impl PipeCb {
    fn new(capacity: usize, reader: FcbId, writer: FcbId) -> Self {
        Self {
            buffer: PipeBuffer::new(capacity),
            reader: Some(reader),
            writer: Some(writer),
            has_data: CondVar::new(),
            has_space: CondVar::new(),
        }
    }
}

/// Builds a pipe whose ends are owned by the given FCBs.
pub(crate) fn create(k: &mut KernelGuard<'_>, reader: FcbId, writer: FcbId) -> PipeId {
    let capacity = k.config.pipe_buffer_size;
    match k.pipes.insert(PipeCb::new(capacity, reader, writer)) {
        Ok(id) => {
            debug!(target: "kobj::pipe", "pipe {:?} created cap={}", id, capacity);
            id
        }
        Err(_) => fatal!("pipe arena exhausted"),
    }
}

/// `CreatePipe()`: two handles in the caller's FIDT, read end first.
pub(crate) fn open(k: &mut KernelGuard<'_>, pid: Pid) -> KResult<PipePair> {
    let reserved = stream::reserve(k, pid, 2)?;
    let (read_fid, read_fcb) = reserved[0];
    let (write_fid, write_fcb) = reserved[1];
    let pipe = create(k, read_fcb, write_fcb);
    stream::install(k, read_fcb, Arc::new(PipeReader(pipe)));
    stream::install(k, write_fcb, Arc::new(PipeWriter(pipe)));
    Ok(PipePair { read: read_fid, write: write_fid })
}

fn write_blocked(state: &KernelState, id: PipeId) -> bool {
    state.pipes.get(id).is_some_and(|pipe| {
        pipe.buffer.is_full() && pipe.reader.is_some() && pipe.writer.is_some()
    })
}

fn read_blocked(state: &KernelState, id: PipeId) -> bool {
    state.pipes.get(id).is_some_and(|pipe| pipe.buffer.is_empty() && pipe.writer.is_some())
}

/// Writes all of `buf` unless the reader disappears, in which case the bytes
/// already accepted are reported.
pub(crate) fn write(k: &mut KernelGuard<'_>, id: PipeId, buf: &[u8]) -> KResult<usize> {
    let (has_space, has_data) = match k.pipes.get(id) {
        Some(pipe) if pipe.reader.is_some() && pipe.writer.is_some() => {
            (pipe.has_space.clone(), pipe.has_data.clone())
        }
        _ => return Err(KernelError::Closed),
    };
    let mut written = 0;
    while written < buf.len() {
        has_space.wait_while(k, |state| write_blocked(state, id));
        let Some(pipe) = k.pipes.get_mut(id) else { break };
        if pipe.writer.is_none() {
            break;
        }
        let n = pipe.buffer.push(&buf[written..]);
        written += n;
        trace!(target: "kobj::pipe", "pipe {:?} +{} len={}", id, n, pipe.buffer.len());
        has_data.broadcast();
        if pipe.reader.is_none() {
            break;
        }
    }
    Ok(written)
}

/// Reads up to `buf.len()` bytes; `Ok(0)` is end-of-stream.
pub(crate) fn read(k: &mut KernelGuard<'_>, id: PipeId, buf: &mut [u8]) -> KResult<usize> {
    let (has_data, has_space) = match k.pipes.get(id) {
        Some(pipe) if pipe.reader.is_none() => return Err(KernelError::Closed),
        Some(pipe) => (pipe.has_data.clone(), pipe.has_space.clone()),
        None => return Err(KernelError::Closed),
    };
    has_data.wait_while(k, |state| read_blocked(state, id));
    let Some(pipe) = k.pipes.get_mut(id) else { return Ok(0) };
    let n = pipe.buffer.pop(buf);
    trace!(target: "kobj::pipe", "pipe {:?} -{} len={}", id, n, pipe.buffer.len());
    has_space.broadcast();
    Ok(n)
}

pub(crate) fn close_reader(k: &mut KernelGuard<'_>, id: PipeId) {
    let Some(pipe) = k.pipes.get_mut(id) else { return };
    if pipe.reader.take().is_none() {
        return;
    }
    pipe.has_space.broadcast();
    let orphaned = pipe.writer.is_none();
    release_if_orphaned(k, id, orphaned);
}

pub(crate) fn close_writer(k: &mut KernelGuard<'_>, id: PipeId) {
    let Some(pipe) = k.pipes.get_mut(id) else { return };
    if pipe.writer.take().is_none() {
        return;
    }
    pipe.has_data.broadcast();
    pipe.has_space.broadcast();
    let orphaned = pipe.reader.is_none();
    release_if_orphaned(k, id, orphaned);
}

fn release_if_orphaned(k: &mut KernelGuard<'_>, id: PipeId, orphaned: bool) {
    if orphaned && k.pipes.remove(id).is_some() {
        debug!(target: "kobj::pipe", "pipe {:?} released", id);
    }
}

/// Read end as seen through a handle.
struct PipeReader(PipeId);

impl StreamOps for PipeReader {
    fn read(&self, k: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        read(k, self.0, buf)
    }

    fn close(&self, k: &mut KernelGuard<'_>) {
        close_reader(k, self.0);
    }
}

/// Write end as seen through a handle.
struct PipeWriter(PipeId);

impl StreamOps for PipeWriter {
    fn write(&self, k: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        write(k, self.0, buf)
    }

    fn close(&self, k: &mut KernelGuard<'_>) {
        close_writer(k, self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::Kernel;

    fn small_kernel() -> Arc<Kernel> {
        let config = KernelConfig { pipe_buffer_size: 8, ..KernelConfig::default() };
        Kernel::new(config).expect("config")
    }

    #[test]
    fn open_hands_out_lowest_slots() {
        let kernel = small_kernel();
        let mut k = kernel.lock();
        let pair = open(&mut k, Pid::IDLE).expect("pipe");
        assert_eq!(pair, PipePair { read: Fid::from_raw(0), write: Fid::from_raw(1) });
        assert_eq!(k.pipes.len(), 1);
    }

    #[test]
    fn reads_see_writes_in_order() {
        let kernel = small_kernel();
        let mut k = kernel.lock();
        let pair = open(&mut k, Pid::IDLE).expect("pipe");
        let writer = stream::get(&k, Pid::IDLE, pair.write).expect("writer");
        let reader = stream::get(&k, Pid::IDLE, pair.read).expect("reader");
        assert_eq!(writer.write(&mut k, b"hello"), Ok(5));
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut k, &mut buf), Ok(3));
        assert_eq!(&buf, b"hel");
        assert_eq!(reader.read(&mut k, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"lo");
    }

    #[test]
    fn wrong_direction_is_not_supported() {
        let kernel = small_kernel();
        let mut k = kernel.lock();
        let pair = open(&mut k, Pid::IDLE).expect("pipe");
        let reader = stream::get(&k, Pid::IDLE, pair.read).expect("reader");
        assert_eq!(reader.write(&mut k, b"x"), Err(KernelError::NotSupported));
    }

    #[test]
    fn eof_after_writer_closes_and_buffer_drains() {
        let kernel = small_kernel();
        let mut k = kernel.lock();
        let pair = open(&mut k, Pid::IDLE).expect("pipe");
        let reader = stream::get(&k, Pid::IDLE, pair.read).expect("reader");
        let writer = stream::get(&k, Pid::IDLE, pair.write).expect("writer");
        assert_eq!(writer.write(&mut k, b"ab"), Ok(2));
        stream::close(&mut k, Pid::IDLE, pair.write).expect("close writer");
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut k, &mut buf), Ok(2));
        assert_eq!(reader.read(&mut k, &mut buf), Ok(0));
    }

    #[test]
    fn write_without_reader_fails() {
        let kernel = small_kernel();
        let mut k = kernel.lock();
        let pair = open(&mut k, Pid::IDLE).expect("pipe");
        let writer = stream::get(&k, Pid::IDLE, pair.write).expect("writer");
        stream::close(&mut k, Pid::IDLE, pair.read).expect("close reader");
        assert_eq!(writer.write(&mut k, b"x"), Err(KernelError::Closed));
    }

    #[test]
    fn pipe_is_freed_when_both_ends_close() {
        let kernel = small_kernel();
        let mut k = kernel.lock();
        let pair = open(&mut k, Pid::IDLE).expect("pipe");
        let writer = stream::get(&k, Pid::IDLE, pair.write).expect("writer");
        stream::close(&mut k, Pid::IDLE, pair.read).expect("close reader");
        assert_eq!(k.pipes.len(), 1);
        stream::close(&mut k, Pid::IDLE, pair.write).expect("close writer");
        assert_eq!(k.pipes.len(), 0);
        // The stale stream object must not resurrect or double-free the pipe.
        writer.close(&mut k);
        assert_eq!(writer.write(&mut k, b"x"), Err(KernelError::Closed));
    }
}
