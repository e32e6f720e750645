// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: File control blocks, per-process handle tables and the stream interface
//! OWNERS: @kernel-team
//! PUBLIC API: (crate) StreamOps, FileTable, reserve/install/get/incref/decref/close/dup2
//! DEPENDS_ON: arena, proc::ProcessTable
//! INVARIANTS: An FCB's refcount equals the number of FIDT slots naming it;
//!             the stream is closed exactly once, when that count reaches zero

use std::sync::Arc;

use log::{debug, trace};

use crate::arena::{arena_key, Arena};
use crate::error::{fatal, KResult, KernelError};
use crate::kernel::KernelGuard;
use crate::socket::SocketId;
use crate::types::{Fid, Pid};

arena_key!(pub(crate) FcbId);

/// Device-style operations behind a handle. Unsupported operations keep the
/// default bodies.
pub(crate) trait StreamOps: Send + Sync {
    fn read(&self, k: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        let _ = (k, buf);
        Err(KernelError::NotSupported)
    }

    fn write(&self, k: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        let _ = (k, buf);
        Err(KernelError::NotSupported)
    }

    /// Runs once, when the last handle goes away.
    fn close(&self, k: &mut KernelGuard<'_>);

    fn as_socket(&self) -> Option<SocketId> {
        None
    }
}

pub(crate) struct Fcb {
    refcount: usize,
    stream: Option<Arc<dyn StreamOps>>,
}

/// System-wide FCB pool.
pub(crate) struct FileTable {
    fcbs: Arena<FcbId, Fcb>,
}

impl FileTable {
    pub fn new(max_files: usize) -> Self {
        Self { fcbs: Arena::with_capacity(max_files) }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fcbs.len()
    }
}

/// Claims `n` free FIDT slots of `pid` (lowest first) and `n` fresh FCBs, or
/// nothing at all.
pub(crate) fn reserve(k: &mut KernelGuard<'_>, pid: Pid, n: usize) -> KResult<Vec<(Fid, FcbId)>> {
    let state = &mut **k;
    let pcb = state.procs.pcb_mut(pid);
    let slots: Vec<usize> = pcb
        .fidt
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_none())
        .map(|(index, _)| index)
        .take(n)
        .collect();
    let files = &mut state.files.fcbs;
    if slots.len() < n || files.capacity() - files.len() < n {
        return Err(KernelError::OutOfFileSlots);
    }
    let mut reserved = Vec::with_capacity(n);
    for index in slots {
        let fcb = match files.insert(Fcb { refcount: 1, stream: None }) {
            Ok(fcb) => fcb,
            Err(_) => fatal!("file table filled up during reservation"),
        };
        pcb.fidt[index] = Some(fcb);
        reserved.push((Fid::from(index), fcb));
    }
    Ok(reserved)
}

/// Attaches the stream object to a freshly reserved FCB.
pub(crate) fn install(k: &mut KernelGuard<'_>, fcb: FcbId, stream: Arc<dyn StreamOps>) {
    match k.files.fcbs.get_mut(fcb) {
        Some(entry) => entry.stream = Some(stream),
        None => fatal!("install on unknown fcb {:?}", fcb),
    }
}

fn lookup(k: &KernelGuard<'_>, pid: Pid, fid: Fid) -> KResult<FcbId> {
    k.procs
        .pcb(pid)
        .fidt
        .get(fid.as_index())
        .copied()
        .flatten()
        .ok_or(KernelError::BadFileDescriptor)
}

/// Resolves a handle to its stream object.
pub(crate) fn get(k: &KernelGuard<'_>, pid: Pid, fid: Fid) -> KResult<Arc<dyn StreamOps>> {
    let fcb = lookup(k, pid, fid)?;
    k.files
        .fcbs
        .get(fcb)
        .and_then(|entry| entry.stream.clone())
        .ok_or(KernelError::BadFileDescriptor)
}

pub(crate) fn incref(k: &mut KernelGuard<'_>, fcb: FcbId) {
    match k.files.fcbs.get_mut(fcb) {
        Some(entry) => entry.refcount += 1,
        None => fatal!("incref on unknown fcb {:?}", fcb),
    }
}

/// Drops one reference; the last one frees the FCB and closes its stream.
pub(crate) fn decref(k: &mut KernelGuard<'_>, fcb: FcbId) {
    let Some(entry) = k.files.fcbs.get_mut(fcb) else {
        fatal!("decref on unknown fcb {:?}", fcb);
    };
    entry.refcount -= 1;
    if entry.refcount > 0 {
        return;
    }
    let entry = k.files.fcbs.remove(fcb);
    trace!(target: "kobj::stream", "fcb {:?} released", fcb);
    if let Some(stream) = entry.and_then(|entry| entry.stream) {
        stream.close(k);
    }
}

/// `Close(fid)`: clears the slot and drops its reference.
pub(crate) fn close(k: &mut KernelGuard<'_>, pid: Pid, fid: Fid) -> KResult<()> {
    let fcb = lookup(k, pid, fid)?;
    k.procs.pcb_mut(pid).fidt[fid.as_index()] = None;
    decref(k, fcb);
    Ok(())
}

/// `Dup2(old, new)`: makes `new` name the same FCB as `old`, closing whatever
/// `new` held before.
pub(crate) fn dup2(k: &mut KernelGuard<'_>, pid: Pid, old: Fid, new: Fid) -> KResult<()> {
    let fcb = lookup(k, pid, old)?;
    if new.as_index() >= k.procs.pcb(pid).fidt.len() {
        return Err(KernelError::BadFileDescriptor);
    }
    if old == new {
        return Ok(());
    }
    incref(k, fcb);
    let previous = k.procs.pcb_mut(pid).fidt[new.as_index()].replace(fcb);
    if let Some(previous) = previous {
        decref(k, previous);
    }
    debug!(target: "kobj::stream", "pid {} dup2 {} -> {}", pid, old, new);
    Ok(())
}

/// Drops every handle of `pid`. Used by process teardown and failed exec.
pub(crate) fn release_all(k: &mut KernelGuard<'_>, pid: Pid) {
    let slots = k.procs.pcb(pid).fidt.len();
    for index in 0..slots {
        if let Some(fcb) = k.procs.pcb_mut(pid).fidt[index].take() {
            decref(k, fcb);
        }
    }
}

/// References held by `fcb`, `None` once it is freed.
#[cfg(test)]
pub(crate) fn refcount(k: &KernelGuard<'_>, fcb: FcbId) -> Option<usize> {
    k.files.fcbs.get(fcb).map(|entry| entry.refcount)
}
