// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and process lifecycle (exec, wait, exit, teardown)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: ProcState, ProcInfo; (crate) ProcessTable, exec/wait_child/exit/teardown
//! DEPENDS_ON: thread, stream, sync::CondVar, types::Pid
//! INVARIANTS: A slot is FREE iff it is on the free list; a process is on its parent's
//!             children list until reaped and on the exited list iff it is a zombie;
//!             pid 0 and pid 1 have no parent

mod info;

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info};

use crate::arena::Tid;
use crate::error::{fatal, KResult, KernelError};
use crate::kernel::{Kernel, KernelGuard};
use crate::sched::Task;
use crate::stream::{self, FcbId};
use crate::sync::CondVar;
use crate::thread;
use crate::types::Pid;

pub use info::{ProcInfo, PROCINFO_MAX_ARGS_SIZE};
pub(crate) use info::open_info;

/// Lifecycle state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Free,
    Alive,
    Zombie,
}

/// Process control block.
pub(crate) struct Pcb {
    pub state: ProcState,
    /// Bumped on every allocation of the slot.
    pub epoch: u64,
    pub parent: Option<Pid>,
    pub main_task: Option<Task>,
    pub args: Option<Arc<[u8]>>,
    pub argl: usize,
    pub exitval: i32,
    pub fidt: Vec<Option<FcbId>>,
    pub children: VecDeque<Pid>,
    pub exited: VecDeque<Pid>,
    pub threads: Vec<Tid>,
    pub thread_count: usize,
    pub child_exit: CondVar,
}

impl Pcb {
    fn free(max_fileid: usize) -> Self {
        Self {
            state: ProcState::Free,
            epoch: 0,
            parent: None,
            main_task: None,
            args: None,
            argl: 0,
            exitval: 0,
            fidt: vec![None; max_fileid],
            children: VecDeque::new(),
            exited: VecDeque::new(),
            threads: Vec::new(),
            thread_count: 0,
            child_exit: CondVar::new(),
        }
    }
}

/// Fixed-size table of PCBs plus the free list.
pub(crate) struct ProcessTable {
    slots: Vec<Pcb>,
    /// Top of the stack is the next slot handed out.
    free: Vec<Pid>,
    max_fileid: usize,
    next_epoch: u64,
}

impl ProcessTable {
    pub fn new(max_proc: usize, max_fileid: usize) -> Self {
        Self {
            slots: (0..max_proc).map(|_| Pcb::free(max_fileid)).collect(),
            free: (0..max_proc as u32).rev().map(Pid::from_raw).collect(),
            max_fileid,
            next_epoch: 1,
        }
    }

    /// Pops the head of the free list and marks it alive.
    fn acquire(&mut self) -> Option<Pid> {
        let pid = self.free.pop()?;
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let pcb = &mut self.slots[pid.as_index()];
        pcb.state = ProcState::Alive;
        pcb.epoch = epoch;
        Some(pid)
    }

    /// Resets the slot and pushes it back onto the head of the free list.
    fn release(&mut self, pid: Pid) {
        self.slots[pid.as_index()] = Pcb::free(self.max_fileid);
        self.free.push(pid);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Non-free slots.
    pub fn count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn state(&self, pid: Pid) -> Option<ProcState> {
        self.slots.get(pid.as_index()).map(|pcb| pcb.state)
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(pid.as_index()).filter(|pcb| pcb.state != ProcState::Free)
    }

    pub fn pcb(&self, pid: Pid) -> &Pcb {
        match self.get(pid) {
            Some(pcb) => pcb,
            None => fatal!("pid {} is not allocated", pid),
        }
    }

    pub fn pcb_mut(&mut self, pid: Pid) -> &mut Pcb {
        match self.slots.get_mut(pid.as_index()) {
            Some(pcb) if pcb.state != ProcState::Free => pcb,
            _ => fatal!("pid {} is not allocated", pid),
        }
    }

    /// Raw slot access for enumeration, free slots included.
    pub fn slot(&self, index: usize) -> Option<&Pcb> {
        self.slots.get(index)
    }

    fn is_live_child(&self, child: Pid, parent: Pid, epoch: u64) -> bool {
        self.get(child).is_some_and(|pcb| {
            pcb.epoch == epoch && pcb.parent == Some(parent) && pcb.state == ProcState::Alive
        })
    }
}

/// `Exec`: allocates a slot, links it under `creator`, inherits the creator's
/// handles and, when a task is given, starts the main thread.
pub(crate) fn exec(
    kernel: &Arc<Kernel>,
    k: &mut KernelGuard<'_>,
    creator: Option<Pid>,
    task: Option<Task>,
    args: &[u8],
) -> KResult<Pid> {
    let pid = k.procs.acquire().ok_or(KernelError::OutOfProcessSlots)?;
    let parent = if pid.is_parentless() { None } else { creator };

    let fidt = match parent {
        Some(parent) => k.procs.pcb(parent).fidt.clone(),
        None => vec![None; k.procs.max_fileid],
    };
    for fcb in fidt.iter().flatten() {
        stream::incref(k, *fcb);
    }

    let args: Arc<[u8]> = Arc::from(args);
    {
        let pcb = k.procs.pcb_mut(pid);
        pcb.parent = parent;
        pcb.main_task = task.clone();
        pcb.argl = args.len();
        pcb.args = Some(Arc::clone(&args));
        pcb.fidt = fidt;
    }
    if let Some(parent) = parent {
        k.procs.pcb_mut(parent).children.push_front(pid);
    }

    if let Some(task) = task {
        if let Err(err) = thread::spawn(kernel, k, pid, task, args, true) {
            abort_exec(k, pid);
            return Err(err);
        }
    }
    info!(
        target: "kobj::proc",
        "exec pid={} parent={:?} argl={}",
        pid,
        parent.map(Pid::as_raw),
        k.procs.pcb(pid).argl
    );
    Ok(pid)
}

fn abort_exec(k: &mut KernelGuard<'_>, pid: Pid) {
    if let Some(parent) = k.procs.pcb(pid).parent {
        k.procs.pcb_mut(parent).children.retain(|child| *child != pid);
    }
    stream::release_all(k, pid);
    k.procs.release(pid);
}

/// `WaitChild`: `Some(pid)` waits for that child, `None` for any child.
/// Returns the reaped pid and its exit status.
pub(crate) fn wait_child(
    k: &mut KernelGuard<'_>,
    caller: Pid,
    target: Option<Pid>,
) -> KResult<(Pid, i32)> {
    match target {
        Some(child) => wait_specific(k, caller, child),
        None => wait_any(k, caller),
    }
}

fn wait_specific(k: &mut KernelGuard<'_>, caller: Pid, child: Pid) -> KResult<(Pid, i32)> {
    let epoch = match k.procs.get(child) {
        Some(pcb) if pcb.parent == Some(caller) => pcb.epoch,
        _ => return Err(KernelError::NotAChild),
    };
    let child_exit = k.procs.pcb(caller).child_exit.clone();
    child_exit.wait_while(k, |state| state.procs.is_live_child(child, caller, epoch));

    match k.procs.get(child) {
        Some(pcb)
            if pcb.epoch == epoch
                && pcb.parent == Some(caller)
                && pcb.state == ProcState::Zombie => {}
        _ => return Err(KernelError::NotAChild),
    }
    Ok((child, reap(k, child)))
}

fn wait_any(k: &mut KernelGuard<'_>, caller: Pid) -> KResult<(Pid, i32)> {
    let child_exit = k.procs.pcb(caller).child_exit.clone();
    child_exit.wait_while(k, |state| {
        let pcb = state.procs.pcb(caller);
        !pcb.children.is_empty() && pcb.exited.is_empty()
    });

    let pcb = k.procs.pcb(caller);
    if pcb.children.is_empty() {
        return Err(KernelError::NoChildren);
    }
    let Some(&child) = pcb.exited.front() else {
        fatal!("pid {} woke with children but nothing exited", caller);
    };
    if k.procs.state(child) != Some(ProcState::Zombie) {
        fatal!("pid {} on the exited list of {} is not a zombie", child, caller);
    }
    Ok((child, reap(k, child)))
}

/// Unlinks a zombie from its parent, frees its slot and returns its status.
fn reap(k: &mut KernelGuard<'_>, child: Pid) -> i32 {
    let (parent, status) = {
        let pcb = k.procs.pcb(child);
        (pcb.parent, pcb.exitval)
    };
    if let Some(parent) = parent {
        let pcb = k.procs.pcb_mut(parent);
        pcb.children.retain(|pid| *pid != child);
        pcb.exited.retain(|pid| *pid != child);
    }
    k.procs.release(child);
    debug!(target: "kobj::proc", "reaped pid={} status={}", child, status);
    status
}

/// `Exit(status)` path: records the status; init first drains every child.
/// Finishes through the thread-exit path of the calling thread.
pub(crate) fn exit(k: &mut KernelGuard<'_>, pid: Pid, tid: Tid, status: i32) {
    k.procs.pcb_mut(pid).exitval = status;
    if pid == Pid::INIT {
        drain_children(k, pid);
    }
    thread::thread_exit(k, pid, tid, status);
}

fn drain_children(k: &mut KernelGuard<'_>, pid: Pid) {
    while wait_any(k, pid).is_ok() {}
}

/// Runs when the last thread of `pid` has exited.
pub(crate) fn teardown(k: &mut KernelGuard<'_>, pid: Pid) {
    if pid == Pid::INIT && !k.procs.pcb(pid).children.is_empty() {
        drain_children(k, pid);
    }

    let (parent, children, exited) = {
        let pcb = k.procs.pcb_mut(pid);
        (pcb.parent, std::mem::take(&mut pcb.children), std::mem::take(&mut pcb.exited))
    };

    if let Some(parent) = parent {
        adopt_orphans(k, children, exited);
        let pcb = k.procs.pcb_mut(parent);
        pcb.exited.push_front(pid);
        pcb.child_exit.broadcast();
    } else if !children.is_empty() || !exited.is_empty() {
        fatal!("parentless pid {} exiting with {} children", pid, children.len());
    }

    stream::release_all(k, pid);
    let threads = {
        let pcb = k.procs.pcb_mut(pid);
        pcb.args = None;
        pcb.thread_count = 0;
        std::mem::take(&mut pcb.threads)
    };
    for tid in threads {
        k.threads.remove(tid);
    }

    let pcb = k.procs.pcb_mut(pid);
    pcb.state = ProcState::Zombie;
    info!(target: "kobj::proc", "pid {} exited status={}", pid, pcb.exitval);
    if pid == Pid::INIT {
        k.halted.broadcast();
    }
}

/// Moves children of an exiting process under init. Zombies travel with their
/// place on the exited list so init can reap them.
fn adopt_orphans(k: &mut KernelGuard<'_>, children: VecDeque<Pid>, exited: VecDeque<Pid>) {
    if children.is_empty() {
        return;
    }
    for &child in &children {
        k.procs.pcb_mut(child).parent = Some(Pid::INIT);
    }
    let init = k.procs.pcb_mut(Pid::INIT);
    for child in children {
        init.children.push_front(child);
    }
    if !exited.is_empty() {
        init.exited.extend(exited);
        init.child_exit.broadcast();
    }
    debug!(target: "kobj::proc", "init adopted orphans");
}
