// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-thread control blocks and the join/detach/exit protocol
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! PUBLIC API: (crate) Ptcb, spawn/join/detach/thread_exit
//! DEPENDS_ON: arena::Tid, sched::spawn, proc::teardown, sync::CondVar
//! INVARIANTS: A PTCB outlives every joiner (refcount); it is released once it has
//!             exited, nobody waits on it and it is detached or already collected.
//!             Whatever remains goes with process teardown.

use std::sync::Arc;

use log::{debug, warn};

use crate::arena::Tid;
use crate::error::{fatal, KResult, KernelError};
use crate::kernel::{Kernel, KernelGuard};
use crate::proc;
use crate::sched::{self, Task};
use crate::sync::CondVar;
use crate::types::Pid;

/// Process thread control block.
pub(crate) struct Ptcb {
    pub owner: Pid,
    pub task: Task,
    pub args: Arc<[u8]>,
    /// Main thread: a plain return from its task exits the whole process.
    pub main: bool,
    pub exited: bool,
    pub detached: bool,
    /// A join already consumed the exit value.
    pub collected: bool,
    pub exitval: i32,
    /// Threads currently blocked in join on this PTCB.
    pub refcount: usize,
    pub exit_cv: CondVar,
}

impl Ptcb {
    fn new(owner: Pid, task: Task, args: Arc<[u8]>, main: bool) -> Self {
        Self {
            owner,
            task,
            args,
            main,
            exited: false,
            detached: false,
            collected: false,
            exitval: 0,
            refcount: 0,
            exit_cv: CondVar::new(),
        }
    }
}

/// Allocates a PTCB in `pid`, links it and starts its OS thread.
pub(crate) fn spawn(
    kernel: &Arc<Kernel>,
    k: &mut KernelGuard<'_>,
    pid: Pid,
    task: Task,
    args: Arc<[u8]>,
    main: bool,
) -> KResult<Tid> {
    let tid = match k.threads.insert(Ptcb::new(pid, task, args, main)) {
        Ok(tid) => tid,
        Err(_) => fatal!("thread arena exhausted"),
    };
    {
        let pcb = k.procs.pcb_mut(pid);
        pcb.threads.push(tid);
        pcb.thread_count += 1;
    }
    if let Err(err) = sched::spawn(kernel, pid, tid) {
        warn!(target: "kobj::thread", "pid {} thread spawn failed: {}", pid, err);
        let pcb = k.procs.pcb_mut(pid);
        pcb.threads.retain(|t| *t != tid);
        pcb.thread_count -= 1;
        k.threads.remove(tid);
        return Err(KernelError::ThreadSpawn);
    }
    debug!(target: "kobj::thread", "pid {} thread {} created main={}", pid, tid, main);
    Ok(tid)
}

fn owned<'a>(k: &'a KernelGuard<'_>, pid: Pid, tid: Tid) -> KResult<&'a Ptcb> {
    k.threads.get(tid).filter(|ptcb| ptcb.owner == pid).ok_or(KernelError::InvalidTarget)
}

/// `ThreadJoin`: waits for `target` to exit and returns its exit value.
pub(crate) fn join(k: &mut KernelGuard<'_>, pid: Pid, caller: Tid, target: Tid) -> KResult<i32> {
    if target == caller {
        return Err(KernelError::InvalidTarget);
    }
    let ptcb = owned(k, pid, target)?;
    if ptcb.detached {
        return Err(KernelError::Detached);
    }
    let exit_cv = ptcb.exit_cv.clone();
    if let Some(ptcb) = k.threads.get_mut(target) {
        ptcb.refcount += 1;
    }

    exit_cv.wait_while(k, |state| {
        state.threads.get(target).is_some_and(|ptcb| !ptcb.exited && !ptcb.detached)
    });

    let Some(ptcb) = k.threads.get_mut(target) else {
        fatal!("joined thread {} vanished while referenced", target);
    };
    ptcb.refcount -= 1;
    let outcome = if ptcb.detached {
        Err(KernelError::Detached)
    } else {
        ptcb.collected = true;
        Ok(ptcb.exitval)
    };
    release_if_unreferenced(k, target);
    outcome
}

/// `ThreadDetach`: marks `target` detached and wakes its joiners.
pub(crate) fn detach(k: &mut KernelGuard<'_>, pid: Pid, target: Tid) -> KResult<()> {
    if owned(k, pid, target)?.exited {
        return Err(KernelError::InvalidTarget);
    }
    if let Some(ptcb) = k.threads.get_mut(target) {
        ptcb.detached = true;
        ptcb.exit_cv.broadcast();
    }
    Ok(())
}

/// `ThreadExit` bookkeeping. The last thread out tears the process down.
pub(crate) fn thread_exit(k: &mut KernelGuard<'_>, pid: Pid, tid: Tid, status: i32) {
    let Some(ptcb) = k.threads.get_mut(tid) else {
        fatal!("exiting thread {} has no PTCB", tid);
    };
    ptcb.exitval = status;
    ptcb.exited = true;
    ptcb.exit_cv.broadcast();

    let remaining = {
        let pcb = k.procs.pcb_mut(pid);
        pcb.thread_count -= 1;
        pcb.thread_count
    };
    debug!(target: "kobj::thread", "pid {} thread {} exited status={}", pid, tid, status);
    if remaining == 0 {
        proc::teardown(k, pid);
    } else {
        release_if_unreferenced(k, tid);
    }
}

fn release_if_unreferenced(k: &mut KernelGuard<'_>, tid: Tid) {
    let Some(ptcb) = k.threads.get(tid) else { return };
    if !(ptcb.exited && ptcb.refcount == 0 && (ptcb.detached || ptcb.collected)) {
        return;
    }
    let owner = ptcb.owner;
    k.threads.remove(tid);
    if let Some(pcb) = k.procs.get(owner) {
        if pcb.threads.contains(&tid) {
            k.procs.pcb_mut(owner).threads.retain(|t| *t != tid);
        }
    }
}
