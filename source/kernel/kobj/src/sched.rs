// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host scheduler backend: one OS thread per kernel thread
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! PUBLIC API: Task
//! DEPENDS_ON: kernel::Kernel, proc::exit, thread::thread_exit
//! INVARIANTS: A spawned thread cannot observe its PTCB before the spawner drops the
//!             kernel lock; every thread ends in exactly one exit path
//!
//! `Exit` and `ThreadExit` never return to the task. They unwind with a private
//! [`ExitRequest`] payload which the trampoline catches before running the exit
//! bookkeeping, after which the OS thread simply ends.

use core::fmt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use log::{debug, error};

use crate::arena::Tid;
use crate::error::fatal;
use crate::kernel::Kernel;
use crate::syscall::Context;
use crate::types::Pid;
use crate::{proc, thread as kthread};

type TaskFn = dyn Fn(&Context, &[u8]) -> i32 + Send + Sync;

/// Entry point of a process or thread: receives the calling context and the
/// argument blob, returns the exit status.
#[derive(Clone)]
pub struct Task(Arc<TaskFn>);

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Context, &[u8]) -> i32 + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Identity of the task body, stable across clones. Reported by process info.
    pub fn id(&self) -> u64 {
        Arc::as_ptr(&self.0) as *const () as usize as u64
    }

    fn run(&self, ctx: &Context, args: &[u8]) -> i32 {
        (self.0)(ctx, args)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:#x})", self.id())
    }
}

/// Unwind payload carried from `Exit`/`ThreadExit` to the trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitRequest {
    Process(i32),
    Thread(i32),
}

impl ExitRequest {
    pub fn raise(self) -> ! {
        panic::resume_unwind(Box::new(self))
    }
}

/// Starts the OS thread backing `tid`. Called with the kernel lock held.
pub(crate) fn spawn(kernel: &Arc<Kernel>, pid: Pid, tid: Tid) -> std::io::Result<()> {
    let kernel = Arc::clone(kernel);
    thread::Builder::new()
        .name(format!("p{}/t{}", pid, tid.as_raw() as u32))
        .spawn(move || trampoline(kernel, pid, tid))
        .map(|_| ())
}

fn trampoline(kernel: Arc<Kernel>, pid: Pid, tid: Tid) {
    let (task, args, main) = {
        let k = kernel.lock();
        match k.threads.get(tid) {
            Some(ptcb) => (ptcb.task.clone(), Arc::clone(&ptcb.args), ptcb.main),
            None => fatal!("thread {} of pid {} started without a PTCB", tid, pid),
        }
    };
    debug!(target: "kobj::sched", "thread {} of pid {} running", tid, pid);

    let ctx = Context::new(Arc::clone(&kernel), pid, tid);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx, &args)));
    let request = match outcome {
        Ok(status) if main => ExitRequest::Process(status),
        Ok(status) => ExitRequest::Thread(status),
        Err(payload) => match payload.downcast::<ExitRequest>() {
            Ok(request) => *request,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(target: "kobj::sched", "pid {} thread {} faulted: {}", pid, tid, message);
                kernel.lock().record_fault(format!("pid {pid}: {message}"));
                if main {
                    ExitRequest::Process(-1)
                } else {
                    ExitRequest::Thread(-1)
                }
            }
        },
    };
    drop(ctx);

    let mut k = kernel.lock();
    match request {
        ExitRequest::Process(status) => proc::exit(&mut k, pid, tid, status),
        ExitRequest::Thread(status) => kthread::thread_exit(&mut k, pid, tid, status),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
