// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall surface seen by tasks
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: Context (process, thread, handle, pipe and socket calls)
//! DEPENDS_ON: proc, thread, stream, pipe, socket, sched::ExitRequest
//! INVARIANTS: Each call takes the kernel lock once and drops it before returning;
//!             `exit` and `thread_exit` never return to the task
//!
//! A [`Context`] is handed to every task invocation and identifies the calling
//! process and thread, the same way a trap frame identifies the current task.

use std::sync::Arc;
use std::time::Duration;

use crate::arena::Tid;
use crate::error::{KResult, KernelError};
use crate::kernel::{Kernel, KernelGuard};
use crate::pipe::{self, PipePair};
use crate::proc;
use crate::sched::{ExitRequest, Task};
use crate::socket::{self, ShutdownMode, SocketId};
use crate::stream;
use crate::thread;
use crate::types::{Fid, Pid, Port};

/// Calling context of a running task.
pub struct Context {
    kernel: Arc<Kernel>,
    pid: Pid,
    tid: Tid,
}

impl Context {
    pub(crate) fn new(kernel: Arc<Kernel>, pid: Pid, tid: Tid) -> Self {
        Self { kernel, pid, tid }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    // ---------------------------------------------------------------- processes

    /// Creates a child process. With `None` the child has no thread and stays
    /// alive until the kernel goes away.
    pub fn exec(&self, task: Option<Task>, args: &[u8]) -> KResult<Pid> {
        let mut k = self.kernel.lock();
        proc::exec(&self.kernel, &mut k, Some(self.pid), task, args)
    }

    pub fn get_pid(&self) -> Pid {
        self.pid
    }

    /// Parent of the calling process; `None` for idle and init.
    pub fn get_ppid(&self) -> Option<Pid> {
        self.kernel.lock().procs.pcb(self.pid).parent
    }

    /// Reaps `Some(child)` or, with `None`, whichever child exits first.
    pub fn wait_child(&self, target: Option<Pid>) -> KResult<(Pid, i32)> {
        let mut k = self.kernel.lock();
        proc::wait_child(&mut k, self.pid, target)
    }

    /// Terminates the process with `status` once its last thread is gone.
    pub fn exit(&self, status: i32) -> ! {
        ExitRequest::Process(status).raise()
    }

    // ------------------------------------------------------------------ threads

    pub fn create_thread(&self, task: Task, args: &[u8]) -> KResult<Tid> {
        let mut k = self.kernel.lock();
        thread::spawn(&self.kernel, &mut k, self.pid, task, Arc::from(args), false)
    }

    pub fn thread_self(&self) -> Tid {
        self.tid
    }

    pub fn thread_join(&self, tid: Tid) -> KResult<i32> {
        let mut k = self.kernel.lock();
        thread::join(&mut k, self.pid, self.tid, tid)
    }

    pub fn thread_detach(&self, tid: Tid) -> KResult<()> {
        let mut k = self.kernel.lock();
        thread::detach(&mut k, self.pid, tid)
    }

    pub fn thread_exit(&self, status: i32) -> ! {
        ExitRequest::Thread(status).raise()
    }

    // ------------------------------------------------------------------ handles

    pub fn read(&self, fid: Fid, buf: &mut [u8]) -> KResult<usize> {
        let mut k = self.kernel.lock();
        let stream = stream::get(&k, self.pid, fid)?;
        stream.read(&mut k, buf)
    }

    pub fn write(&self, fid: Fid, buf: &[u8]) -> KResult<usize> {
        let mut k = self.kernel.lock();
        let stream = stream::get(&k, self.pid, fid)?;
        stream.write(&mut k, buf)
    }

    pub fn close(&self, fid: Fid) -> KResult<()> {
        let mut k = self.kernel.lock();
        stream::close(&mut k, self.pid, fid)
    }

    pub fn dup2(&self, old: Fid, new: Fid) -> KResult<()> {
        let mut k = self.kernel.lock();
        stream::dup2(&mut k, self.pid, old, new)
    }

    /// Handle enumerating the process table, one [`crate::ProcInfo`] record per read.
    pub fn open_info(&self) -> KResult<Fid> {
        let mut k = self.kernel.lock();
        proc::open_info(&mut k, self.pid)
    }

    pub fn pipe(&self) -> KResult<PipePair> {
        let mut k = self.kernel.lock();
        pipe::open(&mut k, self.pid)
    }

    // ------------------------------------------------------------------ sockets

    pub fn socket(&self, port: Port) -> KResult<Fid> {
        let mut k = self.kernel.lock();
        socket::open(&mut k, self.pid, port)
    }

    pub fn listen(&self, fid: Fid) -> KResult<()> {
        let mut k = self.kernel.lock();
        let sock = self.socket_of(&k, fid)?;
        socket::listen(&mut k, sock)
    }

    /// Blocks until a connection request arrives; returns the new peer handle.
    pub fn accept(&self, fid: Fid) -> KResult<Fid> {
        let mut k = self.kernel.lock();
        let sock = self.socket_of(&k, fid)?;
        socket::accept(&mut k, self.pid, sock)
    }

    /// Connects to the listener on `port`, giving up after `timeout`.
    pub fn connect(&self, fid: Fid, port: Port, timeout: Duration) -> KResult<()> {
        let mut k = self.kernel.lock();
        let sock = self.socket_of(&k, fid)?;
        socket::connect(&mut k, sock, port, timeout)
    }

    pub fn shutdown(&self, fid: Fid, mode: ShutdownMode) -> KResult<()> {
        let mut k = self.kernel.lock();
        let sock = self.socket_of(&k, fid)?;
        socket::shutdown(&mut k, sock, mode)
    }

    fn socket_of(&self, k: &KernelGuard<'_>, fid: Fid) -> KResult<SocketId> {
        stream::get(k, self.pid, fid)?.as_socket().ok_or(KernelError::NotSupported)
    }
}
