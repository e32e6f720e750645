// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel root object: the global tables behind one coarse lock
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: Kernel (new/boot/config/process_count/process_state)
//! DEPENDS_ON: proc, thread, stream, pipe, socket, sched, sync
//! INVARIANTS: Every field of KernelState is mutated only under `Kernel::lock`;
//!             the kernel never tears itself down once built

use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::arena::{Arena, Tid};
use crate::config::{ConfigError, KernelConfig};
use crate::error::{fatal, KResult, KernelError};
use crate::pipe::{PipeCb, PipeId};
use crate::proc::{self, ProcState, ProcessTable};
use crate::sched::Task;
use crate::socket::{ConnectionRequest, PortMap, RequestId, SocketCb, SocketId};
use crate::stream::FileTable;
use crate::sync::CondVar;
use crate::thread::Ptcb;
use crate::types::Pid;

/// Guard over the kernel-wide lock. Blocking operations hand it to a
/// [`CondVar`] which releases it while the caller sleeps.
pub(crate) type KernelGuard<'a> = MutexGuard<'a, KernelState>;

/// All mutable kernel-object state.
pub(crate) struct KernelState {
    pub config: KernelConfig,
    pub procs: ProcessTable,
    pub threads: Arena<Tid, Ptcb>,
    pub files: FileTable,
    pub pipes: Arena<PipeId, PipeCb>,
    pub sockets: Arena<SocketId, SocketCb>,
    pub requests: Arena<RequestId, ConnectionRequest>,
    pub ports: PortMap,
    /// Broadcast once init turns into a zombie.
    pub halted: CondVar,
    /// First task panic observed, reported by [`Kernel::boot`].
    pub fault: Option<String>,
}

impl KernelState {
    fn new(config: KernelConfig) -> Self {
        Self {
            procs: ProcessTable::new(config.max_proc, config.max_fileid),
            threads: Arena::unbounded(),
            files: FileTable::new(config.max_files),
            pipes: Arena::unbounded(),
            sockets: Arena::unbounded(),
            requests: Arena::unbounded(),
            ports: PortMap::new(config.max_port),
            halted: CondVar::new(),
            fault: None,
            config,
        }
    }

    pub fn record_fault(&mut self, message: String) {
        if self.fault.is_none() {
            self.fault = Some(message);
        }
    }
}

/// The kernel root. Shared by every schedulable thread through an `Arc`.
pub struct Kernel {
    state: Mutex<KernelState>,
}

impl Kernel {
    /// Builds the tables and the idle process (pid 0, no thread).
    pub fn new(config: KernelConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let kernel = Arc::new(Self { state: Mutex::new(KernelState::new(config)) });
        {
            let mut k = kernel.lock();
            match proc::exec(&kernel, &mut k, None, None, &[]) {
                Ok(pid) if pid == Pid::IDLE => {}
                Ok(pid) => fatal!("idle process got pid {}", pid),
                Err(err) => fatal!("idle process creation failed: {}", err),
            }
        }
        Ok(kernel)
    }

    /// Kernel with [`KernelConfig::default`] sizing.
    pub fn with_defaults() -> Arc<Self> {
        match Self::new(KernelConfig::default()) {
            Ok(kernel) => kernel,
            Err(err) => fatal!("default config rejected: {}", err),
        }
    }

    /// Starts `init` as pid 1 and blocks the host until init has exited.
    ///
    /// Returns init's exit status, or [`KernelError::TaskFault`] when any task
    /// panicked along the way.
    pub fn boot(self: &Arc<Self>, init: Task, args: &[u8]) -> KResult<i32> {
        let mut k = self.lock();
        if k.procs.state(Pid::INIT) != Some(ProcState::Free) {
            warn!(target: "kobj::boot", "init already started");
            return Err(KernelError::AlreadyInUse);
        }
        let pid = proc::exec(self, &mut k, None, Some(init), args)?;
        if pid != Pid::INIT {
            fatal!("init process got pid {}", pid);
        }
        info!(target: "kobj::boot", "init started");

        let halted = k.halted.clone();
        halted.wait_while(&mut k, |s| s.procs.state(Pid::INIT) != Some(ProcState::Zombie));

        let status = k.procs.pcb(Pid::INIT).exitval;
        info!(target: "kobj::boot", "init exited status={}", status);
        match k.fault.clone() {
            Some(message) => Err(KernelError::TaskFault(message)),
            None => Ok(status),
        }
    }

    pub fn config(&self) -> KernelConfig {
        self.lock().config.clone()
    }

    /// Number of non-free process slots (idle included).
    pub fn process_count(&self) -> usize {
        self.lock().procs.count()
    }

    /// Lifecycle state of a slot, `None` when `pid` is out of range.
    pub fn process_state(&self, pid: Pid) -> Option<ProcState> {
        self.lock().procs.state(pid)
    }

    pub(crate) fn lock(&self) -> KernelGuard<'_> {
        self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_kernel_has_only_idle() {
        let kernel = Kernel::with_defaults();
        assert_eq!(kernel.process_count(), 1);
        assert_eq!(kernel.process_state(Pid::IDLE), Some(ProcState::Alive));
        assert_eq!(kernel.process_state(Pid::INIT), Some(ProcState::Free));
        let max = kernel.config().max_proc as u32;
        assert_eq!(kernel.process_state(Pid::from_raw(max)), None);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = KernelConfig { max_proc: 1, ..KernelConfig::default() };
        assert!(Kernel::new(config).is_err());
    }

    #[test]
    fn boot_returns_init_status() {
        let kernel = Kernel::with_defaults();
        let status = kernel.boot(Task::new(|_, _| 7), &[]).expect("boot");
        assert_eq!(status, 7);
        assert_eq!(kernel.process_state(Pid::INIT), Some(ProcState::Zombie));
    }

    #[test]
    fn second_boot_is_rejected() {
        let kernel = Kernel::with_defaults();
        kernel.boot(Task::new(|_, _| 0), &[]).expect("first boot");
        assert_eq!(kernel.boot(Task::new(|_, _| 0), &[]), Err(KernelError::AlreadyInUse));
    }

    #[test]
    fn task_panic_is_reported_as_fault() {
        let kernel = Kernel::with_defaults();
        let err = kernel.boot(Task::new(|_, _| panic!("init blew up")), &[]).unwrap_err();
        assert!(matches!(err, KernelError::TaskFault(ref msg) if msg.contains("init blew up")));
    }
}
