// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel object layer: process table, thread lifecycle, pipes and local sockets.
//!
//! The crate runs hosted. Each kernel thread is an OS thread, every kernel
//! object lives behind one coarse kernel lock, and blocking calls wait on
//! condition variables tied to that lock. Tasks receive a [`Context`] through
//! which they issue syscalls:
//!
//! ```
//! use kobj::{Kernel, Task};
//!
//! let kernel = Kernel::with_defaults();
//! let status = kernel
//!     .boot(
//!         Task::new(|ctx, _args| {
//!             let child = ctx.exec(Some(Task::new(|_, args| args.len() as i32)), b"abc").unwrap();
//!             let (_, status) = ctx.wait_child(Some(child)).unwrap();
//!             status
//!         }),
//!         &[],
//!     )
//!     .unwrap();
//! assert_eq!(status, 3);
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

mod arena;
mod config;
mod error;
mod kernel;
mod pipe;
mod proc;
mod sched;
mod socket;
mod stream;
mod sync;
mod syscall;
mod thread;
mod types;

pub use arena::Tid;
pub use config::{ConfigError, KernelConfig};
pub use error::{ErrorKind, KResult, KernelError};
pub use kernel::Kernel;
pub use pipe::PipePair;
pub use proc::{ProcInfo, ProcState, PROCINFO_MAX_ARGS_SIZE};
pub use sched::Task;
pub use socket::ShutdownMode;
pub use syscall::Context;
pub use types::{Fid, Pid, Port, NOPORT};
