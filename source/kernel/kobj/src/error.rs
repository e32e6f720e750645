// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Recoverable error taxonomy for kernel-object syscalls
//! OWNERS: @kernel-team
//! PUBLIC API: KernelError, ErrorKind, KResult
//! INVARIANTS: Every recoverable failure is returned, never retried internally;
//!             invariant violations go through `fatal!` instead

/// Result type used by every kernel-object operation.
pub type KResult<T> = Result<T, KernelError>;

/// Errors surfaced to syscall callers.
#[must_use = "kernel errors must be handled explicitly"]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// Every process slot is in use.
    #[error("process table exhausted")]
    OutOfProcessSlots,
    /// No free FIDT slot or file control block.
    #[error("file table exhausted")]
    OutOfFileSlots,
    /// The scheduler could not start a new schedulable unit.
    #[error("thread spawn failed")]
    ThreadSpawn,
    /// An argument was out of range (port, mode, pid bound).
    #[error("invalid argument")]
    InvalidArgument,
    /// The pid exists but is not a child of the caller.
    #[error("not a child of the calling process")]
    NotAChild,
    /// The caller has no children left to wait for.
    #[error("no children to wait for")]
    NoChildren,
    /// Thread identity is the caller, stale, foreign or already exited.
    #[error("invalid thread target")]
    InvalidTarget,
    /// The joined thread was detached before it could be joined.
    #[error("thread is detached")]
    Detached,
    /// The handle does not name an open file.
    #[error("bad file descriptor")]
    BadFileDescriptor,
    /// The stream behind the handle does not implement this operation.
    #[error("operation not supported by this stream")]
    NotSupported,
    /// Port already has a listener, or the socket already listens.
    #[error("address already in use")]
    AlreadyInUse,
    /// The socket is not in the listening state.
    #[error("socket is not listening")]
    NotListening,
    /// The socket is not a connected peer.
    #[error("socket is not connected")]
    NotConnected,
    /// One end of the channel is gone.
    #[error("channel closed")]
    Closed,
    /// The listener refused or vanished before admitting the request.
    #[error("connection failed")]
    ConnectFailed,
    /// Connect gave up before being admitted.
    #[error("connection timed out")]
    Timeout,
    /// The listener was closed while accept was waiting.
    #[error("listener closed")]
    ListenerClosed,
    /// A task panicked; the first message is kept.
    #[error("task fault: {0}")]
    TaskFault(String),
}

/// Coarse grouping used by callers that only care about the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceExhausted,
    InvalidArgument,
    NotFound,
    AlreadyInUse,
    Closed,
    Timeout,
    Fault,
}

impl KernelError {
    pub fn kind(&self) -> ErrorKind {
        use KernelError::*;
        match self {
            OutOfProcessSlots | OutOfFileSlots | ThreadSpawn => ErrorKind::ResourceExhausted,
            InvalidArgument | BadFileDescriptor | NotSupported | NotListening | NotConnected => {
                ErrorKind::InvalidArgument
            }
            NotAChild | NoChildren | InvalidTarget | Detached => ErrorKind::NotFound,
            AlreadyInUse => ErrorKind::AlreadyInUse,
            Closed | ConnectFailed | ListenerClosed => ErrorKind::Closed,
            Timeout => ErrorKind::Timeout,
            TaskFault(_) => ErrorKind::Fault,
        }
    }
}

/// Aborts the kernel on an invariant violation. No recovery is defined for these.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!(target: "kobj::fatal", $($arg)+);
        panic!("kernel fatal: {}", format_args!($($arg)+));
    }};
}

pub(crate) use fatal;
