// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for process, handle and port identities
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, Fid, Port, NOPORT
//! INVARIANTS: Pid indexes the process table; Fid indexes a per-process FIDT
//!
//! Thread identities live in `arena` because they are generation-stamped keys
//! rather than plain table indices.

use core::fmt;

/// Process identifier, an index into the process table.
///
/// **Ownership**: Only the process table hands out PIDs.
/// **Invariant**: PID 0 is the idle process, PID 1 is init; both are parentless.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Idle/bootstrap process.
    pub const IDLE: Self = Self(0);
    /// The init process; adopts orphans and reaps them on exit.
    pub const INIT: Self = Self(1);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into the process table.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Processes with pid 0 or 1 never get a parent.
    #[inline]
    pub const fn is_parentless(self) -> bool {
        self.0 <= 1
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

impl From<Pid> for usize {
    #[inline]
    fn from(pid: Pid) -> Self {
        pid.as_index()
    }
}

/// File handle: slot index into the owning process's FIDT.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Fid(u32);

impl Fid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

impl From<usize> for Fid {
    #[inline]
    fn from(raw: usize) -> Self {
        Self(raw as u32)
    }
}

/// Socket port number. `NOPORT` is accepted at socket creation only.
pub type Port = u16;

/// "No port": a socket created with it can neither listen nor be connected to.
pub const NOPORT: Port = 0;
