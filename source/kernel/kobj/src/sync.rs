// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Condition primitive coupled to the kernel lock
//! OWNERS: @kernel-sync-team
//! PUBLIC API: CondVar (wait/wait_timeout/wait_while/signal/broadcast)
//! DEPENDS_ON: parking_lot::Condvar, kernel::KernelGuard
//! INVARIANTS: Waiting atomically releases the kernel lock and reacquires it before
//!             returning; callers always re-check their own predicate afterwards

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Condvar;

use crate::kernel::{KernelGuard, KernelState};

/// Shared handle to a condition. Objects keep one and waiters clone it before
/// blocking, so the object itself may be mutated while they sleep.
#[derive(Clone, Default)]
pub(crate) struct CondVar(Arc<Condvar>);

impl CondVar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self, guard: &mut KernelGuard<'_>) {
        self.0.wait(guard);
    }

    /// Returns `true` when woken, `false` when the timeout elapsed first.
    pub fn wait_timeout(&self, guard: &mut KernelGuard<'_>, timeout: Duration) -> bool {
        !self.0.wait_for(guard, timeout).timed_out()
    }

    /// Blocks until `blocked` turns false. The predicate runs under the lock on
    /// entry and after every wakeup.
    pub fn wait_while<F>(&self, guard: &mut KernelGuard<'_>, mut blocked: F)
    where
        F: FnMut(&KernelState) -> bool,
    {
        while blocked(&**guard) {
            self.wait(guard);
        }
    }

    /// Like [`CondVar::wait_while`] but gives up at `deadline`.
    /// Returns `false` when the predicate still blocks at the deadline.
    pub fn wait_while_until<F>(
        &self,
        guard: &mut KernelGuard<'_>,
        deadline: Instant,
        mut blocked: F,
    ) -> bool
    where
        F: FnMut(&KernelState) -> bool,
    {
        while blocked(&**guard) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait_timeout(guard, deadline - now);
        }
        true
    }

    pub fn signal(&self) {
        self.0.notify_one();
    }

    pub fn broadcast(&self) {
        self.0.notify_all();
    }
}
