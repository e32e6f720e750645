// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-info stream: one fixed-size record per non-free slot
//! OWNERS: @kernel-sched-team
//! PUBLIC API: ProcInfo (encode/decode/WIRE_SIZE), PROCINFO_MAX_ARGS_SIZE
//! INVARIANTS: Records are little-endian and exactly WIRE_SIZE bytes; the cursor only
//!             moves forward within a pass and returns to slot 0 after reporting the end
//!
//! Wire layout:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | pid                                     |
//! | 4      | 4    | ppid (`u32::MAX` when parentless)       |
//! | 8      | 1    | alive (1) / zombie (0)                  |
//! | 9      | 3    | reserved, zero                          |
//! | 12     | 4    | thread_count                            |
//! | 16     | 8    | main task identity (0 when none)        |
//! | 24     | 4    | argl (full argument length)             |
//! | 28     | 128  | argument bytes, truncated, zero-padded  |
//!
//! A zombie's record carries its `argl` but no argument bytes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{KResult, KernelError};
use crate::kernel::KernelGuard;
use crate::proc::{Pcb, ProcState};
use crate::stream::{self, StreamOps};
use crate::types::{Fid, Pid};

/// Argument bytes carried by one record.
pub const PROCINFO_MAX_ARGS_SIZE: usize = 128;

const HEADER_SIZE: usize = 28;
const WIRE_LEN: usize = HEADER_SIZE + PROCINFO_MAX_ARGS_SIZE;
const NO_PARENT: u32 = u32::MAX;

/// Snapshot of one process slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub alive: bool,
    pub thread_count: u32,
    /// [`crate::Task::id`] of the main task, if the process has one.
    pub main_task: Option<u64>,
    /// Length of the full argument blob.
    pub argl: u32,
    /// Leading `min(argl, PROCINFO_MAX_ARGS_SIZE)` argument bytes. Empty for a zombie,
    /// whose argument blob is freed at exit while `argl` keeps the original length.
    pub args: Vec<u8>,
}

impl ProcInfo {
    pub const WIRE_SIZE: usize = WIRE_LEN;

    fn from_pcb(pid: Pid, pcb: &Pcb) -> Self {
        let args = pcb
            .args
            .as_deref()
            .map(|args| args[..args.len().min(PROCINFO_MAX_ARGS_SIZE)].to_vec())
            .unwrap_or_default();
        Self {
            pid,
            ppid: pcb.parent,
            alive: pcb.state == ProcState::Alive,
            thread_count: pcb.thread_count as u32,
            main_task: pcb.main_task.as_ref().map(|task| task.id()),
            argl: pcb.argl as u32,
            args,
        }
    }

    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[0..4].copy_from_slice(&self.pid.as_raw().to_le_bytes());
        let ppid = self.ppid.map_or(NO_PARENT, Pid::as_raw);
        out[4..8].copy_from_slice(&ppid.to_le_bytes());
        out[8] = u8::from(self.alive);
        out[12..16].copy_from_slice(&self.thread_count.to_le_bytes());
        out[16..24].copy_from_slice(&self.main_task.unwrap_or(0).to_le_bytes());
        out[24..28].copy_from_slice(&self.argl.to_le_bytes());
        let n = self.args.len().min(PROCINFO_MAX_ARGS_SIZE);
        out[HEADER_SIZE..HEADER_SIZE + n].copy_from_slice(&self.args[..n]);
        out
    }

    /// Parses a record; `None` when `buf` is shorter than [`ProcInfo::WIRE_SIZE`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut task = [0u8; 8];
        task.copy_from_slice(&buf[16..24]);
        let main_task = u64::from_le_bytes(task);
        let argl = u32_at(24);
        let alive = buf[8] != 0;
        let kept = if alive { (argl as usize).min(PROCINFO_MAX_ARGS_SIZE) } else { 0 };
        Some(Self {
            pid: Pid::from_raw(u32_at(0)),
            ppid: match u32_at(4) {
                NO_PARENT => None,
                raw => Some(Pid::from_raw(raw)),
            },
            alive,
            thread_count: u32_at(12),
            main_task: (main_task != 0).then_some(main_task),
            argl,
            args: buf[HEADER_SIZE..HEADER_SIZE + kept].to_vec(),
        })
    }
}

/// Cursor over the process table. Reads are serialised by the kernel lock.
struct ProcInfoStream {
    cursor: AtomicUsize,
}

impl StreamOps for ProcInfoStream {
    fn read(&self, k: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        if buf.len() < ProcInfo::WIRE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let start = self.cursor.load(Ordering::Relaxed);
        let found = (start..k.procs.capacity()).find_map(|index| {
            k.procs
                .slot(index)
                .filter(|pcb| pcb.state != ProcState::Free)
                .map(|pcb| (index, ProcInfo::from_pcb(Pid::from_raw(index as u32), pcb)))
        });
        match found {
            Some((index, info)) => {
                buf[..ProcInfo::WIRE_SIZE].copy_from_slice(&info.encode());
                self.cursor.store(index + 1, Ordering::Relaxed);
                Ok(ProcInfo::WIRE_SIZE)
            }
            None => {
                self.cursor.store(0, Ordering::Relaxed);
                Ok(0)
            }
        }
    }

    fn close(&self, _k: &mut KernelGuard<'_>) {}
}

/// `OpenInfo()`: a read-only handle enumerating the process table.
pub(crate) fn open_info(k: &mut KernelGuard<'_>, pid: Pid) -> KResult<Fid> {
    let (fid, fcb) = stream::reserve(k, pid, 1)?[0];
    stream::install(k, fcb, Arc::new(ProcInfoStream { cursor: AtomicUsize::new(0) }));
    Ok(fid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;

    #[test]
    fn encode_decode_keeps_fields() {
        let info = ProcInfo {
            pid: Pid::from_raw(7),
            ppid: Some(Pid::INIT),
            alive: true,
            thread_count: 3,
            main_task: Some(0xdead_beef),
            argl: 5,
            args: b"hello".to_vec(),
        };
        let wire = info.encode();
        assert_eq!(&wire[0..4], &7u32.to_le_bytes());
        assert_eq!(ProcInfo::decode(&wire), Some(info));
    }

    #[test]
    fn long_args_are_truncated_but_argl_is_kept() {
        let info = ProcInfo {
            pid: Pid::INIT,
            ppid: None,
            alive: true,
            thread_count: 0,
            main_task: None,
            argl: 300,
            args: vec![0xab; PROCINFO_MAX_ARGS_SIZE],
        };
        let decoded = ProcInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.argl, 300);
        assert_eq!(decoded.args.len(), PROCINFO_MAX_ARGS_SIZE);
        assert_eq!(decoded.ppid, None);
        assert_eq!(decoded.main_task, None);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(ProcInfo::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn zombie_record_keeps_argl_but_drops_args() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let init = crate::proc::exec(&kernel, &mut k, None, None, &[]).expect("init");
        let child = crate::proc::exec(&kernel, &mut k, Some(init), None, b"abc").expect("child");
        crate::proc::teardown(&mut k, child);

        let record = ProcInfo::from_pcb(child, k.procs.pcb(child));
        assert!(!record.alive);
        assert_eq!(record.ppid, Some(init));
        assert_eq!(record.argl, 3);
        assert!(record.args.is_empty());
        assert_eq!(ProcInfo::decode(&record.encode()), Some(record));
    }

    #[test]
    fn stream_visits_idle_then_wraps() {
        let kernel = Kernel::with_defaults();
        let mut k = kernel.lock();
        let fid = open_info(&mut k, Pid::IDLE).expect("open");
        let stream = stream::get(&k, Pid::IDLE, fid).expect("stream");
        let mut buf = vec![0u8; ProcInfo::WIRE_SIZE];

        assert_eq!(stream.read(&mut k, &mut buf), Ok(ProcInfo::WIRE_SIZE));
        let idle = ProcInfo::decode(&buf).unwrap();
        assert_eq!(idle.pid, Pid::IDLE);
        assert_eq!(idle.ppid, None);
        assert!(idle.alive);
        assert_eq!(idle.thread_count, 0);

        assert_eq!(stream.read(&mut k, &mut buf), Ok(0));
        assert_eq!(stream.read(&mut k, &mut buf), Ok(ProcInfo::WIRE_SIZE));
        assert_eq!(stream.read(&mut k, &mut [0u8; 8]), Err(KernelError::InvalidArgument));
        assert_eq!(stream.write(&mut k, b"x"), Err(KernelError::NotSupported));
    }
}
