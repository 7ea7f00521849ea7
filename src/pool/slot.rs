use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicU64, Ordering},
};

use nix::unistd::Pid;

use crate::fd::close_checked;

/// `{pid: -1, fd: -1}`.
const INVALID: u64 = u64::MAX;

const fn pack(pid: i32, fd: RawFd) -> u64 {
    ((pid as u32 as u64) << 32) | fd as u32 as u64
}

const fn unpack(raw: u64) -> (i32, RawFd) {
    ((raw >> 32) as u32 as i32, raw as u32 as i32)
}

/// A registered warm worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    pub pid: Pid,
    pub report_fd: RawFd,
}

/// `{pid, report_fd}` packed into one lock-free atomic word.
#[derive(Debug)]
pub struct PoolSlot(AtomicU64);

impl PoolSlot {
    pub const fn new() -> Self {
        Self(AtomicU64::new(INVALID))
    }

    pub fn get(&self) -> Option<SlotEntry> {
        decode(self.0.load(Ordering::SeqCst))
    }

    /// Claims the slot if it is empty.
    pub fn set_if_invalid(&self, pid: Pid, report_fd: RawFd) -> bool {
        self.0
            .compare_exchange(
                INVALID,
                pack(pid.as_raw(), report_fd),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Empties the slot if it holds `pid`, closing the report fd.
    /// Async-signal-safe.
    pub fn clear_for_pid(&self, pid: Pid) -> bool {
        let current = self.0.load(Ordering::SeqCst);
        match decode(current) {
            Some(entry) if entry.pid == pid => {
                if self
                    .0
                    .compare_exchange(current, INVALID, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    close_checked(entry.report_fd);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Empties the slot and hands back what it held. The caller owns the fd.
    pub fn take(&self) -> Option<SlotEntry> {
        decode(self.0.swap(INVALID, Ordering::SeqCst))
    }

    /// Empties the slot without closing anything.
    pub fn invalidate(&self) {
        self.0.store(INVALID, Ordering::SeqCst);
    }
}

impl Default for PoolSlot {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(raw: u64) -> Option<SlotEntry> {
    if raw == INVALID {
        return None;
    }
    let (pid, report_fd) = unpack(raw);
    Some(SlotEntry {
        pid: Pid::from_raw(pid),
        report_fd,
    })
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;

    use super::*;

    #[test]
    fn pack_keeps_both_halves() {
        assert_eq!(unpack(pack(500, 9)), (500, 9));
        assert_eq!(unpack(pack(i32::MAX, 0)), (i32::MAX, 0));
    }

    #[test]
    fn clear_only_matches_its_pid() {
        let fd = std::fs::File::open("/dev/null").unwrap().into_raw_fd();
        let slot = PoolSlot::new();
        assert!(slot.set_if_invalid(Pid::from_raw(500), fd));
        assert!(!slot.set_if_invalid(Pid::from_raw(501), fd));
        assert!(!slot.clear_for_pid(Pid::from_raw(501)));
        assert!(slot.clear_for_pid(Pid::from_raw(500)));
        assert!(slot.get().is_none());
    }
}
