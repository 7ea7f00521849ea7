use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use thiserror::Error;

use crate::fd::close_checked;

use super::slot::{PoolSlot, SlotEntry};

/// Maximum number of warm workers.
pub const POOL_CAPACITY: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool registry is full ({0} slots)")]
    Full(usize),
    #[error("invalid pool worker pid {0}")]
    InvalidPid(i32),
    #[error("invalid report fd {0}")]
    InvalidFd(RawFd),
}

/// Fixed-size table of warm workers, shared with the SIGCHLD handler.
///
/// Every operation is lock-free. Only [`PoolRegistry::remove`] and
/// [`PoolRegistry::count`] are called from the handler.
#[derive(Debug)]
pub struct PoolRegistry {
    slots: [PoolSlot; POOL_CAPACITY],
    insert_index: AtomicUsize,
    count: AtomicU32,
}

impl PoolRegistry {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: PoolSlot = PoolSlot::new();
        Self {
            slots: [EMPTY; POOL_CAPACITY],
            insert_index: AtomicUsize::new(0),
            count: AtomicU32::new(0),
        }
    }

    /// Registers a worker, taking ownership of `report_fd`. Returns the slot index.
    pub fn insert(&self, pid: Pid, report_fd: RawFd) -> Result<usize, PoolError> {
        if pid.as_raw() <= 0 {
            return Err(PoolError::InvalidPid(pid.as_raw()));
        }
        if report_fd < 0 {
            return Err(PoolError::InvalidFd(report_fd));
        }
        // Counted before the slot becomes visible, so a removal racing in
        // from the handler always has something to decrement.
        self.count.fetch_add(1, Ordering::SeqCst);
        match self.place(pid, report_fd) {
            Some(index) => Ok(index),
            None => {
                self.count.fetch_sub(1, Ordering::SeqCst);
                Err(PoolError::Full(POOL_CAPACITY))
            }
        }
    }

    fn place(&self, pid: Pid, report_fd: RawFd) -> Option<usize> {
        let start = self.insert_index.fetch_add(1, Ordering::Relaxed);
        (0..POOL_CAPACITY)
            .map(|offset| (start + offset) % POOL_CAPACITY)
            .find(|index| self.slots[*index].set_if_invalid(pid, report_fd))
    }

    /// Drops the slot for `pid` and closes its report fd. Async-signal-safe.
    pub fn remove(&self, pid: Pid) -> bool {
        for slot in &self.slots {
            if slot.clear_for_pid(pid) {
                self.decrement();
                return true;
            }
        }
        false
    }

    fn decrement(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<SlotEntry> {
        self.slots.iter().filter_map(PoolSlot::get).collect()
    }

    pub fn report_fds(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .filter_map(PoolSlot::get)
            .map(|e| e.report_fd)
            .collect()
    }

    /// Forgets every slot without closing anything. Used in a freshly forked
    /// child, whose copy of the table describes the parent's workers.
    pub fn invalidate_all(&self) {
        for slot in &self.slots {
            slot.invalidate();
        }
        self.count.store(0, Ordering::SeqCst);
    }

    /// Terminates every warm worker. Does not wait for them to exit.
    pub fn drain(&self) -> usize {
        let mut killed = 0;
        for slot in &self.slots {
            if let Some(entry) = slot.take() {
                if let Err(e) = kill(entry.pid, Signal::SIGTERM) {
                    warn!("Couldn't send SIGTERM to pool worker {}: {e}", entry.pid);
                }
                close_checked(entry.report_fd);
                self.decrement();
                killed += 1;
            }
        }
        killed
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        os::fd::IntoRawFd,
        sync::{Arc, Barrier},
        thread,
    };

    use super::*;

    fn null_fd() -> RawFd {
        std::fs::File::open("/dev/null").unwrap().into_raw_fd()
    }

    #[test]
    fn rejects_bad_entries_and_fills_up() {
        let registry = PoolRegistry::new();
        assert_eq!(registry.insert(Pid::from_raw(0), 3), Err(PoolError::InvalidPid(0)));
        assert_eq!(registry.insert(Pid::from_raw(7), -1), Err(PoolError::InvalidFd(-1)));
        for pid in 1..=POOL_CAPACITY as i32 {
            registry.insert(Pid::from_raw(pid), 1000 + pid).unwrap();
        }
        assert_eq!(registry.count(), POOL_CAPACITY as u32);
        assert_eq!(
            registry.insert(Pid::from_raw(1000), 5),
            Err(PoolError::Full(POOL_CAPACITY))
        );
        registry.invalidate_all();
        assert_eq!(registry.count(), 0);
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn concurrent_inserts_never_share_a_slot() {
        let registry = Arc::new(PoolRegistry::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (0..10)
                        .map(|i| registry.insert(Pid::from_raw(1 + t * 10 + i), 100).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let indices: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: HashSet<usize> = indices.iter().copied().collect();
        assert_eq!(indices.len(), 80);
        assert_eq!(unique.len(), 80);
        assert_eq!(registry.count(), 80);
        let pids: HashSet<Pid> = registry.entries().iter().map(|e| e.pid).collect();
        assert_eq!(pids.len(), 80);
        registry.invalidate_all();
    }

    #[test]
    fn concurrent_removes_only_count_matches() {
        let registry = Arc::new(PoolRegistry::new());
        for pid in 1..=20 {
            registry.insert(Pid::from_raw(pid), null_fd()).unwrap();
        }
        // Even threads remove registered pids, odd threads unknown ones.
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let pid = if t % 2 == 0 { 2 * t + 1 } else { 500 + t };
                    registry.remove(Pid::from_raw(pid))
                })
            })
            .collect();
        let matched = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|m| *m)
            .count();
        assert_eq!(matched, 4);
        assert_eq!(registry.count(), 20 - matched as u32);
        registry.drain_without_kill_for_test();
    }

    #[test]
    fn removal_right_after_placement_keeps_count_exact() {
        let registry = PoolRegistry::new();
        registry.insert(Pid::from_raw(1), null_fd()).unwrap();

        // Same steps as insert, with the handler removing the new worker
        // the moment its slot is visible.
        registry.count.fetch_add(1, Ordering::SeqCst);
        registry.place(Pid::from_raw(2), null_fd()).unwrap();
        assert!(registry.remove(Pid::from_raw(2)));

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.entries().len(), 1);
        assert!(registry.remove(Pid::from_raw(1)));
        assert_eq!(registry.count(), 0);
    }

    impl PoolRegistry {
        fn drain_without_kill_for_test(&self) {
            for slot in &self.slots {
                if let Some(entry) = slot.take() {
                    close_checked(entry.report_fd);
                }
            }
            self.count.store(0, Ordering::SeqCst);
        }
    }
}
