use std::{
    collections::BTreeSet,
    os::fd::RawFd,
    sync::atomic::{AtomicBool, Ordering},
};

use nix::{
    sys::signal::Signal,
    unistd::{ForkResult, Pid},
};

use crate::{
    error::prelude::*,
    fd::{self, Allowlist, FdTable, LeakCheck},
    logging,
    pool::{reaper, POOL},
    specialize::{set_priority, PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN},
};

use super::signals;

static IS_FORKED_CHILD: AtomicBool = AtomicBool::new(false);

/// Whether this process came out of [`ForkController::fork_and_run`].
pub fn is_forked_child() -> bool {
    IS_FORKED_CHILD.load(Ordering::SeqCst)
}

fn warn_priority(priority: i32) {
    if let Err(e) = set_priority(priority) {
        warn!("{e:#}");
    }
}

/// Owns the descriptor table and performs every fork of the engine.
#[derive(Debug)]
pub struct ForkController {
    allowlist: Allowlist,
    table: Option<FdTable>,
    singleton_marker: String,
}

impl ForkController {
    pub fn new(allowlist: Allowlist, singleton_marker: impl Into<String>) -> Self {
        Self {
            allowlist,
            table: None,
            singleton_marker: singleton_marker.into(),
        }
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn table(&self) -> Option<&FdTable> {
        self.table.as_ref()
    }

    /// Takes the first snapshot, or brings the existing one up to date.
    pub fn refresh_table(&mut self, ignore: &BTreeSet<RawFd>) -> Result {
        match &mut self.table {
            Some(table) => table
                .restat(ignore, &self.allowlist, &self.singleton_marker)
                .context("Couldn't restat descriptor table"),
            None => {
                let table = FdTable::snapshot(ignore, &self.allowlist)
                    .context("Couldn't snapshot descriptor table")?;
                debug!("Snapshotted {} descriptors", table.len());
                self.table = Some(table);
                Ok(())
            }
        }
    }

    /// Forks with a clean descriptor state in the child.
    ///
    /// Returns the child's pid in the parent and `0` in the child. In the
    /// child every fd in `fds_to_close` points at `/dev/null`, the pool
    /// registry is empty and every recorded descriptor is reopened or
    /// detached.
    ///
    /// SIGCHLD is unblocked on return unless the caller had already blocked
    /// it. Logging stays on stderr only from quiescing until the fork is done.
    pub fn fork_and_run(
        &mut self,
        priority_fork: bool,
        fds_to_close: &[RawFd],
        fds_to_ignore: &[RawFd],
        failure: &dyn Failure,
    ) -> Pid {
        reaper::install_handlers();
        let was_blocked = signals::is_blocked(Signal::SIGCHLD).or_fail(failure);
        signals::block(Signal::SIGCHLD).or_fail(failure);
        logging::quiesce();

        let ignore: BTreeSet<RawFd> = fds_to_close.iter().chain(fds_to_ignore).copied().collect();
        self.refresh_table(&ignore).or_fail(failure);

        let leak_level = fd::leak_check();
        warn_priority(PRIORITY_MAX);

        // Only the control thread forks and the table is not shared.
        let pid = match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Child) => {
                IS_FORKED_CHILD.store(true, Ordering::SeqCst);
                self.reset_child(fds_to_close, leak_level).or_fail(failure);
                warn_priority(if priority_fork { PRIORITY_MAX } else { PRIORITY_MIN });
                Pid::from_raw(0)
            }
            Ok(ForkResult::Parent { child }) => {
                warn_priority(PRIORITY_DEFAULT);
                child
            }
            Err(e) => {
                warn_priority(PRIORITY_DEFAULT);
                failure.fail(format!("Unable to fork: {e}"))
            }
        };

        if !was_blocked {
            signals::unblock(Signal::SIGCHLD).or_fail(failure);
        }
        logging::resume();
        pid
    }

    fn reset_child(&self, fds_to_close: &[RawFd], leak_level: LeakCheck) -> Result {
        // Detaching replaces descriptors the leak checker would flag.
        fd::set_leak_check(LeakCheck::Disabled);
        fd::detach_descriptors(fds_to_close)?;
        POOL.invalidate_all();
        if let Some(table) = &self.table {
            table.reopen_or_detach()?;
        }
        fd::set_leak_check(leak_level);
        Ok(())
    }
}
