//! SIGCHLD handling. Everything reachable from [`sigchld_handler`] is
//! async-signal-safe: atomics, `waitpid`, `write` and [`signal_log!`].

use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicI32, Ordering},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{getpid, Pid},
};

use crate::{error::prelude::*, signal_log, sys};

use super::{PoolRegistry, POOL};

static SUPERVISOR_PID: AtomicI32 = AtomicI32::new(0);
static EVENT_FD: AtomicI32 = AtomicI32::new(-1);

pub fn set_supervisor_pid(pid: Pid) {
    SUPERVISOR_PID.store(pid.as_raw(), Ordering::SeqCst);
}

pub fn supervisor_pid() -> Option<Pid> {
    match SUPERVISOR_PID.load(Ordering::SeqCst) {
        pid if pid > 0 => Some(Pid::from_raw(pid)),
        _ => None,
    }
}

pub(crate) fn set_event_fd(fd: RawFd) {
    EVENT_FD.store(fd, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(Pid, i32),
    Signaled(Pid, Signal, bool),
}

impl ChildExit {
    pub fn pid(&self) -> Pid {
        match self {
            Self::Exited(pid, _) | Self::Signaled(pid, _, _) => *pid,
        }
    }
}

/// Source of exited children.
pub trait ChildWaiter {
    /// The next exited child, or `None` once nothing is left to reap.
    fn next_exit(&mut self) -> Option<ChildExit>;
}

/// `waitpid(-1, WNOHANG)`.
pub struct SystemWaiter;

impl ChildWaiter for SystemWaiter {
    fn next_exit(&mut self) -> Option<ChildExit> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => return Some(ChildExit::Exited(pid, code)),
                Ok(WaitStatus::Signaled(pid, sig, core)) => {
                    return Some(ChildExit::Signaled(pid, sig, core))
                }
                Ok(WaitStatus::StillAlive) => return None,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return None,
                Err(e) => {
                    signal_log!("waitpid failed: {}", e.desc());
                    return None;
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub reaped: u32,
    pub pool_removed: u64,
    pub supervisor_exited: bool,
}

/// Reaps until `waiter` runs dry, removing pool slots of exited workers.
///
/// Workers killed with SIGTERM keep their slot: they were terminated by a
/// pool drain, which already released it. Stops early when the supervisor
/// exits.
pub fn reap_children<W: ChildWaiter>(
    waiter: &mut W,
    pool: &PoolRegistry,
    supervisor: Option<Pid>,
) -> ReapSummary {
    let mut summary = ReapSummary::default();
    while let Some(exit) = waiter.next_exit() {
        summary.reaped += 1;
        let pid = exit.pid();
        match exit {
            ChildExit::Exited(_, code) => {
                if code == 0 {
                    signal_log!("Process {} exited cleanly", pid);
                } else {
                    signal_log!("Process {} exited cleanly ({})", pid, code);
                }
                if pool.remove(pid) {
                    summary.pool_removed += 1;
                }
            }
            ChildExit::Signaled(_, sig, core) => {
                signal_log!(
                    "Process {} exited due to signal {} ({}){}",
                    pid,
                    sig as i32,
                    sig.as_str(),
                    if core { "; core dumped" } else { "" }
                );
                if sig != Signal::SIGTERM && pool.remove(pid) {
                    summary.pool_removed += 1;
                }
            }
        }
        if supervisor == Some(pid) {
            summary.supervisor_exited = true;
            return summary;
        }
    }
    summary
}

/// Kills the whole engine. Used when its foundations are gone.
pub fn terminate_engine() -> ! {
    let _ = kill(getpid(), Signal::SIGKILL);
    unsafe { libc::_exit(1) }
}

/// Acts on a reap: escalates a supervisor death and signals the pool event fd.
pub fn handle_summary(summary: &ReapSummary, event_fd: RawFd) {
    if summary.supervisor_exited {
        signal_log!("Exit the engine because the supervisor exited");
        terminate_engine();
    }
    if summary.pool_removed > 0 && event_fd >= 0 {
        if let Err(e) = sys::write_u64(event_fd, summary.pool_removed) {
            signal_log!("Failed to write to pool event fd: {}", e.desc());
            terminate_engine();
        }
    }
}

extern "C" fn sigchld_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let _errno = sys::ErrnoGuard::save();
    let summary = reap_children(&mut SystemWaiter, &POOL, supervisor_pid());
    handle_summary(&summary, EVENT_FD.load(Ordering::SeqCst));
}

/// Installs the SIGCHLD handler and ignores SIGHUP. Idempotent.
pub fn install_handlers() {
    let chld = SigAction::new(
        SigHandler::SigAction(sigchld_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &chld) } {
        warn!("Failed to install SIGCHLD handler: {e}");
    }
    let hup = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    if let Err(e) = unsafe { sigaction(Signal::SIGHUP, &hup) } {
        warn!("Failed to ignore SIGHUP: {e}");
    }
}

/// Puts SIGCHLD back to its default disposition.
pub fn restore_default_handler() -> Result {
    let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGCHLD, &dfl) }.context("Couldn't restore SIGCHLD handler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        os::fd::{AsFd, AsRawFd, IntoRawFd},
    };

    use nix::sys::eventfd::{EfdFlags, EventFd};

    use super::*;

    struct Scripted(VecDeque<ChildExit>);

    impl ChildWaiter for Scripted {
        fn next_exit(&mut self) -> Option<ChildExit> {
            self.0.pop_front()
        }
    }

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    fn null_fd() -> RawFd {
        std::fs::File::open("/dev/null").unwrap().into_raw_fd()
    }

    #[test]
    fn exited_workers_leave_the_pool_but_sigterm_ones_do_not() {
        let pool = PoolRegistry::new();
        pool.insert(pid(100), null_fd()).unwrap();
        pool.insert(pid(101), null_fd()).unwrap();
        pool.insert(pid(102), null_fd()).unwrap();
        let mut waiter = Scripted(
            [
                ChildExit::Exited(pid(100), 0),
                ChildExit::Signaled(pid(101), Signal::SIGTERM, false),
                ChildExit::Signaled(pid(102), Signal::SIGSEGV, true),
                ChildExit::Exited(pid(999), 3),
            ]
            .into(),
        );
        let summary = reap_children(&mut waiter, &pool, None);
        assert_eq!(
            summary,
            ReapSummary {
                reaped: 4,
                pool_removed: 2,
                supervisor_exited: false
            }
        );
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.entries()[0].pid, pid(101));
    }

    #[test]
    fn supervisor_exit_stops_the_loop() {
        let pool = PoolRegistry::new();
        let mut waiter = Scripted(
            [
                ChildExit::Signaled(pid(42), Signal::SIGKILL, false),
                ChildExit::Exited(pid(43), 0),
            ]
            .into(),
        );
        let summary = reap_children(&mut waiter, &pool, Some(pid(42)));
        assert!(summary.supervisor_exited);
        assert_eq!(summary.reaped, 1);
        assert_eq!(waiter.0.len(), 1);
    }

    #[test]
    fn removed_workers_are_counted_on_the_event_fd() {
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let fd = efd.as_fd().as_raw_fd();
        let summary = ReapSummary {
            reaped: 3,
            pool_removed: 2,
            supervisor_exited: false,
        };
        handle_summary(&summary, fd);
        handle_summary(&summary, fd);
        assert_eq!(sys::read_u64(fd).unwrap(), 4);
    }
}
