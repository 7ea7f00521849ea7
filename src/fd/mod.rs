//! Bookkeeping for the descriptors the engine holds across forks.

use std::{
    collections::BTreeSet,
    os::fd::RawFd,
    path::Path,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{error::prelude::*, signal_log, sys};

mod allowlist;
mod info;
mod table;

pub use allowlist::{AllowRule, Allowlist, AllowlistError};
pub use info::FdInfo;
pub use table::FdTable;

/// Descriptors currently open in this process.
pub fn open_fds() -> Result<BTreeSet<RawFd>> {
    let mut fds = BTreeSet::new();
    for entry in std::fs::read_dir("/proc/self/fd").context("Couldn't read /proc/self/fd")? {
        let entry = entry.context("Couldn't read /proc/self/fd entry")?;
        if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            fds.insert(fd);
        }
    }
    // The directory stream's own fd is listed too and is closed by now.
    fds.retain(|fd| sys::fcntl_getfd(*fd).is_ok());
    Ok(fds)
}

/// Redirects each fd to `/dev/null` so the number stays taken but the
/// original file is no longer reachable.
pub fn detach_descriptors(fds: &[RawFd]) -> Result {
    if fds.is_empty() {
        return Ok(());
    }
    let null =
        sys::open(Path::new("/dev/null"), libc::O_RDWR).context("Couldn't open /dev/null")?;
    let res = fds.iter().filter(|fd| **fd != null).try_for_each(|fd| {
        sys::dup3(null, *fd, libc::O_CLOEXEC)
            .with_context(|| format!("Couldn't detach fd {fd}"))
    });
    close_checked(null);
    res
}

/// How loudly to report closing a descriptor that is not open.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakCheck {
    Disabled = 0,
    Warn = 1,
    Fatal = 2,
}

static LEAK_CHECK: AtomicU8 = AtomicU8::new(LeakCheck::Warn as u8);

pub fn leak_check() -> LeakCheck {
    match LEAK_CHECK.load(Ordering::Relaxed) {
        0 => LeakCheck::Disabled,
        1 => LeakCheck::Warn,
        _ => LeakCheck::Fatal,
    }
}

pub fn set_leak_check(level: LeakCheck) {
    LEAK_CHECK.store(level as u8, Ordering::Relaxed);
}

/// Closes a descriptor the caller owns. A double close is reported at the
/// current [`LeakCheck`] level. Safe to call from the SIGCHLD handler.
pub fn close_checked(fd: RawFd) {
    if let Err(nix::errno::Errno::EBADF) = sys::close(fd) {
        match leak_check() {
            LeakCheck::Disabled => {}
            LeakCheck::Warn => signal_log!("fd {} closed while not open", fd),
            LeakCheck::Fatal => {
                signal_log!("fd {} closed while not open, aborting", fd);
                std::process::abort();
            }
        }
    }
}
