//! Warm worker bookkeeping and child reaping.

use std::{
    fs::File,
    io::Write,
    mem::ManuallyDrop,
    os::fd::{AsFd, AsRawFd, FromRawFd, RawFd},
    sync::OnceLock,
};

use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::{error::prelude::*, sys};

pub mod reaper;
mod registry;
mod slot;

pub use registry::{PoolError, PoolRegistry, POOL_CAPACITY};
pub use slot::{PoolSlot, SlotEntry};

/// The registry the SIGCHLD handler works on. Initialized at compile time,
/// so it exists before any handler can run.
pub static POOL: PoolRegistry = PoolRegistry::new();

static EVENT_FD: OnceLock<EventFd> = OnceLock::new();

/// The eventfd the reaper bumps by the number of workers it removed.
/// Created on first use.
pub fn event_fd() -> Result<RawFd> {
    if let Some(efd) = EVENT_FD.get() {
        return Ok(efd.as_fd().as_raw_fd());
    }
    let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
        .context("Unable to create pool event fd")?;
    let fd = EVENT_FD.get_or_init(|| efd).as_fd().as_raw_fd();
    reaper::set_event_fd(fd);
    Ok(fd)
}

/// The eventfd if it was already created.
pub fn existing_event_fd() -> Option<RawFd> {
    EVENT_FD.get().map(|efd| efd.as_fd().as_raw_fd())
}

/// Non-blocking read of the event counter. `0` when nothing was reaped.
pub fn take_events() -> Result<u64> {
    let Some(fd) = existing_event_fd() else {
        return Ok(0);
    };
    if !sys::poll_readable(fd).context("Couldn't poll pool event fd")? {
        return Ok(0);
    }
    sys::read_u64(fd).context("Couldn't read pool event fd")
}

/// Reads the pid a worker writes to its report channel once specialized.
/// `None` when the worker closed the channel first.
pub fn read_report(report_fd: RawFd) -> Result<Option<i32>> {
    sys::read_i32(report_fd).with_context(|| format!("Couldn't read report fd {report_fd}"))
}

/// Worker side of [`read_report`]. Leaves `report_fd` open.
pub fn write_report(report_fd: RawFd, pid: i32) -> Result {
    // Borrowed; ManuallyDrop keeps the File from closing it.
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(report_fd) });
    file.write_all(&pid.to_ne_bytes())
        .with_context(|| format!("Couldn't write report fd {report_fd}"))
}
