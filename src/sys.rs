//! Thin wrappers over raw descriptor and process syscalls.
//! Everything here takes raw fds because the callers are either the fd
//! snapshot (which works on numbers it does not own) or the SIGCHLD handler.
//! The counter and report reads and writes stay on plain libc so the handler
//! never allocates.

use std::{
    os::fd::{BorrowedFd, IntoRawFd, RawFd},
    path::Path,
};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::{
        socket::{getsockname, AddressFamily, SockaddrLike, SockaddrStorage},
        stat::Mode,
    },
    unistd::{lseek, Whence},
};

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
const PR_SET_PTRACER: libc::c_int = 0x5961_6d61;
const PR_SET_PTRACER_ANY: libc::c_ulong = libc::c_ulong::MAX;

fn retry<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// Borrows a descriptor the caller keeps open for the duration of the call.
fn borrowed<'a>(fd: RawFd) -> BorrowedFd<'a> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

pub fn fcntl_getfd(fd: RawFd) -> nix::Result<i32> {
    fcntl(borrowed(fd), FcntlArg::F_GETFD)
}

pub fn fcntl_setfd(fd: RawFd, flags: i32) -> nix::Result<()> {
    fcntl(borrowed(fd), FcntlArg::F_SETFD(FdFlag::from_bits_retain(flags))).map(drop)
}

pub fn fcntl_getfl(fd: RawFd) -> nix::Result<i32> {
    fcntl(borrowed(fd), FcntlArg::F_GETFL)
}

pub fn fcntl_setfl(fd: RawFd, flags: i32) -> nix::Result<()> {
    fcntl(borrowed(fd), FcntlArg::F_SETFL(OFlag::from_bits_retain(flags))).map(drop)
}

pub fn seek_current(fd: RawFd) -> nix::Result<i64> {
    lseek(borrowed(fd), 0, Whence::SeekCur).map(|off| off as i64)
}

pub fn seek_to(fd: RawFd, offset: i64) -> nix::Result<()> {
    lseek(borrowed(fd), offset as libc::off_t, Whence::SeekSet).map(drop)
}

/// Opens `path` close-on-exec. The caller owns the returned fd.
pub fn open(path: &Path, flags: i32) -> nix::Result<RawFd> {
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_CLOEXEC;
    retry(|| nix::fcntl::open(path, flags, Mode::empty())).map(IntoRawFd::into_raw_fd)
}

/// Makes `new` a copy of `old`. `new` stays owned by whoever owned it before.
pub fn dup3(old: RawFd, new: RawFd, flags: i32) -> nix::Result<()> {
    let flags = OFlag::from_bits_retain(flags);
    retry(|| unsafe { nix::unistd::dup3_raw(borrowed(old), new, flags) })
        .map(|fd| drop(fd.into_raw_fd()))
}

pub fn close(fd: RawFd) -> nix::Result<()> {
    nix::unistd::close(fd)
}

pub fn write_u64(fd: RawFd, value: u64) -> nix::Result<()> {
    let buf = value.to_ne_bytes();
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        match n {
            -1 if Errno::last() == Errno::EINTR => continue,
            -1 => return Err(Errno::last()),
            n if n as usize == buf.len() => return Ok(()),
            _ => return Err(Errno::EIO),
        }
    }
}

pub fn read_u64(fd: RawFd) -> nix::Result<u64> {
    let mut buf = [0u8; 8];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            -1 if Errno::last() == Errno::EINTR => continue,
            -1 => return Err(Errno::last()),
            n if n as usize == buf.len() => return Ok(u64::from_ne_bytes(buf)),
            _ => return Err(Errno::EIO),
        }
    }
}

pub fn read_i32(fd: RawFd) -> nix::Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let rest = &mut buf[filled..];
        let n = unsafe { libc::read(fd, rest.as_mut_ptr().cast(), rest.len()) };
        match n {
            -1 if Errno::last() == Errno::EINTR => continue,
            -1 => return Err(Errno::last()),
            0 if filled == 0 => return Ok(None),
            0 => return Err(Errno::EIO),
            n => filled += n as usize,
        }
    }
    Ok(Some(i32::from_ne_bytes(buf)))
}

/// Whether `fd` is readable right now. Never blocks.
pub fn poll_readable(fd: RawFd) -> nix::Result<bool> {
    let mut fds = [PollFd::new(borrowed(fd), PollFlags::POLLIN)];
    let n = retry(|| poll(&mut fds, PollTimeout::ZERO))?;
    Ok(n > 0 && fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)))
}

/// Resolves the bound name of a socket.
///
/// `Ok(None)` means the socket is not `AF_UNIX`. Unnamed sockets resolve to
/// an empty string and abstract ones to `@name`.
pub fn socket_name(fd: RawFd) -> nix::Result<Option<String>> {
    let addr: SockaddrStorage = getsockname(fd)?;
    if addr.family() != Some(AddressFamily::Unix) {
        return Ok(None);
    }
    let Some(unix) = addr.as_unix_addr() else {
        return Ok(None);
    };
    if let Some(path) = unix.path() {
        return Ok(Some(path.to_string_lossy().into_owned()));
    }
    if let Some(name) = unix.as_abstract() {
        return Ok(Some(format!("@{}", String::from_utf8_lossy(name))));
    }
    Ok(Some(String::new()))
}

pub fn set_priority(priority: i32) -> nix::Result<()> {
    Errno::clear();
    let res = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, priority) };
    if res == -1 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

pub fn set_default_scheduler() -> nix::Result<()> {
    let param = libc::sched_param { sched_priority: 0 };
    Errno::result(unsafe { libc::sched_setscheduler(0, libc::SCHED_OTHER, &param) }).map(drop)
}

pub fn get_dumpable() -> nix::Result<i32> {
    Errno::result(unsafe { libc::prctl(libc::PR_GET_DUMPABLE, 0, 0, 0, 0) })
}

pub fn set_dumpable(value: i32) -> nix::Result<()> {
    Errno::result(unsafe { libc::prctl(libc::PR_SET_DUMPABLE, value as libc::c_ulong, 0, 0, 0) })
        .map(drop)
}

pub fn set_ptracer_any() -> nix::Result<()> {
    Errno::result(unsafe { libc::prctl(PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0) }).map(drop)
}

/// `Ok(false)` once `cap` is past the last capability the kernel knows.
pub fn capbset_read(cap: u32) -> nix::Result<bool> {
    match Errno::result(unsafe { libc::prctl(libc::PR_CAPBSET_READ, cap as libc::c_ulong, 0, 0, 0) })
    {
        Ok(_) => Ok(true),
        Err(Errno::EINVAL) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn capbset_drop(cap: u32) -> nix::Result<()> {
    Errno::result(unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) })
        .map(drop)
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CapSets {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
}

fn join(lo: u32, hi: u32) -> u64 {
    lo as u64 | ((hi as u64) << 32)
}

pub fn capget() -> nix::Result<CapSets> {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];
    Errno::result(unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    })?;
    Ok(CapSets {
        effective: join(data[0].effective, data[1].effective),
        permitted: join(data[0].permitted, data[1].permitted),
        inheritable: join(data[0].inheritable, data[1].inheritable),
    })
}

pub fn capset(sets: CapSets) -> nix::Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapUserData {
            effective: sets.effective as u32,
            permitted: sets.permitted as u32,
            inheritable: sets.inheritable as u32,
        },
        CapUserData {
            effective: (sets.effective >> 32) as u32,
            permitted: (sets.permitted >> 32) as u32,
            inheritable: (sets.inheritable >> 32) as u32,
        },
    ];
    Errno::result(unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    })
    .map(drop)
}

fn errno_location() -> *mut libc::c_int {
    #[cfg(target_os = "android")]
    unsafe {
        libc::__errno()
    }
    #[cfg(not(target_os = "android"))]
    unsafe {
        libc::__errno_location()
    }
}

/// Restores the thread's errno on drop. Signal handlers must not leak errno
/// into the code they interrupted.
pub struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    pub fn save() -> Self {
        Self(unsafe { *errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe { *errno_location() = self.0 };
    }
}
