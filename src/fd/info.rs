use std::{
    fs::{FileType, Metadata},
    os::{
        fd::RawFd,
        unix::fs::{FileTypeExt, MetadataExt},
    },
    path::Path,
};

use crate::{error::prelude::*, sys};

use super::{close_checked, Allowlist};

/// Paths whose backing store is shared memory; they are never reopened.
const IN_MEMORY_PREFIXES: &[&str] = &["/memfd:", "/dev/ashmem"];

/// One descriptor open at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdInfo {
    pub fd: RawFd,
    pub dev: u64,
    pub ino: u64,
    /// Resolved path, or the bound name for sockets.
    pub path: String,
    pub open_flags: i32,
    pub fd_flags: i32,
    /// `None` for descriptors that cannot seek.
    pub offset: Option<i64>,
    pub is_socket: bool,
}

fn proc_path(fd: RawFd) -> String {
    format!("/proc/self/fd/{fd}")
}

fn stat_fd(fd: RawFd) -> Result<Metadata> {
    std::fs::metadata(proc_path(fd)).with_context(|| format!("Couldn't stat fd {fd}"))
}

fn describe(ft: FileType) -> &'static str {
    if ft.is_dir() {
        "directory"
    } else if ft.is_symlink() {
        "symlink"
    } else if ft.is_block_device() {
        "block device"
    } else if ft.is_fifo() {
        "FIFO"
    } else {
        "unknown"
    }
}

impl FdInfo {
    /// Records `fd`, failing when its kind is unsupported or its path is not
    /// allowlisted.
    pub fn from_fd(fd: RawFd, allowlist: &Allowlist) -> Result<Self> {
        let meta = stat_fd(fd)?;
        let ft = meta.file_type();
        let fd_flags = sys::fcntl_getfd(fd).with_context(|| format!("F_GETFD failed for fd {fd}"))?;

        if ft.is_socket() {
            let name = sys::socket_name(fd)
                .with_context(|| format!("Couldn't get socket name for fd {fd}"))?
                .with_context(|| format!("Unsupported socket family for fd {fd}"))?;
            if !allowlist.is_allowed(&name) {
                bail!("Socket name not allowlisted: {name:?} (fd={fd})");
            }
            return Ok(Self {
                fd,
                dev: meta.dev(),
                ino: meta.ino(),
                path: name,
                open_flags: 0,
                fd_flags,
                offset: None,
                is_socket: true,
            });
        }

        if !(ft.is_file() || ft.is_char_device()) {
            bail!("Unsupported st_mode for fd {fd}: {}", describe(ft));
        }

        let path = std::fs::read_link(proc_path(fd))
            .with_context(|| format!("Couldn't readlink fd {fd}"))?
            .to_string_lossy()
            .into_owned();
        if !allowlist.is_allowed(&path) {
            bail!("Not allowlisted: {path} (fd={fd})");
        }

        let open_flags = sys::fcntl_getfl(fd)
            .with_context(|| format!("F_GETFL failed for fd {fd}"))?
            & !(libc::O_CREAT | libc::O_EXCL | libc::O_NOCTTY | libc::O_TRUNC);
        let offset = sys::seek_current(fd).ok();

        Ok(Self {
            fd,
            dev: meta.dev(),
            ino: meta.ino(),
            path,
            open_flags,
            fd_flags,
            offset,
            is_socket: false,
        })
    }

    /// True when `fd` now refers to a different file than the one recorded.
    pub fn is_stale(&self) -> Result<bool> {
        let meta = stat_fd(self.fd)?;
        Ok(meta.dev() != self.dev || meta.ino() != self.ino)
    }

    pub fn is_in_memory(&self) -> bool {
        IN_MEMORY_PREFIXES.iter().any(|p| self.path.starts_with(p))
    }

    fn cloexec_flag(&self) -> i32 {
        if self.fd_flags & libc::FD_CLOEXEC != 0 {
            libc::O_CLOEXEC
        } else {
            0
        }
    }

    pub fn reopen_or_detach(&self) -> Result {
        if self.is_socket {
            return self.detach();
        }
        if self.is_in_memory() {
            return Ok(());
        }
        self.reopen()
    }

    /// Points the fd at `/dev/null`, keeping its number and close-on-exec flag.
    pub fn detach(&self) -> Result {
        let null = sys::open(Path::new("/dev/null"), libc::O_RDWR)
            .context("Couldn't open /dev/null")?;
        let res = sys::dup3(null, self.fd, self.cloexec_flag())
            .with_context(|| format!("Couldn't dup3 /dev/null onto fd {}", self.fd));
        close_checked(null);
        res
    }

    fn reopen(&self) -> Result {
        let new_fd = sys::open(Path::new(&self.path), self.open_flags)
            .with_context(|| format!("Couldn't reopen {} for fd {}", self.path, self.fd))?;
        let res = self.swap_in(new_fd);
        close_checked(new_fd);
        res
    }

    fn swap_in(&self, new_fd: RawFd) -> Result {
        sys::fcntl_setfd(new_fd, self.fd_flags)
            .with_context(|| format!("F_SETFD failed while reopening {}", self.path))?;
        sys::fcntl_setfl(new_fd, self.open_flags)
            .with_context(|| format!("F_SETFL failed while reopening {}", self.path))?;
        if let Some(offset) = self.offset {
            sys::seek_to(new_fd, offset)
                .with_context(|| format!("Couldn't seek {} to {offset}", self.path))?;
        }
        sys::dup3(new_fd, self.fd, self.cloexec_flag())
            .with_context(|| format!("Couldn't dup3 {} onto fd {}", self.path, self.fd))
    }
}
