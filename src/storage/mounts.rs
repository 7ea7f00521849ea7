//! Mount side effects, behind a trait so namespace construction can be
//! tested without privileges.

use std::{
    fs::Permissions,
    os::unix::fs::{chown, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::{
    mount::{umount2, MntFlags, MsFlags},
    sched::CloneFlags,
};

use crate::error::prelude::*;

pub trait MountOps {
    fn unshare_mount_namespace(&self) -> Result;
    fn bind(&self, source: &Path, target: &Path) -> Result;
    fn mount_tmpfs(&self, target: &Path, options: &str) -> Result;
    /// Makes `target` and everything below it a slave mount.
    fn make_rslave(&self, target: &Path) -> Result;
    /// Creates `dir` (and parents) if missing and fixes its mode and owner.
    fn prepare_dir(&self, dir: &Path, mode: u32, uid: u32, gid: u32) -> Result;
    /// Lazily unmounts every mount point under `prefix`, deepest first.
    fn unmount_tree(&self, prefix: &Path) -> Result;
    fn exists(&self, path: &Path) -> bool;
}

pub struct SystemMounts;

impl MountOps for SystemMounts {
    fn unshare_mount_namespace(&self) -> Result {
        nix::sched::unshare(CloneFlags::CLONE_NEWNS).context("Couldn't unshare mount namespace")
    }

    fn bind(&self, source: &Path, target: &Path) -> Result {
        debug!("Bind mounting {} to {}", source.display(), target.display());
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_context(|| format!("Couldn't bind {} to {}", source.display(), target.display()))
    }

    fn mount_tmpfs(&self, target: &Path, options: &str) -> Result {
        debug!("Mounting tmpfs at {}", target.display());
        nix::mount::mount(
            None::<&str>,
            target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some(options),
        )
        .with_context(|| format!("Couldn't mount tmpfs at {}", target.display()))
    }

    fn make_rslave(&self, target: &Path) -> Result {
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_context(|| format!("Couldn't make {} a slave mount", target.display()))
    }

    fn prepare_dir(&self, dir: &Path, mode: u32, uid: u32, gid: u32) -> Result {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Couldn't create {}", dir.display()))?;
        std::fs::set_permissions(dir, Permissions::from_mode(mode))
            .with_context(|| format!("Couldn't chmod {} to {mode:o}", dir.display()))?;
        chown(dir, Some(uid), Some(gid))
            .with_context(|| format!("Couldn't chown {} to {uid}:{gid}", dir.display()))
    }

    fn unmount_tree(&self, prefix: &Path) -> Result {
        let mounts = std::fs::read_to_string("/proc/self/mounts")
            .context("Couldn't read /proc/self/mounts")?;
        for target in mount_points_under(&mounts, prefix).iter().rev() {
            if let Err(e) = umount2(target, MntFlags::MNT_DETACH) {
                warn!("Failed to unmount {}: {e}", target.display());
            }
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Mount points at or below `prefix`, in mount order.
pub fn mount_points_under(mounts: &str, prefix: &Path) -> Vec<PathBuf> {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .filter(|p| p.starts_with(prefix))
        .collect()
}

/// `/proc/self/mounts` escapes spaces and friends as octal.
fn unescape_mount_path(raw: &str) -> PathBuf {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.by_ref().take(3).collect();
            match u8::from_str_radix(&digits, 8) {
                Ok(b) => out.push(b as char),
                Err(_) => {
                    out.push('\\');
                    out.push_str(&digits);
                }
            }
        } else {
            out.push(c);
        }
    }
    PathBuf::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_points_are_filtered_by_component_prefix() {
        let mounts = "\
/dev/root / ext4 rw 0 0
tmpfs /storage tmpfs rw 0 0
/dev/fuse /storage/emulated fuse rw 0 0
tmpfs /storage_extra tmpfs rw 0 0
/dev/fuse /storage/my\\040card fuse rw 0 0
";
        let points = mount_points_under(mounts, Path::new("/storage"));
        assert_eq!(
            points,
            vec![
                PathBuf::from("/storage"),
                PathBuf::from("/storage/emulated"),
                PathBuf::from("/storage/my card"),
            ]
        );
    }
}
