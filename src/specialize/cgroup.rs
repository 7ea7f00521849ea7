//! Per-process accounting groups (`<root>/uid_<uid>/pid_<pid>`).

use std::path::{Path, PathBuf};

use nix::unistd::{Pid, Uid};

use crate::error::prelude::*;

#[derive(Debug, Clone)]
pub struct ProcessGroup {
    path: PathBuf,
}

impl ProcessGroup {
    fn write_prop(&self, prop: &str, val: &str) -> Result {
        std::fs::write(self.path.join(prop), val)
            .with_context(|| format!("Couldn't write cgroup property ({prop})"))
    }

    pub fn create(root: &Path, uid: u32, pid: Pid) -> Result<Self> {
        let path = root.join(format!("uid_{uid}")).join(format!("pid_{pid}"));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Couldn't create cgroup at {}", path.display()))?;
        let group = Self { path };
        group.move_pid(pid)?;
        Ok(group)
    }

    pub fn move_pid(&self, pid: Pid) -> Result {
        self.write_prop("cgroup.procs", &pid.to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Puts `pid` in its own group. Only root can; without a cgroup hierarchy
/// this only warns.
pub fn create_process_group(root: &Path, uid: u32, pid: Pid) -> Result<Option<ProcessGroup>> {
    if !Uid::current().is_root() {
        return Ok(None);
    }
    if !root.join("cgroup.procs").exists() {
        warn!("No cgroup hierarchy at {}, skipping process group", root.display());
        return Ok(None);
    }
    match ProcessGroup::create(root, uid, pid) {
        Ok(group) => Ok(Some(group)),
        Err(e) => match e.root_cause().downcast_ref::<std::io::Error>() {
            Some(io) if io.raw_os_error() == Some(libc::EROFS) => {
                warn!("cgroup hierarchy at {} is read-only: {e:#}", root.display());
                Ok(None)
            }
            _ => Err(e).with_context(|| format!("Couldn't create process group for {uid}/{pid}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_hierarchy_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = create_process_group(dir.path(), 10057, Pid::from_raw(1234)).unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn group_paths_nest_uid_then_pid() {
        let dir = tempfile::tempdir().unwrap();
        let group = ProcessGroup::create(dir.path(), 10057, Pid::from_raw(1234)).unwrap();
        assert_eq!(group.path(), dir.path().join("uid_10057/pid_1234"));
        let procs = std::fs::read_to_string(group.path().join("cgroup.procs")).unwrap();
        assert_eq!(procs, "1234");
    }
}
