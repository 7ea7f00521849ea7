use std::{
    collections::{BTreeMap, BTreeSet},
    os::fd::RawFd,
};

use crate::error::prelude::*;

use super::{open_fds, Allowlist, FdInfo};

/// Every descriptor the engine keeps open across forks, keyed by fd number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdTable {
    entries: BTreeMap<RawFd, FdInfo>,
}

impl FdTable {
    /// Records every open descriptor not in `ignore`.
    pub fn snapshot(ignore: &BTreeSet<RawFd>, allowlist: &Allowlist) -> Result<Self> {
        let fds = open_fds()?.into_iter().filter(|fd| !ignore.contains(fd));
        Self::from_fds(fds, allowlist)
    }

    pub fn from_fds(fds: impl IntoIterator<Item = RawFd>, allowlist: &Allowlist) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for fd in fds {
            entries.insert(fd, FdInfo::from_fd(fd, allowlist)?);
        }
        Ok(Self { entries })
    }

    /// Brings the table up to date with the descriptors open right now.
    pub fn restat(
        &mut self,
        ignore: &BTreeSet<RawFd>,
        allowlist: &Allowlist,
        singleton_marker: &str,
    ) -> Result {
        self.restat_fds(open_fds()?, ignore, allowlist, singleton_marker)
    }

    /// Like [`FdTable::restat`], against an explicit set of open fds.
    ///
    /// Opened and closed descriptors are only warned about, but anything new
    /// still has to pass the allowlist.
    pub fn restat_fds(
        &mut self,
        open: BTreeSet<RawFd>,
        ignore: &BTreeSet<RawFd>,
        allowlist: &Allowlist,
        singleton_marker: &str,
    ) -> Result {
        let open: BTreeSet<RawFd> = open.into_iter().filter(|fd| !ignore.contains(fd)).collect();

        let closed: Vec<RawFd> = self
            .entries
            .keys()
            .filter(|fd| !open.contains(fd))
            .copied()
            .collect();
        for fd in closed {
            warn!("Closed file descriptor {fd} since the last fork");
            self.entries.remove(&fd);
        }

        for fd in open {
            let fresh = match self.entries.get(&fd) {
                Some(info) => {
                    if !info.is_stale()? {
                        continue;
                    }
                    debug!("fd {fd} now refers to a different file, recording it again");
                    FdInfo::from_fd(fd, allowlist)?
                }
                None => {
                    warn!("New file descriptor {fd} opened since the last fork");
                    FdInfo::from_fd(fd, allowlist)?
                }
            };
            self.entries.insert(fd, fresh);
        }

        if !singleton_marker.is_empty() {
            let count = self
                .entries
                .values()
                .filter(|info| info.path.starts_with(singleton_marker))
                .count();
            if count > 1 {
                bail!("Found {count} descriptors for singleton resource {singleton_marker}");
            }
        }
        Ok(())
    }

    /// Makes every recorded descriptor private to this process.
    pub fn reopen_or_detach(&self) -> Result {
        for info in self.entries.values() {
            info.reopen_or_detach()
                .with_context(|| format!("Couldn't reopen or detach fd {}", info.fd))?;
        }
        Ok(())
    }

    pub fn get(&self, fd: RawFd) -> Option<&FdInfo> {
        self.entries.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FdInfo> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    fn allowlist_for(files: &[&tempfile::NamedTempFile]) -> Allowlist {
        let list = Allowlist::with_defaults();
        for f in files {
            list.allow(f.path().to_str().unwrap()).unwrap();
        }
        list
    }

    #[test]
    fn restat_twice_is_identical() {
        let a = tempfile::NamedTempFile::new().unwrap();
        let b = tempfile::NamedTempFile::new().unwrap();
        let list = allowlist_for(&[&a, &b]);
        let fds: BTreeSet<RawFd> = [a.as_file().as_raw_fd(), b.as_file().as_raw_fd()].into();

        let mut table = FdTable::from_fds(fds.clone(), &list).unwrap();
        table.restat_fds(fds.clone(), &BTreeSet::new(), &list, "").unwrap();
        let first = table.clone();
        table.restat_fds(fds, &BTreeSet::new(), &list, "").unwrap();
        assert_eq!(first, table);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn restat_tracks_opened_closed_and_ignored() {
        let a = tempfile::NamedTempFile::new().unwrap();
        let b = tempfile::NamedTempFile::new().unwrap();
        let list = allowlist_for(&[&a, &b]);
        let (fa, fb) = (a.as_file().as_raw_fd(), b.as_file().as_raw_fd());

        let mut table = FdTable::from_fds([fa], &list).unwrap();
        table.restat_fds([fb].into(), &BTreeSet::new(), &list, "").unwrap();
        assert!(table.get(fa).is_none());
        assert!(table.get(fb).is_some());

        table.restat_fds([fa, fb].into(), &[fb].into(), &list, "").unwrap();
        assert!(table.get(fa).is_some());
        assert!(table.get(fb).is_none());
    }

    #[test]
    fn new_descriptor_must_pass_allowlist() {
        let a = tempfile::NamedTempFile::new().unwrap();
        let list = Allowlist::with_defaults();
        let mut table = FdTable::default();
        let err = table
            .restat_fds([a.as_file().as_raw_fd()].into(), &BTreeSet::new(), &list, "")
            .unwrap_err();
        assert!(format!("{err}").contains("Not allowlisted"), "{err}");
    }

    #[test]
    fn duplicated_singleton_is_fatal() {
        let a = tempfile::NamedTempFile::new().unwrap();
        let list = allowlist_for(&[&a]);
        let fd = a.as_file().as_raw_fd();
        let dup = a.as_file().try_clone().unwrap();
        let marker = a.path().to_str().unwrap();

        let mut table = FdTable::default();
        table.restat_fds([fd].into(), &BTreeSet::new(), &list, marker).unwrap();
        let err = table
            .restat_fds([fd, dup.as_raw_fd()].into(), &BTreeSet::new(), &list, marker)
            .unwrap_err();
        assert!(format!("{err}").contains("singleton"), "{err}");
    }
}
