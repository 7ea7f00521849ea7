//! Switching the process to its target uid, gid and groups.

use nix::unistd::{Gid, Uid};

use crate::error::prelude::*;

fn print_uid_gid() {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();
    debug!("UID: {uid}, GID: {gid}");
}

/// Applies supplementary groups. Spawners without an explicit list end up
/// with none, so they cannot pass the engine's groups on.
pub fn set_groups(gids: Option<&[u32]>, is_spawner: bool) -> Result {
    let groups: Vec<Gid> = match gids {
        Some(gids) => gids.iter().copied().map(Gid::from_raw).collect(),
        None if is_spawner => Vec::new(),
        None => return Ok(()),
    };
    nix::unistd::setgroups(&groups).context("setgroups failed")
}

pub fn set_gid(gid: u32) -> Result {
    let gid = Gid::from_raw(gid);
    nix::unistd::setresgid(gid, gid, gid).with_context(|| format!("setresgid({gid}) failed"))
}

pub fn set_uid(uid: u32) -> Result {
    let uid = Uid::from_raw(uid);
    nix::unistd::setresuid(uid, uid, uid).with_context(|| format!("setresuid({uid}) failed"))?;
    print_uid_gid();
    Ok(())
}
