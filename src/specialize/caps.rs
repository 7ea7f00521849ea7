//! Capability sets, the bounding set and the per-app grant policy.

use bitflags::bitflags;

use crate::{error::prelude::*, sys};

use super::request::CapabilityMasks;

bitflags! {
    /// Linux capabilities as a 64-bit mask, bit `n` being capability `n`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Capabilities: u64 {
        const CHOWN = 1 << 0;
        const DAC_OVERRIDE = 1 << 1;
        const DAC_READ_SEARCH = 1 << 2;
        const FOWNER = 1 << 3;
        const FSETID = 1 << 4;
        const KILL = 1 << 5;
        const SETGID = 1 << 6;
        const SETUID = 1 << 7;
        const SETPCAP = 1 << 8;
        const NET_BIND_SERVICE = 1 << 10;
        const NET_BROADCAST = 1 << 11;
        const NET_ADMIN = 1 << 12;
        const NET_RAW = 1 << 13;
        const IPC_LOCK = 1 << 14;
        const SYS_MODULE = 1 << 16;
        const SYS_CHROOT = 1 << 18;
        const SYS_PTRACE = 1 << 19;
        const SYS_ADMIN = 1 << 21;
        const SYS_BOOT = 1 << 22;
        const SYS_NICE = 1 << 23;
        const SYS_RESOURCE = 1 << 24;
        const SYS_TIME = 1 << 25;
        const MKNOD = 1 << 27;
        const AUDIT_WRITE = 1 << 29;
        const SETFCAP = 1 << 31;
        const MAC_ADMIN = 1 << 33;
        const SYSLOG = 1 << 34;
        const WAKE_ALARM = 1 << 35;
        const BLOCK_SUSPEND = 1 << 36;
    }
}

pub fn set_keep_capabilities(keep: bool) -> Result {
    nix::sys::prctl::set_keepcaps(keep).context("Couldn't set keepcaps")
}

/// Replaces the inheritable set, keeping effective and permitted.
pub fn set_inheritable(inheritable: Capabilities) -> Result {
    let mut sets = sys::capget().context("capget failed")?;
    sets.inheritable = inheritable.bits();
    sys::capset(sets).context("capset failed")
}

/// Drops every capability the kernel knows about that `keep` does not name.
pub fn drop_bounding_set(keep: Capabilities) -> Result {
    for cap in 0..64u32 {
        if !sys::capbset_read(cap).with_context(|| format!("Couldn't read bounding cap {cap}"))? {
            break;
        }
        if keep.bits() & (1u64 << cap) != 0 {
            continue;
        }
        match sys::capbset_drop(cap) {
            Ok(()) => {}
            Err(nix::errno::Errno::EINVAL) => {
                error!("prctl(PR_CAPBSET_DROP) failed with EINVAL for {cap}, kernel lacks capability support");
            }
            Err(e) => return Err(e).with_context(|| format!("prctl(PR_CAPBSET_DROP, {cap}) failed")),
        }
    }
    Ok(())
}

pub fn set_capabilities(
    permitted: Capabilities,
    effective: Capabilities,
    inheritable: Capabilities,
) -> Result {
    sys::capset(sys::CapSets {
        effective: effective.bits(),
        permitted: permitted.bits(),
        inheritable: inheritable.bits(),
    })
    .with_context(|| {
        format!(
            "capset({:#x}, {:#x}, {:#x}) failed",
            permitted.bits(),
            effective.bits(),
            inheritable.bits()
        )
    })
}

pub fn current_effective() -> Result<Capabilities> {
    let sets = sys::capget().context("capget failed")?;
    Ok(Capabilities::from_bits_retain(sets.effective))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppGrant {
    pub app_id: u32,
    pub caps: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GidGrant {
    pub gid: u32,
    pub caps: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default = "default_app_grants")]
    pub app_grants: Vec<AppGrant>,
    #[serde(default = "default_gid_grants")]
    pub gid_grants: Vec<GidGrant>,
    /// Extra capabilities left in the bounding set for members of a group.
    #[serde(default = "default_bounding_grants")]
    pub bounding_grants: Vec<GidGrant>,
}

const BLUETOOTH_APP_ID: u32 = 1002;
const NETWORK_STACK_APP_ID: u32 = 1073;
const WAKELOCK_GID: u32 = 3010;
const VIRTUALMACHINE_GID: u32 = 3013;

fn default_app_grants() -> Vec<AppGrant> {
    vec![
        AppGrant {
            app_id: BLUETOOTH_APP_ID,
            caps: Capabilities::WAKE_ALARM
                | Capabilities::NET_ADMIN
                | Capabilities::NET_RAW
                | Capabilities::NET_BIND_SERVICE
                | Capabilities::SYS_NICE,
        },
        AppGrant {
            app_id: NETWORK_STACK_APP_ID,
            caps: Capabilities::WAKE_ALARM
                | Capabilities::NET_ADMIN
                | Capabilities::NET_BROADCAST
                | Capabilities::NET_BIND_SERVICE
                | Capabilities::NET_RAW,
        },
    ]
}

fn default_gid_grants() -> Vec<GidGrant> {
    vec![GidGrant {
        gid: WAKELOCK_GID,
        caps: Capabilities::BLOCK_SUSPEND,
    }]
}

fn default_bounding_grants() -> Vec<GidGrant> {
    vec![GidGrant {
        gid: VIRTUALMACHINE_GID,
        caps: Capabilities::SYS_NICE,
    }]
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            app_grants: default_app_grants(),
            gid_grants: default_gid_grants(),
            bounding_grants: default_bounding_grants(),
        }
    }
}

/// Computes the capability masks a spawn is entitled to.
pub struct CapabilityPolicy<'a> {
    config: &'a CapabilityConfig,
    per_user_range: u32,
}

impl<'a> CapabilityPolicy<'a> {
    pub fn new(config: &'a CapabilityConfig, per_user_range: u32) -> Self {
        Self {
            config,
            per_user_range,
        }
    }

    /// Masks for `uid`, limited to what this process itself holds.
    pub fn for_app(&self, uid: u32, gid: u32, gids: &[u32], is_spawner: bool) -> Result<CapabilityMasks> {
        Ok(self.compute(uid, gid, gids, is_spawner, current_effective()?))
    }

    pub fn compute(
        &self,
        uid: u32,
        gid: u32,
        gids: &[u32],
        is_spawner: bool,
        available: Capabilities,
    ) -> CapabilityMasks {
        let app_id = uid % self.per_user_range;
        let in_group = |g: u32| gid == g || gids.contains(&g);

        let mut caps = Capabilities::empty();
        for grant in self.config.app_grants.iter().filter(|g| g.app_id == app_id) {
            caps |= grant.caps;
        }
        for grant in self.config.gid_grants.iter().filter(|g| in_group(g.gid)) {
            caps |= grant.caps;
        }
        if is_spawner {
            caps |= Capabilities::SETUID | Capabilities::SETGID | Capabilities::SETPCAP;
        }
        caps &= available;

        let mut bounding = Capabilities::empty();
        for grant in self.config.bounding_grants.iter().filter(|g| in_group(g.gid)) {
            bounding |= grant.caps;
        }

        CapabilityMasks {
            permitted: caps,
            effective: caps,
            bounding,
        }
    }
}
