//! Compiling and installing syscall filter profiles.
//! Profiles are compiled once in the engine and installed in each child.

use std::collections::BTreeMap;

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};

use crate::error::prelude::*;

use super::syscalls;

const fn get_arch() -> TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        TargetArch::aarch64
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("Unsupported architecture");
    }
}

// Redeclared from seccompiler because they don't serialize well
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum FilterAction {
    /// Returns from syscall with specified error number.
    Errno { errno: u32 },
    /// Kills calling thread.
    KillThread,
    /// Kills calling process.
    KillProcess,
    /// Allows syscall after logging it.
    Log,
    /// Sends `SIGSYS` to the calling process.
    Trap,
}

impl Default for FilterAction {
    fn default() -> Self {
        Self::Errno {
            errno: libc::EPERM as u32,
        }
    }
}

impl From<FilterAction> for SeccompAction {
    fn from(action: FilterAction) -> Self {
        match action {
            FilterAction::Errno { errno } => SeccompAction::Errno(errno),
            FilterAction::KillThread => SeccompAction::KillThread,
            FilterAction::KillProcess => SeccompAction::KillProcess,
            FilterAction::Log => SeccompAction::Log,
            FilterAction::Trap => SeccompAction::Trap,
        }
    }
}

/// A deny-list profile. Everything not listed is allowed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BpfConfig {
    #[serde(default)]
    pub deny_action: FilterAction,
    #[serde(default)]
    pub denied_calls: Vec<String>,
    /// Reject uid/gid changes to ids below the first app uid.
    #[serde(default)]
    pub restrict_id_changes: bool,
}

impl BpfConfig {
    fn denying(calls: &[&str], restrict_id_changes: bool) -> Self {
        Self {
            deny_action: FilterAction::default(),
            denied_calls: calls.iter().map(|c| c.to_string()).collect(),
            restrict_id_changes,
        }
    }
}

const KERNEL_CALLS: &[&str] = &[
    "acct",
    "delete_module",
    "finit_module",
    "init_module",
    "kexec_load",
    "reboot",
    "swapoff",
    "swapon",
];

const APP_EXTRA_CALLS: &[&str] = &[
    "bpf",
    "clock_adjtime",
    "clock_settime",
    "lookup_dcookie",
    "perf_event_open",
    "pivot_root",
    "quotactl",
    "setdomainname",
    "sethostname",
    "settimeofday",
    "setns",
    "vhangup",
];

/// Calls an app may not make but a nested spawner needs for its children.
const SPAWNER_ONLY_CALLS: &[&str] = &["mount", "umount2", "unshare"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeccompProfiles {
    #[serde(default = "default_system")]
    pub system: BpfConfig,
    #[serde(default = "default_app")]
    pub app: BpfConfig,
    #[serde(default = "default_app_spawner")]
    pub app_spawner: BpfConfig,
}

fn default_system() -> BpfConfig {
    BpfConfig::denying(KERNEL_CALLS, false)
}

fn default_app() -> BpfConfig {
    let calls: Vec<&str> = KERNEL_CALLS
        .iter()
        .chain(APP_EXTRA_CALLS)
        .chain(SPAWNER_ONLY_CALLS)
        .copied()
        .collect();
    BpfConfig::denying(&calls, true)
}

fn default_app_spawner() -> BpfConfig {
    let calls: Vec<&str> = KERNEL_CALLS.iter().chain(APP_EXTRA_CALLS).copied().collect();
    BpfConfig::denying(&calls, true)
}

impl Default for SeccompProfiles {
    fn default() -> Self {
        Self {
            system: default_system(),
            app: default_app(),
            app_spawner: default_app_spawner(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    System,
    App,
    AppSpawner,
}

impl Profile {
    pub fn select(uid: u32, is_spawner: bool, first_app_uid: u32) -> Self {
        match (uid >= first_app_uid, is_spawner) {
            (false, _) => Self::System,
            (true, false) => Self::App,
            (true, true) => Self::AppSpawner,
        }
    }
}

/// The three profiles, compiled for the running architecture.
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    system: BpfProgram,
    app: BpfProgram,
    app_spawner: BpfProgram,
}

impl CompiledFilters {
    pub fn compile(profiles: &SeccompProfiles, first_app_uid: u32) -> Result<Self> {
        Ok(Self {
            system: compile_filter(&profiles.system, first_app_uid)
                .context("Couldn't compile system profile")?,
            app: compile_filter(&profiles.app, first_app_uid)
                .context("Couldn't compile app profile")?,
            app_spawner: compile_filter(&profiles.app_spawner, first_app_uid)
                .context("Couldn't compile app spawner profile")?,
        })
    }

    pub fn get(&self, profile: Profile) -> &BpfProgram {
        match profile {
            Profile::System => &self.system,
            Profile::App => &self.app,
            Profile::AppSpawner => &self.app_spawner,
        }
    }
}

type Rules = BTreeMap<i64, Vec<SeccompRule>>;

fn arg_rule(arg: u8, op: SeccompCmpOp, value: u32) -> Result<SeccompRule> {
    let cond = SeccompCondition::new(arg, SeccompCmpArgLen::Dword, op, value as u64)
        .context("Invalid seccomp condition")?;
    SeccompRule::new(vec![cond]).context("Invalid seccomp rule")
}

/// Rules matching `setresuid`/`setresgid` calls with any id outside `[min, max]`.
fn id_range_rules(rules: &mut Rules, min: u32, max: Option<u32>) -> Result {
    for call in ["setresuid", "setresgid"] {
        let nr = syscalls::lookup(call).with_context(|| format!("Unknown syscall {call}"))?;
        let mut call_rules = Vec::new();
        for arg in 0..3 {
            call_rules.push(arg_rule(arg, SeccompCmpOp::Lt, min)?);
            if let Some(max) = max {
                call_rules.push(arg_rule(arg, SeccompCmpOp::Gt, max)?);
            }
        }
        rules.insert(nr, call_rules);
    }
    Ok(())
}

pub fn compile_filter(config: &BpfConfig, first_app_uid: u32) -> Result<BpfProgram> {
    let mut rules: Rules = config
        .denied_calls
        .iter()
        .map(|call| {
            syscalls::lookup(call)
                .map(|nr| (nr, vec![]))
                .ok_or_else(|| anyhow!("Unknown syscall for seccomp: {}", call))
        })
        .collect::<Result<_>>()?;

    if config.restrict_id_changes {
        id_range_rules(&mut rules, first_app_uid, None)?;
    }

    build(rules, config.deny_action.into())
}

/// A filter rejecting uid/gid changes outside `[min, max]`.
pub fn compile_id_range_filter(min: u32, max: u32) -> Result<BpfProgram> {
    if min > max {
        bail!("Invalid id range [{min}, {max}]");
    }
    let mut rules = Rules::new();
    id_range_rules(&mut rules, min, Some(max))?;
    build(rules, FilterAction::default().into())
}

fn build(rules: Rules, deny: SeccompAction) -> Result<BpfProgram> {
    let filter = SeccompFilter::new(rules, SeccompAction::Allow, deny, get_arch())
        .context("Failed to create seccomp filter")?;
    filter.try_into().context("Failed to compile seccomp filter")
}

pub fn install_filter(program: &BpfProgram) -> Result {
    debug!("Applying seccomp filter");
    seccompiler::apply_filter(program).context("Couldn't apply seccomp filter")
}
