use std::path::PathBuf;

use bitflags::bitflags;
use nix::sys::resource::Resource;

use super::caps::Capabilities;

bitflags! {
    /// Per-spawn runtime flags. Unknown bits pass through to the hooks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RuntimeFlags: u32 {
        const DEBUG_ENABLE_DEBUGGER = 1;
        const DEBUG_ENABLE_CHECKJNI = 1 << 1;
        const DEBUG_ENABLE_ASSERT = 1 << 2;
        const PROFILE_SUPERVISOR = 1 << 14;
        const PROFILE_FROM_SHELL = 1 << 15;
        const DEBUG_ENABLE_PTRACE = 1 << 25;
    }
}

/// Which view of shared storage a process gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    None,
    Default,
    Read,
    Write,
    Legacy,
    Installer,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitResource {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Memlock,
    Nofile,
    Nproc,
    Rtprio,
    Stack,
}

impl From<LimitResource> for Resource {
    fn from(r: LimitResource) -> Self {
        match r {
            LimitResource::As => Resource::RLIMIT_AS,
            LimitResource::Core => Resource::RLIMIT_CORE,
            LimitResource::Cpu => Resource::RLIMIT_CPU,
            LimitResource::Data => Resource::RLIMIT_DATA,
            LimitResource::Fsize => Resource::RLIMIT_FSIZE,
            LimitResource::Memlock => Resource::RLIMIT_MEMLOCK,
            LimitResource::Nofile => Resource::RLIMIT_NOFILE,
            LimitResource::Nproc => Resource::RLIMIT_NPROC,
            LimitResource::Rtprio => Resource::RLIMIT_RTPRIO,
            LimitResource::Stack => Resource::RLIMIT_STACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RLimit {
    pub resource: LimitResource,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityMasks {
    #[serde(default)]
    pub permitted: Capabilities,
    #[serde(default)]
    pub effective: Capabilities,
    /// Capabilities kept in the bounding set.
    #[serde(default)]
    pub bounding: Capabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequest {
    #[serde(default)]
    pub mode: StorageMode,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub packages_for_uid: Vec<String>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
}

/// Everything needed to turn a forked child into one specific process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecializationRequest {
    pub uid: u32,
    pub gid: u32,
    /// `None` leaves groups alone, except for spawners, which get none.
    #[serde(default)]
    pub gids: Option<Vec<u32>>,
    #[serde(default)]
    pub runtime_flags: RuntimeFlags,
    #[serde(default)]
    pub rlimits: Vec<RLimit>,
    #[serde(default)]
    pub capabilities: CapabilityMasks,
    #[serde(default)]
    pub storage: StorageRequest,
    /// Label selector, `seinfo[:extra]`.
    #[serde(default)]
    pub label_hint: Option<String>,
    #[serde(default)]
    pub nice_name: Option<String>,
    #[serde(default)]
    pub instruction_set: Option<String>,
    #[serde(default)]
    pub app_data_dir: Option<PathBuf>,
    #[serde(default)]
    pub is_supervisor: bool,
    #[serde(default)]
    pub is_spawner: bool,
}

impl SpecializationRequest {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            ..Default::default()
        }
    }

    pub fn process_name(&self) -> &str {
        match &self.nice_name {
            Some(name) => name,
            None if self.is_supervisor => "supervisor",
            None => "worker",
        }
    }
}
