use std::{os::fd::RawFd, path::Path, path::PathBuf};

use crate::{
    error::prelude::*,
    specialize::{CapabilityConfig, IsaConfig, LabelRule, SeccompProfiles},
    storage::StorageConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First uid handed to applications. Everything below is a system process.
    #[serde(default = "default_first_app_uid")]
    pub first_app_uid: u32,
    /// Uids per user; `uid / per_user_range` is the user id.
    #[serde(default = "default_per_user_range")]
    pub per_user_range: u32,
    #[serde(default = "default_socket_env_prefix")]
    pub socket_env_prefix: String,
    #[serde(default)]
    pub sockets: SocketNames,
    #[serde(default = "default_true")]
    pub security_enforced: bool,
    #[serde(default = "default_supervisor_label")]
    pub supervisor_label: String,
    #[serde(default)]
    pub label_rules: Vec<LabelRule>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub seccomp: SeccompProfiles,
    #[serde(default)]
    pub capability_grants: CapabilityConfig,
    /// Extra exact paths allowed to stay open across a fork.
    #[serde(default)]
    pub allow_paths: Vec<String>,
    #[serde(default = "default_singleton_marker")]
    pub singleton_marker: String,
    #[serde(default)]
    pub isa_shim: IsaConfig,
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    /// Keep core dumps for debuggable processes.
    #[serde(default)]
    pub core_dump_debug: bool,
    /// Opened once before the first fork and inherited by every child.
    #[serde(default)]
    pub preload_files: Vec<PathBuf>,
}

fn default_first_app_uid() -> u32 {
    10000
}

fn default_per_user_range() -> u32 {
    100000
}

fn default_socket_env_prefix() -> String {
    "FORKSERVER_SOCKET_".to_string()
}

fn default_true() -> bool {
    true
}

fn default_supervisor_label() -> String {
    "u:r:system_server:s0".to_string()
}

fn default_singleton_marker() -> String {
    "/memfd:jit-zygote-cache".to_string()
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            first_app_uid: default_first_app_uid(),
            per_user_range: default_per_user_range(),
            socket_env_prefix: default_socket_env_prefix(),
            sockets: SocketNames::default(),
            security_enforced: default_true(),
            supervisor_label: default_supervisor_label(),
            label_rules: Vec::new(),
            storage: StorageConfig::default(),
            seccomp: SeccompProfiles::default(),
            capability_grants: CapabilityConfig::default(),
            allow_paths: Vec::new(),
            singleton_marker: default_singleton_marker(),
            isa_shim: IsaConfig::default(),
            cgroup_root: default_cgroup_root(),
            core_dump_debug: false,
            preload_files: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Reads the config from `path`, or from `FORKSERVER_CONFIG`, or falls
    /// back to defaults when neither is set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FORKSERVER_CONFIG").map(PathBuf::from));
        let Some(path) = path else {
            debug!("No config file given, using defaults");
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Couldn't read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Couldn't parse config file {}", path.display()))
    }

    pub fn user_id(&self, uid: u32) -> u32 {
        uid / self.per_user_range
    }

    pub fn app_id(&self, uid: u32) -> u32 {
        uid % self.per_user_range
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketNames {
    #[serde(default = "default_control")]
    pub control: String,
    #[serde(default = "default_control_secondary")]
    pub control_secondary: String,
    #[serde(default = "default_pool_primary")]
    pub pool_primary: String,
    #[serde(default = "default_pool_secondary")]
    pub pool_secondary: String,
}

fn default_control() -> String {
    "forkserver".to_string()
}

fn default_control_secondary() -> String {
    "forkserver_secondary".to_string()
}

fn default_pool_primary() -> String {
    "pool_primary".to_string()
}

fn default_pool_secondary() -> String {
    "pool_secondary".to_string()
}

impl Default for SocketNames {
    fn default() -> Self {
        Self {
            control: default_control(),
            control_secondary: default_control_secondary(),
            pool_primary: default_pool_primary(),
            pool_secondary: default_pool_secondary(),
        }
    }
}

/// The engine's own listening sockets, inherited as raw fds. `-1` when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSockets {
    pub control: RawFd,
    pub pool: RawFd,
}

impl ControlSockets {
    pub fn from_env(prefix: &str, names: &SocketNames, is_primary: bool) -> Self {
        let (control, pool) = if is_primary {
            (&names.control, &names.pool_primary)
        } else {
            (&names.control_secondary, &names.pool_secondary)
        };
        Self {
            control: socket_fd(prefix, control),
            pool: socket_fd(prefix, pool),
        }
    }
}

fn socket_fd(prefix: &str, name: &str) -> RawFd {
    let var = format!("{prefix}{name}");
    match std::env::var(&var) {
        Ok(raw) => match raw.trim().parse::<RawFd>() {
            Ok(fd) if fd >= 0 => fd,
            _ => {
                error!("Invalid fd in {var}: {raw:?}");
                -1
            }
        },
        Err(_) => {
            error!("Unable to fetch socket {name}: {var} not set");
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.first_app_uid, 10000);
        assert_eq!(config.per_user_range, 100000);
        assert_eq!(config.singleton_marker, "/memfd:jit-zygote-cache");
        assert!(config.security_enforced);
        assert_eq!(config.sockets.pool_secondary, "pool_secondary");
    }

    #[test]
    fn user_and_app_id_split() {
        let config = EngineConfig::default();
        assert_eq!(config.user_id(1_010_123), 10);
        assert_eq!(config.app_id(1_010_123), 10_123);
    }

    #[test]
    fn sockets_resolve_from_prefixed_env() {
        let names = SocketNames::default();
        std::env::set_var("FSTEST_SOCKET_forkserver_secondary", "12");
        std::env::set_var("FSTEST_SOCKET_pool_secondary", "not-a-number");
        let sockets = ControlSockets::from_env("FSTEST_SOCKET_", &names, false);
        assert_eq!(sockets.control, 12);
        assert_eq!(sockets.pool, -1);
        let primary = ControlSockets::from_env("FSTEST_SOCKET_", &names, true);
        assert_eq!(primary, ControlSockets { control: -1, pool: -1 });
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"first_app_uid": 20000, "allow_paths": ["/data/x.bin"]}"#)
            .unwrap();
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.first_app_uid, 20000);
        assert_eq!(config.allow_paths, vec!["/data/x.bin".to_string()]);
    }
}
