//! Foreign instruction-set shim and the legacy address-space layout workaround.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::{error::prelude::*, storage::MountOps};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsaConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Whether a translator for foreign instruction sets is installed.
    #[serde(default)]
    pub shim_available: bool,
    /// Bound over `/proc/cpuinfo` for translated processes.
    #[serde(default)]
    pub cpuinfo_override: Option<PathBuf>,
}

fn default_host() -> String {
    match std::env::consts::ARCH {
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

impl Default for IsaConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            shim_available: false,
            cpuinfo_override: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimDecision {
    NotNeeded,
    Enabled,
    /// Needed, but there is no data directory to host it.
    Disabled,
}

impl ShimDecision {
    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

pub fn shim_decision(
    config: &IsaConfig,
    is_supervisor: bool,
    instruction_set: Option<&str>,
    app_data_dir: Option<&Path>,
) -> ShimDecision {
    if is_supervisor || !config.shim_available {
        return ShimDecision::NotNeeded;
    }
    match instruction_set {
        Some(isa) if isa != config.host => {}
        _ => return ShimDecision::NotNeeded,
    }
    if app_data_dir.is_none() {
        warn!("Native bridge is needed but the app data directory is unknown, disabling it");
        return ShimDecision::Disabled;
    }
    ShimDecision::Enabled
}

/// Prepares the translated process: its code cache and, if configured, the
/// cpuinfo it should see.
pub fn pre_initialize(
    config: &IsaConfig,
    app_data_dir: &Path,
    isa: &str,
    mounts: &dyn MountOps,
) -> Result {
    let cache = app_data_dir.join("code_cache");
    std::fs::create_dir_all(&cache)
        .with_context(|| format!("Couldn't create shim code cache {}", cache.display()))?;
    if let Some(cpuinfo) = &config.cpuinfo_override {
        mounts
            .bind(cpuinfo, Path::new("/proc/cpuinfo"))
            .with_context(|| format!("Couldn't bind {} cpuinfo", isa))?;
    }
    debug!("Prepared native bridge for {isa} in {}", app_data_dir.display());
    Ok(())
}

/// Parses `major.minor` from a kernel release string.
pub fn kernel_version(release: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"^(\d+)\.(\d+)").ok()?;
    let caps = re.captures(release)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Kernels before 4.5 on arm64 mapped 32-bit processes in a way that broke
/// some translated code; the compat layout avoids it.
pub fn needs_legacy_layout(arch: &str, release: &str) -> Option<bool> {
    if arch != "aarch64" {
        return Some(false);
    }
    kernel_version(release).map(|v| v < (4, 5))
}

/// Switches to the compat layout where needed. Failures only warn.
pub fn apply_aslr_workaround() {
    let release = match nix::sys::utsname::uname() {
        Ok(uts) => uts.release().to_string_lossy().into_owned(),
        Err(e) => {
            warn!("uname failed, skipping layout workaround: {e}");
            return;
        }
    };
    match needs_legacy_layout(std::env::consts::ARCH, &release) {
        Some(true) => {}
        Some(false) => return,
        None => {
            warn!("Couldn't parse kernel release {release:?}, skipping layout workaround");
            return;
        }
    }
    use nix::sys::personality::{self, Persona};
    let res = personality::get()
        .and_then(|current| personality::set(current | Persona::ADDR_COMPAT_LAYOUT));
    if let Err(e) = res {
        warn!("personality(ADDR_COMPAT_LAYOUT) failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(shim: bool) -> IsaConfig {
        IsaConfig {
            host: "arm64".into(),
            shim_available: shim,
            cpuinfo_override: None,
        }
    }

    #[test]
    fn shim_only_for_foreign_isa_with_data_dir() {
        let dir = Path::new("/data/user/0/com.example");
        let c = config(true);
        assert_eq!(shim_decision(&c, false, Some("x86_64"), Some(dir)), ShimDecision::Enabled);
        assert_eq!(shim_decision(&c, false, Some("arm64"), Some(dir)), ShimDecision::NotNeeded);
        assert_eq!(shim_decision(&c, true, Some("x86_64"), Some(dir)), ShimDecision::NotNeeded);
        assert_eq!(shim_decision(&c, false, Some("x86_64"), None), ShimDecision::Disabled);
        assert_eq!(
            shim_decision(&config(false), false, Some("x86_64"), Some(dir)),
            ShimDecision::NotNeeded
        );
    }

    #[test]
    fn kernel_versions_parse() {
        assert_eq!(kernel_version("4.4.302-android"), Some((4, 4)));
        assert_eq!(kernel_version("6.1.57"), Some((6, 1)));
        assert_eq!(kernel_version("garbage"), None);
    }

    #[test]
    fn layout_workaround_is_arm64_and_old_kernel_only() {
        assert_eq!(needs_legacy_layout("aarch64", "4.4.0"), Some(true));
        assert_eq!(needs_legacy_layout("aarch64", "4.5.0"), Some(false));
        assert_eq!(needs_legacy_layout("x86_64", "3.18.0"), Some(false));
        assert_eq!(needs_legacy_layout("aarch64", "weird"), None);
    }
}
