//! Private mount namespaces with per-user views of shared storage.

use std::{
    cell::Cell,
    path::{Path, PathBuf},
};

use crate::{error::prelude::*, specialize::StorageMode};

mod mounts;

pub use mounts::{mount_points_under, MountOps, SystemMounts};

/// Group owning every user's storage root.
const EVERYBODY_GID: u32 = 9997;
const SHELL_UID: u32 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Holds one directory per view: `default`, `read`, `write`, `full`.
    #[serde(default = "default_view_root")]
    pub view_root: PathBuf,
    /// Holds `<user id>` directories bound to `<target>/self`.
    #[serde(default = "default_user_root")]
    pub user_root: PathBuf,
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,
    #[serde(default = "default_target")]
    pub target: PathBuf,
    #[serde(default)]
    pub isolated_storage: bool,
    #[serde(default)]
    pub prepare_on_init: bool,
}

fn default_view_root() -> PathBuf {
    PathBuf::from("/mnt/runtime")
}

fn default_user_root() -> PathBuf {
    PathBuf::from("/mnt/user")
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("/mnt/sandbox")
}

fn default_target() -> PathBuf {
    PathBuf::from("/storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            view_root: default_view_root(),
            user_root: default_user_root(),
            sandbox_root: default_sandbox_root(),
            target: default_target(),
            isolated_storage: false,
            prepare_on_init: false,
        }
    }
}

impl StorageMode {
    fn view_name(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Default => Some("default"),
            Self::Read => Some("read"),
            Self::Write | Self::Legacy | Self::Installer => Some("write"),
            Self::Full => Some("full"),
        }
    }

    fn is_sandboxable(self) -> bool {
        matches!(self, Self::Legacy | Self::Full)
    }
}

fn valid_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Builds the storage view of one spawned process.
pub struct NamespaceBuilder<'a> {
    ops: &'a dyn MountOps,
    config: &'a StorageConfig,
    per_user_range: u32,
    in_private_namespace: Cell<bool>,
}

impl<'a> NamespaceBuilder<'a> {
    pub fn new(ops: &'a dyn MountOps, config: &'a StorageConfig, per_user_range: u32) -> Self {
        Self {
            ops,
            config,
            per_user_range,
            in_private_namespace: Cell::new(false),
        }
    }

    fn ensure_namespace(&self) -> Result {
        if !self.in_private_namespace.get() {
            self.ops.unshare_mount_namespace()?;
            self.in_private_namespace.set(true);
        }
        Ok(())
    }

    pub fn mount_storage(
        &self,
        uid: u32,
        mode: StorageMode,
        force_namespace: bool,
        package_name: Option<&str>,
        packages_for_uid: &[String],
        sandbox_id: Option<&str>,
    ) -> Result {
        self.ensure_namespace()?;
        let Some(view) = mode.view_name() else {
            if force_namespace {
                debug!("Private mount namespace forced without storage");
            }
            return Ok(());
        };

        let user_id = uid / self.per_user_range;
        let user_source = self.config.user_root.join(user_id.to_string());
        // The primary user's root also lets the shell traverse it.
        let owner = if user_id == 0 { SHELL_UID } else { 0 };
        self.ops.prepare_dir(
            &user_source,
            0o710,
            owner,
            user_id * self.per_user_range + EVERYBODY_GID,
        )?;

        if self.config.isolated_storage && mode.is_sandboxable() {
            let staging = self.mount_sandbox(uid, user_id, package_name, packages_for_uid, sandbox_id)?;
            self.ops.bind(&staging, &self.config.target)?;
        } else {
            self.ops
                .bind(&self.config.view_root.join(view), &self.config.target)?;
        }

        self.ops.bind(&user_source, &self.config.target.join("self"))
    }

    /// Builds a staging tree exposing only the given packages' private
    /// storage. Returns its root.
    fn mount_sandbox(
        &self,
        uid: u32,
        user_id: u32,
        package_name: Option<&str>,
        packages_for_uid: &[String],
        sandbox_id: Option<&str>,
    ) -> Result<PathBuf> {
        let sandbox_id = sandbox_id
            .or(package_name)
            .context("Isolated storage needs a sandbox id or package name")?;
        if !valid_component(sandbox_id) {
            bail!("Invalid sandbox id {sandbox_id:?}");
        }
        let staging = self
            .config
            .sandbox_root
            .join(user_id.to_string())
            .join(sandbox_id);
        self.ops.prepare_dir(&staging, 0o700, uid, uid)?;

        let real_android = self
            .config
            .view_root
            .join("write/emulated")
            .join(user_id.to_string())
            .join("Android");
        for package in packages_for_uid {
            if !valid_component(package) {
                bail!("Invalid package name {package:?}");
            }
            for sub in ["data", "media", "obb"] {
                let source = real_android.join(sub).join(package);
                let target = staging.join("Android").join(sub).join(package);
                self.prepare_if_missing(&source, 0o770, uid, uid)?;
                self.ops.prepare_dir(&target, 0o700, uid, uid)?;
                self.ops.bind(&source, &target)?;
            }
        }
        Ok(staging)
    }

    fn prepare_if_missing(&self, dir: &Path, mode: u32, uid: u32, gid: u32) -> Result {
        if self.ops.exists(dir) {
            return Ok(());
        }
        self.ops.prepare_dir(dir, mode, uid, gid)
    }
}

/// Engine start-up: a private namespace with nothing mounted under the
/// storage target.
pub fn prepare_on_init(ops: &dyn MountOps, config: &StorageConfig) -> Result {
    ops.unshare_mount_namespace()?;
    ops.make_rslave(Path::new("/"))?;
    if let Some(staging) = std::env::var_os("EMULATED_STORAGE_TARGET") {
        ops.mount_tmpfs(Path::new(&staging), "uid=0,gid=1028,mode=0751")?;
    }
    ops.unmount_tree(&config.target)
}


#[cfg(test)]
mod tests {
    use super::{
        testing::{MountCall, RecordingMounts},
        *,
    };

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn mode_none_only_creates_the_namespace() {
        let ops = RecordingMounts::default();
        let config = StorageConfig::default();
        let builder = NamespaceBuilder::new(&ops, &config, 100000);
        builder
            .mount_storage(10057, StorageMode::None, false, Some("com.example"), &[], None)
            .unwrap();
        assert_eq!(*ops.calls.borrow(), vec![MountCall::Unshare]);
    }

    #[test]
    fn write_mode_binds_view_and_self() {
        let ops = RecordingMounts::default();
        let config = StorageConfig::default();
        let builder = NamespaceBuilder::new(&ops, &config, 100000);
        builder
            .mount_storage(1_010_057, StorageMode::Write, false, None, &[], None)
            .unwrap();
        assert_eq!(
            ops.binds(),
            vec![
                (p("/mnt/runtime/write"), p("/storage")),
                (p("/mnt/user/10"), p("/storage/self")),
            ]
        );
        assert_eq!(ops.calls.borrow()[0], MountCall::Unshare);
        assert!(ops.calls.borrow().contains(&MountCall::PrepareDir(
            p("/mnt/user/10"),
            0o710,
            0,
            1_009_997
        )));
    }

    #[test]
    fn primary_user_root_is_owned_by_shell() {
        let ops = RecordingMounts::default();
        let config = StorageConfig::default();
        let builder = NamespaceBuilder::new(&ops, &config, 100000);
        builder
            .mount_storage(10057, StorageMode::Read, false, None, &[], None)
            .unwrap();
        assert!(ops.calls.borrow().contains(&MountCall::PrepareDir(
            p("/mnt/user/0"),
            0o710,
            2000,
            9997
        )));
    }

    #[test]
    fn namespace_is_created_once() {
        let ops = RecordingMounts::default();
        let config = StorageConfig::default();
        let builder = NamespaceBuilder::new(&ops, &config, 100000);
        builder.mount_storage(10057, StorageMode::None, true, None, &[], None).unwrap();
        builder.mount_storage(10057, StorageMode::Read, false, None, &[], None).unwrap();
        let unshares = ops
            .calls
            .borrow()
            .iter()
            .filter(|c| **c == MountCall::Unshare)
            .count();
        assert_eq!(unshares, 1);
    }

    #[test]
    fn isolated_full_mode_builds_a_sandbox() {
        let mut ops = RecordingMounts::default();
        ops.existing
            .insert(p("/mnt/runtime/write/emulated/0/Android/data/com.a"));
        let config = StorageConfig {
            isolated_storage: true,
            ..Default::default()
        };
        let builder = NamespaceBuilder::new(&ops, &config, 100000);
        let packages = vec!["com.a".to_string(), "com.b".to_string()];
        builder
            .mount_storage(10057, StorageMode::Full, false, Some("com.a"), &packages, None)
            .unwrap();

        let binds = ops.binds();
        assert_eq!(binds.len(), 2 * 3 + 2);
        assert!(binds.contains(&(
            p("/mnt/runtime/write/emulated/0/Android/obb/com.b"),
            p("/mnt/sandbox/0/com.a/Android/obb/com.b"),
        )));
        assert_eq!(binds[binds.len() - 2], (p("/mnt/sandbox/0/com.a"), p("/storage")));

        let calls = ops.calls.borrow();
        assert!(!calls.contains(&MountCall::PrepareDir(
            p("/mnt/runtime/write/emulated/0/Android/data/com.a"),
            0o770,
            10057,
            10057
        )));
        assert!(calls.contains(&MountCall::PrepareDir(
            p("/mnt/runtime/write/emulated/0/Android/data/com.b"),
            0o770,
            10057,
            10057
        )));
    }

    #[test]
    fn sandbox_rejects_path_like_names() {
        let ops = RecordingMounts::default();
        let config = StorageConfig {
            isolated_storage: true,
            ..Default::default()
        };
        let builder = NamespaceBuilder::new(&ops, &config, 100000);
        let err = builder
            .mount_storage(10057, StorageMode::Legacy, false, Some("../etc"), &[], None)
            .unwrap_err();
        assert!(format!("{err}").contains("Invalid sandbox id"));
    }

    #[test]
    fn init_preparation_order() {
        let ops = RecordingMounts::default();
        std::env::remove_var("EMULATED_STORAGE_TARGET");
        prepare_on_init(&ops, &StorageConfig::default()).unwrap();
        assert_eq!(
            *ops.calls.borrow(),
            vec![
                MountCall::Unshare,
                MountCall::Rslave(p("/")),
                MountCall::UnmountTree(p("/storage")),
            ]
        );
    }
}
