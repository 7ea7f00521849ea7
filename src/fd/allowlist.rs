use std::{collections::HashSet, sync::RwLock};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllowlistError {
    #[error("path {0:?} contains a parent-directory segment")]
    Traversal(String),
    #[error("path {0:?} is not absolute")]
    Relative(String),
}

/// `prefix` + optional `infix` + `suffix` match on a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowRule {
    pub prefix: String,
    pub infix: Option<String>,
    pub suffix: String,
}

impl AllowRule {
    pub fn new(prefix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            infix: None,
            suffix: suffix.to_string(),
        }
    }

    pub fn with_infix(prefix: &str, infix: &str, suffix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            infix: Some(infix.to_string()),
            suffix: suffix.to_string(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        let Some(middle) = rest.strip_suffix(self.suffix.as_str()) else {
            return false;
        };
        match &self.infix {
            Some(infix) => middle.contains(infix.as_str()),
            None => true,
        }
    }
}

const STATIC_PATHS: &[&str] = &[
    "/dev/null",
    "/dev/urandom",
    "/dev/socket/forkserver",
    "/dev/socket/forkserver_secondary",
    "/dev/socket/pool_primary",
    "/dev/socket/pool_secondary",
    "/dev/socket/logdw",
    "/sys/kernel/debug/tracing/trace_marker",
    "/sys/kernel/tracing/trace_marker",
    "/system/framework/framework-res.apk",
];

const OVERLAY_DIRS: &[&str] = &[
    "/system/overlay/",
    "/system_ext/overlay/",
    "/product/overlay/",
    "/vendor/overlay/",
    "/odm/overlay/",
    "/oem/overlay/",
];

fn has_traversal(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

/// Decides which descriptors may survive a fork.
///
/// The exact paths and rules are fixed at construction. Paths added later
/// through [`Allowlist::allow`] only ever grow the set.
#[derive(Debug)]
pub struct Allowlist {
    exact: HashSet<String>,
    rules: Vec<AllowRule>,
    dynamic: RwLock<Vec<String>>,
}

impl Allowlist {
    pub fn new(exact: impl IntoIterator<Item = String>, rules: Vec<AllowRule>) -> Self {
        Self {
            exact: exact.into_iter().collect(),
            rules,
            dynamic: RwLock::new(Vec::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let mut rules = vec![
            AllowRule::new("/system/framework/", ".jar"),
            AllowRule::with_infix("/apex/", "/javalib/", ".jar"),
            AllowRule::new("/data/resource-cache/", ".idmap"),
            AllowRule::new("/memfd:", ""),
        ];
        rules.extend(OVERLAY_DIRS.iter().map(|dir| AllowRule::new(dir, ".apk")));
        Self::new(STATIC_PATHS.iter().map(|p| p.to_string()), rules)
    }

    /// Adds one exact path for the rest of the process lifetime.
    pub fn allow(&self, path: &str) -> Result<(), AllowlistError> {
        if !path.starts_with('/') {
            return Err(AllowlistError::Relative(path.to_string()));
        }
        if has_traversal(path) {
            return Err(AllowlistError::Traversal(path.to_string()));
        }
        let mut dynamic = self.dynamic.write().unwrap_or_else(|e| e.into_inner());
        if !dynamic.iter().any(|p| p == path) {
            dynamic.push(path.to_string());
        }
        Ok(())
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        if has_traversal(path) {
            return false;
        }
        if self.exact.contains(path) || self.rules.iter().any(|r| r.matches(path)) {
            return true;
        }
        self.dynamic
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|p| p == path)
    }
}

impl Default for Allowlist {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_paths_never_traverse() {
        let list = Allowlist::with_defaults();
        let candidates = [
            "/system/framework/core.jar",
            "/system/framework/../../data/evil.jar",
            "/apex/com.android.art/javalib/core-oj.jar",
            "/apex/com.android.art/../javalib/x.jar",
            "/apex/com.android.art/lib64/x.jar",
            "/vendor/overlay/Theme.apk",
            "/vendor/overlay/../../data/app/x.apk",
            "/product/overlay/sub/Theme.apk",
            "/dev/null",
            "/dev/zero",
            "/system/framework/core.jarx",
            "/data/system/framework/core.jar",
        ];
        for path in candidates {
            let traversal = has_traversal(path);
            if list.is_allowed(path) {
                assert!(!traversal, "{path} accepted with traversal");
            } else {
                let prefix = list.exact.contains(path)
                    || list.rules.iter().any(|r| path.starts_with(r.prefix.as_str()));
                let suffix = list.exact.contains(path)
                    || list.rules.iter().any(|r| r.matches(path));
                assert!(!prefix || !suffix || traversal, "{path} rejected without reason");
            }
        }
    }

    #[test]
    fn apex_rule_requires_javalib() {
        let list = Allowlist::with_defaults();
        assert!(list.is_allowed("/apex/com.android.conscrypt/javalib/conscrypt.jar"));
        assert!(!list.is_allowed("/apex/com.android.conscrypt/lib/conscrypt.jar"));
    }

    #[test]
    fn dynamic_entries_grow_and_reject_traversal() {
        let list = Allowlist::with_defaults();
        assert!(!list.is_allowed("/data/misc/shared.bin"));
        list.allow("/data/misc/shared.bin").unwrap();
        list.allow("/data/misc/shared.bin").unwrap();
        assert!(list.is_allowed("/data/misc/shared.bin"));
        assert_eq!(list.dynamic.read().unwrap().len(), 1);
        assert_eq!(
            list.allow("/data/../etc/passwd"),
            Err(AllowlistError::Traversal("/data/../etc/passwd".into()))
        );
        assert!(matches!(list.allow("rel/path"), Err(AllowlistError::Relative(_))));
    }
}
