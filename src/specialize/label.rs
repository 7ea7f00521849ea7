//! Security labels (SELinux contexts) for specialized processes.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::prelude::*;

/// Picks a context for a process. Every field that is set must match; the
/// first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    /// First `:`-separated segment of the spawn's label hint.
    #[serde(default)]
    pub seinfo: Option<String>,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub min_uid: Option<u32>,
    #[serde(default)]
    pub max_uid: Option<u32>,
    pub context: String,
}

impl LabelRule {
    fn matches(&self, uid: u32, hint: Option<&str>, name: Option<&str>) -> bool {
        let seinfo = hint.and_then(|h| h.split(':').next());
        self.seinfo.as_deref().map_or(true, |s| seinfo == Some(s))
            && self
                .name_prefix
                .as_deref()
                .map_or(true, |p| name.is_some_and(|n| n.starts_with(p)))
            && self.min_uid.map_or(true, |min| uid >= min)
            && self.max_uid.map_or(true, |max| uid <= max)
    }
}

pub trait Labeler {
    /// Labels a worker from its uid, label hint and name.
    fn set_context(&self, uid: u32, hint: Option<&str>, name: Option<&str>) -> Result;
    /// Applies one fixed context.
    fn set_fixed(&self, context: &str) -> Result;
}

/// Writes contexts to `/proc/thread-self/attr/current`.
/// Does nothing on kernels without SELinux.
pub struct SelinuxLabeler {
    rules: Vec<LabelRule>,
    selinuxfs: PathBuf,
    attr: PathBuf,
    context_re: Regex,
}

impl SelinuxLabeler {
    pub fn new(rules: Vec<LabelRule>) -> Result<Self> {
        Self::with_paths(
            rules,
            PathBuf::from("/sys/fs/selinux"),
            PathBuf::from("/proc/thread-self/attr/current"),
        )
    }

    pub fn with_paths(rules: Vec<LabelRule>, selinuxfs: PathBuf, attr: PathBuf) -> Result<Self> {
        const PATTERN: &str = r"^[^:\s]+:[^:\s]+:[^:\s]+(:\S+)?$";
        let context_re = Regex::new(PATTERN).context("Couldn't compile regex")?;
        if let Some(bad) = rules.iter().find(|r| !context_re.is_match(&r.context)) {
            bail!("Invalid security context in label rule: {:?}", bad.context);
        }
        Ok(Self {
            rules,
            selinuxfs,
            attr,
            context_re,
        })
    }

    pub fn enabled(&self) -> bool {
        self.selinuxfs.exists()
    }

    pub fn resolve(&self, uid: u32, hint: Option<&str>, name: Option<&str>) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.matches(uid, hint, name))
            .map(|r| r.context.as_str())
    }

    fn write_context(&self, context: &str) -> Result {
        if !self.context_re.is_match(context) {
            bail!("Invalid security context: {context:?}");
        }
        if !self.enabled() {
            debug!("SELinux not present, not applying {context}");
            return Ok(());
        }
        write_attr(&self.attr, context)
    }
}

fn write_attr(attr: &Path, context: &str) -> Result {
    std::fs::write(attr, context)
        .with_context(|| format!("Couldn't set security context {context}"))
}

impl Labeler for SelinuxLabeler {
    fn set_context(&self, uid: u32, hint: Option<&str>, name: Option<&str>) -> Result {
        if self.rules.is_empty() {
            debug!("No label rules configured");
            return Ok(());
        }
        let context = self.resolve(uid, hint, name).with_context(|| {
            format!("No label rule for uid {uid}, hint {hint:?}, name {name:?}")
        })?;
        self.write_context(context)
    }

    fn set_fixed(&self, context: &str) -> Result {
        self.write_context(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(seinfo: Option<&str>, min_uid: Option<u32>, context: &str) -> LabelRule {
        LabelRule {
            seinfo: seinfo.map(str::to_string),
            name_prefix: None,
            min_uid,
            max_uid: None,
            context: context.to_string(),
        }
    }

    fn labeler(rules: Vec<LabelRule>, dir: &Path) -> SelinuxLabeler {
        SelinuxLabeler::with_paths(rules, dir.to_path_buf(), dir.join("current")).unwrap()
    }

    #[test]
    fn first_matching_rule_wins() {
        let dir = tempfile::tempdir().unwrap();
        let l = labeler(
            vec![
                rule(Some("platform"), None, "u:r:platform_app:s0"),
                rule(None, Some(10000), "u:r:untrusted_app:s0"),
                rule(None, None, "u:r:system_app:s0"),
            ],
            dir.path(),
        );
        assert_eq!(l.resolve(10057, Some("platform:targetSdkVersion=34"), None), Some("u:r:platform_app:s0"));
        assert_eq!(l.resolve(10057, Some("default"), None), Some("u:r:untrusted_app:s0"));
        assert_eq!(l.resolve(1000, None, None), Some("u:r:system_app:s0"));
    }

    #[test]
    fn context_is_written_when_selinux_is_present() {
        let dir = tempfile::tempdir().unwrap();
        let l = labeler(vec![rule(None, None, "u:r:untrusted_app:s0:c512,c768")], dir.path());
        l.set_context(10057, None, Some("com.example")).unwrap();
        let written = std::fs::read_to_string(dir.path().join("current")).unwrap();
        assert_eq!(written, "u:r:untrusted_app:s0:c512,c768");
    }

    #[test]
    fn no_selinux_means_no_write() {
        let dir = tempfile::tempdir().unwrap();
        let l = SelinuxLabeler::with_paths(
            vec![],
            dir.path().join("missing"),
            dir.path().join("current"),
        )
        .unwrap();
        l.set_fixed("u:r:system_server:s0").unwrap();
        assert!(!dir.path().join("current").exists());
    }

    #[test]
    fn malformed_contexts_are_rejected() {
        assert!(SelinuxLabeler::new(vec![rule(None, None, "not a context")]).is_err());
        let dir = tempfile::tempdir().unwrap();
        let l = labeler(vec![rule(Some("x"), None, "u:r:a:s0")], dir.path());
        assert!(l.set_context(10057, Some("y"), None).is_err());
    }
}
