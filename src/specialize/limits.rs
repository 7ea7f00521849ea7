use nix::sys::resource::{getrlimit, setrlimit, Resource};

use crate::{error::prelude::*, sys};

use super::request::{RLimit, RuntimeFlags};

pub const PRIORITY_MAX: i32 = -20;
pub const PRIORITY_MIN: i32 = 19;
pub const PRIORITY_DEFAULT: i32 = 0;

const SUID_DUMP_USER: i32 = 1;
const SUID_DUMP_ROOT: i32 = 2;

pub fn set_rlimits(limits: &[RLimit]) -> Result {
    for limit in limits {
        setrlimit(limit.resource.into(), limit.soft, limit.hard).with_context(|| {
            format!(
                "setrlimit({:?}, {}, {}) failed",
                limit.resource, limit.soft, limit.hard
            )
        })?;
    }
    Ok(())
}

pub fn set_priority(priority: i32) -> Result {
    sys::set_priority(priority).with_context(|| format!("setpriority({priority}) failed"))
}

pub fn set_default_scheduler() -> Result {
    sys::set_default_scheduler().context("Couldn't set SCHED_OTHER")
}

/// The dumpable value to apply, if it has to change.
///
/// Apps never inherit root-only dumps; the debug flags turn dumps back on.
pub fn dumpable_target(current: i32, uid: u32, first_app_uid: u32, flags: RuntimeFlags) -> Option<i32> {
    if flags.intersects(RuntimeFlags::DEBUG_ENABLE_PTRACE | RuntimeFlags::PROFILE_FROM_SHELL) {
        return (current != SUID_DUMP_USER).then_some(SUID_DUMP_USER);
    }
    if current == SUID_DUMP_ROOT && uid >= first_app_uid {
        return Some(0);
    }
    None
}

/// Applies the dumpable policy and consumes the debug flags it handles.
pub fn apply_debuggability(
    uid: u32,
    first_app_uid: u32,
    flags: RuntimeFlags,
    keep_core_dumps: bool,
) -> Result<RuntimeFlags> {
    let current = sys::get_dumpable().context("prctl(PR_GET_DUMPABLE) failed")?;
    if let Some(target) = dumpable_target(current, uid, first_app_uid, flags) {
        sys::set_dumpable(target)
            .with_context(|| format!("prctl(PR_SET_DUMPABLE, {target}) failed"))?;
    }

    if flags.contains(RuntimeFlags::DEBUG_ENABLE_PTRACE) {
        enable_debugger(keep_core_dumps)?;
    }

    Ok(flags - (RuntimeFlags::DEBUG_ENABLE_PTRACE | RuntimeFlags::PROFILE_FROM_SHELL))
}

fn enable_debugger(keep_core_dumps: bool) -> Result {
    match sys::set_ptracer_any() {
        Ok(()) | Err(nix::errno::Errno::EINVAL) => {}
        Err(e) => return Err(e).context("prctl(PR_SET_PTRACER, PR_SET_PTRACER_ANY) failed"),
    }
    if !keep_core_dumps {
        let (_, hard) = getrlimit(Resource::RLIMIT_CORE).context("getrlimit(RLIMIT_CORE) failed")?;
        setrlimit(Resource::RLIMIT_CORE, 0, hard).context("setrlimit(RLIMIT_CORE) failed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apps_lose_root_dumps() {
        assert_eq!(dumpable_target(2, 10001, 10000, RuntimeFlags::empty()), Some(0));
        assert_eq!(dumpable_target(2, 1000, 10000, RuntimeFlags::empty()), None);
        assert_eq!(dumpable_target(1, 10001, 10000, RuntimeFlags::empty()), None);
    }

    #[test]
    fn debug_flags_force_dumps_on() {
        assert_eq!(
            dumpable_target(2, 10001, 10000, RuntimeFlags::DEBUG_ENABLE_PTRACE),
            Some(1)
        );
        assert_eq!(dumpable_target(0, 10001, 10000, RuntimeFlags::PROFILE_FROM_SHELL), Some(1));
        assert_eq!(dumpable_target(1, 10001, 10000, RuntimeFlags::PROFILE_FROM_SHELL), None);
    }
}
