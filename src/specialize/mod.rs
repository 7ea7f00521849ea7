//! Turning a freshly forked, fully privileged child into one restricted
//! process.

use nix::unistd::getpid;

use crate::{
    config::EngineConfig,
    error::{prelude::*, NamedFailure},
    logging,
    pool::reaper,
    storage::{MountOps, NamespaceBuilder},
};

mod caps;
mod cgroup;
mod compat;
mod hooks;
mod identity;
mod label;
mod limits;
mod name;
mod request;
mod seccomp;
mod stages;
mod syscalls;

pub use caps::{AppGrant, Capabilities, CapabilityConfig, CapabilityPolicy, GidGrant};
pub use compat::{IsaConfig, ShimDecision};
pub use hooks::{HookFlags, NoHooks, PostForkHooks};
pub use label::{LabelRule, Labeler, SelinuxLabeler};
pub use limits::{set_priority, PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN};
pub use name::{set_thread_name, truncated_name};
pub use request::{
    CapabilityMasks, LimitResource, RLimit, RuntimeFlags, SpecializationRequest, StorageMode,
    StorageRequest,
};
pub use seccomp::{
    compile_id_range_filter, install_filter, BpfConfig, CompiledFilters, FilterAction, Profile,
    SeccompProfiles,
};
pub use stages::{Stage, StageTracker};

/// Capability sets actually applied for a request: permitted is widened by
/// the bounding grant and doubles as the inheritable set. Effective is
/// applied exactly as requested.
pub fn applied_capabilities(masks: &CapabilityMasks) -> (Capabilities, Capabilities, Capabilities) {
    let permitted = masks.permitted | masks.bounding;
    (permitted, masks.effective, permitted)
}

/// Everything a child needs to specialize itself, borrowed from the engine.
pub struct Specializer<'a> {
    pub config: &'a EngineConfig,
    pub filters: &'a CompiledFilters,
    pub security_enforced: bool,
    pub labeler: &'a dyn Labeler,
    pub mounts: &'a dyn MountOps,
    pub failure: &'a dyn Failure,
}

impl Specializer<'_> {
    /// Runs every specialization step in order. Any failure ends the process.
    pub fn specialize(&self, req: &SpecializationRequest, hooks: &dyn PostForkHooks) {
        let name = req.process_name().to_string();
        let fail = NamedFailure::new(&name, self.failure);
        let mut stage = StageTracker::default();
        let (permitted, effective, inheritable) = applied_capabilities(&req.capabilities);

        stage.enter(Stage::KeepCapabilities);
        if req.uid != 0 {
            caps::set_keep_capabilities(true).or_fail(&fail);
        }

        stage.enter(Stage::InheritableCapabilities);
        caps::set_inheritable(inheritable).or_fail(&fail);

        stage.enter(Stage::BoundingSet);
        caps::drop_bounding_set(req.capabilities.bounding).or_fail(&fail);

        stage.enter(Stage::ShimDecision);
        let shim = compat::shim_decision(
            &self.config.isa_shim,
            req.is_supervisor,
            req.instruction_set.as_deref(),
            req.app_data_dir.as_deref(),
        );

        stage.enter(Stage::Storage);
        NamespaceBuilder::new(self.mounts, &self.config.storage, self.config.per_user_range)
            .mount_storage(
                req.uid,
                req.storage.mode,
                shim.is_enabled(),
                req.storage.package_name.as_deref(),
                &req.storage.packages_for_uid,
                req.storage.sandbox_id.as_deref(),
            )
            .or_fail(&fail);

        stage.enter(Stage::ProcessGroup);
        if let Err(e) = cgroup::create_process_group(&self.config.cgroup_root, req.uid, getpid()) {
            warn!("Process group assignment failed: {e:#}");
        }

        stage.enter(Stage::GroupsAndLimits);
        identity::set_groups(req.gids.as_deref(), req.is_spawner).or_fail(&fail);
        limits::set_rlimits(&req.rlimits).or_fail(&fail);

        stage.enter(Stage::ShimPreinit);
        if shim.is_enabled() {
            if let (Some(dir), Some(isa)) = (&req.app_data_dir, &req.instruction_set) {
                compat::pre_initialize(&self.config.isa_shim, dir, isa, self.mounts).or_fail(&fail);
            }
        }

        // The filter needs CAP_SYS_ADMIN or no_new_privs, so it goes in
        // before the uid changes.
        stage.enter(Stage::GidAndFilter);
        identity::set_gid(req.gid).or_fail(&fail);
        if self.security_enforced {
            let profile = Profile::select(req.uid, req.is_spawner, self.config.first_app_uid);
            seccomp::install_filter(self.filters.get(profile)).or_fail(&fail);
        }

        stage.enter(Stage::Uid);
        identity::set_uid(req.uid).or_fail(&fail);

        stage.enter(Stage::Dumpable);
        let runtime_flags = limits::apply_debuggability(
            req.uid,
            self.config.first_app_uid,
            req.runtime_flags,
            self.config.core_dump_debug,
        )
        .or_fail(&fail);

        stage.enter(Stage::LayoutWorkaround);
        compat::apply_aslr_workaround();

        stage.enter(Stage::Capabilities);
        caps::set_capabilities(permitted, effective, inheritable).or_fail(&fail);

        stage.enter(Stage::Scheduler);
        limits::set_default_scheduler().or_fail(&fail);
        if let Err(e) = limits::set_priority(PRIORITY_DEFAULT) {
            warn!("{e:#}");
        }

        stage.enter(Stage::QuiesceLogging);
        logging::quiesce();

        stage.enter(Stage::SecurityLabel);
        self.labeler
            .set_context(req.uid, req.label_hint.as_deref(), req.nice_name.as_deref())
            .or_fail(&fail);

        stage.enter(Stage::ThreadName);
        if let Some(nice_name) = &req.nice_name {
            set_thread_name(nice_name).or_fail(&fail);
        }

        stage.enter(Stage::ChildSignals);
        reaper::restore_default_handler().or_fail(&fail);

        stage.enter(Stage::Hooks);
        let flags = HookFlags {
            runtime_flags,
            is_supervisor: req.is_supervisor,
            is_spawner: req.is_spawner,
            instruction_set: req.instruction_set.clone(),
        };
        if req.is_supervisor {
            hooks.on_supervisor(&flags).or_fail(&fail);
            self.labeler
                .set_fixed(&self.config.supervisor_label)
                .or_fail(&fail);
        } else {
            hooks.on_worker(&flags).or_fail(&fail);
        }
        debug!("Specialized {name} as {}:{}", req.uid, req.gid);
    }
}
