//! The engine: one control thread's worth of state and every spawn entry
//! point built on it.

use std::{
    collections::BTreeSet,
    os::fd::RawFd,
    path::Path,
};

use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    config::{ControlSockets, EngineConfig},
    error::{prelude::*, AbortOnFailure},
    fd::{self, Allowlist, AllowlistError},
    pool::{self, reaper, PoolError, POOL},
    spawn::{signals, ForkController},
    specialize::{
        compile_id_range_filter, install_filter, CompiledFilters, PostForkHooks,
        SelinuxLabeler, SpecializationRequest, Specializer,
    },
    storage::{self, MountOps, SystemMounts},
};

const SELINUX_ENFORCE: &str = "/sys/fs/selinux/enforce";

/// `1` in the enforce file means enforcing; without the file the configured
/// default applies.
fn enforcing_from(contents: Option<&str>, default: bool) -> bool {
    match contents.map(str::trim) {
        Some("1") => true,
        Some("0") => false,
        Some(other) => {
            warn!("Unexpected SELinux enforce value {other:?}, assuming enforcing");
            true
        }
        None => default,
    }
}

/// Descriptors extracted by preloading, allowed across every fork.
#[derive(Debug, Default)]
struct PreloadMarks {
    before: Option<BTreeSet<RawFd>>,
    allowed: Option<Vec<RawFd>>,
}

/// Fd lists for one fork: everything in `close` is detached in the child,
/// and both lists stay out of the snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ForkFds {
    pub close: Vec<RawFd>,
    pub ignore: Vec<RawFd>,
}

impl ForkFds {
    pub fn new(close: &[RawFd], ignore: &[RawFd]) -> Self {
        Self {
            close: close.to_vec(),
            ignore: ignore.to_vec(),
        }
    }

    fn close_valid(&mut self, fds: impl IntoIterator<Item = RawFd>) {
        self.close.extend(fds.into_iter().filter(|fd| *fd >= 0));
    }

    fn ignore_valid(&mut self, fds: impl IntoIterator<Item = RawFd>) {
        self.ignore.extend(fds.into_iter().filter(|fd| *fd >= 0));
    }

    fn finish(mut self) -> Self {
        self.close.sort_unstable();
        self.close.dedup();
        self.ignore.sort_unstable();
        self.ignore.dedup();
        self.ignore.retain(|fd| !self.close.contains(fd));
        self
    }
}

pub struct Engine {
    config: EngineConfig,
    sockets: ControlSockets,
    security_enforced: bool,
    filters: CompiledFilters,
    labeler: SelinuxLabeler,
    mounts: Box<dyn MountOps>,
    failure: Box<dyn Failure>,
    forker: ForkController,
    preload: PreloadMarks,
    keep_fds: BTreeSet<RawFd>,
    close_fds: BTreeSet<RawFd>,
}

impl Engine {
    /// Resolves the engine's sockets, compiles its filters and, if
    /// configured, moves it into its own mount namespace.
    pub fn init(config: EngineConfig, is_primary: bool) -> Result<Self> {
        let sockets =
            ControlSockets::from_env(&config.socket_env_prefix, &config.sockets, is_primary);
        let enforce = std::fs::read_to_string(SELINUX_ENFORCE).ok();
        let security_enforced = enforcing_from(enforce.as_deref(), config.security_enforced);
        info!(
            "Starting {} engine, security {}",
            if is_primary { "primary" } else { "secondary" },
            if security_enforced { "enforced" } else { "permissive" }
        );

        let filters = CompiledFilters::compile(&config.seccomp, config.first_app_uid)?;
        let labeler = SelinuxLabeler::new(config.label_rules.clone())?;

        let allowlist = Allowlist::with_defaults();
        for path in &config.allow_paths {
            allowlist
                .allow(path)
                .with_context(|| format!("Invalid allow path {path}"))?;
        }

        let mounts: Box<dyn MountOps> = Box::new(SystemMounts);
        if config.storage.prepare_on_init {
            storage::prepare_on_init(mounts.as_ref(), &config.storage)
                .context("Couldn't prepare storage")?;
        }

        let forker = ForkController::new(allowlist, config.singleton_marker.clone());
        Ok(Self {
            config,
            sockets,
            security_enforced,
            filters,
            labeler,
            mounts,
            failure: Box::new(AbortOnFailure),
            forker,
            preload: PreloadMarks::default(),
            keep_fds: BTreeSet::new(),
            close_fds: BTreeSet::new(),
        })
    }

    pub fn with_failure(mut self, failure: Box<dyn Failure>) -> Self {
        self.failure = failure;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sockets(&self) -> ControlSockets {
        self.sockets
    }

    pub fn security_enforced(&self) -> bool {
        self.security_enforced
    }

    fn specializer(&self) -> Specializer<'_> {
        Specializer {
            config: &self.config,
            filters: &self.filters,
            security_enforced: self.security_enforced,
            labeler: &self.labeler,
            mounts: self.mounts.as_ref(),
            failure: self.failure.as_ref(),
        }
    }

    /// Adds what every fork has to hide from the child.
    fn spawn_fds(&self, mut fds: ForkFds) -> ForkFds {
        fds.close_valid(POOL.report_fds());
        fds.close_valid([self.sockets.pool]);
        fds.close_valid(pool::existing_event_fd());
        fds.close_valid(self.close_fds.iter().copied());
        fds.ignore_valid(self.keep_fds.iter().copied());
        if let Some(allowed) = &self.preload.allowed {
            fds.ignore_valid(allowed.iter().copied());
        }
        fds.finish()
    }

    fn fork(&mut self, priority_fork: bool, fds: &ForkFds) -> Pid {
        self.forker
            .fork_and_run(priority_fork, &fds.close, &fds.ignore, self.failure.as_ref())
    }

    /// Forks and specializes an ordinary process. `0` in the child, which
    /// returns specialized.
    pub fn fork_and_specialize(
        &mut self,
        req: &SpecializationRequest,
        fds_to_close: &[RawFd],
        fds_to_ignore: &[RawFd],
        hooks: &dyn PostForkHooks,
    ) -> Pid {
        let fds = self.spawn_fds(ForkFds::new(fds_to_close, fds_to_ignore));
        let pid = self.fork(true, &fds);
        if pid.as_raw() == 0 {
            self.specializer().specialize(req, hooks);
        }
        pid
    }

    /// Forks the supervisor, whose death takes the engine down.
    pub fn fork_supervisor(&mut self, req: &SpecializationRequest, hooks: &dyn PostForkHooks) -> Pid {
        let req = SpecializationRequest {
            is_supervisor: true,
            ..req.clone()
        };
        let fds = self.spawn_fds(ForkFds::default());
        let pid = self.fork(true, &fds);
        if pid.as_raw() == 0 {
            self.specializer().specialize(&req, hooks);
            return pid;
        }

        info!("Supervisor process {pid} has been created");
        reaper::set_supervisor_pid(pid);
        // It may have died before the reaper knew whom to watch.
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                error!("Supervisor process {pid} has died ({status:?}), terminating");
                reaper::terminate_engine();
            }
            Err(e) => warn!("Couldn't check supervisor {pid}: {e}"),
        }
        pid
    }

    /// Forks an unspecialized warm worker.
    ///
    /// `report_fd` and `worker_fd` are the two ends of the worker's channel.
    /// The parent keeps `report_fd`, registered in the pool, and closes
    /// `worker_fd`; the child does the opposite. Returns `0` in the child.
    ///
    /// SIGCHLD stays blocked until the worker is registered, so a worker
    /// that dies right away is reaped against its own slot.
    pub fn fork_pool_worker(
        &mut self,
        report_fd: RawFd,
        worker_fd: RawFd,
        session_sockets: &[RawFd],
        args_known: bool,
    ) -> Result<Pid, PoolError> {
        let event_fd = self.pool_event_fd();
        let mut fds = ForkFds::new(session_sockets, &[report_fd, worker_fd]);
        fds.close_valid([self.sockets.control, event_fd]);
        if args_known {
            fds.close_valid([self.sockets.pool]);
        }
        fds.close_valid(POOL.report_fds());
        fds.close_valid(self.close_fds.iter().copied());
        fds.ignore_valid(self.keep_fds.iter().copied());
        if let Some(allowed) = &self.preload.allowed {
            fds.ignore_valid(allowed.iter().copied());
        }
        let fds = fds.finish();

        signals::block(Signal::SIGCHLD).or_fail(self.failure.as_ref());
        let pid = self.fork(false, &fds);
        let res = if pid.as_raw() == 0 {
            fd::close_checked(report_fd);
            Ok(pid)
        } else {
            fd::close_checked(worker_fd);
            register_pool_worker(pid, report_fd)
        };
        signals::unblock(Signal::SIGCHLD).or_fail(self.failure.as_ref());
        res
    }

    /// Specializes a warm worker that received its request.
    pub fn specialize_pool_worker(&self, req: &SpecializationRequest, hooks: &dyn PostForkHooks) {
        self.specializer().specialize(req, hooks);
    }

    /// Forgets a worker that was claimed by a client. Closes its report fd.
    pub fn remove_pool_worker(&self, pid: Pid) -> bool {
        POOL.remove(pid)
    }

    pub fn pool_count(&self) -> u32 {
        POOL.count()
    }

    pub fn pool_report_fds(&self) -> Vec<RawFd> {
        POOL.report_fds()
    }

    /// SIGTERMs every warm worker without waiting for them.
    pub fn empty_pool(&self) -> usize {
        let killed = POOL.drain();
        info!("Emptied pool, {killed} workers terminated");
        killed
    }

    pub fn pool_event_fd(&self) -> RawFd {
        pool::event_fd().or_fail(self.failure.as_ref())
    }

    pub fn block_sigterm(&self) {
        signals::block(Signal::SIGTERM).or_fail(self.failure.as_ref());
    }

    pub fn unblock_sigterm(&self) {
        signals::unblock(Signal::SIGTERM).or_fail(self.failure.as_ref());
    }

    /// Extra filter for nested spawners, limiting the ids their children
    /// may take.
    pub fn install_uid_gid_filter(&self, min: u32, max: u32) -> Result {
        if !self.security_enforced {
            return Ok(());
        }
        let program = compile_id_range_filter(min, max)?;
        install_filter(&program).with_context(|| format!("Couldn't restrict ids to [{min}, {max}]"))
    }

    /// Records which descriptors exist before preloading. Only the first
    /// call counts.
    pub fn mark_opened_files_before_preload(&mut self) -> Result {
        if self.preload.before.is_none() {
            self.preload.before = Some(fd::open_fds()?);
        }
        Ok(())
    }

    /// Lets every descriptor opened since the mark survive later forks.
    pub fn allow_files_opened_by_preload(&mut self) -> Result {
        if self.preload.allowed.is_some() {
            return Ok(());
        }
        let before = self
            .preload
            .before
            .as_ref()
            .context("Preload descriptors were never marked")?;
        let allowed: Vec<RawFd> = fd::open_fds()?.difference(before).copied().collect();
        debug!("Preload opened {} descriptors", allowed.len());
        self.preload.allowed = Some(allowed);
        Ok(())
    }

    /// Keeps `fd` out of the snapshot; children inherit it as is.
    pub fn keep_across_fork(&mut self, fd: RawFd) {
        self.keep_fds.insert(fd);
    }

    /// Keeps `fd` out of the snapshot and detaches it in every child.
    pub fn close_across_fork(&mut self, fd: RawFd) {
        self.close_fds.insert(fd);
    }

    pub fn allow_file_across_fork(&self, path: &str) -> Result<(), AllowlistError> {
        self.forker.allowlist().allow(path)
    }

    pub fn is_file_allowed(&self, path: &Path) -> bool {
        path.to_str()
            .is_some_and(|p| self.forker.allowlist().is_allowed(p))
    }
}

/// Hands `report_fd` to the pool. A worker that cannot be registered is
/// killed, since nothing could ever claim it.
fn register_pool_worker(pid: Pid, report_fd: RawFd) -> Result<Pid, PoolError> {
    if let Err(e) = POOL.insert(pid, report_fd) {
        warn!("Couldn't register pool worker {pid}: {e}");
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            warn!("Couldn't kill unregistered worker {pid}: {e}");
        }
        fd::close_checked(report_fd);
        return Err(e);
    }
    debug!("Pool worker {pid} registered, {} pooled", POOL.count());
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforce_file_overrides_config() {
        assert!(enforcing_from(Some("1\n"), false));
        assert!(!enforcing_from(Some("0"), true));
        assert!(enforcing_from(Some("weird"), false));
        assert!(enforcing_from(None, true));
        assert!(!enforcing_from(None, false));
    }

    #[test]
    fn fork_fds_drop_invalid_and_duplicates() {
        let mut fds = ForkFds::new(&[7, 3], &[3, 9, 9]);
        fds.close_valid([-1, 7, 11]);
        fds.ignore_valid([-1, 12]);
        let fds = fds.finish();
        assert_eq!(fds.close, vec![3, 7, 11]);
        assert_eq!(fds.ignore, vec![9, 12]);
    }
}
