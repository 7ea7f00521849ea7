use std::{
    fs::File,
    io::{BufRead, Write},
    mem::ManuallyDrop,
    os::{
        fd::{FromRawFd, IntoRawFd},
        unix::net::UnixStream,
    },
};

use forkserver::{
    error::prelude::*,
    pool::{self, SlotEntry, POOL, POOL_CAPACITY},
    spawn::signals,
    specialize::NoHooks,
    Engine,
};
use nix::sys::signal::Signal;

use super::{worker_side, ClientMessage, ServerMessage, SpawnCommand};

pub struct Daemon {
    engine: Engine,
    /// Held open so every child inherits them.
    _preloaded: Vec<File>,
}

impl Daemon {
    pub fn new(mut engine: Engine) -> Result<Self> {
        // stdin and stdout carry the protocol, children must not see them.
        engine.close_across_fork(0);
        engine.close_across_fork(1);
        engine.keep_across_fork(2);

        engine.mark_opened_files_before_preload()?;
        let preloaded = engine
            .config()
            .preload_files
            .iter()
            .map(|path| {
                File::open(path).with_context(|| format!("Couldn't preload {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        engine.allow_files_opened_by_preload()?;
        if !preloaded.is_empty() {
            info!("Preloaded {} files", preloaded.len());
        }

        Ok(Self {
            engine,
            _preloaded: preloaded,
        })
    }

    /// Serves client messages until `Stop` or end of input.
    pub fn run(&mut self, input: &mut impl BufRead) -> Result {
        loop {
            self.log_reaped();
            let Some(msg) = ClientMessage::wait_for(input)? else {
                info!("Client closed input, stopping");
                self.engine.empty_pool();
                return Ok(());
            };
            debug!("Received {msg:?}");
            let reply = self
                .handle(msg)
                .unwrap_or_else(|e| ServerMessage::Error(format!("{e:#}")));
            reply.send()?;
            if reply == ServerMessage::Stopped {
                return Ok(());
            }
        }
    }

    fn log_reaped(&self) {
        match pool::take_events() {
            Ok(0) => {}
            Ok(n) => info!("{n} pool workers exited, {} pooled", self.engine.pool_count()),
            Err(e) => warn!("{e:#}"),
        }
    }

    fn handle(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        Ok(match msg {
            ClientMessage::Spawn(cmd) => self.spawn(&cmd)?,
            ClientMessage::Supervise(cmd) => {
                let pid = self.engine.fork_supervisor(&cmd.request, &NoHooks);
                if pid.as_raw() == 0 {
                    worker_side::exec_command(&cmd);
                }
                ServerMessage::SupervisorStarted(pid.as_raw())
            }
            ClientMessage::FillPool(target) => self.fill_pool(target)?,
            ClientMessage::EmptyPool => ServerMessage::PoolEmptied(self.engine.empty_pool()),
            ClientMessage::Status => ServerMessage::Status {
                pooled: self.engine.pool_count(),
                security_enforced: self.engine.security_enforced(),
            },
            ClientMessage::Stop => {
                self.engine.empty_pool();
                ServerMessage::Stopped
            }
        })
    }

    fn spawn(&mut self, cmd: &SpawnCommand) -> Result<ServerMessage> {
        if let Some(pid) = self.claim_worker(cmd)? {
            return Ok(ServerMessage::Spawned(pid, true));
        }
        let pid = self
            .engine
            .fork_and_specialize(&cmd.request, &[], &[], &NoHooks);
        if pid.as_raw() == 0 {
            worker_side::exec_command(cmd);
        }
        Ok(ServerMessage::Spawned(pid.as_raw(), false))
    }

    /// Hands `cmd` to a warm worker. SIGCHLD stays blocked so the reaper
    /// cannot close the report fd mid-claim.
    fn claim_worker(&self, cmd: &SpawnCommand) -> Result<Option<i32>> {
        if self.engine.pool_count() == 0 {
            return Ok(None);
        }
        let line = serde_json::to_string(cmd).context("Couldn't serialize spawn request")?;
        signals::block(Signal::SIGCHLD)?;
        let res = POOL
            .entries()
            .into_iter()
            .find_map(|entry| self.try_claim(entry, &line));
        signals::unblock(Signal::SIGCHLD)?;
        Ok(res)
    }

    fn try_claim(&self, entry: SlotEntry, line: &str) -> Option<i32> {
        let mut channel = ManuallyDrop::new(unsafe { File::from_raw_fd(entry.report_fd) });
        if let Err(e) = writeln!(channel, "{line}") {
            warn!("Couldn't hand request to pool worker {}: {e}", entry.pid);
            self.engine.remove_pool_worker(entry.pid);
            return None;
        }
        let reported = pool::read_report(entry.report_fd);
        self.engine.remove_pool_worker(entry.pid);
        match reported {
            Ok(Some(pid)) => Some(pid),
            Ok(None) => {
                warn!("Pool worker {} exited before reporting", entry.pid);
                None
            }
            Err(e) => {
                warn!("{e:#}");
                None
            }
        }
    }

    fn fill_pool(&mut self, target: u32) -> Result<ServerMessage> {
        if target as usize > POOL_CAPACITY {
            bail!("Pool holds at most {POOL_CAPACITY} workers, {target} requested");
        }
        while self.engine.pool_count() < target {
            let (report, worker) =
                UnixStream::pair().context("Couldn't create pool worker channel")?;
            let (report_fd, worker_fd) = (report.into_raw_fd(), worker.into_raw_fd());
            let pid = self
                .engine
                .fork_pool_worker(report_fd, worker_fd, &[], false)?;
            if pid.as_raw() == 0 {
                worker_side::run_pool_worker(&self.engine, worker_fd);
            }
        }
        Ok(ServerMessage::PoolFilled(self.engine.pool_count()))
    }
}
