use std::{
    fs::File,
    io::{BufRead, BufReader},
    os::{
        fd::{FromRawFd, RawFd},
        unix::process::CommandExt,
    },
    process::Command,
};

use forkserver::{error::prelude::*, logging, pool, specialize::NoHooks, Engine};

use super::SpawnCommand;

/// Replaces the process image. Only returns by exiting.
pub fn exec_command(cmd: &SpawnCommand) -> ! {
    let err = Command::new(&cmd.program)
        .args(&cmd.args)
        .envs(&cmd.env)
        .exec();
    error!("Couldn't exec {}: {err}", cmd.program);
    std::process::exit(127)
}

/// Waits on `worker_fd` for a spawn request, specializes, reports its pid
/// and execs.
pub fn run_pool_worker(engine: &Engine, worker_fd: RawFd) -> ! {
    logging::set_tag("pool-worker");
    match _run_pool_worker(engine, worker_fd) {
        Ok(Some(cmd)) => exec_command(&cmd),
        Ok(None) => {
            debug!("Pool channel closed, exiting");
            std::process::exit(0)
        }
        Err(e) => {
            error!("{e:?}");
            std::process::exit(1)
        }
    }
}

fn _run_pool_worker(engine: &Engine, worker_fd: RawFd) -> Result<Option<SpawnCommand>> {
    let channel = unsafe { File::from_raw_fd(worker_fd) };
    let mut reader = BufReader::new(channel);
    let mut line = String::new();
    if reader
        .read_line(&mut line)
        .context("Couldn't read spawn request")?
        == 0
    {
        return Ok(None);
    }
    let cmd: SpawnCommand =
        serde_json::from_str(&line).context("Couldn't deserialize spawn request")?;

    engine.block_sigterm();
    engine.specialize_pool_worker(&cmd.request, &NoHooks);
    pool::write_report(worker_fd, nix::unistd::getpid().as_raw())?;
    drop(reader);
    engine.unblock_sigterm();
    Ok(Some(cmd))
}
