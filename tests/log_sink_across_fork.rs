//! Lines logged while a fork is being prepared must not leave the engine's
//! log file open in the child.

use std::{fs::File, io::Read, path::Path};

use forkserver::{
    error::Failure,
    fd::{open_fds, Allowlist},
    logging::{self, EngineLogger},
    spawn::ForkController,
};

struct PanicOnFailure;

impl Failure for PanicOnFailure {
    fn fail(&self, msg: String) -> ! {
        panic!("{msg}")
    }
}

fn holds_open(path: &Path) -> bool {
    open_fds().unwrap().into_iter().any(|fd| {
        std::fs::read_link(format!("/proc/self/fd/{fd}")).ok().as_deref() == Some(path)
    })
}

#[test]
fn child_does_not_inherit_the_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = std::fs::canonicalize(dir.path()).unwrap().join("engine.log");
    std::env::set_var("FORKSERVER_LOG_FILE", &log_path);
    std::env::set_var("FORKSERVER_LOG", "debug");
    EngineLogger::setup("log-sink").unwrap();

    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let ignore: Vec<i32> = open_fds().unwrap().into_iter().collect();
    let mut forker = ForkController::new(Allowlist::with_defaults(), "/memfd:jit-zygote-cache");

    // The first fork logs the snapshot it takes.
    let pid = forker.fork_and_run(false, &[], &ignore, &PanicOnFailure);
    if pid.as_raw() == 0 {
        let leaked = holds_open(&log_path);
        let _ = nix::unistd::write(&write_end, &[leaked as u8]);
        unsafe { libc::_exit(0) }
    }
    drop(write_end);

    let mut verdict = [0u8; 1];
    File::from(read_end).read_exact(&mut verdict).unwrap();
    assert_eq!(verdict[0], 0, "child holds the engine log file");

    // Once the fork is done the sink works again.
    log::info!("after fork");
    logging::quiesce();
    let written = std::fs::read_to_string(&log_path).unwrap();
    assert!(written.contains("[log-sink][INFO]: after fork"), "{written}");
    assert!(!written.contains("Snapshotted"), "{written}");
}
