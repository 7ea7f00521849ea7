//! A warm worker's child must start with an empty pool registry.

use std::{fs::File, io::Read};

use forkserver::{
    error::Failure,
    fd::{open_fds, Allowlist},
    pool::POOL,
    spawn::ForkController,
};
use nix::unistd::Pid;

struct PanicOnFailure;

impl Failure for PanicOnFailure {
    fn fail(&self, msg: String) -> ! {
        panic!("{msg}")
    }
}

#[test]
fn forked_child_sees_no_pool_slots() {
    POOL.insert(Pid::from_raw(500), 9).unwrap();
    assert_eq!(POOL.count(), 1);

    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    // Only the bookkeeping is under test, not the allowlist.
    let ignore: Vec<i32> = open_fds().unwrap().into_iter().collect();
    let mut forker = ForkController::new(Allowlist::with_defaults(), "/memfd:jit-zygote-cache");

    let pid = forker.fork_and_run(false, &[], &ignore, &PanicOnFailure);
    if pid.as_raw() == 0 {
        let clean = POOL.count() == 0 && POOL.entries().is_empty();
        let _ = nix::unistd::write(&write_end, &[clean as u8]);
        unsafe { libc::_exit(0) }
    }
    drop(write_end);

    let mut verdict = [0u8; 1];
    File::from(read_end).read_exact(&mut verdict).unwrap();
    assert_eq!(verdict[0], 1, "child inherited pool slots");
    assert!(pid.as_raw() > 0);
    assert_ne!(pid, Pid::from_raw(500));

    // The parent's own registry is untouched.
    assert_eq!(POOL.count(), 1);
    assert_eq!(POOL.entries()[0].pid, Pid::from_raw(500));
    POOL.invalidate_all();
}
