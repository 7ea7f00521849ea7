//! The engine kills itself when the supervisor exits.

use std::collections::VecDeque;

use forkserver::pool::{
    reaper::{self, ChildExit, ChildWaiter},
    PoolRegistry,
};
use nix::{
    sys::{
        signal::Signal,
        wait::{waitpid, WaitStatus},
    },
    unistd::{ForkResult, Pid},
};

struct Scripted(VecDeque<ChildExit>);

impl ChildWaiter for Scripted {
    fn next_exit(&mut self) -> Option<ChildExit> {
        self.0.pop_front()
    }
}

#[test]
fn supervisor_exit_terminates_the_engine() {
    match unsafe { nix::unistd::fork() }.unwrap() {
        ForkResult::Child => {
            let supervisor = Pid::from_raw(42);
            reaper::set_supervisor_pid(supervisor);
            let pool = PoolRegistry::new();
            let mut waiter = Scripted(VecDeque::from([
                ChildExit::Exited(Pid::from_raw(41), 0),
                ChildExit::Exited(supervisor, 1),
            ]));
            let summary = reaper::reap_children(&mut waiter, &pool, reaper::supervisor_pid());
            if !summary.supervisor_exited || summary.reaped != 2 {
                unsafe { libc::_exit(3) }
            }
            reaper::handle_summary(&summary, -1);
            // Only reached if the escalation merely logged.
            unsafe { libc::_exit(0) }
        }
        ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
            WaitStatus::Signaled(pid, Signal::SIGKILL, _) => assert_eq!(pid, child),
            other => panic!("Engine was not killed: {other:?}"),
        },
    }
}
