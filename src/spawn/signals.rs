use nix::sys::signal::{SigSet, SigmaskHow, Signal};

use crate::error::prelude::*;

fn change_mask(how: SigmaskHow, signal: Signal) -> Result {
    let mut set = SigSet::empty();
    set.add(signal);
    nix::sys::signal::sigprocmask(how, Some(&set), None)
        .with_context(|| format!("sigprocmask({how:?}, {signal}) failed"))
}

pub fn block(signal: Signal) -> Result {
    change_mask(SigmaskHow::SIG_BLOCK, signal)
}

pub fn unblock(signal: Signal) -> Result {
    change_mask(SigmaskHow::SIG_UNBLOCK, signal)
}

/// Whether `signal` is blocked on the calling thread.
pub fn is_blocked(signal: Signal) -> Result<bool> {
    let mut current = SigSet::empty();
    nix::sys::signal::sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current))
        .context("Couldn't read signal mask")?;
    Ok(current.contains(signal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_and_unblock_round_trip() {
        // Test threads have their own masks, so this does not leak.
        block(Signal::SIGUSR2).unwrap();
        assert!(is_blocked(Signal::SIGUSR2).unwrap());
        unblock(Signal::SIGUSR2).unwrap();
        assert!(!is_blocked(Signal::SIGUSR2).unwrap());
    }
}
