use std::panic::Location;

/// Something that ends the process when a fork-path step cannot proceed.
///
/// Every failure after fork and before the handoff to the caller is fatal,
/// so implementations never return.
pub trait Failure {
    fn fail(&self, msg: String) -> !;
}

/// Logs the message and aborts. The default for every engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnFailure;

impl Failure for AbortOnFailure {
    fn fail(&self, msg: String) -> ! {
        error!("{msg}");
        log::logger().flush();
        std::process::abort()
    }
}

/// Prefixes failures with the process name being specialized.
pub struct NamedFailure<'a> {
    name: &'a str,
    inner: &'a dyn Failure,
}

impl<'a> NamedFailure<'a> {
    pub fn new(name: &'a str, inner: &'a dyn Failure) -> Self {
        Self { name, inner }
    }
}

impl Failure for NamedFailure<'_> {
    fn fail(&self, msg: String) -> ! {
        if self.name.is_empty() {
            self.inner.fail(msg)
        } else {
            self.inner.fail(format!("({}) {msg}", self.name))
        }
    }
}

pub trait OrFail<T> {
    /// Unwraps or hands the error to `failure`, stamped with the caller's
    /// file and line.
    fn or_fail(self, failure: &dyn Failure) -> T;
}

impl<T> OrFail<T> for anyhow::Result<T> {
    #[track_caller]
    fn or_fail(self, failure: &dyn Failure) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                let loc = Location::caller();
                failure.fail(format!("{}:{}: {e:#}", loc.file(), loc.line()))
            }
        }
    }
}

pub mod prelude {
    pub use super::{Failure, OrFail};
    pub use anyhow::{anyhow, bail, Context};
    use std::result::Result as StdResult;
    pub type Result<T = (), E = anyhow::Error> = StdResult<T, E>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use super::Failure;

    /// Records the message and unwinds, so tests can catch it.
    #[derive(Default)]
    pub struct PanicOnFailure {
        pub last: RefCell<Option<String>>,
    }

    impl Failure for PanicOnFailure {
        fn fail(&self, msg: String) -> ! {
            *self.last.borrow_mut() = Some(msg.clone());
            panic!("{msg}")
        }
    }
}
