//! Forking with a clean descriptor and signal state.

mod fork;
pub mod signals;

pub use fork::{is_forked_child, ForkController};
