//! A process-spawning engine: forks from a warmed-up parent, scrubs what the
//! child inherited and specializes it into one sandboxed process.

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde;

pub mod config;
pub mod engine;
pub mod error;
pub mod fd;
pub mod logging;
pub mod pool;
pub mod spawn;
pub mod specialize;
pub mod storage;
mod sys;

pub use config::EngineConfig;
pub use engine::{Engine, ForkFds};
pub use specialize::{PostForkHooks, SpecializationRequest};
