use crate::error::prelude::*;

use super::request::RuntimeFlags;

/// What hooks get to see of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFlags {
    pub runtime_flags: RuntimeFlags,
    pub is_supervisor: bool,
    pub is_spawner: bool,
    pub instruction_set: Option<String>,
}

/// Caller-supplied setup run after the engine's own specialization.
pub trait PostForkHooks {
    fn on_supervisor(&self, _flags: &HookFlags) -> Result {
        Ok(())
    }

    fn on_worker(&self, _flags: &HookFlags) -> Result {
        Ok(())
    }
}

pub struct NoHooks;

impl PostForkHooks for NoHooks {}
