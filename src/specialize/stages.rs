/// Specialization steps, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    KeepCapabilities,
    InheritableCapabilities,
    BoundingSet,
    ShimDecision,
    Storage,
    ProcessGroup,
    GroupsAndLimits,
    ShimPreinit,
    GidAndFilter,
    Uid,
    Dumpable,
    LayoutWorkaround,
    Capabilities,
    Scheduler,
    QuiesceLogging,
    SecurityLabel,
    ThreadName,
    ChildSignals,
    Hooks,
}

/// Asserts in debug builds that stages only move forward.
#[derive(Debug, Default)]
pub struct StageTracker {
    last: Option<Stage>,
}

impl StageTracker {
    pub fn enter(&mut self, stage: Stage) {
        debug_assert!(
            self.last.map_or(true, |last| last < stage),
            "specialization stage {stage:?} entered after {:?}",
            self.last
        );
        trace!("Specialization stage {stage:?}");
        self.last = Some(stage);
    }

    pub fn last(&self) -> Option<Stage> {
        self.last
    }
}
