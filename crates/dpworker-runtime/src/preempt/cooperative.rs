//! Flag-based preemption
//!
//! Requests are only recorded; the job notices them at its next safe point
//! (`JobContext::preempt_point`) or when a critical section closes. Jobs
//! that never reach a safe point are never preempted.

use std::sync::Arc;

use dpworker_core::EngineResult;

use super::{PreemptState, PreemptionKind, PreemptionStrategy};

#[derive(Debug, Default)]
pub struct CooperativePreemption;

impl CooperativePreemption {
    pub fn new() -> Self {
        Self
    }
}

impl PreemptionStrategy for CooperativePreemption {
    fn kind(&self) -> PreemptionKind {
        PreemptionKind::Cooperative
    }

    fn install(&self, _state: &Arc<PreemptState>) -> EngineResult<()> {
        Ok(())
    }

    fn deliver(&self, _state: &PreemptState) -> EngineResult<()> {
        // The request flag is the delivery
        Ok(())
    }
}
