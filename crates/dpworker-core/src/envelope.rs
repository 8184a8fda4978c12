//! Units exchanged between dispatcher and worker

use core::fmt;

use crate::mempool::PoolBuf;

/// Opaque resumption token for a job parked on a worker.
///
/// Names a job slot plus the generation it was issued under, so a handle
/// that outlives its job is detected instead of resuming a stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    slot: u32,
    generation: u32,
}

impl JobHandle {
    /// Handle reported for envelopes that never got a job (malformed
    /// frames). No job table resolves it.
    pub const DETACHED: JobHandle = JobHandle::new(u32::MAX, 0);

    #[inline]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    #[inline]
    pub const fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}.{}", self.slot, self.generation)
    }
}

/// What an envelope asks the worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    NewPacket,
    ResumeContext,
}

/// Envelope payload
#[derive(Debug)]
pub enum Work {
    /// Raw received frame; ownership passes to the worker
    Packet(PoolBuf),
    /// Job previously reported as preempted
    Resume(JobHandle),
}

/// Dispatcher → worker unit of work
#[derive(Debug)]
pub struct Envelope {
    pub work: Work,
    /// Receive time, carried through to the outcome untouched
    pub timestamp: u64,
    /// Request class tag, carried through to the outcome untouched
    pub class: u32,
}

impl Envelope {
    pub fn packet(frame: PoolBuf, timestamp: u64, class: u32) -> Self {
        Self { work: Work::Packet(frame), timestamp, class }
    }

    pub fn resume(handle: JobHandle, timestamp: u64, class: u32) -> Self {
        Self { work: Work::Resume(handle), timestamp, class }
    }

    /// Rebuild the envelope that resumes a preempted outcome
    pub fn resume_from(outcome: &Outcome) -> Self {
        Self::resume(outcome.handle, outcome.timestamp, outcome.class)
    }

    #[inline]
    pub fn category(&self) -> Category {
        match self.work {
            Work::Packet(_) => Category::NewPacket,
            Work::Resume(_) => Category::ResumeContext,
        }
    }
}

/// How a scheduling turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Job ran to completion (or had nothing to do); its handle is retired
    Finished,
    /// Job was suspended and can be resumed with its handle
    Preempted,
}

/// Worker → dispatcher report, one per consumed envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub timestamp: u64,
    pub class: u32,
    pub handle: JobHandle,
    pub status: JobStatus,
}

impl Outcome {
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::Mempool;

    #[test]
    fn test_category() {
        let pool = Mempool::new("env", 1, 64).unwrap();
        let env = Envelope::packet(pool.acquire().unwrap(), 10, 2);
        assert_eq!(env.category(), Category::NewPacket);

        let env = Envelope::resume(JobHandle::new(1, 1), 10, 2);
        assert_eq!(env.category(), Category::ResumeContext);
    }

    #[test]
    fn test_resume_from_preserves_tags() {
        let out = Outcome {
            timestamp: 77,
            class: 3,
            handle: JobHandle::new(4, 9),
            status: JobStatus::Preempted,
        };
        let env = Envelope::resume_from(&out);
        assert_eq!(env.timestamp, 77);
        assert_eq!(env.class, 3);
        assert!(matches!(env.work, Work::Resume(h) if h == JobHandle::new(4, 9)));
    }
}
