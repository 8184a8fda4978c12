//! Error types for the dpworker engine

use core::fmt;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the worker engine
///
/// Anything reaching the worker loop as an `EngineError` is fatal to that
/// loop; recoverable conditions (reply send failures, malformed frames)
/// are absorbed before they get this far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Execution context could not be entered or resumed
    Context(ContextError),

    /// Fixed-size pool could not satisfy a request
    Pool(PoolError),

    /// Stack/region mapping failed
    Memory(MemoryError),

    /// Worker thread setup failed
    Worker(WorkerError),

    /// Transmission path reported an error
    Net(String),

    /// Platform-specific error (errno)
    Platform(i32),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Context(e) => write!(f, "context error: {}", e),
            EngineError::Pool(e) => write!(f, "pool error: {}", e),
            EngineError::Memory(e) => write!(f, "memory error: {}", e),
            EngineError::Worker(e) => write!(f, "worker error: {}", e),
            EngineError::Net(msg) => write!(f, "net error: {}", msg),
            EngineError::Platform(code) => write!(f, "platform error: {}", code),
        }
    }
}

impl std::error::Error for EngineError {}

/// Execution context errors
///
/// These correspond to a failed switch: the worker cannot know what state
/// the job is in afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Handle does not name a live job (retired, or never issued)
    InvalidHandle { slot: u32, generation: u32 },

    /// Job exists but is not in a state that can be switched into
    InvalidState { slot: u32, state: &'static str },

    /// All job slots are occupied by running or suspended jobs
    NoSlotsAvailable,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::InvalidHandle { slot, generation } => {
                write!(f, "invalid job handle {}.{}", slot, generation)
            }
            ContextError::InvalidState { slot, state } => {
                write!(f, "job slot {} cannot be entered from state {}", slot, state)
            }
            ContextError::NoSlotsAvailable => write!(f, "no job slots available"),
        }
    }
}

impl std::error::Error for ContextError {}

impl From<ContextError> for EngineError {
    fn from(e: ContextError) -> Self {
        EngineError::Context(e)
    }
}

/// Mempool errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is currently handed out
    Exhausted,

    /// Pool was created with zero capacity or zero-sized slots
    InvalidConfig,

    /// Data does not fit into one slot
    TooLarge { len: usize, slot_size: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => write!(f, "pool exhausted"),
            PoolError::InvalidConfig => write!(f, "invalid pool configuration"),
            PoolError::TooLarge { len, slot_size } => {
                write!(f, "{} bytes do not fit a {} byte slot", len, slot_size)
            }
        }
    }
}

impl std::error::Error for PoolError {}

impl From<PoolError> for EngineError {
    fn from(e: PoolError) -> Self {
        EngineError::Pool(e)
    }
}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect failed
    ProtectionFailed,

    /// Requested region size overflows
    TooManySlots,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::TooManySlots => write!(f, "too many slots requested"),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for EngineError {
    fn from(e: MemoryError) -> Self {
        EngineError::Memory(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,

    /// Failed to set thread affinity
    AffinityFailed,

    /// Signal setup failed
    SignalSetupFailed,

    /// Preemption request could not be delivered
    SignalDeliveryFailed,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::AffinityFailed => write!(f, "failed to set thread affinity"),
            WorkerError::SignalSetupFailed => write!(f, "signal setup failed"),
            WorkerError::SignalDeliveryFailed => write!(f, "preemption signal delivery failed"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<WorkerError> for EngineError {
    fn from(e: WorkerError) -> Self {
        EngineError::Worker(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Pool(PoolError::Exhausted);
        assert_eq!(format!("{}", err), "pool error: pool exhausted");

        let err: EngineError = ContextError::InvalidHandle { slot: 3, generation: 7 }.into();
        assert_eq!(format!("{}", err), "context error: invalid job handle 3.7");
    }

    #[test]
    fn test_error_conversion() {
        let err: EngineError = MemoryError::AllocationFailed.into();
        assert!(matches!(err, EngineError::Memory(MemoryError::AllocationFailed)));

        let err: EngineError = WorkerError::SignalSetupFailed.into();
        assert!(matches!(err, EngineError::Worker(WorkerError::SignalSetupFailed)));
    }
}
