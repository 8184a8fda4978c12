//! # dpworker-core
//!
//! Platform-agnostic building blocks of the dpworker request engine.
//!
//! ## Modules
//!
//! - `envelope` - units of work, outcomes, job handles
//! - `mailbox` - per-core SPSC dispatcher/worker handoff
//! - `mempool` - fixed-capacity buffer pool
//! - `tuple` - connection 4-tuple
//! - `wire` - 48-byte request/response record
//! - `error` - error types
//! - `logger` - stderr backend for the `log` facade
//! - `spinlock` - short non-suspending lock
//! - `env` - environment variable utilities
//! - `time` - process-monotonic nanosecond clock

pub mod envelope;
pub mod mailbox;
pub mod mempool;
pub mod tuple;
pub mod wire;
pub mod error;
pub mod logger;
pub mod spinlock;
pub mod env;
pub mod time;

// Re-exports for convenience
pub use envelope::{Category, Envelope, JobHandle, JobStatus, Outcome, Work};
pub use mailbox::{mailbox, DispatchPort, RequestFlag, ResponseFlag, WorkerPort};
pub use mempool::{Mempool, PoolBuf, PoolResult, PoolStats};
pub use tuple::IpTuple;
pub use wire::WireRecord;
pub use error::{ContextError, EngineError, EngineResult, MemoryError, PoolError, WorkerError};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool};
pub use time::now_ns;
