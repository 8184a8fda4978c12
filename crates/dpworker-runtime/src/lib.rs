//! # dpworker-runtime
//!
//! Platform-specific engine of the dpworker request executor.
//!
//! This crate provides:
//! - Job stacks (mmap with guard pages)
//! - Context switching (architecture-specific assembly)
//! - Preemption (SIGURG or cooperative flag)
//! - The per-core worker loop and worker threads
//! - The dispatcher feeding workers through their mailboxes

pub mod config;
pub mod memory;
pub mod arch;
pub mod preempt;
pub mod job;
pub mod work;
pub mod worker;
pub mod dispatcher;

// Re-exports
pub use config::{ConfigError, EngineConfig};
pub use dispatcher::{DispatchMonitor, DispatchStats, Dispatcher, Ingress};
pub use job::{JobContext, JobCounters};
pub use preempt::{CriticalSection, PreemptHandle, PreemptState, PreemptionKind, PreemptionStrategy};
pub use work::{AppWork, KvWork, SpinWork};
pub use worker::{Worker, WorkerMonitor, WorkerPool, WorkerServices, WorkerStats};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
