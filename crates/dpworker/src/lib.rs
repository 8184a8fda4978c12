//! # dpworker - preemptible request execution engine
//!
//! The worker core of a kernel-bypass dataplane: a dispatcher core hands
//! received requests to worker cores, each of which runs every request as
//! a job on its own stack. A job that overruns its time slice is preempted,
//! parked, and later resumed where it left off, so long requests cannot
//! hold up short ones.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dpworker::{EngineConfig, Runtime, SpinWork, UdpTransport};
//!
//! dpworker::init_logging();
//! let transport = Arc::new(UdpTransport::bind("0.0.0.0:9000".parse()?)?);
//! let mut rt = Runtime::start(
//!     EngineConfig::from_env(),
//!     Arc::new(SpinWork::new()),
//!     transport,
//!     |_worker, _outcome| {},
//! )?;
//! rt.submit_frame(&frame, 0)?;
//! rt.shutdown()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//!    RX threads ──▶ Ingress (bounded MPMC)
//!                        │
//!                        ▼
//!               ┌─────────────────┐      time slice check
//!               │   Dispatcher    │──────────────────────┐
//!               └─────────────────┘                      │ preempt
//!                 │ mailbox   ▲ outcome                  ▼
//!                 ▼           │                   ┌─────────────┐
//!          ┌───────────────────────┐              │ SIGURG/flag │
//!          │  Worker (one per core)│◀─────────────┴─────────────┘
//!          │  job stacks, scheduler│
//!          └───────────────────────┘
//!                 │ reply
//!                 ▼
//!             Transport
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

// Re-export core types
pub use dpworker_core::{
    mailbox, now_ns, Category, ContextError, DispatchPort, EngineError, EngineResult, Envelope,
    IpTuple, JobHandle, JobStatus, MemoryError, Mempool, Outcome, PoolBuf, PoolError, PoolStats,
    WireRecord, Work, WorkerError, WorkerPort,
};

// Re-export logging setup and env utilities
pub use dpworker_core::logger::{init as init_logging, init_with_level as init_logging_with_level};
pub use dpworker_core::{env_get, env_get_bool};

// Re-export network edge
pub use dpworker_net::{
    build_udp_frame, extract_request, FrameError, LoopbackTransport, NetError, Transport,
    UdpTransport,
};

// Re-export runtime types
pub use dpworker_runtime::{
    AppWork, ConfigError, DispatchStats, Dispatcher, EngineConfig, Ingress, JobContext, KvWork,
    PreemptHandle, PreemptionKind, SpinWork, Worker, WorkerPool, WorkerServices, WorkerStats,
};

use dpworker_runtime::{DispatchMonitor, WorkerMonitor};

/// Errors from starting, feeding, or stopping a [`Runtime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    Config(ConfigError),
    Engine(EngineError),
    /// Ingress queue full; the frame was dropped
    Backpressure,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Config(e) => write!(f, "{}", e),
            RuntimeError::Engine(e) => write!(f, "{}", e),
            RuntimeError::Backpressure => write!(f, "ingress queue full"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<ConfigError> for RuntimeError {
    fn from(e: ConfigError) -> Self {
        RuntimeError::Config(e)
    }
}

impl From<EngineError> for RuntimeError {
    fn from(e: EngineError) -> Self {
        RuntimeError::Engine(e)
    }
}

impl From<PoolError> for RuntimeError {
    fn from(e: PoolError) -> Self {
        RuntimeError::Engine(e.into())
    }
}

impl From<WorkerError> for RuntimeError {
    fn from(e: WorkerError) -> Self {
        RuntimeError::Engine(e.into())
    }
}

/// Snapshot of the whole engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub workers: Vec<WorkerStats>,
    pub dispatch: DispatchStats,
    /// Frames refused at submission (no buffer or queue full)
    pub dropped: u64,
}

impl RuntimeStats {
    /// Sum of all worker counters
    pub fn total(&self) -> WorkerStats {
        self.workers.iter().fold(WorkerStats::default(), |mut acc, w| {
            acc.envelopes += w.envelopes;
            acc.finished += w.finished;
            acc.preempted += w.preempted;
            acc.malformed += w.malformed;
            acc.replies += w.replies;
            acc.send_failures += w.send_failures;
            acc.panics += w.panics;
            acc.preemptions += w.preemptions;
            acc.deferred += w.deferred;
            acc
        })
    }
}

/// A running engine: worker threads, a dispatcher thread and the shared
/// receive pool
pub struct Runtime {
    stop: Arc<AtomicBool>,
    workers: Option<WorkerPool>,
    dispatcher: Option<JoinHandle<()>>,
    ingress: Ingress,
    rx_pool: Mempool,
    monitors: Vec<WorkerMonitor>,
    dispatch: DispatchMonitor,
    dropped: AtomicU64,
}

impl Runtime {
    /// Validate `config`, bring up the workers and the dispatcher.
    ///
    /// `sink` runs on the dispatcher thread for every outcome.
    pub fn start<S>(
        config: EngineConfig,
        work: Arc<dyn AppWork>,
        transport: Arc<dyn Transport>,
        sink: S,
    ) -> Result<Self, RuntimeError>
    where
        S: FnMut(usize, &Outcome) + Send + 'static,
    {
        config.validate()?;
        if config.debug_logging {
            log::set_max_level(log::LevelFilter::Debug);
        }
        config.print();

        let rx_pool = Mempool::new("rx", config.rx_pool_slots, config.rx_slot_size)?;
        let mut dispatcher = Dispatcher::new(config.ingress_capacity, config.time_slice);
        let mut workers = Vec::with_capacity(config.num_workers);
        let mut monitors = Vec::with_capacity(config.num_workers);

        for id in 0..config.num_workers {
            let (dispatch_port, worker_port) = mailbox();
            let responses = Mempool::new(
                &format!("responses-{}", id),
                config.response_pool_slots,
                config.response_slot_size,
            )?;
            let services = WorkerServices {
                work: Arc::clone(&work),
                transport: Arc::clone(&transport),
                responses,
            };
            let worker = Worker::new(id, &config, worker_port, services)?;
            dispatcher.attach(dispatch_port, worker.preempt_handle());
            monitors.push(worker.monitor());
            workers.push(worker);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let pin = config.pin_workers.then_some(config.first_core);
        let pool = WorkerPool::start(workers, Arc::clone(&stop), pin)?;

        let ingress = dispatcher.ingress();
        let dispatch = dispatcher.monitor();
        let dispatcher_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("dpworker-dispatch".to_string())
            .spawn(move || {
                let mut dispatcher = dispatcher;
                dispatcher.run(&dispatcher_stop, sink);
            });
        let dispatcher = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("failed to spawn dispatcher: {}", e);
                stop.store(true, Ordering::Release);
                let _ = pool.join();
                return Err(WorkerError::SpawnFailed.into());
            }
        };

        Ok(Self {
            stop,
            workers: Some(pool),
            dispatcher: Some(dispatcher),
            ingress,
            rx_pool,
            monitors,
            dispatch,
            dropped: AtomicU64::new(0),
        })
    }

    /// Producer handle for callers that fill their own receive buffers
    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    /// Shared receive buffers
    pub fn rx_pool(&self) -> &Mempool {
        &self.rx_pool
    }

    /// Copy a received frame into the receive pool and queue it, stamped
    /// with the current time.
    pub fn submit_frame(&self, frame: &[u8], class: u32) -> Result<(), RuntimeError> {
        let buf = match self.rx_pool.acquire_with(frame) {
            Ok(buf) => buf,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        if self.ingress.push(Envelope::packet(buf, now_ns(), class)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(RuntimeError::Backpressure);
        }
        Ok(())
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            workers: self.monitors.iter().map(WorkerMonitor::stats).collect(),
            dispatch: self.dispatch.stats(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Stop dispatching, then stop and join the workers.
    ///
    /// Parked jobs are discarded: their stacks are unmapped without
    /// unwinding, so destructors of values the application work held on
    /// those stacks never run. Each worker logs how many jobs it dropped.
    pub fn shutdown(&mut self) -> Result<(), RuntimeError> {
        self.stop.store(true, Ordering::Release);
        let mut result = Ok(());
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                result = Err(WorkerError::Panicked.into());
            }
        }
        if let Some(pool) = self.workers.take() {
            pool.join()?;
        }
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("runtime shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn request(run_ns: u64) -> Vec<u8> {
        let tuple = IpTuple::new(0x0a00_0001, 1000, 0x0a00_0002, 2000);
        let record = WireRecord { id: 9, run_ns, ..Default::default() };
        let mut frame = vec![0u8; 128];
        let n = build_udp_frame(&tuple, &record.to_bytes(), &mut frame).unwrap();
        frame.truncate(n);
        frame
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Runtime::start(
            EngineConfig::new().num_workers(0),
            Arc::new(SpinWork::new()),
            Arc::new(LoopbackTransport::new(1)),
            |_: usize, _: &Outcome| {},
        );
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_runtime_serves_requests() {
        const N: usize = 32;
        let transport = Arc::new(LoopbackTransport::new(N));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink_outcomes = Arc::clone(&outcomes);

        let config = EngineConfig::new()
            .num_workers(2)
            .max_jobs(64)
            .rx_pool(64, 256)
            .preemption(PreemptionKind::Cooperative);
        let mut rt = Runtime::start(
            config,
            Arc::new(SpinWork::new()),
            transport.clone(),
            move |worker: usize, o: &Outcome| {
                if o.is_finished() {
                    if let Ok(mut v) = sink_outcomes.lock() {
                        v.push((worker, *o));
                    }
                }
            },
        )
        .unwrap();

        for i in 0..N {
            rt.submit_frame(&request(1_000), i as u32).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(20);
        let collected = || outcomes.lock().map(|v| v.len()).unwrap_or(0);
        while collected() < N && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        rt.shutdown().unwrap();

        assert_eq!(transport.sent_count(), N);
        assert_eq!(outcomes.lock().unwrap().len(), N);
        let stats = rt.stats();
        assert_eq!(stats.total().finished, N as u64);
        assert_eq!(stats.dispatch.finished, N as u64);
        assert_eq!(stats.dropped, 0);
        assert_eq!(rt.rx_pool().in_use(), 0);
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let config = EngineConfig::new().rx_pool(4, 128).preemption(PreemptionKind::Cooperative);
        let rt = Runtime::start(
            config,
            Arc::new(SpinWork::new()),
            Arc::new(LoopbackTransport::new(1)),
            |_: usize, _: &Outcome| {},
        )
        .unwrap();

        let err = rt.submit_frame(&[0u8; 4096], 0).unwrap_err();
        assert!(matches!(err, RuntimeError::Engine(EngineError::Pool(PoolError::TooLarge { .. }))));
        assert_eq!(rt.stats().dropped, 1);
    }
}
