//! Worker: the per-core scheduling loop
//!
//! Each worker thread owns a job table, a response pool and the worker end
//! of one mailbox. Every turn it:
//!
//! 1. lets the transport reclaim and flush transmit buffers
//! 2. busy-polls the mailbox for the next envelope
//! 3. starts a job for a new packet, or resumes a parked one
//! 4. publishes one outcome once the job finishes or is preempted
//!
//! Exactly one outcome is published per envelope, in consumption order.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use dpworker_core::logger;
use dpworker_core::{
    now_ns, ContextError, EngineResult, Envelope, JobHandle, JobStatus, Mempool, Outcome, PoolBuf,
    Work, WorkerError, WorkerPort,
};
use dpworker_net::{extract_request, Transport};

use crate::config::EngineConfig;
use crate::current_arch::{context_switch, SavedRegs};
use crate::job::{JobCounters, JobEnv, JobTable, SlotState};
use crate::preempt::{register_current, unregister_current, PreemptHandle, PreemptState};
use crate::work::AppWork;

/// What a worker needs from the outside world
pub struct WorkerServices {
    pub work: Arc<dyn AppWork>,
    pub transport: Arc<dyn Transport>,
    /// Reply buffers, private to this worker
    pub responses: Mempool,
}

/// Scheduler-side counters
#[derive(Debug, Default)]
pub struct WorkerCounters {
    envelopes: AtomicU64,
    finished: AtomicU64,
    preempted: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub envelopes: u64,
    pub finished: u64,
    pub preempted: u64,
    pub malformed: u64,
    pub replies: u64,
    pub send_failures: u64,
    pub panics: u64,
    /// Preemption requests honoured
    pub preemptions: u64,
    /// Requests that landed in a critical section
    pub deferred: u64,
}

/// Read-only view of a worker's counters, usable from any thread
#[derive(Clone)]
pub struct WorkerMonitor {
    counters: Arc<WorkerCounters>,
    jobs: Arc<JobCounters>,
    preempt: Arc<PreemptState>,
}

impl WorkerMonitor {
    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        let j = &self.jobs;
        WorkerStats {
            envelopes: c.envelopes.load(Ordering::Relaxed),
            finished: c.finished.load(Ordering::Relaxed),
            preempted: c.preempted.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            replies: j.replies.load(Ordering::Relaxed),
            send_failures: j.send_failures.load(Ordering::Relaxed),
            panics: j.panics.load(Ordering::Relaxed),
            preemptions: self.preempt.preemptions(),
            deferred: self.preempt.deferred(),
        }
    }
}

pub struct Worker {
    id: usize,
    port: WorkerPort,
    // Dropped before `env`: slots point into it
    jobs: JobTable,
    env: Box<JobEnv>,
    /// Scheduler context jobs switch back to
    sched_regs: Box<UnsafeCell<SavedRegs>>,
    next_turn: u64,
    counters: Arc<WorkerCounters>,
}

// Safety: a worker is moved to its thread before `init` and never shared;
// the raw pointers it holds only point into its own boxes.
unsafe impl Send for Worker {}

impl Worker {
    pub fn new(
        id: usize,
        config: &EngineConfig,
        port: WorkerPort,
        services: WorkerServices,
    ) -> EngineResult<Self> {
        let preempt = Arc::new(PreemptState::new());
        let env = Box::new(JobEnv {
            worker_id: id,
            work: services.work,
            transport: services.transport,
            responses: services.responses,
            preempt,
            strategy: config.preemption.strategy(),
            counters: Arc::new(JobCounters::default()),
        });
        let jobs = JobTable::new(config.max_jobs, config.stack_size, &*env as *const JobEnv)?;
        let sched_regs = Box::new(UnsafeCell::new(SavedRegs::default()));
        env.preempt.set_sched_regs(sched_regs.get());

        Ok(Self {
            id,
            port,
            jobs,
            env,
            sched_regs,
            next_turn: 0,
            counters: Arc::new(WorkerCounters::default()),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Handle the dispatcher uses to preempt this worker's jobs
    pub fn preempt_handle(&self) -> PreemptHandle {
        PreemptHandle::new(Arc::clone(&self.env.preempt), Arc::clone(&self.env.strategy))
    }

    pub fn monitor(&self) -> WorkerMonitor {
        WorkerMonitor {
            counters: Arc::clone(&self.counters),
            jobs: Arc::clone(&self.env.counters),
            preempt: Arc::clone(&self.env.preempt),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.monitor().stats()
    }

    /// Jobs currently parked or running
    pub fn live_jobs(&self) -> usize {
        self.jobs.live()
    }

    /// Bind this worker to the calling thread. Must run on the thread that
    /// will call [`run`](Self::run) or [`process`](Self::process).
    pub fn init(&self) -> EngineResult<()> {
        logger::set_worker_tag(self.id);
        register_current(&self.env.preempt);
        self.env.strategy.install(&self.env.preempt)?;
        log::debug!(
            "worker {} ready: {} job slots, {} preemption",
            self.id,
            self.jobs.capacity(),
            self.env.strategy.kind()
        );
        Ok(())
    }

    /// Serve envelopes until `stop` is raised.
    ///
    /// An engine error here means job or scheduler state can no longer be
    /// trusted; it is logged and the process exits.
    pub fn run(mut self, stop: &AtomicBool) {
        loop {
            match self.turn(stop) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log::error!("worker {}: fatal: {}", self.id, e);
                    std::process::exit(-1);
                }
            }
        }
        let s = self.stats();
        log::info!(
            "worker {} stopped: {} envelopes, {} finished, {} preempted, {} malformed",
            self.id,
            s.envelopes,
            s.finished,
            s.preempted,
            s.malformed
        );
    }

    /// One scheduling turn. `Ok(false)` once `stop` ends the wait.
    pub fn turn(&mut self, stop: &AtomicBool) -> EngineResult<bool> {
        self.env.transport.reclaim();
        self.env.transport.flush();

        let Some(envelope) = self.port.recv(stop) else {
            return Ok(false);
        };
        let outcome = self.process(envelope)?;
        if self.port.complete(outcome, stop).is_err() {
            log::debug!("worker {}: stopped with an unpublished outcome", self.id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Execute one envelope and produce its outcome
    pub fn process(&mut self, envelope: Envelope) -> EngineResult<Outcome> {
        self.counters.envelopes.fetch_add(1, Ordering::Relaxed);
        let Envelope { work, timestamp, class } = envelope;

        let (handle, status) = match work {
            Work::Packet(frame) => self.start(frame)?,
            Work::Resume(handle) => {
                self.jobs.lookup(handle)?;
                (handle, self.enter(handle.slot())?)
            }
        };

        match status {
            JobStatus::Finished => self.counters.finished.fetch_add(1, Ordering::Relaxed),
            JobStatus::Preempted => self.counters.preempted.fetch_add(1, Ordering::Relaxed),
        };
        Ok(Outcome { timestamp, class, handle, status })
    }

    /// Create a job for `frame` and run its first turn. A frame that does
    /// not parse finishes on the spot without taking a job slot.
    fn start(&mut self, frame: PoolBuf) -> EngineResult<(JobHandle, JobStatus)> {
        let request = match extract_request(frame.as_slice()) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("worker {}: dropping frame: {}", self.id, e);
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return Ok((JobHandle::DETACHED, JobStatus::Finished));
            }
        };

        let handle = self.jobs.alloc()?.handle();
        let slot = self.jobs.slot(handle.slot());
        // Safety: the slot is fresh and sched_regs outlives the table
        unsafe { slot.prepare(frame, request.payload, request.tuple, self.sched_regs.get()) };
        Ok((handle, self.enter(handle.slot())?))
    }

    /// Switch into the job in `index` until it finishes or is preempted
    fn enter(&mut self, index: u32) -> EngineResult<JobStatus> {
        let slot = self.jobs.slot(index);
        match slot.state() {
            SlotState::Fresh => {}
            SlotState::Suspended => slot.unpark(now_ns()),
            state => {
                return Err(ContextError::InvalidState { slot: index, state: state.name() }.into());
            }
        }

        self.next_turn += 1;
        let preempt = &self.env.preempt;
        slot.set_state(SlotState::Running);
        preempt.begin_turn(self.next_turn, slot.regs());
        // Safety: slot regs hold a prepared or suspended context whose stack
        // is mapped; the job switches back to sched_regs.
        unsafe { context_switch(self.sched_regs.get(), slot.regs()) };
        preempt.end_turn();

        if slot.is_finished() {
            self.jobs.retire(index);
            Ok(JobStatus::Finished)
        } else {
            slot.park(now_ns());
            Ok(JobStatus::Preempted)
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Parked stacks are unmapped with the table, never unwound
        let live = self.jobs.live();
        if live > 0 {
            log::warn!(
                "worker {}: discarding {} parked jobs without unwinding their stacks",
                self.id,
                live
            );
        }
        unregister_current(&self.env.preempt);
    }
}

/// Worker threads of one engine
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start one thread per worker. Worker `i` is pinned to core
    /// `first_core + i` when `pin` is set.
    ///
    /// Returns once every worker has finished `init`; fails if any did not.
    pub fn start(workers: Vec<Worker>, stop: Arc<AtomicBool>, pin: Option<usize>) -> EngineResult<Self> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let count = workers.len();
        let mut handles = Vec::with_capacity(count);

        for worker in workers {
            let id = worker.id();
            let stop = Arc::clone(&stop);
            let ready_tx = ready_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("dpworker-{}", id))
                .spawn(move || {
                    if let Some(first) = pin {
                        if let Err(e) = pin_current_thread(first + id) {
                            log::warn!("worker {}: pinning to core {} failed: {}", id, first + id, e);
                        }
                    }
                    let ready = worker.init();
                    let ok = ready.is_ok();
                    let _ = ready_tx.send(ready);
                    if ok {
                        worker.run(&stop);
                    }
                })
                .map_err(|_| WorkerError::SpawnFailed)?;
            handles.push(handle);
        }
        drop(ready_tx);

        for _ in 0..count {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    stop.store(true, Ordering::Release);
                    return Err(e);
                }
                Err(_) => {
                    stop.store(true, Ordering::Release);
                    return Err(WorkerError::Panicked.into());
                }
            }
        }
        log::info!("started {} workers", count);
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker thread to exit
    pub fn join(self) -> Result<(), WorkerError> {
        let mut result = Ok(());
        for handle in self.handles {
            if handle.join().is_err() {
                result = Err(WorkerError::Panicked);
            }
        }
        result
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn pin_current_thread(core: usize) -> Result<(), WorkerError> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(core).map_err(|_| WorkerError::AffinityFailed)?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|_| WorkerError::AffinityFailed)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn pin_current_thread(_core: usize) -> Result<(), WorkerError> {
    Err(WorkerError::AffinityFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpworker_core::{mailbox, IpTuple};
    use dpworker_net::{build_udp_frame, LoopbackTransport};

    use crate::preempt::PreemptionKind;

    fn worker(max_jobs: usize) -> Worker {
        let config = EngineConfig::new()
            .max_jobs(max_jobs)
            .stack_size(64 * 1024)
            .preemption(PreemptionKind::Cooperative);
        let (_d, port) = mailbox();
        let services = WorkerServices {
            work: Arc::new(|_: &[u8], _: &crate::job::JobContext<'_>| {}),
            transport: Arc::new(LoopbackTransport::new(16)),
            responses: Mempool::new("resp", 4, 256).unwrap(),
        };
        Worker::new(0, &config, port, services).unwrap()
    }

    #[test]
    fn test_malformed_frame_finishes() {
        let mut w = worker(2);
        w.init().unwrap();
        let rx = Mempool::new("rx", 1, 256).unwrap();
        let out = w.process(Envelope::packet(rx.acquire_with(&[0u8; 10]).unwrap(), 9, 4)).unwrap();

        assert_eq!(out.status, JobStatus::Finished);
        assert_eq!(out.handle, JobHandle::DETACHED);
        assert_eq!((out.timestamp, out.class), (9, 4));
        assert_eq!(rx.in_use(), 0);
        assert_eq!(w.live_jobs(), 0);
        assert_eq!(w.stats().malformed, 1);
    }

    #[test]
    fn test_malformed_frame_with_full_table() {
        let mut w = worker(1);
        w.init().unwrap();
        let _held = w.jobs.alloc().unwrap().handle();

        let rx = Mempool::new("rx", 1, 256).unwrap();
        let out = w.process(Envelope::packet(rx.acquire_with(&[0u8; 10]).unwrap(), 1, 0)).unwrap();
        assert_eq!(out.status, JobStatus::Finished);
        assert_eq!(rx.in_use(), 0);
        assert_eq!(w.live_jobs(), 1);

        // The reported handle never resolves
        let err = w.process(Envelope::resume_from(&out)).unwrap_err();
        assert!(matches!(err, dpworker_core::EngineError::Context(ContextError::InvalidHandle { .. })));
    }

    #[test]
    fn test_unknown_handle_rejected() {
        let mut w = worker(2);
        w.init().unwrap();
        let err = w.process(Envelope::resume(JobHandle::new(1, 7), 0, 0)).unwrap_err();
        assert!(matches!(err, dpworker_core::EngineError::Context(ContextError::InvalidHandle { .. })));
    }

    #[test]
    fn test_slot_exhaustion_is_error() {
        let mut w = worker(1);
        w.init().unwrap();
        // Occupy the only slot without running it
        let _held = w.jobs.alloc().unwrap().handle();

        let rx = Mempool::new("rx", 1, 256).unwrap();
        let mut buf = rx.acquire().unwrap();
        let tuple = IpTuple::new(0x0a00_0001, 1000, 0x0a00_0002, 2000);
        let n = build_udp_frame(&tuple, b"req", buf.spare_mut()).unwrap();
        buf.set_len(n).unwrap();

        let err = w.process(Envelope::packet(buf, 0, 0)).unwrap_err();
        assert_eq!(err, dpworker_core::EngineError::Context(ContextError::NoSlotsAvailable));
        // Frame released on the error path
        assert_eq!(rx.in_use(), 0);
    }

    #[test]
    fn test_turn_drains_transport() {
        let config = EngineConfig::new()
            .max_jobs(2)
            .stack_size(64 * 1024)
            .preemption(PreemptionKind::Cooperative);
        let (mut dispatch, port) = mailbox();
        let transport = Arc::new(LoopbackTransport::new(16));
        let services = WorkerServices {
            work: Arc::new(|_: &[u8], _: &crate::job::JobContext<'_>| {}),
            transport: transport.clone(),
            responses: Mempool::new("resp", 4, 256).unwrap(),
        };
        let mut w = Worker::new(0, &config, port, services).unwrap();
        w.init().unwrap();

        let rx = Mempool::new("rx", 4, 256).unwrap();
        let stop = AtomicBool::new(false);
        for turn in 1..=3u64 {
            let env = Envelope::packet(rx.acquire_with(&[0u8; 4]).unwrap(), turn, 0);
            assert!(dispatch.submit(env).is_ok());
            assert_eq!(w.turn(&stop), Ok(true));
            assert!(dispatch.poll().is_some());
            assert_eq!(transport.reclaim_count(), turn);
            assert_eq!(transport.flush_count(), turn);
        }

        // Drained even on the turn that ends the wait
        stop.store(true, Ordering::Release);
        assert_eq!(w.turn(&stop), Ok(false));
        assert_eq!((transport.reclaim_count(), transport.flush_count()), (4, 4));
    }
}
