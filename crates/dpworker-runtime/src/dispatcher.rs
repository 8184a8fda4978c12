//! Dispatcher: the producer side of the worker mailboxes
//!
//! Runs on one dedicated thread. Receive threads push new packets into a
//! bounded [`Ingress`] queue; the dispatcher hands each idle worker the
//! oldest pending unit of work, collects outcomes, and asks workers to
//! preempt jobs that overrun the time slice.
//!
//! Design:
//! - A worker has at most one envelope in flight; it is idle again once
//!   its outcome is collected.
//! - A preempted job is parked on its own worker (its stack lives there),
//!   so it goes to that worker's resume queue, stamped with the time it was
//!   requeued.
//! - An idle worker takes whichever is older: the head of its resume queue
//!   (by requeue time) or the next new packet (by receive timestamp). Ties
//!   go to the new packet. Timestamps are [`now_ns`] values.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use dpworker_core::{now_ns, DispatchPort, Envelope, JobStatus, Outcome};

use crate::preempt::PreemptHandle;

/// Producer handle for new work. Clones share one queue.
#[derive(Clone)]
pub struct Ingress {
    queue: Arc<ArrayQueue<Envelope>>,
}

impl Ingress {
    fn new(capacity: usize) -> Self {
        Self { queue: Arc::new(ArrayQueue::new(capacity.max(1))) }
    }

    /// Enqueue a new-packet envelope. Gives it back when the queue is full.
    #[inline]
    pub fn push(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.queue.push(envelope)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    finished: AtomicU64,
    preempted: AtomicU64,
    slice_expiries: AtomicU64,
}

/// Point-in-time dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Envelopes handed to workers (new and resumed)
    pub dispatched: u64,
    pub finished: u64,
    pub preempted: u64,
    /// Preemption requests sent for overrunning jobs
    pub slice_expiries: u64,
}

/// Read-only view of dispatcher counters, usable from any thread
#[derive(Clone)]
pub struct DispatchMonitor {
    counters: Arc<DispatchCounters>,
}

impl DispatchMonitor {
    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            finished: c.finished.load(Ordering::Relaxed),
            preempted: c.preempted.load(Ordering::Relaxed),
            slice_expiries: c.slice_expiries.load(Ordering::Relaxed),
        }
    }
}

/// Dispatcher's view of one worker
struct WorkerLink {
    port: DispatchPort,
    preempt: PreemptHandle,
    /// An envelope is in flight
    busy: bool,
    /// Last turn a slice-expiry request was sent for
    last_expired: u64,
    /// Preempted jobs waiting for this worker, with their requeue time
    resumes: VecDeque<(u64, Envelope)>,
}

impl WorkerLink {
    /// Request preemption if the running job has used up its slice
    fn check_slice(&mut self, now: u64, slice_ns: u64) -> bool {
        let Some(turn) = self.preempt.running_turn() else {
            return false;
        };
        if turn == self.last_expired || now.saturating_sub(self.preempt.running_since_ns()) < slice_ns {
            return false;
        }
        self.last_expired = turn;
        match self.preempt.preempt(turn) {
            Ok(sent) => sent,
            Err(e) => {
                log::warn!("preempting turn {} failed: {}", turn, e);
                false
            }
        }
    }
}

pub struct Dispatcher {
    ingress: Ingress,
    /// Next new packet, taken off the ingress queue but not yet dispatched
    staged: Option<Envelope>,
    workers: Vec<WorkerLink>,
    time_slice_ns: u64,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    /// `time_slice` of zero disables slice preemption.
    pub fn new(ingress_capacity: usize, time_slice: Duration) -> Self {
        Self {
            ingress: Ingress::new(ingress_capacity),
            staged: None,
            workers: Vec::new(),
            time_slice_ns: time_slice.as_nanos().min(u64::MAX as u128) as u64,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    /// Add a worker; returns its index in outcome callbacks.
    pub fn attach(&mut self, port: DispatchPort, preempt: PreemptHandle) -> usize {
        self.workers.push(WorkerLink {
            port,
            preempt,
            busy: false,
            last_expired: 0,
            resumes: VecDeque::new(),
        });
        self.workers.len() - 1
    }

    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    pub fn monitor(&self) -> DispatchMonitor {
        DispatchMonitor { counters: Arc::clone(&self.counters) }
    }

    pub fn stats(&self) -> DispatchStats {
        self.monitor().stats()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Nothing queued, staged, parked or in flight
    pub fn is_idle(&self) -> bool {
        self.staged.is_none()
            && self.ingress.is_empty()
            && self.workers.iter().all(|w| !w.busy && w.resumes.is_empty())
    }

    /// One pass over all workers: collect outcomes, enforce the time slice,
    /// and feed idle workers. Returns the number of envelopes moved.
    pub fn poll_once<F>(&mut self, sink: &mut F) -> usize
    where
        F: FnMut(usize, &Outcome),
    {
        let mut moved = 0;
        let counters = &self.counters;

        for (id, link) in self.workers.iter_mut().enumerate() {
            let now = now_ns();

            if let Some(outcome) = link.port.poll() {
                link.busy = false;
                moved += 1;
                match outcome.status {
                    JobStatus::Finished => {
                        counters.finished.fetch_add(1, Ordering::Relaxed);
                    }
                    JobStatus::Preempted => {
                        counters.preempted.fetch_add(1, Ordering::Relaxed);
                        link.resumes.push_back((now, Envelope::resume_from(&outcome)));
                    }
                }
                sink(id, &outcome);
            }

            if link.busy {
                if self.time_slice_ns > 0 && link.check_slice(now, self.time_slice_ns) {
                    counters.slice_expiries.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }

            if self.staged.is_none() {
                self.staged = self.ingress.queue.pop();
            }
            let take_resume = match (link.resumes.front(), &self.staged) {
                (Some((requeued, _)), Some(fresh)) => *requeued < fresh.timestamp,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => continue,
            };

            let envelope = if take_resume {
                link.resumes.pop_front().map(|(_, e)| e)
            } else {
                self.staged.take()
            };
            let Some(envelope) = envelope else { continue };

            match link.port.submit(envelope) {
                Ok(()) => {
                    link.busy = true;
                    moved += 1;
                    counters.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                // Outcome collected means the request slot was drained; keep
                // the envelope where it came from regardless
                Err(back) if take_resume => link.resumes.push_front((now, back)),
                Err(back) => self.staged = Some(back),
            }
        }
        moved
    }

    /// Dispatch until `stop` is raised
    pub fn run<F>(&mut self, stop: &AtomicBool, mut sink: F)
    where
        F: FnMut(usize, &Outcome),
    {
        log::debug!("dispatcher running with {} workers", self.workers.len());
        while !stop.load(Ordering::Relaxed) {
            if self.poll_once(&mut sink) == 0 {
                std::hint::spin_loop();
            }
        }
        let s = self.stats();
        log::info!(
            "dispatcher stopped: {} dispatched, {} finished, {} preempted, {} slice expiries",
            s.dispatched,
            s.finished,
            s.preempted,
            s.slice_expiries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpworker_core::{mailbox, JobHandle, Mempool, Work, WorkerPort};

    use crate::preempt::{PreemptState, PreemptionKind};

    fn attach_one(d: &mut Dispatcher) -> (WorkerPort, Arc<PreemptState>) {
        let (dp, wp) = mailbox();
        let state = Arc::new(PreemptState::new());
        d.attach(dp, PreemptHandle::new(Arc::clone(&state), PreemptionKind::Cooperative.strategy()));
        (wp, state)
    }

    fn reply(wp: &mut WorkerPort, env: &Envelope, handle: JobHandle, status: JobStatus) {
        let out = Outcome { timestamp: env.timestamp, class: env.class, handle, status };
        wp.try_complete(out).unwrap();
    }

    #[test]
    fn test_ingress_bounded() {
        let d = Dispatcher::new(1, Duration::ZERO);
        let pool = Mempool::new("rx", 2, 64).unwrap();
        let ingress = d.ingress();
        assert!(ingress.push(Envelope::packet(pool.acquire().unwrap(), 1, 0)).is_ok());
        let back = ingress.push(Envelope::packet(pool.acquire().unwrap(), 2, 0)).unwrap_err();
        assert_eq!(back.timestamp, 2);
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress.capacity(), 1);
    }

    #[test]
    fn test_one_envelope_in_flight() {
        let mut d = Dispatcher::new(8, Duration::ZERO);
        let (mut wp, _state) = attach_one(&mut d);
        let pool = Mempool::new("rx", 4, 64).unwrap();
        for ts in 1..=2 {
            d.ingress().push(Envelope::packet(pool.acquire().unwrap(), ts, 0)).unwrap();
        }

        let mut outcomes = Vec::new();
        let mut sink = |_: usize, o: &Outcome| outcomes.push(*o);
        assert_eq!(d.poll_once(&mut sink), 1);
        // Still busy: nothing more is submitted
        assert_eq!(d.poll_once(&mut sink), 0);

        let env = wp.try_recv().unwrap();
        assert_eq!(env.timestamp, 1);
        reply(&mut wp, &env, JobHandle::new(0, 0), JobStatus::Finished);

        // Collect + submit the second packet
        assert_eq!(d.poll_once(&mut sink), 2);
        assert_eq!(wp.try_recv().unwrap().timestamp, 2);
        drop(sink);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(d.stats().dispatched, 2);
    }

    #[test]
    fn test_preempted_job_requeued_on_its_worker() {
        let mut d = Dispatcher::new(8, Duration::ZERO);
        let (mut wp, _state) = attach_one(&mut d);
        let mut sink = |_: usize, _: &Outcome| {};

        let pool = Mempool::new("rx", 4, 64).unwrap();
        d.ingress().push(Envelope::packet(pool.acquire().unwrap(), 1, 7)).unwrap();
        d.poll_once(&mut sink);

        let env = wp.try_recv().unwrap();
        let handle = JobHandle::new(3, 1);
        reply(&mut wp, &env, handle, JobStatus::Preempted);
        d.poll_once(&mut sink);

        // Resume envelope keeps the original tags
        let resumed = wp.try_recv().unwrap();
        assert!(matches!(resumed.work, Work::Resume(h) if h == handle));
        assert_eq!((resumed.timestamp, resumed.class), (1, 7));
        reply(&mut wp, &resumed, handle, JobStatus::Finished);
        d.poll_once(&mut sink);

        assert!(d.is_idle());
        let s = d.stats();
        assert_eq!((s.dispatched, s.finished, s.preempted), (2, 1, 1));
    }

    #[test]
    fn test_older_packet_goes_before_resume() {
        let mut d = Dispatcher::new(8, Duration::ZERO);
        let (mut wp, _state) = attach_one(&mut d);
        let mut sink = |_: usize, _: &Outcome| {};
        let pool = Mempool::new("rx", 4, 64).unwrap();

        d.ingress().push(Envelope::packet(pool.acquire().unwrap(), 1, 0)).unwrap();
        d.poll_once(&mut sink);
        // Received before the first job is preempted
        let received = now_ns();
        d.ingress().push(Envelope::packet(pool.acquire().unwrap(), received, 0)).unwrap();

        let first = wp.try_recv().unwrap();
        reply(&mut wp, &first, JobHandle::new(0, 0), JobStatus::Preempted);
        d.poll_once(&mut sink);

        let next = wp.try_recv().unwrap();
        assert_eq!(next.timestamp, received);
        assert!(matches!(next.work, Work::Packet(_)));
    }

    #[test]
    fn test_slice_expiry_requests_preemption_once() {
        let mut d = Dispatcher::new(8, Duration::from_nanos(1));
        let (mut wp, state) = attach_one(&mut d);
        let mut sink = |_: usize, _: &Outcome| {};
        let pool = Mempool::new("rx", 1, 64).unwrap();

        d.ingress().push(Envelope::packet(pool.acquire().unwrap(), 1, 0)).unwrap();
        d.poll_once(&mut sink);
        let _env = wp.try_recv().unwrap();

        // Worker side: job turn 1 is running
        state.begin_turn(1, std::ptr::null_mut());
        std::thread::sleep(Duration::from_millis(1));

        d.poll_once(&mut sink);
        d.poll_once(&mut sink);
        assert_eq!(d.stats().slice_expiries, 1);
        state.end_turn();
    }
}
