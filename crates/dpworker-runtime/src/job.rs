//! Jobs: one request executing on its own stack
//!
//! Each worker owns a fixed table of job slots. A slot holds the saved
//! registers of its context, the received frame the request lives in, and
//! the bookkeeping the scheduler needs to report and resume it. Slots are
//! recycled LIFO; a generation counter invalidates handles of retired jobs.

use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dpworker_core::{ContextError, EngineResult, IpTuple, JobHandle, Mempool, PoolBuf, PoolResult};
use dpworker_net::Transport;

use crate::current_arch::{init_context, SavedRegs};
use crate::memory::StackRegion;
use crate::preempt::{CriticalSection, PreemptState, PreemptionStrategy};
use crate::work::AppWork;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    /// Context prepared, never entered
    Fresh,
    Running,
    Suspended,
}

impl SlotState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Fresh => "fresh",
            SlotState::Running => "running",
            SlotState::Suspended => "suspended",
        }
    }
}

/// Counters bumped from job context, read from anywhere
#[derive(Debug, Default)]
pub struct JobCounters {
    pub replies: AtomicU64,
    pub send_failures: AtomicU64,
    pub panics: AtomicU64,
}

/// Per-worker services every job on that worker uses
pub(crate) struct JobEnv {
    pub(crate) worker_id: usize,
    pub(crate) work: Arc<dyn AppWork>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) responses: Mempool,
    pub(crate) preempt: Arc<PreemptState>,
    pub(crate) strategy: Arc<dyn PreemptionStrategy>,
    pub(crate) counters: Arc<JobCounters>,
}

pub(crate) struct JobSlot {
    index: u32,
    generation: Cell<u32>,
    state: Cell<SlotState>,
    regs: UnsafeCell<SavedRegs>,
    /// Set by the job as its last act; read by the scheduler after switch
    finished: AtomicBool,
    frame: UnsafeCell<Option<PoolBuf>>,
    payload: Cell<(usize, usize)>,
    tuple: Cell<IpTuple>,
    /// Total time spent parked between turns
    suspended_ns: Cell<u64>,
    parked_at_ns: Cell<u64>,
    stack_top: *mut u8,
    env: *const JobEnv,
}

impl JobSlot {
    #[inline]
    pub(crate) fn handle(&self) -> JobHandle {
        JobHandle::new(self.index, self.generation.get())
    }

    #[inline]
    pub(crate) fn state(&self) -> SlotState {
        self.state.get()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: SlotState) {
        self.state.set(state);
    }

    #[inline]
    pub(crate) fn regs(&self) -> *mut SavedRegs {
        self.regs.get()
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Nothing to run; the turn reports finished without entering a context
    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn park(&self, now: u64) {
        self.state.set(SlotState::Suspended);
        self.parked_at_ns.set(now);
    }

    /// Account the time since `park`
    pub(crate) fn unpark(&self, now: u64) {
        let parked = now.saturating_sub(self.parked_at_ns.get());
        self.suspended_ns.set(self.suspended_ns.get() + parked);
    }

    /// Bind a request to this slot and prepare its context.
    ///
    /// # Safety
    ///
    /// The slot must not be running, and `link` must outlive the job.
    pub(crate) unsafe fn prepare(
        &self,
        frame: PoolBuf,
        payload: std::ops::Range<usize>,
        tuple: IpTuple,
        link: *const SavedRegs,
    ) {
        *self.frame.get() = Some(frame);
        self.payload.set((payload.start, payload.end));
        self.tuple.set(tuple);
        self.suspended_ns.set(0);
        self.finished.store(false, Ordering::Release);
        init_context(
            &mut *self.regs.get(),
            self.stack_top,
            job_entry,
            self as *const JobSlot as usize,
            link,
        );
        self.state.set(SlotState::Fresh);
    }

    /// Request bytes inside the held frame
    fn payload(&self) -> &[u8] {
        // Safety: the frame is only replaced by prepare/retire, neither of
        // which runs while the job can observe it.
        let frame = unsafe { &*self.frame.get() };
        let (start, end) = self.payload.get();
        match frame {
            Some(buf) => &buf.as_slice()[start..end],
            None => &[],
        }
    }
}

/// Fixed set of job slots and their stacks
pub(crate) struct JobTable {
    slots: Box<[JobSlot]>,
    free: Vec<u32>,
    // Unmapped after the slots are gone
    _stacks: StackRegion,
}

impl JobTable {
    pub(crate) fn new(max_jobs: usize, stack_size: usize, env: *const JobEnv) -> EngineResult<Self> {
        let stacks = StackRegion::new(max_jobs, stack_size)?;
        let slots: Box<[JobSlot]> = (0..max_jobs as u32)
            .map(|i| JobSlot {
                index: i,
                generation: Cell::new(0),
                state: Cell::new(SlotState::Free),
                regs: UnsafeCell::new(SavedRegs::default()),
                finished: AtomicBool::new(false),
                frame: UnsafeCell::new(None),
                payload: Cell::new((0, 0)),
                tuple: Cell::new(IpTuple::default()),
                suspended_ns: Cell::new(0),
                parked_at_ns: Cell::new(0),
                stack_top: stacks.stack_top(i),
                env,
            })
            .collect();
        // LIFO: slot 0 comes out first and stays cache-warm
        let free = (0..max_jobs as u32).rev().collect();

        Ok(Self { slots, free, _stacks: stacks })
    }

    pub(crate) fn alloc(&mut self) -> Result<&JobSlot, ContextError> {
        let index = self.free.pop().ok_or(ContextError::NoSlotsAvailable)?;
        let slot = &self.slots[index as usize];
        slot.state.set(SlotState::Fresh);
        Ok(slot)
    }

    #[inline]
    pub(crate) fn slot(&self, index: u32) -> &JobSlot {
        &self.slots[index as usize]
    }

    /// Resolve a handle issued earlier by this table
    pub(crate) fn lookup(&self, handle: JobHandle) -> Result<&JobSlot, ContextError> {
        let invalid = ContextError::InvalidHandle {
            slot: handle.slot(),
            generation: handle.generation(),
        };
        let slot = self.slots.get(handle.slot() as usize).ok_or(invalid.clone())?;
        if slot.generation.get() != handle.generation() || slot.state.get() == SlotState::Free {
            return Err(invalid);
        }
        Ok(slot)
    }

    /// Discard the job in `index`: release its frame and invalidate its handle
    pub(crate) fn retire(&mut self, index: u32) {
        let slot = &self.slots[index as usize];
        // Safety: the job is not running; nothing else borrows the frame
        unsafe { *slot.frame.get() = None };
        slot.generation.set(slot.generation.get().wrapping_add(1));
        slot.state.set(SlotState::Free);
        self.free.push(index);
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// What application work can see of the job it runs in
pub struct JobContext<'a> {
    slot: &'a JobSlot,
    env: &'a JobEnv,
}

impl JobContext<'_> {
    /// Give up the CPU here if a preemption request is pending.
    ///
    /// Required for progress under cooperative preemption; harmless under
    /// signal preemption.
    #[inline]
    pub fn preempt_point(&self) {
        self.env.preempt.poll();
    }

    /// Run `f` with preemption deferred
    #[inline]
    pub fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.guard();
        f()
    }

    /// Defer preemption until the returned guard drops
    #[inline]
    pub fn guard(&self) -> CriticalSection<'_> {
        CriticalSection::enter(&self.env.preempt)
    }

    /// Take a buffer from `pool` without exposing a half-updated pool to
    /// a preemption
    pub fn acquire(&self, pool: &Mempool) -> PoolResult<PoolBuf> {
        self.critical(|| pool.acquire())
    }

    /// Counterpart of [`acquire`](Self::acquire)
    pub fn release(&self, buf: PoolBuf) {
        self.critical(move || drop(buf));
    }

    /// Nanoseconds this job has spent parked so far
    #[inline]
    pub fn suspended_ns(&self) -> u64 {
        self.slot.suspended_ns.get()
    }

    pub fn worker_id(&self) -> usize {
        self.env.worker_id
    }

    pub fn handle(&self) -> JobHandle {
        self.slot.handle()
    }
}

/// First function a job context runs
extern "C" fn job_entry(arg: usize) {
    // Safety: arg is the address of a JobSlot in a table that outlives the
    // context; env outlives the table.
    let slot = unsafe { &*(arg as *const JobSlot) };
    let env = unsafe { &*slot.env };
    run_job(slot, env);
    slot.finished.store(true, Ordering::Release);
    // Returning resumes the scheduler through the link context
}

fn run_job(slot: &JobSlot, env: &JobEnv) {
    let payload = slot.payload();
    let cx = JobContext { slot, env };

    env.strategy.enable(&env.preempt);
    let result = panic::catch_unwind(AssertUnwindSafe(|| env.work.run(payload, &cx)));
    env.strategy.disable(&env.preempt);

    if result.is_err() {
        env.counters.panics.fetch_add(1, Ordering::Relaxed);
        log::error!("worker {}: {} panicked in application work, no reply", env.worker_id, slot.handle());
        return;
    }

    let reply_to = slot.tuple.get().reversed();
    match send_reply(env, payload, &reply_to) {
        Ok(()) => {
            env.counters.replies.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            env.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("worker {}: reply to {} failed: {}", env.worker_id, reply_to.dst_addr(), e);
        }
    }
}

fn send_reply(env: &JobEnv, payload: &[u8], to: &IpTuple) -> EngineResult<()> {
    let buf = env.responses.acquire_with(payload)?;
    env.transport.send(buf.as_slice(), to)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> JobTable {
        JobTable::new(n, 64 * 1024, std::ptr::null()).unwrap()
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let mut t = table(2);
        let a = t.alloc().unwrap().handle();
        let b = t.alloc().unwrap().handle();
        assert_eq!(a.slot(), 0);
        assert_eq!(b.slot(), 1);
        assert_eq!(t.alloc().err(), Some(ContextError::NoSlotsAvailable));
        assert_eq!(t.live(), 2);
        assert_eq!(t.capacity(), 2);
    }

    #[test]
    fn test_retire_invalidates_handle() {
        let mut t = table(1);
        let h = t.alloc().unwrap().handle();
        assert!(t.lookup(h).is_ok());

        t.retire(h.slot());
        assert!(matches!(t.lookup(h), Err(ContextError::InvalidHandle { .. })));

        let h2 = t.alloc().unwrap().handle();
        assert_eq!(h2.slot(), h.slot());
        assert_ne!(h2.generation(), h.generation());
        assert!(t.lookup(h2).is_ok());
    }

    #[test]
    fn test_lookup_out_of_range() {
        let t = table(1);
        assert!(t.lookup(JobHandle::new(5, 0)).is_err());
        // Never allocated
        assert!(t.lookup(JobHandle::new(0, 0)).is_err());
    }

    #[test]
    fn test_retire_releases_frame() {
        let pool = Mempool::new("frames", 1, 64).unwrap();
        let mut t = table(1);
        let slot = t.alloc().unwrap();
        let link = SavedRegs::default();
        unsafe { slot.prepare(pool.acquire_with(b"abcdef").unwrap(), 2..4, IpTuple::default(), &link) };
        assert_eq!(slot.payload(), b"cd");
        assert_eq!(slot.state(), SlotState::Fresh);
        assert_eq!(pool.in_use(), 1);

        let idx = slot.handle().slot();
        t.retire(idx);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_suspension_accounting() {
        let mut t = table(1);
        let slot = t.alloc().unwrap();
        slot.park(1_000);
        slot.unpark(1_600);
        slot.park(2_000);
        slot.unpark(2_100);
        assert_eq!(slot.suspended_ns.get(), 700);
        assert_eq!(slot.state(), SlotState::Suspended);
    }
}
