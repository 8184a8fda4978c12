//! Preemption of running jobs
//!
//! A worker shares one [`PreemptState`] with whoever may ask it to give up
//! the CPU (the dispatcher's time-slice check, tests, the job itself). A
//! request names the *turn* it targets; every switch into a job starts a
//! new turn, so a request that arrives late can never hit the wrong job.
//!
//! A job is only switched out when all of these hold:
//!
//! - it is inside its preemptible region (`enabled`)
//! - no critical section is open (`critical == 0`)
//! - the pending request targets the running turn
//!
//! How the request reaches the worker is the job of a
//! [`PreemptionStrategy`]: a signal that interrupts the job wherever it is
//! ([`SignalPreemption`]), or a flag the job observes at safe points
//! ([`CooperativePreemption`]). A request that lands inside a critical
//! section is honoured when the outermost section closes.

mod cooperative;
mod signal;

pub use cooperative::CooperativePreemption;
pub use signal::SignalPreemption;

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;
use std::cell::Cell;
use std::sync::atomic::{compiler_fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dpworker_core::{now_ns, EngineResult};

use crate::current_arch::{context_switch, SavedRegs};

/// Preemption state shared between a worker and its controllers
pub struct PreemptState {
    /// Turn currently executing a job; 0 while the scheduler runs
    running: AtomicU64,
    /// Turn the most recent request targets
    requested: AtomicU64,
    /// When the running turn started
    run_start_ns: AtomicU64,
    /// Job is inside its preemptible region
    enabled: AtomicBool,
    /// Critical-section nesting depth of the running job
    critical: AtomicU32,
    /// Register block of the running job
    job_regs: AtomicPtr<SavedRegs>,
    /// Scheduler context to return to
    sched_regs: AtomicPtr<SavedRegs>,
    /// Requests honoured
    preemptions: AtomicU64,
    /// Requests that arrived inside a critical section
    deferred: AtomicU64,
    /// Yields outside the signal handler must mask SIGURG themselves
    signal_masked: AtomicBool,
}

impl Default for PreemptState {
    fn default() -> Self {
        Self::new()
    }
}

impl PreemptState {
    pub const fn new() -> Self {
        Self {
            running: AtomicU64::new(0),
            requested: AtomicU64::new(0),
            run_start_ns: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            critical: AtomicU32::new(0),
            job_regs: AtomicPtr::new(std::ptr::null_mut()),
            sched_regs: AtomicPtr::new(std::ptr::null_mut()),
            preemptions: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            signal_masked: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_signal_masked(&self, on: bool) {
        self.signal_masked.store(on, Ordering::Relaxed);
    }

    pub(crate) fn set_sched_regs(&self, regs: *mut SavedRegs) {
        self.sched_regs.store(regs, Ordering::Release);
    }

    /// Scheduler side, right before switching into a job
    pub(crate) fn begin_turn(&self, turn: u64, job_regs: *mut SavedRegs) {
        debug_assert_ne!(turn, 0);
        self.job_regs.store(job_regs, Ordering::Relaxed);
        self.critical.store(0, Ordering::Relaxed);
        self.run_start_ns.store(now_ns(), Ordering::Relaxed);
        self.running.store(turn, Ordering::Release);
    }

    /// Scheduler side, once the job has switched back
    pub(crate) fn end_turn(&self) {
        self.running.store(0, Ordering::Release);
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Turn currently running a job, if any
    #[inline]
    pub fn running_turn(&self) -> Option<u64> {
        match self.running.load(Ordering::Acquire) {
            0 => None,
            turn => Some(turn),
        }
    }

    #[inline]
    pub fn run_start_ns(&self) -> u64 {
        self.run_start_ns.load(Ordering::Relaxed)
    }

    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    /// Record a request against `turn`. False if that turn is not running.
    fn request(&self, turn: u64) -> bool {
        if self.running.load(Ordering::Acquire) != turn {
            return false;
        }
        self.requested.store(turn, Ordering::Release);
        true
    }

    #[inline]
    pub(crate) fn set_enabled(&self, on: bool) {
        compiler_fence(Ordering::SeqCst);
        self.enabled.store(on, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// A request targets the running turn and the job is in its
    /// preemptible region. Critical sections are checked separately.
    #[inline]
    fn targeted(&self) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        let turn = self.running.load(Ordering::Relaxed);
        turn != 0 && self.requested.load(Ordering::Acquire) == turn
    }

    #[inline]
    fn in_critical(&self) -> bool {
        self.critical.load(Ordering::Relaxed) != 0
    }

    /// Safe-point check: yield if a request is pending and allowed.
    ///
    /// Must only be called on the running job's stack.
    #[inline]
    pub(crate) fn poll(&self) {
        if self.targeted() && !self.in_critical() {
            // Safety: caller runs on the job's stack
            unsafe { self.yield_to_scheduler(false) };
        }
    }

    /// Switch from the running job to the scheduler; returns on resume.
    ///
    /// The scheduler always runs with SIGURG blocked and the job's region
    /// always runs with it open. Inside the handler the kernel does both
    /// (the signal is masked during delivery, sigreturn restores the job's
    /// mask); every other yield switches the mask along with the registers.
    ///
    /// # Safety
    ///
    /// Must run on the stack of the job registered by `begin_turn`.
    unsafe fn yield_to_scheduler(&self, in_handler: bool) {
        let mask = !in_handler && self.signal_masked.load(Ordering::Relaxed);
        self.set_enabled(false);
        if mask {
            signal::block_preempt_signal();
        }
        self.preemptions.fetch_add(1, Ordering::Relaxed);
        let job = self.job_regs.load(Ordering::Relaxed);
        let sched = self.sched_regs.load(Ordering::Acquire);
        context_switch(job, sched);
        // Flag before mask: a signal pending since resume finds its target
        self.set_enabled(true);
        if mask {
            signal::unblock_preempt_signal();
        }
    }
}

impl fmt::Debug for PreemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreemptState")
            .field("running", &self.running_turn())
            .field("preemptions", &self.preemptions())
            .field("deferred", &self.deferred())
            .finish()
    }
}

/// Which mechanism interrupts a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionKind {
    /// SIGURG delivered to the worker thread
    Signal,
    /// Flag observed at safe points
    Cooperative,
}

impl PreemptionKind {
    /// Fresh strategy instance for one worker
    pub fn strategy(self) -> Arc<dyn PreemptionStrategy> {
        match self {
            PreemptionKind::Signal => Arc::new(SignalPreemption::new()),
            PreemptionKind::Cooperative => Arc::new(CooperativePreemption::new()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PreemptionKind::Signal => "signal",
            PreemptionKind::Cooperative => "cooperative",
        }
    }
}

impl fmt::Display for PreemptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreemptionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signal" | "sigurg" | "interrupt" => Ok(PreemptionKind::Signal),
            "cooperative" | "coop" | "flag" => Ok(PreemptionKind::Cooperative),
            other => Err(format!("unknown preemption kind '{}'", other)),
        }
    }
}

/// Delivery mechanism for preemption requests.
///
/// One instance per worker. `install`, `enable` and `disable` run on the
/// worker thread; `deliver` may run anywhere.
pub trait PreemptionStrategy: Send + Sync {
    fn kind(&self) -> PreemptionKind;

    /// Worker-thread setup before the first job runs
    fn install(&self, state: &Arc<PreemptState>) -> EngineResult<()>;

    /// Job enters its preemptible region
    fn enable(&self, state: &PreemptState) {
        state.set_enabled(true);
    }

    /// Job leaves its preemptible region
    fn disable(&self, state: &PreemptState) {
        state.set_enabled(false);
    }

    /// Make the worker notice a request already recorded in `state`
    fn deliver(&self, state: &PreemptState) -> EngineResult<()>;
}

thread_local! {
    /// State of the worker owning this thread, for the signal handler
    static CURRENT: Cell<*const PreemptState> = const { Cell::new(std::ptr::null()) };
}

/// Publish `state` as this thread's worker state
pub(crate) fn register_current(state: &Arc<PreemptState>) {
    CURRENT.with(|c| c.set(Arc::as_ptr(state)));
}

/// Forget this thread's worker state if it is `state`
pub(crate) fn unregister_current(state: &Arc<PreemptState>) {
    CURRENT.with(|c| {
        if c.get() == Arc::as_ptr(state) {
            c.set(std::ptr::null());
        }
    });
}

#[inline]
fn current() -> *const PreemptState {
    CURRENT.with(|c| c.get())
}

/// Handle used to preempt one worker from any thread
#[derive(Clone)]
pub struct PreemptHandle {
    state: Arc<PreemptState>,
    strategy: Arc<dyn PreemptionStrategy>,
}

impl PreemptHandle {
    pub(crate) fn new(state: Arc<PreemptState>, strategy: Arc<dyn PreemptionStrategy>) -> Self {
        Self { state, strategy }
    }

    pub fn kind(&self) -> PreemptionKind {
        self.strategy.kind()
    }

    pub fn state(&self) -> &PreemptState {
        &self.state
    }

    #[inline]
    pub fn running_turn(&self) -> Option<u64> {
        self.state.running_turn()
    }

    #[inline]
    pub fn running_since_ns(&self) -> u64 {
        self.state.run_start_ns()
    }

    /// Ask the job running `turn` to give up the CPU.
    ///
    /// Returns `Ok(false)` if that turn already ended.
    pub fn preempt(&self, turn: u64) -> EngineResult<bool> {
        if !self.state.request(turn) {
            return Ok(false);
        }
        self.strategy.deliver(&self.state)?;
        Ok(true)
    }

    /// Preempt whatever job is running now, if any
    pub fn preempt_current(&self) -> EngineResult<bool> {
        match self.running_turn() {
            Some(turn) => self.preempt(turn),
            None => Ok(false),
        }
    }
}

impl fmt::Debug for PreemptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreemptHandle")
            .field("kind", &self.kind())
            .field("state", &self.state)
            .finish()
    }
}

/// Open critical section of the running job.
///
/// Preemption requests are deferred while any section is open; when the
/// outermost one closes, a deferred request is honoured on the spot.
pub struct CriticalSection<'a> {
    state: &'a PreemptState,
    // stays on the job's stack
    _not_send: PhantomData<*const ()>,
}

impl<'a> CriticalSection<'a> {
    pub(crate) fn enter(state: &'a PreemptState) -> Self {
        state.critical.fetch_add(1, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        Self { state, _not_send: PhantomData }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        compiler_fence(Ordering::SeqCst);
        if self.state.critical.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.state.poll();
        }
    }
}
