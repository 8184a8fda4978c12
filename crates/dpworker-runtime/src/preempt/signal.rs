//! SIGURG-based preemption
//!
//! The worker thread keeps SIGURG blocked except while a job runs
//! application work. A controller records a request in the shared state and
//! `pthread_kill`s the worker; the handler runs on the job's own stack and,
//! if the request is still valid, switches straight to the scheduler. The
//! handler frame stays parked on the job stack until the job is resumed,
//! at which point the handler returns and the kernel restores the job's
//! signal mask.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use dpworker_core::{EngineResult, WorkerError};

use super::{current, PreemptState, PreemptionKind, PreemptionStrategy};

const PREEMPT_SIGNAL: Signal = Signal::SIGURG;

static HANDLER_INIT: Once = Once::new();
static HANDLER_OK: AtomicBool = AtomicBool::new(false);

#[inline]
fn errno_ptr() -> *mut libc::c_int {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // Safety: always valid for the calling thread
            unsafe { libc::__errno_location() }
        } else {
            // Safety: always valid for the calling thread
            unsafe { libc::__error() }
        }
    }
}

extern "C" fn on_preempt_signal(_sig: libc::c_int) {
    let state = current();
    if state.is_null() {
        return;
    }
    // Safety: registered by the worker that owns this thread; cleared
    // before that worker's state is dropped.
    let state = unsafe { &*state };

    if !state.targeted() {
        return;
    }
    if state.in_critical() {
        state.deferred.fetch_add(1, Ordering::Relaxed);
        return;
    }

    // Code in the interrupted job may be between a call and its errno read
    let errno = errno_ptr();
    // Safety: errno is thread-local and we are on its thread; targeted()
    // implies a job turn is live and we are on its stack.
    unsafe {
        let saved = *errno;
        state.yield_to_scheduler(true);
        *errno = saved;
    }
}

fn preempt_mask() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(PREEMPT_SIGNAL);
    mask
}

/// Mask SIGURG on the calling thread
pub(super) fn block_preempt_signal() {
    if let Err(e) = preempt_mask().thread_block() {
        log::warn!("blocking {} failed: {}", PREEMPT_SIGNAL, e);
    }
}

/// Unmask SIGURG on the calling thread
pub(super) fn unblock_preempt_signal() {
    if let Err(e) = preempt_mask().thread_unblock() {
        log::warn!("unblocking {} failed: {}", PREEMPT_SIGNAL, e);
    }
}

fn install_handler() -> bool {
    HANDLER_INIT.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_preempt_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // Safety: the handler only touches atomics and thread-local state
        match unsafe { sigaction(PREEMPT_SIGNAL, &action) } {
            Ok(_) => HANDLER_OK.store(true, Ordering::Release),
            Err(e) => log::error!("sigaction({}) failed: {}", PREEMPT_SIGNAL, e),
        }
    });
    HANDLER_OK.load(Ordering::Acquire)
}

/// Interrupt-driven strategy: jobs need no safe points
pub struct SignalPreemption {
    mask: SigSet,
    /// pthread_t of the worker, 0 until installed
    thread: AtomicUsize,
}

impl SignalPreemption {
    pub fn new() -> Self {
        Self { mask: preempt_mask(), thread: AtomicUsize::new(0) }
    }

    fn thread(&self) -> Option<Pthread> {
        match self.thread.load(Ordering::Acquire) {
            0 => None,
            t => Some(t as Pthread),
        }
    }
}

impl Default for SignalPreemption {
    fn default() -> Self {
        Self::new()
    }
}

impl PreemptionStrategy for SignalPreemption {
    fn kind(&self) -> PreemptionKind {
        PreemptionKind::Signal
    }

    fn install(&self, state: &Arc<PreemptState>) -> EngineResult<()> {
        if !install_handler() {
            return Err(WorkerError::SignalSetupFailed.into());
        }
        // Scheduler code runs with the signal blocked
        self.mask
            .thread_block()
            .map_err(|_| WorkerError::SignalSetupFailed)?;
        state.set_signal_masked(true);
        self.thread.store(pthread_self() as usize, Ordering::Release);
        Ok(())
    }

    fn enable(&self, state: &PreemptState) {
        state.set_enabled(true);
        if let Err(e) = self.mask.thread_unblock() {
            log::warn!("unblocking {} failed: {}", PREEMPT_SIGNAL, e);
        }
    }

    fn disable(&self, state: &PreemptState) {
        // Flag first: a signal landing mid-syscall then finds nothing to do
        state.set_enabled(false);
        if let Err(e) = self.mask.thread_block() {
            log::warn!("blocking {} failed: {}", PREEMPT_SIGNAL, e);
        }
    }

    fn deliver(&self, _state: &PreemptState) -> EngineResult<()> {
        let thread = self.thread().ok_or(WorkerError::SignalDeliveryFailed)?;
        pthread_kill(thread, PREEMPT_SIGNAL).map_err(|_| WorkerError::SignalDeliveryFailed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_deliver_before_install_fails() {
        let s = SignalPreemption::new();
        let state = PreemptState::new();
        assert!(s.deliver(&state).is_err());
    }

    #[test]
    fn test_signal_without_job_is_ignored() {
        let s = SignalPreemption::new();
        let state = Arc::new(PreemptState::new());
        super::super::register_current(&state);
        s.install(&state).unwrap();

        // Blocked in scheduler context: stays pending, then fires when
        // unblocked with no job turn, and is dropped by the handler.
        s.deliver(&state).unwrap();
        s.mask.thread_unblock().unwrap();
        s.mask.thread_block().unwrap();
        assert_eq!(state.preemptions(), 0);

        super::super::unregister_current(&state);
        s.mask.thread_unblock().unwrap();
    }
}
