//! Per-core dispatcher/worker handoff
//!
//! A mailbox is two capacity-1 slots: one carries envelopes to the worker,
//! the other carries outcomes back. Each slot has exactly one writer and
//! one reader. The flag byte is the handoff: the writer fills the value,
//! then release-stores a non-empty flag; the reader acquire-loads the flag,
//! moves the value out, then release-stores the empty flag.
//!
//! ```text
//!   dispatcher ──submit──▶ [request  slot]  ──recv────▶ worker
//!   dispatcher ◀──poll──── [response slot]  ◀─complete── worker
//! ```
//!
//! Single writer / single reader is enforced by ownership: [`mailbox`]
//! returns one non-cloneable port per side and every operation takes
//! `&mut self`.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::envelope::{Envelope, JobStatus, Outcome};

/// Inbound slot state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFlag {
    Waiting = 0,
    Ready = 1,
}

/// Outbound slot state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    /// Empty; the last outcome was consumed
    Processed = 0,
    Finished = 1,
    Preempted = 2,
}

const EMPTY: u8 = 0;

/// One cache-line-aligned handoff slot
#[repr(C, align(64))]
struct Slot<T> {
    flag: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            flag: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    fn flag(&self) -> u8 {
        self.flag.load(Ordering::Acquire)
    }

    /// Writer side. Gives the value back if the reader has not drained the
    /// previous one.
    #[inline]
    fn try_put(&self, value: T, flag: u8) -> Result<(), T> {
        debug_assert_ne!(flag, EMPTY);
        if self.flag() != EMPTY {
            return Err(value);
        }
        // Safety: flag is EMPTY, so the reader is not touching value, and
        // we are the only writer.
        unsafe { (*self.value.get()).write(value) };
        self.flag.store(flag, Ordering::Release);
        Ok(())
    }

    /// Reader side. Consumes the value exactly once.
    #[inline]
    fn try_take(&self) -> Option<(T, u8)> {
        let flag = self.flag();
        if flag == EMPTY {
            return None;
        }
        // Safety: non-empty flag was release-stored after the write; the
        // writer will not touch value until we store EMPTY.
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.flag.store(EMPTY, Ordering::Release);
        Some((value, flag))
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if *self.flag.get_mut() != EMPTY {
            // Safety: non-empty means initialized and not yet taken
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

struct Channel {
    request: Slot<Envelope>,
    response: Slot<Outcome>,
}

// Safety: each slot has one writer and one reader (enforced by the ports),
// synchronized by the acquire/release flag protocol.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

/// Create the port pair for one worker core
pub fn mailbox() -> (DispatchPort, WorkerPort) {
    let chan = Arc::new(Channel {
        request: Slot::new(),
        response: Slot::new(),
    });
    (
        DispatchPort { chan: Arc::clone(&chan) },
        WorkerPort { chan },
    )
}

/// Dispatcher end: writes envelopes, reads outcomes
pub struct DispatchPort {
    chan: Arc<Channel>,
}

impl DispatchPort {
    /// Hand an envelope to the worker. Fails (returning it) while the
    /// previous envelope is still unconsumed.
    #[inline]
    pub fn submit(&mut self, envelope: Envelope) -> Result<(), Envelope> {
        self.chan.request.try_put(envelope, RequestFlag::Ready as u8)
    }

    /// Take the worker's next outcome, if one is published
    #[inline]
    pub fn poll(&mut self) -> Option<Outcome> {
        self.chan.response.try_take().map(|(outcome, _)| outcome)
    }

    pub fn request_flag(&self) -> RequestFlag {
        match self.chan.request.flag() {
            EMPTY => RequestFlag::Waiting,
            _ => RequestFlag::Ready,
        }
    }

    pub fn response_flag(&self) -> ResponseFlag {
        match self.chan.response.flag() {
            EMPTY => ResponseFlag::Processed,
            f if f == ResponseFlag::Preempted as u8 => ResponseFlag::Preempted,
            _ => ResponseFlag::Finished,
        }
    }
}

/// Worker end: reads envelopes, writes outcomes
pub struct WorkerPort {
    chan: Arc<Channel>,
}

impl WorkerPort {
    #[inline]
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.chan.request.try_take().map(|(envelope, _)| envelope)
    }

    /// Busy-poll for the next envelope. Returns `None` only once `stop` is
    /// set and the slot is still empty.
    pub fn recv(&mut self, stop: &AtomicBool) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.try_recv() {
                return Some(envelope);
            }
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            core::hint::spin_loop();
        }
    }

    /// Publish an outcome. Fails (returning it) if the dispatcher has not
    /// consumed the previous one.
    #[inline]
    pub fn try_complete(&mut self, outcome: Outcome) -> Result<(), Outcome> {
        let flag = match outcome.status {
            JobStatus::Finished => ResponseFlag::Finished,
            JobStatus::Preempted => ResponseFlag::Preempted,
        };
        self.chan.response.try_put(outcome, flag as u8)
    }

    /// Publish an outcome, spinning until the slot drains. Returns the
    /// outcome back if `stop` is raised first.
    pub fn complete(&mut self, mut outcome: Outcome, stop: &AtomicBool) -> Result<(), Outcome> {
        loop {
            match self.try_complete(outcome) {
                Ok(()) => return Ok(()),
                Err(back) => outcome = back,
            }
            if stop.load(Ordering::Relaxed) {
                return Err(outcome);
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{JobHandle, Work};
    use crate::mempool::Mempool;
    use std::thread;

    fn outcome(n: u64, status: JobStatus) -> Outcome {
        Outcome {
            timestamp: n,
            class: 0,
            handle: JobHandle::new(n as u32, 0),
            status,
        }
    }

    #[test]
    fn test_flag_transitions() {
        let (mut d, mut w) = mailbox();
        assert_eq!(d.request_flag(), RequestFlag::Waiting);

        d.submit(Envelope::resume(JobHandle::new(1, 1), 5, 0)).unwrap();
        assert_eq!(d.request_flag(), RequestFlag::Ready);

        let env = w.try_recv().unwrap();
        assert_eq!(env.timestamp, 5);
        assert_eq!(d.request_flag(), RequestFlag::Waiting);
        assert!(w.try_recv().is_none());

        assert_eq!(d.response_flag(), ResponseFlag::Processed);
        w.try_complete(outcome(1, JobStatus::Preempted)).unwrap();
        assert_eq!(d.response_flag(), ResponseFlag::Preempted);
        assert_eq!(d.poll().unwrap().status, JobStatus::Preempted);
        assert_eq!(d.response_flag(), ResponseFlag::Processed);
    }

    #[test]
    fn test_occupied_slot_rejects() {
        let (mut d, mut w) = mailbox();
        d.submit(Envelope::resume(JobHandle::new(1, 1), 1, 0)).unwrap();
        let back = d.submit(Envelope::resume(JobHandle::new(2, 1), 2, 0)).unwrap_err();
        assert_eq!(back.timestamp, 2);

        w.try_complete(outcome(1, JobStatus::Finished)).unwrap();
        assert!(w.try_complete(outcome(2, JobStatus::Finished)).is_err());
    }

    #[test]
    fn test_stop_ends_recv() {
        let (_d, mut w) = mailbox();
        let stop = AtomicBool::new(true);
        assert!(w.recv(&stop).is_none());
    }

    #[test]
    fn test_unconsumed_packet_released_on_drop() {
        let pool = Mempool::new("mbx", 1, 64).unwrap();
        let (mut d, w) = mailbox();
        d.submit(Envelope::packet(pool.acquire().unwrap(), 0, 0)).unwrap();
        assert_eq!(pool.in_use(), 1);
        drop(d);
        drop(w);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_cross_thread_order_no_duplicates() {
        const N: u64 = 20_000;
        let (mut d, mut w) = mailbox();
        let stop = std::sync::Arc::new(AtomicBool::new(false));

        let worker_stop = stop.clone();
        let worker = thread::spawn(move || {
            let mut seen = 0u64;
            while let Some(env) = w.recv(&worker_stop) {
                let Work::Resume(h) = env.work else { panic!("unexpected packet") };
                assert_eq!(env.timestamp, seen);
                let out = Outcome {
                    timestamp: env.timestamp,
                    class: env.class,
                    handle: h,
                    status: JobStatus::Finished,
                };
                if w.complete(out, &worker_stop).is_err() {
                    break;
                }
                seen += 1;
            }
            seen
        });

        let mut outcomes = Vec::with_capacity(N as usize);
        for i in 0..N {
            let mut env = Envelope::resume(JobHandle::new(i as u32, 0), i, 1);
            loop {
                match d.submit(env) {
                    Ok(()) => break,
                    Err(back) => env = back,
                }
                core::hint::spin_loop();
            }
            loop {
                if let Some(out) = d.poll() {
                    outcomes.push(out);
                    break;
                }
                core::hint::spin_loop();
            }
        }
        stop.store(true, Ordering::Relaxed);

        assert_eq!(worker.join().unwrap(), N);
        assert_eq!(outcomes.len(), N as usize);
        for (i, out) in outcomes.iter().enumerate() {
            assert_eq!(out.timestamp, i as u64);
            assert_eq!(out.handle.slot(), i as u32);
        }
    }
}
