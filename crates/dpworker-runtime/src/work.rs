//! Application work run by jobs
//!
//! The engine treats request processing as an opaque callback: it hands the
//! request payload to an [`AppWork`] and, once that returns, echoes the
//! payload back to the sender.
//!
//! # Writing work that can be preempted
//!
//! Under signal preemption a job can be switched out between any two
//! instructions, including inside the allocator or while holding a lock.
//! Another job on the same worker that then needs the same lock spins
//! forever. Work must therefore do anything that takes a process-wide lock
//! (heap allocation, stdio, [`SpinLock`](dpworker_core::SpinLock)) inside
//! [`JobContext::critical`] or under a [`JobContext::guard`].
//!
//! Under cooperative preemption a job only yields at
//! [`JobContext::preempt_point`]; long loops should call it.

use std::collections::BTreeMap;
use std::hint::black_box;

use dpworker_core::now_ns;
use dpworker_core::wire::{WireRecord, KIND_GET, KIND_SCAN};

use crate::job::JobContext;

/// Request processing callback
pub trait AppWork: Send + Sync {
    /// Process one request. Runs on the job's own stack.
    fn run(&self, request: &[u8], cx: &JobContext<'_>);
}

impl<F> AppWork for F
where
    F: Fn(&[u8], &JobContext<'_>) + Send + Sync,
{
    #[inline]
    fn run(&self, request: &[u8], cx: &JobContext<'_>) {
        self(request, cx)
    }
}

/// Busy-spin for the service time the request asks for.
///
/// Only time spent running counts; time parked after a preemption does not.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinWork;

impl SpinWork {
    pub fn new() -> Self {
        Self
    }
}

impl AppWork for SpinWork {
    fn run(&self, request: &[u8], cx: &JobContext<'_>) {
        let Some(record) = WireRecord::decode(request) else {
            cx.critical(|| log::debug!("spin: short request ({} bytes)", request.len()));
            return;
        };

        let start = now_ns();
        let parked_before = cx.suspended_ns();
        loop {
            // Resample if a preemption lands between the two reads
            let (now, parked) = loop {
                let s1 = cx.suspended_ns();
                let now = now_ns();
                if cx.suspended_ns() == s1 {
                    break (now, s1);
                }
            };
            let ran = now.saturating_sub(start).saturating_sub(parked - parked_before);
            if ran >= record.run_ns {
                break;
            }
            cx.preempt_point();
            std::hint::spin_loop();
        }
    }
}

/// In-memory ordered key-value store answering GET and SCAN records
#[derive(Debug, Default, Clone)]
pub struct KvWork {
    entries: BTreeMap<u64, Vec<u8>>,
}

impl KvWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with keys `0..n`, each holding `value_len` bytes
    pub fn with_entries(n: u64, value_len: usize) -> Self {
        let entries = (0..n)
            .map(|k| (k, vec![(k & 0xFF) as u8; value_len]))
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, key: u64, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AppWork for KvWork {
    fn run(&self, request: &[u8], cx: &JobContext<'_>) {
        let Some(record) = WireRecord::decode(request) else {
            cx.critical(|| log::debug!("kv: short request ({} bytes)", request.len()));
            return;
        };

        match record.kind {
            KIND_GET => {
                black_box(self.entries.get(&record.key));
            }
            KIND_SCAN => {
                let mut sum = 0u64;
                for (k, v) in &self.entries {
                    sum = sum.wrapping_add(*k).wrapping_add(v.len() as u64);
                    cx.preempt_point();
                }
                black_box(sum);
            }
            other => {
                cx.critical(|| log::warn!("kv: unknown request type {} (id {})", other, record.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_with_entries() {
        let kv = KvWork::with_entries(16, 8);
        assert_eq!(kv.len(), 16);
        assert!(!kv.is_empty());
        assert_eq!(kv.entries.get(&3), Some(&vec![3u8; 8]));
        assert!(KvWork::new().is_empty());
    }

    #[test]
    fn test_closure_is_app_work() {
        fn assert_work<W: AppWork>(_: &W) {}
        let f = |_req: &[u8], _cx: &JobContext<'_>| {};
        assert_work(&f);
        assert_work(&SpinWork::new());
    }
}
