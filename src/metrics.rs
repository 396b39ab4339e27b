// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Engine-wide counters and the per-worker latency sketch. The counters
//! are the only process-wide mutable state in the core; everything else is
//! owned by a worker or guarded by a row's metadata word.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome counters shared by all executors on a coordinator, plus the
/// merged commit-latency sketch. Cheap to clone behind an `Arc`.
#[derive(Default)]
pub struct Metrics {
    pub n_commit: AtomicU64,
    pub n_abort_lock: AtomicU64,
    pub n_abort_read_validation: AtomicU64,
    pub n_abort_no_retry: AtomicU64,
    pub n_network_size: AtomicU64,
    latency: Mutex<Percentile>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn observe_latency_micros(&self, micros: u64) {
        self.latency.lock().add(micros);
    }

    pub fn latency_nth(&self, pct: f64) -> u64 {
        self.latency.lock().nth(pct)
    }

    pub fn commits(&self) -> u64 {
        self.n_commit.load(Ordering::Relaxed)
    }

    pub fn lock_aborts(&self) -> u64 {
        self.n_abort_lock.load(Ordering::Relaxed)
    }

    pub fn validation_aborts(&self) -> u64 {
        self.n_abort_read_validation.load(Ordering::Relaxed)
    }

    pub fn no_retry_aborts(&self) -> u64 {
        self.n_abort_no_retry.load(Ordering::Relaxed)
    }
}

/// Collect-then-sort percentile sketch. Exact rather than approximate: the
/// core commits at most one transaction per worker loop iteration, so the
/// sample volume stays small enough to keep and sort.
#[derive(Default)]
pub struct Percentile {
    samples: Vec<u64>,
    sorted: bool,
}

impl Percentile {
    pub fn new() -> Self {
        Percentile::default()
    }

    pub fn add(&mut self, v: u64) {
        self.samples.push(v);
        self.sorted = false;
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    /// The `pct`-th percentile (e.g. 50.0, 99.9) by nearest-rank. Zero when
    /// empty.
    pub fn nth(&mut self, pct: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        if !self.sorted {
            self.samples.sort_unstable();
            self.sorted = true;
        }
        let rank = (pct / 100.0 * self.samples.len() as f64).ceil() as usize;
        self.samples[rank.clamp(1, self.samples.len()) - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nth_nearest_rank() {
        let mut p = Percentile::new();
        for v in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            p.add(v);
        }
        assert_eq!(p.nth(50.0), 50);
        assert_eq!(p.nth(95.0), 100);
        assert_eq!(p.nth(99.9), 100);
        assert_eq!(p.nth(10.0), 10);
    }

    #[test]
    fn nth_empty_is_zero() {
        let mut p = Percentile::new();
        assert_eq!(p.nth(50.0), 0);
    }

    #[test]
    fn add_after_nth_resorts() {
        let mut p = Percentile::new();
        p.add(50);
        assert_eq!(p.nth(50.0), 50);
        p.add(10);
        assert_eq!(p.nth(50.0), 10);
    }
}
