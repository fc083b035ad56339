//! Lightweight runtime metrics.
//!
//! Atomic counters shared by the orchestrator and gateway, read by status
//! reports through [`RuntimeMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters use relaxed ordering.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Current number of live sandboxes (created - removed).
    pub active_sandboxes: AtomicU64,
    /// Peak concurrent sandboxes observed.
    pub peak_sandboxes: AtomicU64,
    pub sandboxes_created: AtomicU64,
    pub sandboxes_failed: AtomicU64,
    pub execs: AtomicU64,
    pub exec_failures: AtomicU64,
    pub exec_timeouts: AtomicU64,
    pub ai_requests: AtomicU64,
    pub ai_failures: AtomicU64,
    pub ai_units: AtomicU64,
    pub reaped: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sandbox_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        let current = self.active_sandboxes.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_sandboxes.fetch_max(current, Ordering::Relaxed);
    }

    pub fn record_sandbox_failed(&self) {
        self.sandboxes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_removed(&self) {
        let _ = self
            .active_sandboxes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_exec(&self, success: bool, timed_out: bool) {
        self.execs.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.exec_failures.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.exec_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ai_request(&self, success: bool, units: u64) {
        self.ai_requests.fetch_add(1, Ordering::Relaxed);
        self.ai_units.fetch_add(units, Ordering::Relaxed);
        if !success {
            self.ai_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reaped(&self) {
        self.reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all metrics as key-value pairs.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("active_sandboxes".into(), load(&self.active_sandboxes)),
            ("peak_sandboxes".into(), load(&self.peak_sandboxes)),
            ("sandboxes_created".into(), load(&self.sandboxes_created)),
            ("sandboxes_failed".into(), load(&self.sandboxes_failed)),
            ("execs".into(), load(&self.execs)),
            ("exec_failures".into(), load(&self.exec_failures)),
            ("exec_timeouts".into(), load(&self.exec_timeouts)),
            ("ai_requests".into(), load(&self.ai_requests)),
            ("ai_failures".into(), load(&self.ai_failures)),
            ("ai_units".into(), load(&self.ai_units)),
            ("reaped".into(), load(&self.reaped)),
        ]
    }
}
