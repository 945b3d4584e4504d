// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters covering every terminal outcome of a record.
///
/// This is the diagnostics surface of the pipeline: forwarding failures move
/// counters and emit tracing events, they never propagate into the
/// application code path that called `record`.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    records_accepted: AtomicU64,
    records_rejected_full: AtomicU64,
    records_rejected_closed: AtomicU64,
    records_dropped_encoding: AtomicU64,
    records_dropped_fatal: AtomicU64,
    records_dropped_retries_exhausted: AtomicU64,
    records_dropped_shutdown: AtomicU64,
    batches_sent: AtomicU64,
    records_sent: AtomicU64,
}

impl ForwarderStats {
    pub(crate) fn incr_accepted(&self) {
        self.records_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_rejected_full(&self) {
        self.records_rejected_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_rejected_closed(&self) {
        self.records_rejected_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped_encoding(&self, count: u64) {
        self.records_dropped_encoding.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped_fatal(&self, count: u64) {
        self.records_dropped_fatal.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped_retries_exhausted(&self, count: u64) {
        self.records_dropped_retries_exhausted
            .fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped_shutdown(&self, count: u64) {
        self.records_dropped_shutdown.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_sent(&self, records: u64) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.records_sent.fetch_add(records, Ordering::Relaxed);
    }

    /// Sum of every drop class, used by the periodic drop report.
    pub(crate) fn dropped_total(&self) -> u64 {
        self.records_rejected_full.load(Ordering::Relaxed)
            + self.records_rejected_closed.load(Ordering::Relaxed)
            + self.records_dropped_encoding.load(Ordering::Relaxed)
            + self.records_dropped_fatal.load(Ordering::Relaxed)
            + self.records_dropped_retries_exhausted.load(Ordering::Relaxed)
            + self.records_dropped_shutdown.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            records_rejected_full: self.records_rejected_full.load(Ordering::Relaxed),
            records_rejected_closed: self.records_rejected_closed.load(Ordering::Relaxed),
            records_dropped_encoding: self.records_dropped_encoding.load(Ordering::Relaxed),
            records_dropped_fatal: self.records_dropped_fatal.load(Ordering::Relaxed),
            records_dropped_retries_exhausted: self
                .records_dropped_retries_exhausted
                .load(Ordering::Relaxed),
            records_dropped_shutdown: self.records_dropped_shutdown.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the forwarder counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub records_accepted: u64,
    pub records_rejected_full: u64,
    pub records_rejected_closed: u64,
    pub records_dropped_encoding: u64,
    pub records_dropped_fatal: u64,
    pub records_dropped_retries_exhausted: u64,
    pub records_dropped_shutdown: u64,
    pub batches_sent: u64,
    pub records_sent: u64,
}
