// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::OfferError;
use crate::record::LogRecord;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Bounded accumulator of records awaiting a flush.
///
/// Producers append under a mutex whose critical section covers only the
/// push or the batch swap; encoding and I/O happen elsewhere. The flush task
/// seals batches in acceptance order.
pub struct LogAggregator {
    inner: Mutex<Inner>,
    wakeup: Notify,
    max_batch_size: usize,
    max_batch_age: Duration,
    max_buffered_records: usize,
}

struct Inner {
    records: Vec<LogRecord>,
    first_accepted_at: Option<Instant>,
    closed: bool,
}

impl LogAggregator {
    pub fn new(max_batch_size: usize, max_batch_age: Duration, max_buffered_records: usize) -> Self {
        LogAggregator {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                first_accepted_at: None,
                closed: false,
            }),
            wakeup: Notify::new(),
            max_batch_size,
            max_batch_age,
            max_buffered_records,
        }
    }

    /// Appends a record to the in-progress batch.
    ///
    /// Returns `Full` once `max_buffered_records` are outstanding and
    /// `Closed` after [`close`](Self::close); the caller decides what to do
    /// with the rejected record.
    pub fn offer(&self, record: LogRecord) -> Result<(), OfferError> {
        let reached_batch_size;
        {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.closed {
                return Err(OfferError::Closed);
            }
            if inner.records.len() >= self.max_buffered_records {
                return Err(OfferError::Full);
            }
            if inner.records.is_empty() {
                inner.first_accepted_at = Some(Instant::now());
            }
            inner.records.push(record);
            reached_batch_size = inner.records.len() >= self.max_batch_size;
        }
        if reached_batch_size {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    /// Seals up to `max_batch_size` records, in acceptance order.
    ///
    /// Returns an empty vec when nothing is buffered. The flush task calls
    /// this repeatedly until the buffer drains.
    pub fn take_batch(&self) -> Vec<LogRecord> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.records.is_empty() {
            return Vec::new();
        }
        if inner.records.len() <= self.max_batch_size {
            inner.first_accepted_at = None;
            return std::mem::take(&mut inner.records);
        }
        let remainder = inner.records.split_off(self.max_batch_size);
        // The remainder's age clock restarts at the swap.
        inner.first_accepted_at = Some(Instant::now());
        std::mem::replace(&mut inner.records, remainder)
    }

    /// True once the size or age trigger has fired for the buffered records.
    pub fn should_flush(&self, now: Instant) -> bool {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");
        if inner.records.is_empty() {
            return false;
        }
        if inner.records.len() >= self.max_batch_size {
            return true;
        }
        match inner.first_accepted_at {
            Some(first) => now.saturating_duration_since(first) >= self.max_batch_age,
            None => false,
        }
    }

    /// Completes when a full-size batch becomes ready, letting the flush
    /// task react without waiting for its next tick.
    pub async fn batch_ready(&self) {
        self.wakeup.notified().await;
    }

    /// Stops further offers; buffered records stay available to `take_batch`.
    pub fn close(&self) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");
        inner.closed
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");
        inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogEvent, Severity};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::SystemTime;

    fn record(message: &str) -> LogRecord {
        LogEvent::new(Severity::Info, message).into_record(SystemTime::now())
    }

    fn aggregator(max_batch: usize, max_buffered: usize) -> LogAggregator {
        LogAggregator::new(max_batch, Duration::from_secs(60), max_buffered)
    }

    fn drain(aggregator: &LogAggregator) -> Vec<LogRecord> {
        let mut flushed = Vec::new();
        loop {
            let batch = aggregator.take_batch();
            if batch.is_empty() {
                break;
            }
            flushed.extend(batch);
        }
        flushed
    }

    #[test]
    fn test_take_batch_preserves_acceptance_order() {
        let aggregator = aggregator(10, 100);
        for i in 0..7 {
            aggregator.offer(record(&format!("m{i}"))).unwrap();
        }

        let batch = aggregator.take_batch();
        let messages: Vec<&str> = batch.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["m0", "m1", "m2", "m3", "m4", "m5", "m6"]);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_take_batch_chunks_at_batch_size() {
        let aggregator = aggregator(3, 100);
        for i in 0..8 {
            aggregator.offer(record(&format!("m{i}"))).unwrap();
        }

        assert_eq!(aggregator.take_batch().len(), 3);
        assert_eq!(aggregator.take_batch().len(), 3);
        let tail = aggregator.take_batch();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].message, "m7");
        assert!(aggregator.take_batch().is_empty());
    }

    #[test]
    fn test_capacity_rejects_exactly_once_over_the_cap() {
        let cap = 10_000;
        let aggregator = LogAggregator::new(cap + 1, Duration::from_secs(60), cap);

        let mut rejected = 0;
        for i in 0..=cap {
            if aggregator.offer(record(&format!("m{i}"))) == Err(OfferError::Full) {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 1);
        assert_eq!(aggregator.len(), cap);
    }

    #[test]
    fn test_closed_rejects_offers_but_keeps_buffered_records() {
        let aggregator = aggregator(10, 100);
        aggregator.offer(record("kept")).unwrap();
        aggregator.close();

        assert_eq!(aggregator.offer(record("late")), Err(OfferError::Closed));
        assert!(aggregator.is_closed());

        let batch = aggregator.take_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message, "kept");
    }

    #[test]
    fn test_should_flush_on_size_trigger() {
        let aggregator = aggregator(2, 100);
        assert!(!aggregator.should_flush(Instant::now()));

        aggregator.offer(record("a")).unwrap();
        assert!(!aggregator.should_flush(Instant::now()));

        aggregator.offer(record("b")).unwrap();
        assert!(aggregator.should_flush(Instant::now()));
    }

    #[test]
    fn test_should_flush_on_age_trigger() {
        let max_age = Duration::from_secs(5);
        let aggregator = LogAggregator::new(100, max_age, 1_000);
        aggregator.offer(record("a")).unwrap();

        let now = Instant::now();
        assert!(!aggregator.should_flush(now));
        assert!(aggregator.should_flush(now + max_age));
    }

    #[test]
    fn test_age_clock_resets_after_full_drain() {
        let max_age = Duration::from_secs(5);
        let aggregator = LogAggregator::new(100, max_age, 1_000);
        aggregator.offer(record("a")).unwrap();
        aggregator.take_batch();

        assert!(!aggregator.should_flush(Instant::now() + max_age));
    }

    #[tokio::test]
    async fn test_size_trigger_wakes_waiter() {
        let aggregator = Arc::new(aggregator(2, 100));
        let waiter = {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move { aggregator.batch_ready().await })
        };

        aggregator.offer(record("a")).unwrap();
        aggregator.offer(record("b")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("size trigger never fired")
            .unwrap();
    }

    #[test]
    fn test_concurrent_offers_neither_lose_nor_duplicate() {
        let producers = 4;
        let per_producer = 250;
        let aggregator = Arc::new(LogAggregator::new(
            100,
            Duration::from_secs(60),
            producers * per_producer,
        ));

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        aggregator.offer(record(&format!("{p}:{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let flushed = drain(&aggregator);
        assert_eq!(flushed.len(), producers * per_producer);

        // Within each producer the acceptance order must survive.
        let mut next_per_producer = vec![0usize; producers];
        for record in &flushed {
            let (p, i) = record.message.split_once(':').unwrap();
            let p: usize = p.parse().unwrap();
            let i: usize = i.parse().unwrap();
            assert_eq!(i, next_per_producer[p], "producer {p} reordered");
            next_per_producer[p] += 1;
        }
    }

    proptest! {
        #[test]
        fn prop_offered_records_flush_exactly_once_in_order(
            messages in proptest::collection::vec(".{0,16}", 0..64)
        ) {
            let aggregator = LogAggregator::new(10, Duration::from_secs(60), 1_000);
            for message in &messages {
                aggregator.offer(record(message)).unwrap();
            }

            let flushed = drain(&aggregator);
            prop_assert_eq!(flushed.len(), messages.len());
            for (flushed_record, message) in flushed.iter().zip(&messages) {
                prop_assert_eq!(&flushed_record.message, message);
            }
        }
    }
}
