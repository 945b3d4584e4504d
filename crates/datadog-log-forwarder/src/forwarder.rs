// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregator::LogAggregator;
use crate::config::ForwarderConfig;
use crate::errors::{OfferError, TransportError};
use crate::payload::{self, CommonAttributes};
use crate::record::{AttributeValue, LogEvent, LogRecord};
use crate::sender::{BatchDisposition, HttpTransport, LogSender, Transport};
use crate::stats::{ForwarderStats, StatsSnapshot};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a forwarder instance. No transition leaves `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Created,
    Started,
    Draining,
    Stopped,
}

/// Interval between time-trigger checks by the flush task. Independent of
/// producer activity, so an idle partial batch still flushes on age.
const FLUSH_TICK: Duration = Duration::from_millis(100);

/// Interval between dropped-record diagnostic summaries.
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// The public surface used by log-framework adapters.
///
/// Owns the aggregator, the background flush scheduler, and the sender.
/// Each instance is self-contained; independent forwarders never share
/// state.
pub struct LogForwarder {
    aggregator: Arc<LogAggregator>,
    sender: Arc<LogSender>,
    stats: Arc<ForwarderStats>,
    common_attributes: Arc<CommonAttributes>,
    shutdown_timeout: Duration,
    state: RwLock<ForwarderState>,
    cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl LogForwarder {
    /// Builds a forwarder around an injected transport capability.
    pub fn new(config: ForwarderConfig, transport: Arc<dyn Transport>) -> Self {
        let aggregator = Arc::new(LogAggregator::new(
            config.max_batch_size,
            config.max_batch_age,
            config.max_buffered_records,
        ));
        let sender = Arc::new(LogSender::new(transport, &config));
        let mut common_attributes = CommonAttributes::new();
        common_attributes.insert(
            payload::SOURCE_TYPE_KEY.to_string(),
            AttributeValue::from(config.source_type.clone()),
        );

        LogForwarder {
            aggregator,
            sender,
            stats: Arc::new(ForwarderStats::default()),
            common_attributes: Arc::new(common_attributes),
            shutdown_timeout: config.shutdown_timeout,
            state: RwLock::new(ForwarderState::Created),
            cancel: CancellationToken::new(),
            flush_task: Mutex::new(None),
        }
    }

    /// Builds a forwarder with the HTTP transport derived from the config.
    pub fn from_config(config: ForwarderConfig) -> Result<Self, TransportError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(LogForwarder::new(config, transport))
    }

    /// Starts the background flush scheduler. Must be called within a tokio
    /// runtime. Calling again after a successful start is a no-op.
    pub fn start(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.write().expect("lock poisoned");
            if *state != ForwarderState::Created {
                debug!("log forwarder already started");
                return;
            }
            *state = ForwarderState::Started;
        }

        let worker = FlushWorker {
            aggregator: Arc::clone(&self.aggregator),
            sender: Arc::clone(&self.sender),
            stats: Arc::clone(&self.stats),
            common_attributes: Arc::clone(&self.common_attributes),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());
        {
            #[allow(clippy::expect_used)]
            let mut flush_task = self.flush_task.lock().expect("lock poisoned");
            *flush_task = Some(handle);
        }
        info!("log forwarder started");
    }

    /// Accepts one adapter event.
    ///
    /// Returns immediately: the record is buffered, never sent on the
    /// calling thread. Rejections signal backpressure (`Full`) or lifecycle
    /// (`Closed`); they are counted and otherwise harmless to the caller.
    pub fn record(&self, event: LogEvent) -> Result<(), OfferError> {
        let record = event.into_record(SystemTime::now());
        match self.aggregator.offer(record) {
            Ok(()) => {
                self.stats.incr_accepted();
                Ok(())
            }
            Err(OfferError::Full) => {
                self.stats.incr_rejected_full();
                Err(OfferError::Full)
            }
            Err(OfferError::Closed) => {
                self.stats.incr_rejected_closed();
                Err(OfferError::Closed)
            }
        }
    }

    /// Stops intake, drains the buffer, and sends the final partial batch,
    /// waiting at most the configured shutdown timeout before abandoning
    /// whatever is still in flight. Abandoned records are counted as
    /// dropped, not retried.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(self.shutdown_timeout).await;
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.write().expect("lock poisoned");
            match *state {
                ForwarderState::Created => {
                    // Never started: nothing buffered can be in flight.
                    *state = ForwarderState::Stopped;
                    self.aggregator.close();
                    return;
                }
                ForwarderState::Started => *state = ForwarderState::Draining,
                ForwarderState::Draining | ForwarderState::Stopped => return,
            }
        }

        self.aggregator.close();
        self.cancel.cancel();

        let flush_task = {
            #[allow(clippy::expect_used)]
            let mut flush_task = self.flush_task.lock().expect("lock poisoned");
            flush_task.take()
        };

        let drain = async {
            if let Some(task) = flush_task {
                let _ = task.await;
            }
            flush_pending(
                &self.aggregator,
                &self.sender,
                &self.stats,
                &self.common_attributes,
            )
            .await;
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            let abandoned = self.aggregator.len() as u64;
            if abandoned > 0 {
                self.stats.add_dropped_shutdown(abandoned);
            }
            warn!("shutdown timeout elapsed; abandoning {abandoned} buffered records");
        }

        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.write().expect("lock poisoned");
            *state = ForwarderState::Stopped;
        }
        info!("log forwarder stopped");
    }

    pub fn state(&self) -> ForwarderState {
        #[allow(clippy::expect_used)]
        let state = self.state.read().expect("lock poisoned");
        *state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// The background task owning flush scheduling: periodic age checks, the
/// size-trigger wakeup, and the drop-report heartbeat.
struct FlushWorker {
    aggregator: Arc<LogAggregator>,
    sender: Arc<LogSender>,
    stats: Arc<ForwarderStats>,
    common_attributes: Arc<CommonAttributes>,
    cancel: CancellationToken,
}

impl FlushWorker {
    async fn run(self) {
        let mut tick = interval(FLUSH_TICK);
        let mut last_drop_report = Instant::now();
        let mut reported_drops = 0u64;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.aggregator.batch_ready() => {}
                _ = tick.tick() => {}
            }

            if self.aggregator.should_flush(Instant::now()) {
                flush_pending(
                    &self.aggregator,
                    &self.sender,
                    &self.stats,
                    &self.common_attributes,
                )
                .await;
            }

            if last_drop_report.elapsed() >= DROP_REPORT_INTERVAL {
                reported_drops = report_drops(&self.stats, reported_drops);
                last_drop_report = Instant::now();
            }
        }
        debug!("flush scheduler stopped");
    }
}

/// Seals and sends every ready batch, one at a time, in flush order.
async fn flush_pending(
    aggregator: &LogAggregator,
    sender: &LogSender,
    stats: &ForwarderStats,
    common_attributes: &CommonAttributes,
) {
    loop {
        let batch = aggregator.take_batch();
        if batch.is_empty() {
            return;
        }
        send_batch(batch, sender, stats, common_attributes).await;
    }
}

async fn send_batch(
    batch: Vec<LogRecord>,
    sender: &LogSender,
    stats: &ForwarderStats,
    common_attributes: &CommonAttributes,
) {
    let encoded = match payload::encode_batch(&batch, common_attributes) {
        Ok(encoded) => encoded,
        Err(error) => {
            warn!("dropping batch of {} records: {error}", batch.len());
            stats.add_dropped_encoding(batch.len() as u64);
            return;
        }
    };
    if encoded.records_dropped > 0 {
        stats.add_dropped_encoding(encoded.records_dropped as u64);
    }
    if encoded.records == 0 {
        return;
    }

    debug!("flushing batch of {} records", encoded.records);
    match sender.send(encoded.body).await {
        BatchDisposition::Sent { .. } => stats.add_sent(encoded.records as u64),
        BatchDisposition::DroppedFatal => stats.add_dropped_fatal(encoded.records as u64),
        BatchDisposition::DroppedRetriesExhausted => {
            stats.add_dropped_retries_exhausted(encoded.records as u64);
        }
    }
}

fn report_drops(stats: &ForwarderStats, already_reported: u64) -> u64 {
    let total = stats.dropped_total();
    let delta = total.saturating_sub(already_reported);
    if delta > 0 {
        warn!("dropped {delta} log records since last report");
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::record::Severity;
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU16, Ordering};
    use tokio::time::sleep;

    /// Transport that records every posted body and answers a fixed status.
    struct CapturingTransport {
        status: AtomicU16,
        bodies: Mutex<Vec<Bytes>>,
    }

    impl CapturingTransport {
        fn with_status(status: u16) -> Arc<Self> {
            Arc::new(CapturingTransport {
                status: AtomicU16::new(status),
                bodies: Mutex::new(Vec::new()),
            })
        }

        fn bodies(&self) -> Vec<Bytes> {
            self.bodies.lock().unwrap().clone()
        }

        fn messages(&self) -> Vec<String> {
            self.bodies()
                .iter()
                .flat_map(|body| {
                    let value: serde_json::Value = serde_json::from_slice(body).unwrap();
                    value[0]["logs"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|log| log["message"].as_str().unwrap().to_string())
                        .collect::<Vec<_>>()
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for CapturingTransport {
        async fn post(
            &self,
            body: Bytes,
            _headers: &HeaderMap,
        ) -> Result<StatusCode, TransportError> {
            self.bodies.lock().unwrap().push(body);
            Ok(StatusCode::from_u16(self.status.load(Ordering::SeqCst)).unwrap())
        }
    }

    fn test_config() -> ForwarderConfig {
        ForwarderConfig {
            max_batch_size: 5,
            max_batch_age: Duration::from_secs(60),
            max_buffered_records: 100,
            max_send_attempts: 2,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
            shutdown_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn event(message: &str) -> LogEvent {
        LogEvent::new(Severity::Info, message)
    }

    async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let transport = CapturingTransport::with_status(202);
        let forwarder = LogForwarder::new(test_config(), transport);

        assert_eq!(forwarder.state(), ForwarderState::Created);
        forwarder.start();
        forwarder.start();
        assert_eq!(forwarder.state(), ForwarderState::Started);

        forwarder.shutdown().await;
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_without_age_deadline() {
        let transport = CapturingTransport::with_status(202);
        let forwarder = LogForwarder::new(test_config(), transport.clone());
        forwarder.start();

        for i in 0..5 {
            forwarder.record(event(&format!("m{i}"))).unwrap();
        }

        // The batch-age deadline is 60s, so only the size trigger can fire.
        assert!(
            wait_until(Duration::from_secs(2), || !transport.bodies().is_empty()).await,
            "size-triggered flush never reached the transport"
        );
        assert_eq!(transport.messages(), ["m0", "m1", "m2", "m3", "m4"]);

        let stats = forwarder.stats();
        assert_eq!(stats.records_accepted, 5);
        assert_eq!(stats.records_sent, 5);
        assert_eq!(stats.batches_sent, 1);

        forwarder.shutdown().await;
    }

    #[tokio::test]
    async fn test_age_trigger_flushes_partial_batch() {
        let config = ForwarderConfig {
            max_batch_age: Duration::from_millis(200),
            ..test_config()
        };
        let transport = CapturingTransport::with_status(202);
        let forwarder = LogForwarder::new(config, transport.clone());
        forwarder.start();

        forwarder.record(event("lonely")).unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || !transport.bodies().is_empty()).await,
            "age-triggered flush never reached the transport"
        );
        assert_eq!(transport.messages(), ["lonely"]);

        forwarder.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_final_partial_batch() {
        let transport = CapturingTransport::with_status(202);
        let forwarder = LogForwarder::new(test_config(), transport.clone());
        forwarder.start();

        forwarder.record(event("a")).unwrap();
        forwarder.record(event("b")).unwrap();
        forwarder.shutdown().await;

        assert_eq!(transport.messages(), ["a", "b"]);
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
        assert_eq!(forwarder.stats().records_sent, 2);
    }

    #[tokio::test]
    async fn test_records_after_shutdown_are_rejected_and_never_sent() {
        let transport = CapturingTransport::with_status(202);
        let forwarder = LogForwarder::new(test_config(), transport.clone());
        forwarder.start();

        forwarder.record(event("before")).unwrap();
        forwarder.shutdown().await;

        assert_eq!(forwarder.record(event("after")), Err(OfferError::Closed));
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.messages(), ["before"]);
        let stats = forwarder.stats();
        assert_eq!(stats.records_rejected_closed, 1);
        assert_eq!(stats.records_sent, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_stops_immediately() {
        let transport = CapturingTransport::with_status(202);
        let forwarder = LogForwarder::new(test_config(), transport.clone());

        forwarder.shutdown().await;
        assert_eq!(forwarder.state(), ForwarderState::Stopped);
        assert_eq!(forwarder.record(event("late")), Err(OfferError::Closed));
        assert!(transport.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_intake_response_drops_batch_and_counts_it() {
        let transport = CapturingTransport::with_status(400);
        let forwarder = LogForwarder::new(test_config(), transport.clone());
        forwarder.start();

        for i in 0..5 {
            forwarder.record(event(&format!("m{i}"))).unwrap();
        }

        assert!(
            wait_until(Duration::from_secs(2), || {
                forwarder.stats().records_dropped_fatal == 5
            })
            .await,
            "fatal drop never counted"
        );
        assert_eq!(transport.bodies().len(), 1);
        assert_eq!(forwarder.stats().records_sent, 0);

        forwarder.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_rejections_are_counted() {
        let config = ForwarderConfig {
            max_batch_size: 8,
            max_buffered_records: 8,
            ..test_config()
        };
        let transport = CapturingTransport::with_status(202);
        let forwarder = LogForwarder::new(config, transport);
        // Not started: nothing drains the buffer while we overfill it.

        for i in 0..8 {
            forwarder.record(event(&format!("m{i}"))).unwrap();
        }
        assert_eq!(forwarder.record(event("overflow")), Err(OfferError::Full));

        let stats = forwarder.stats();
        assert_eq!(stats.records_accepted, 8);
        assert_eq!(stats.records_rejected_full, 1);
    }
}
