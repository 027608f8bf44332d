//! Delivery of one batch and settlement of its outcome in the store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{encode_payload, BackoffPolicy, OutboundBatch, Transport};
use crate::compression::Compression;
use crate::error::{DeliveryError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::record::{EventRecord, RecordId};
use crate::scheduler::{Batch, BatchId};
use crate::store::RecordStore;

/// Attempts allowed for a batch the collector rejected outright: the first
/// send plus one retry.
pub const PERMANENT_FAILURE_CEILING: u32 = 2;

/// Delivery settings.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub compression: Compression,
    pub backoff: BackoffPolicy,
    /// Attempts after which a record is dropped.
    pub retry_ceiling: u32,
    /// Upper bound on a single send, independent of the transport's own
    /// timeout.
    pub send_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            backoff: BackoffPolicy::default(),
            retry_ceiling: 5,
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one delivery attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryOutcome {
    /// The collector acknowledged the batch; its records are gone from the
    /// store.
    Delivered { batch_id: BatchId, records: usize },
    /// The attempt failed. Records below their ceiling are pending again and
    /// the next drain waits `retry_after`.
    Failed {
        batch_id: BatchId,
        error: String,
        requeued: usize,
        dropped: Vec<RecordId>,
        retry_after: Option<Duration>,
    },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn batch_id(&self) -> &BatchId {
        match self {
            DeliveryOutcome::Delivered { batch_id, .. } => batch_id,
            DeliveryOutcome::Failed { batch_id, .. } => batch_id,
        }
    }

    /// Delay before the next drain, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Failed { retry_after, .. } => *retry_after,
        }
    }

    /// Records that reached their ceiling in this attempt.
    pub fn dropped(&self) -> &[RecordId] {
        match self {
            DeliveryOutcome::Delivered { .. } => &[],
            DeliveryOutcome::Failed { dropped, .. } => dropped,
        }
    }
}

/// Sends batches and settles their records.
///
/// Owned by the pipeline worker, which runs one delivery at a time.
pub struct DeliveryEngine {
    store: Arc<RecordStore>,
    transport: Arc<dyn Transport>,
    metrics: Arc<PipelineMetrics>,
    config: EngineConfig,
    /// Set after a compression failure; the next body is sent uncompressed.
    force_uncompressed: bool,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<RecordStore>,
        transport: Arc<dyn Transport>,
        metrics: Arc<PipelineMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            metrics,
            config,
            force_uncompressed: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Send `records` as `batch` and settle the outcome in the store.
    ///
    /// # Errors
    ///
    /// Only store failures are returned. Transport and codec failures are
    /// reported through [`DeliveryOutcome::Failed`].
    pub async fn deliver(
        &mut self,
        batch: &Batch,
        records: &[EventRecord],
    ) -> PipelineResult<DeliveryOutcome> {
        self.store.mark_in_flight(batch.record_ids())?;

        let outbound = match self.prepare(batch, records) {
            Ok(outbound) => outbound,
            Err(e) => {
                self.metrics.codec_failure();
                self.force_uncompressed = true;
                warn!(
                    batch_id = %batch.id(),
                    error = %e,
                    "Batch encoding failed, next attempt goes uncompressed"
                );
                return self.settle_failure(batch, self.config.retry_ceiling, None, e.to_string());
            }
        };

        debug!(
            batch_id = %batch.id(),
            records = outbound.record_count,
            bytes = outbound.body.len(),
            encoding = outbound.content_encoding.unwrap_or("identity"),
            "Sending batch"
        );

        let result = match tokio::time::timeout(
            self.config.send_timeout,
            self.transport.send(&outbound),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Transient(format!(
                "send exceeded {}ms",
                self.config.send_timeout.as_millis()
            ))),
        };

        match result {
            Ok(ack) => {
                let removed = self.store.mark_delivered(batch.record_ids())?;
                self.metrics.batch_delivered(batch.len(), outbound.body.len());
                info!(
                    batch_id = %batch.id(),
                    records = batch.len(),
                    status = ack.status,
                    "Batch delivered"
                );
                if removed < batch.len() {
                    debug!(
                        batch_id = %batch.id(),
                        expected = batch.len(),
                        removed,
                        "Some records were already settled"
                    );
                }
                Ok(DeliveryOutcome::Delivered {
                    batch_id: batch.id().clone(),
                    records: batch.len(),
                })
            }
            Err(error) => {
                self.metrics.batch_sent(outbound.body.len());
                let ceiling = match &error {
                    DeliveryError::Transient(_) => {
                        self.metrics.transient_failure();
                        self.config.retry_ceiling
                    }
                    DeliveryError::RateLimited { .. } => {
                        self.metrics.rate_limited();
                        self.config.retry_ceiling
                    }
                    DeliveryError::Permanent { .. } => {
                        self.metrics.permanent_failure();
                        self.config.retry_ceiling.min(PERMANENT_FAILURE_CEILING)
                    }
                };
                warn!(batch_id = %batch.id(), error = %error, "Batch delivery failed");
                self.settle_failure(batch, ceiling, error.retry_after(), error.to_string())
            }
        }
    }

    fn prepare(&mut self, batch: &Batch, records: &[EventRecord]) -> PipelineResult<OutboundBatch> {
        let compression = if self.force_uncompressed {
            Compression::None
        } else {
            self.config.compression
        };
        let framed = encode_payload(records)?;
        let body = compression.compress(&framed)?;
        self.force_uncompressed = false;

        Ok(OutboundBatch {
            batch_id: batch.id().clone(),
            record_count: records.len(),
            content_encoding: compression.content_encoding(),
            body,
        })
    }

    fn settle_failure(
        &self,
        batch: &Batch,
        ceiling: u32,
        floor: Option<Duration>,
        error: String,
    ) -> PipelineResult<DeliveryOutcome> {
        self.metrics.batch_failed();
        let outcome = self.store.mark_failed(batch.record_ids(), ceiling)?;
        self.metrics.records_dropped(outcome.dropped.len());

        let retry_after = if outcome.requeued.is_empty() {
            None
        } else {
            Some(
                self.config
                    .backoff
                    .delay_with_floor(outcome.max_retry_count, floor),
            )
        };

        if let Some(delay) = retry_after {
            debug!(
                batch_id = %batch.id(),
                requeued = outcome.requeued.len(),
                retry_count = outcome.max_retry_count,
                delay_ms = delay.as_millis() as u64,
                "Batch scheduled for retry"
            );
        }

        Ok(DeliveryOutcome::Failed {
            batch_id: batch.id().clone(),
            error,
            requeued: outcome.requeued.len(),
            dropped: outcome.dropped,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Priority;
    use crate::store::Durability;
    use crate::transport::{Ack, BoxFuture};
    use parking_lot::Mutex;

    /// Transport that replays a script of results and records what it saw.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<Ack, DeliveryError>>>,
        seen: Mutex<Vec<OutboundBatch>>,
    }

    impl ScriptedTransport {
        fn new(mut script: Vec<Result<Ack, DeliveryError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send<'a>(
            &'a self,
            batch: &'a OutboundBatch,
        ) -> BoxFuture<'a, Result<Ack, DeliveryError>> {
            Box::pin(async move {
                self.seen.lock().push(batch.clone());
                self.script.lock().pop().unwrap_or(Ok(Ack { status: 200 }))
            })
        }
    }

    /// Transport that never answers.
    struct HangingTransport;

    impl Transport for HangingTransport {
        fn send<'a>(&'a self, _: &'a OutboundBatch) -> BoxFuture<'a, Result<Ack, DeliveryError>> {
            Box::pin(std::future::pending())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            compression: Compression::default(),
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
                .with_jitter(0.0),
            retry_ceiling: 5,
            send_timeout: Duration::from_secs(5),
        }
    }

    fn setup(
        transport: Arc<dyn Transport>,
        count: usize,
    ) -> (Arc<RecordStore>, DeliveryEngine) {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        for i in 0..count {
            store
                .enqueue(
                    EventRecord::new(format!("event-{}", i).into_bytes(), Priority::High),
                    Durability::Durable,
                )
                .unwrap();
        }
        let engine = DeliveryEngine::new(
            Arc::clone(&store),
            transport,
            Arc::new(PipelineMetrics::new()),
            config(),
        );
        (store, engine)
    }

    fn next_batch(store: &RecordStore) -> (Batch, Vec<EventRecord>) {
        let records = store.peek_batch(100, 1 << 20).unwrap();
        (Batch::from_records(&records, 100, 1 << 20), records)
    }

    #[tokio::test]
    async fn test_success_removes_records() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (store, mut engine) = setup(transport.clone(), 3);

        let (batch, records) = next_batch(&store);
        let outcome = engine.deliver(&batch, &records).await.unwrap();

        assert!(outcome.is_delivered());
        assert_eq!(store.stats().unwrap().pending, 0);

        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].content_encoding, Some("deflate"));
        assert_eq!(seen[0].decode_records().unwrap(), records);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_backoff() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(DeliveryError::Transient("timeout".to_string())),
            Err(DeliveryError::Transient("timeout".to_string())),
        ]));
        let (store, mut engine) = setup(transport.clone(), 2);

        let (batch, records) = next_batch(&store);
        let first = engine.deliver(&batch, &records).await.unwrap();
        assert_eq!(first.retry_after(), Some(Duration::from_millis(100)));

        let (batch2, records2) = next_batch(&store);
        assert_eq!(batch2.id(), batch.id());
        let second = engine.deliver(&batch2, &records2).await.unwrap();
        assert_eq!(second.retry_after(), Some(Duration::from_millis(200)));

        let (batch3, records3) = next_batch(&store);
        assert!(engine.deliver(&batch3, &records3).await.unwrap().is_delivered());

        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|b| b.batch_id == *batch.id()));
    }

    #[tokio::test]
    async fn test_retry_ceiling_drops_records() {
        let script = (0..5)
            .map(|_| Err(DeliveryError::Transient("down".to_string())))
            .collect();
        let (store, mut engine) = setup(Arc::new(ScriptedTransport::new(script)), 1);

        let mut last = None;
        for _ in 0..5 {
            let (batch, records) = next_batch(&store);
            last = Some(engine.deliver(&batch, &records).await.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.dropped().len(), 1);
        assert_eq!(last.retry_after(), None);
        assert_eq!(store.stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_retried_once() {
        let reject = || {
            Err(DeliveryError::Permanent {
                status: 400,
                reason: "bad".to_string(),
            })
        };
        let (store, mut engine) =
            setup(Arc::new(ScriptedTransport::new(vec![reject(), reject()])), 1);

        let (batch, records) = next_batch(&store);
        let first = engine.deliver(&batch, &records).await.unwrap();
        assert!(first.dropped().is_empty());
        assert!(first.retry_after().is_some());

        let (batch, records) = next_batch(&store);
        let second = engine.deliver(&batch, &records).await.unwrap();
        assert_eq!(second.dropped().len(), 1);
        assert_eq!(store.stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_raises_backoff_floor() {
        let hint = Duration::from_secs(30);
        let (store, mut engine) = setup(
            Arc::new(ScriptedTransport::new(vec![Err(DeliveryError::RateLimited {
                retry_after: Some(hint),
            })])),
            1,
        );
        let (batch, records) = next_batch(&store);
        let outcome = engine.deliver(&batch, &records).await.unwrap();
        assert_eq!(outcome.retry_after(), Some(hint));
    }

    #[tokio::test]
    async fn test_send_timeout_is_transient() {
        let (store, mut engine) = setup(Arc::new(HangingTransport), 1);
        engine.config.send_timeout = Duration::from_millis(20);

        let (batch, records) = next_batch(&store);
        let outcome = engine.deliver(&batch, &records).await.unwrap();
        match outcome {
            DeliveryOutcome::Failed { error, requeued, .. } => {
                assert!(error.contains("transient"));
                assert_eq!(requeued, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forced_uncompressed_after_codec_failure() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let (store, mut engine) = setup(transport.clone(), 1);
        engine.force_uncompressed = true;

        let (batch, records) = next_batch(&store);
        engine.deliver(&batch, &records).await.unwrap();

        assert_eq!(transport.seen.lock()[0].content_encoding, None);
        assert!(!engine.force_uncompressed);
    }
}
