//! Background worker driving scheduler, connectivity and delivery.
//!
//! One task per pipeline. Commands arrive over an unbounded channel, shutdown
//! through a cancellation token. The loop wakes on a command, a connectivity
//! change or the evaluation tick, then runs one cycle:
//!
//! 1. persist deferred records, enforce the quota, recover stale rows
//! 2. resolve flush waiters
//! 3. ask the scheduler whether to drain; if so, send one batch
//! 4. repeat step 2-3 while batches keep succeeding
//!
//! Cancellation is observed between batches; a send in progress completes.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FlushReport, PipelineEvent};
use crate::config::PipelineConfig;
use crate::connectivity::{ConnectivityMonitor, NetworkState};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::record::{Priority, RecordId};
use crate::scheduler::{Batch, BatchScheduler, DrainReason};
use crate::store::RecordStore;
use crate::transport::{DeliveryEngine, DeliveryOutcome};

/// Messages from the [`super::Pipeline`] handle.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// A record was stored.
    Enqueued(Priority),
    /// Report once every record up to `watermark` is settled.
    Flush {
        watermark: RecordId,
        done: oneshot::Sender<FlushReport>,
    },
    Pause,
    Resume,
}

struct FlushWaiter {
    watermark: RecordId,
    requested_at: Instant,
    done: oneshot::Sender<FlushReport>,
}

/// What woke the loop.
enum Wake {
    Command(WorkerCommand),
    Connectivity(Option<NetworkState>),
    Tick,
}

/// Result of one drain attempt.
enum Drain {
    /// A batch went out (delivered or settled as failed).
    Sent,
    /// Nothing was sent.
    Held,
}

pub(crate) struct PipelineWorker {
    config: PipelineConfig,
    store: Arc<RecordStore>,
    scheduler: BatchScheduler,
    engine: DeliveryEngine,
    connectivity: ConnectivityMonitor,
    connectivity_live: bool,
    metrics: Arc<PipelineMetrics>,
    events: broadcast::Sender<PipelineEvent>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    flush_waiters: Vec<FlushWaiter>,
    last_stale_scan: Instant,
    holding_for_network: bool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl PipelineWorker {
    pub(crate) fn new(
        config: PipelineConfig,
        store: Arc<RecordStore>,
        engine: DeliveryEngine,
        connectivity: ConnectivityMonitor,
        metrics: Arc<PipelineMetrics>,
        events: broadcast::Sender<PipelineEvent>,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Self {
        Self {
            scheduler: BatchScheduler::new(config.scheduler_config()),
            config,
            store,
            engine,
            connectivity,
            connectivity_live: true,
            metrics,
            events,
            commands,
            flush_waiters: Vec::new(),
            last_stale_scan: Instant::now(),
            holding_for_network: false,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        info!(
            max_batch_count = self.config.max_batch_count,
            max_latency_ms = self.config.max_latency.as_millis() as u64,
            network = %self.connectivity.current(),
            "Pipeline worker starting"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Pipeline worker received shutdown");
                    break;
                }

                Some(command) = self.commands.recv() => Wake::Command(command),

                change = self.connectivity.wait_for_change(), if self.connectivity_live => {
                    Wake::Connectivity(change)
                }

                _ = ticker.tick() => Wake::Tick,
            };

            let evaluate_now = match wake {
                Wake::Command(command) => self.handle_command(command),
                Wake::Connectivity(Some(state)) => {
                    let _ = self.events.send(PipelineEvent::ConnectivityChanged(state));
                    state.is_available()
                }
                Wake::Connectivity(None) => {
                    debug!("Connectivity publisher dropped, network state is now fixed");
                    self.connectivity_live = false;
                    false
                }
                Wake::Tick => true,
            };

            if evaluate_now {
                self.run_cycle(&shutdown).await;
            }
        }

        if let Err(e) = self.store.flush_deferred() {
            error!(error = %e, "Failed to persist deferred records on shutdown");
        }
        info!(
            pending_flushes = self.flush_waiters.len(),
            "Pipeline worker stopped"
        );
    }

    /// Apply a command. Returns true if a cycle should run right away.
    fn handle_command(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Enqueued(priority) => priority == Priority::Immediate,
            WorkerCommand::Flush { watermark, done } => {
                debug!(watermark = watermark.0, "Flush requested");
                self.flush_waiters.push(FlushWaiter {
                    watermark,
                    requested_at: Instant::now(),
                    done,
                });
                true
            }
            WorkerCommand::Pause => {
                info!("Uploads paused");
                self.scheduler.pause();
                false
            }
            WorkerCommand::Resume => {
                info!("Uploads resumed");
                self.scheduler.resume();
                true
            }
        }
    }

    async fn run_cycle(&mut self, shutdown: &CancellationToken) {
        if let Err(e) = self.maintain() {
            self.report_store_error(&e);
            return;
        }

        while !shutdown.is_cancelled() {
            let stats = match self.store.stats() {
                Ok(stats) => stats,
                Err(e) => {
                    self.report_store_error(&e);
                    return;
                }
            };

            self.resolve_flush_waiters();
            if !self.flush_waiters.is_empty() {
                self.scheduler.request_flush();
            }

            let Some(reason) = self.scheduler.observe(&stats, now_ms()) else {
                return;
            };

            match self.drain(reason).await {
                Drain::Sent => continue,
                Drain::Held => return,
            }
        }
    }

    /// Housekeeping that runs every cycle.
    fn maintain(&mut self) -> Result<(), PipelineError> {
        let written = self.store.flush_deferred()?;
        if written > 0 {
            debug!(written, "Persisted deferred records");
        }

        let evicted = self.store.evict_oldest(self.config.storage_quota_bytes)?;
        if evicted > 0 {
            self.metrics.records_evicted(evicted);
            let _ = self.events.send(PipelineEvent::RecordsEvicted { count: evicted });
        }

        let scan_every = (self.config.stale_in_flight_timeout / 2).max(self.config.tick_interval);
        if self.last_stale_scan.elapsed() >= scan_every {
            self.last_stale_scan = Instant::now();
            let recovered = self
                .store
                .recover_stale_in_flight(self.config.stale_in_flight_timeout)?;
            if recovered > 0 {
                self.metrics.records_recovered(recovered);
            }
        }
        Ok(())
    }

    /// Form and send one batch.
    async fn drain(&mut self, reason: DrainReason) -> Drain {
        let network = self.connectivity.current();
        if !network.is_available() {
            if !self.holding_for_network {
                info!(?reason, "Network unavailable, holding batch");
                self.holding_for_network = true;
            }
            return Drain::Held;
        }
        self.holding_for_network = false;

        let allowed = self
            .config
            .allow_metered_transmission
            .allowed_priorities(network);
        if allowed.is_empty() {
            debug!(%network, "No priority may be sent on this network");
            return Drain::Held;
        }

        if !self.scheduler.begin_drain() {
            return Drain::Held;
        }

        let records = match self.store.peek_batch_for(
            self.config.max_batch_count,
            self.config.max_batch_bytes,
            &allowed,
        ) {
            Ok(records) => records,
            Err(e) => {
                self.scheduler.finish_drain(None, now_ms());
                self.report_store_error(&e);
                return Drain::Held;
            }
        };

        if records.is_empty() {
            debug!(%network, ?reason, "Nothing eligible to send");
            self.scheduler.finish_drain(None, now_ms());
            return Drain::Held;
        }

        let batch = Batch::from_records(
            &records,
            self.config.max_batch_count,
            self.config.max_batch_bytes,
        );
        debug!(
            batch_id = %batch.id(),
            records = batch.len(),
            encoded_bytes = batch.encoded_bytes(),
            ?reason,
            "Draining batch"
        );

        match self.engine.deliver(&batch, &records).await {
            Ok(outcome) => {
                self.scheduler.finish_drain(outcome.retry_after(), now_ms());
                self.publish_outcome(outcome);
                Drain::Sent
            }
            Err(e) => {
                // Records stay in flight until the stale scan returns them.
                self.scheduler
                    .finish_drain(Some(self.config.backoff.base_delay()), now_ms());
                self.report_store_error(&e);
                Drain::Held
            }
        }
    }

    fn publish_outcome(&self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered { batch_id, records } => {
                let _ = self
                    .events
                    .send(PipelineEvent::BatchDelivered { batch_id, records });
            }
            DeliveryOutcome::Failed {
                batch_id,
                error,
                dropped,
                retry_after,
                ..
            } => {
                if !dropped.is_empty() {
                    let _ = self.events.send(PipelineEvent::RecordsDropped {
                        ids: dropped,
                        reason: error.clone(),
                    });
                }
                let _ = self.events.send(PipelineEvent::BatchFailed {
                    batch_id,
                    error,
                    retry_after,
                });
            }
        }
    }

    /// Answer every waiter whose records are all settled.
    fn resolve_flush_waiters(&mut self) {
        if self.flush_waiters.is_empty() {
            return;
        }
        let store = &self.store;
        let mut still_waiting = Vec::with_capacity(self.flush_waiters.len());
        for waiter in self.flush_waiters.drain(..) {
            if waiter.done.is_closed() {
                continue;
            }
            match store.outstanding_through(waiter.watermark) {
                Ok(0) => {
                    let report = FlushReport {
                        watermark: waiter.watermark,
                        elapsed: waiter.requested_at.elapsed(),
                    };
                    debug!(watermark = waiter.watermark.0, "Flush complete");
                    let _ = waiter.done.send(report);
                }
                Ok(_) => still_waiting.push(waiter),
                Err(e) => {
                    warn!(error = %e, "Could not check flush progress");
                    still_waiting.push(waiter);
                }
            }
        }
        self.flush_waiters = still_waiting;
    }

    fn report_store_error(&self, e: &PipelineError) {
        error!(error = %e, "Store operation failed");
        let _ = self.events.send(PipelineEvent::StorageError {
            message: e.to_string(),
        });
    }
}
