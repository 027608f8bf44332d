//! Pipeline orchestrator.
//!
//! [`Pipeline`] is the handle the host application holds. Each instance owns
//! its store, worker task and transport; several pipelines can run side by
//! side in one process.
//!
//! # Lifecycle
//!
//! ```text
//! Pipeline::start ──► record() / flush() / pause() / resume() ──► shutdown()
//!       │
//!       └─ opens store, recovers in-flight rows, spawns PipelineWorker
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use eventline::{ConnectivityMonitor, HttpTransport, NetworkState, Pipeline, PipelineConfig, Priority};
//!
//! # async fn run() -> eventline::PipelineResult<()> {
//! let transport = HttpTransport::new("https://collector.example.com/v1/events", Duration::from_secs(30))?;
//! let (network, monitor) = ConnectivityMonitor::channel(NetworkState::Unmetered);
//!
//! let pipeline = Pipeline::start(
//!     PipelineConfig::new("/var/lib/myapp/events.db"),
//!     Arc::new(transport),
//!     monitor,
//! )?;
//!
//! pipeline.record(b"{\"event\":\"launch\"}".to_vec(), Priority::Normal)?;
//! network.set(NetworkState::Metered);
//! pipeline.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::connectivity::{ConnectivityMonitor, NetworkState};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::record::{EventRecord, Priority, RecordId};
use crate::scheduler::BatchId;
use crate::store::{Durability, RecordStore, StoreLocation, StoreStats};
use crate::transport::{DeliveryEngine, Transport};

use worker::{PipelineWorker, WorkerCommand};

/// Capacity of the diagnostics broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Diagnostics published by a running pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    BatchDelivered {
        batch_id: BatchId,
        records: usize,
    },
    BatchFailed {
        batch_id: BatchId,
        error: String,
        retry_after: Option<Duration>,
    },
    /// Records removed after reaching their retry ceiling.
    RecordsDropped {
        ids: Vec<RecordId>,
        reason: String,
    },
    /// Records removed to stay within the storage quota.
    RecordsEvicted {
        count: usize,
    },
    StorageError {
        message: String,
    },
    ConnectivityChanged(NetworkState),
}

/// Returned when a flush completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushReport {
    /// Highest record id covered by the flush.
    pub watermark: RecordId,
    pub elapsed: Duration,
}

/// Returned by a clean shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub elapsed: Duration,
    /// Records left in the store for the next start.
    pub outstanding: usize,
}

/// A running telemetry pipeline.
pub struct Pipeline {
    store: Arc<RecordStore>,
    metrics: Arc<PipelineMetrics>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: broadcast::Sender<PipelineEvent>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Open the store and start the background worker.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Config` for invalid settings. `StoreUnavailable` if the store cannot
    /// be opened and memory fallback is disabled.
    pub fn start(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
        connectivity: ConnectivityMonitor,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let store = Arc::new(open_store(&config)?);
        let metrics = Arc::new(PipelineMetrics::new());

        let recovered = store.recover_stale_in_flight(Duration::ZERO)?;
        if recovered > 0 {
            info!(recovered, "Recovered records in flight at last exit");
            metrics.records_recovered(recovered);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let engine = DeliveryEngine::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&metrics),
            config.engine_config(),
        );
        let worker = PipelineWorker::new(
            config,
            Arc::clone(&store),
            engine,
            connectivity,
            Arc::clone(&metrics),
            events.clone(),
            commands_rx,
        );

        let worker_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            worker.run(worker_shutdown).await;
        });

        info!(location = ?store.location(), "Pipeline started");

        Ok(Self {
            store,
            metrics,
            commands: commands_tx,
            events,
            shutdown,
            worker: Some(handle),
        })
    }

    /// Store an event for delivery.
    ///
    /// `Normal` records are buffered in memory and persisted on the next
    /// worker cycle. `High` and `Immediate` records are written through before
    /// this returns; `Immediate` also wakes the worker.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` after shutdown began; `WorkerStopped` if the background
    /// worker has exited; `StoreUnavailable` if a durable write fails.
    pub fn record(&self, payload: impl Into<Vec<u8>>, priority: Priority) -> PipelineResult<RecordId> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        if !self.worker_alive() {
            return Err(PipelineError::WorkerStopped);
        }

        let durability = Durability::for_priority(priority);
        let id = match self.store.enqueue(EventRecord::new(payload, priority), durability) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.events.send(PipelineEvent::StorageError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        self.metrics.record_enqueued();
        let _ = self.commands.send(WorkerCommand::Enqueued(priority));
        Ok(id)
    }

    /// Wait until every record stored before this call is delivered or
    /// dropped.
    ///
    /// Records recorded while the flush runs are not waited for. A paused
    /// pipeline does not make progress until resumed.
    pub async fn flush(&self) -> PipelineResult<FlushReport> {
        let watermark = self.store.last_assigned_id();
        let (done, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Flush { watermark, done })
            .map_err(|_| self.stopped_error())?;
        rx.await.map_err(|_| self.stopped_error())
    }

    /// [`Pipeline::flush`] bounded by `timeout`. `Ok(None)` on timeout.
    pub async fn flush_timeout(&self, timeout: Duration) -> PipelineResult<Option<FlushReport>> {
        match tokio::time::timeout(timeout, self.flush()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Flush for at most `timeout`, then stop the worker.
    ///
    /// A send already in progress is allowed to finish. Records not delivered
    /// stay in the store for the next start.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` if the flush did not finish in time. The pipeline is
    /// stopped either way.
    pub async fn shutdown(mut self, timeout: Duration) -> PipelineResult<ShutdownReport> {
        let started = Instant::now();
        info!(timeout_ms = timeout.as_millis() as u64, "Pipeline shutting down");

        let flushed = match self.flush_timeout(timeout).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Flush during shutdown failed");
                false
            }
        };

        self.shutdown.cancel();
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pipeline worker ended abnormally");
            }
        }

        self.store.flush_deferred()?;
        let stats = self.store.stats()?;
        let outstanding = stats.pending + stats.in_flight;

        if !flushed {
            warn!(outstanding, "Shutdown timed out before all records were delivered");
            return Err(PipelineError::ShutdownTimeout {
                timeout_ms: timeout.as_millis() as u64,
                outstanding,
            });
        }

        info!(outstanding, "Pipeline stopped");
        Ok(ShutdownReport {
            elapsed: started.elapsed(),
            outstanding,
        })
    }

    /// Stop starting new sends. Recording continues.
    pub fn pause(&self) {
        let _ = self.commands.send(WorkerCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(WorkerCommand::Resume);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Store counters.
    pub fn stats(&self) -> PipelineResult<StoreStats> {
        self.store.stats()
    }

    pub fn store_location(&self) -> &StoreLocation {
        self.store.location()
    }

    fn worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn stopped_error(&self) -> PipelineError {
        if self.shutdown.is_cancelled() {
            PipelineError::ShuttingDown
        } else {
            PipelineError::WorkerStopped
        }
    }

    /// Receive diagnostics from now on. Slow receivers miss old events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Stops the worker if `shutdown` was never called.
        self.shutdown.cancel();
    }
}

fn open_store(config: &PipelineConfig) -> PipelineResult<RecordStore> {
    let Some(path) = &config.storage_path else {
        return RecordStore::open_in_memory();
    };
    match RecordStore::open(path) {
        Ok(store) => Ok(store),
        Err(e) if config.memory_fallback => {
            warn!(
                path = %path.display(),
                error = %e,
                "Cannot open event store, falling back to memory; events will not survive restart"
            );
            RecordStore::open_in_memory()
        }
        Err(e) => Err(e),
    }
}
