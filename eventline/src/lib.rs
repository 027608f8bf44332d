//! Eventline - durable event telemetry pipeline
//!
//! Applications record small opaque events; eventline persists them in a local
//! SQLite queue, groups them into batches, compresses each batch and delivers
//! it to a collector with retry, backoff and network awareness. Events survive
//! crashes and restarts and are delivered at least once.
//!
//! # Modules
//!
//! - [`record`]: event record model and its versioned binary encoding
//! - [`store`]: durable queue with delivery state tracking
//! - [`compression`]: batch compression
//! - [`scheduler`]: when to form and send a batch
//! - [`connectivity`]: network state and metered-connection policy
//! - [`transport`]: collector transport, backoff and delivery settlement
//! - [`pipeline`]: the [`Pipeline`] handle tying it all together
//! - [`config`], [`logging`], [`metrics`]: configuration, log setup, counters

pub mod compression;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use config::{ConfigFile, PipelineConfig};
pub use connectivity::{ConnectivityHandle, ConnectivityMonitor, MeteredPolicy, NetworkState};
pub use error::{DeliveryError, PipelineError, PipelineResult};
pub use pipeline::{FlushReport, Pipeline, PipelineEvent, ShutdownReport};
pub use record::{EventRecord, Priority, RecordId};
pub use transport::{HttpTransport, Transport};
