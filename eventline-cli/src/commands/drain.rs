//! `eventline drain`: deliver everything in the local queue and exit.
//!
//! Starts a pipeline against the configured collector, asks it to flush and
//! shuts it down. Records still undelivered when the timeout expires stay in
//! the queue for the next run.

use std::sync::Arc;
use std::time::Duration;

use eventline::config::ConfigFile;
use eventline::{
    ConnectivityMonitor, HttpTransport, NetworkState, Pipeline, PipelineError, ShutdownReport,
};
use tracing::info;

use crate::error::CliError;

/// Build the HTTP transport described by the `[transport]` section.
pub fn build_transport(config: &ConfigFile) -> Result<HttpTransport, CliError> {
    let endpoint = config.transport.endpoint.as_deref().ok_or_else(|| {
        CliError::Config(
            "No collector endpoint configured. Set endpoint in the [transport] section of config.ini"
                .to_string(),
        )
    })?;
    let transport = HttpTransport::new(endpoint, config.pipeline.send_timeout)?;
    Ok(match &config.transport.api_key {
        Some(key) => transport.with_api_key(key.clone()),
        None => transport,
    })
}

/// Run the drain command.
pub fn run(config: &ConfigFile, timeout: Duration) -> Result<(), CliError> {
    let transport = Arc::new(build_transport(config)?);
    let pipeline_config = config.to_pipeline_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Runtime(format!("Failed to create Tokio runtime: {}", e)))?;

    let result: Result<ShutdownReport, PipelineError> = runtime.block_on(async move {
        let pipeline = Pipeline::start(
            pipeline_config,
            transport,
            ConnectivityMonitor::fixed(NetworkState::Unmetered),
        )?;
        let pending = pipeline.stats()?.pending;
        info!(pending, "Draining queue");
        println!("Draining {} pending event(s)...", pending);
        pipeline.shutdown(timeout).await
    });

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(PipelineError::ShutdownTimeout {
            timeout_ms,
            outstanding,
        }) => {
            println!(
                "Timed out after {}ms; {} event(s) remain queued for the next run",
                timeout_ms, outstanding
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &ShutdownReport) {
    println!(
        "Drained in {:.1}s, {} event(s) outstanding",
        report.elapsed.as_secs_f64(),
        report.outstanding
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_transport_requires_endpoint() {
        let config = ConfigFile::default();
        assert!(matches!(build_transport(&config), Err(CliError::Config(_))));
    }

    #[test]
    fn test_build_transport_rejects_non_http_endpoint() {
        let mut config = ConfigFile::default();
        config.transport.endpoint = Some("ftp://collector.example.com".to_string());
        assert!(matches!(
            build_transport(&config),
            Err(CliError::Pipeline(PipelineError::Config(_)))
        ));
    }

    #[test]
    fn test_build_transport_with_api_key() {
        let mut config = ConfigFile::default();
        config.transport.endpoint = Some("https://collector.example.com/v1/events".to_string());
        config.transport.api_key = Some("secret".to_string());
        let transport = build_transport(&config).unwrap();
        assert_eq!(transport.endpoint(), "https://collector.example.com/v1/events");
    }
}
