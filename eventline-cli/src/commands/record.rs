//! `eventline record`: append one event to the local queue.
//!
//! The event is committed to disk and left for the next `drain` (or for the
//! host application's pipeline) to deliver.

use eventline::config::ConfigFile;
use eventline::store::Durability;
use eventline::{EventRecord, RecordId};

use super::common::{open_store, PriorityArg};
use crate::error::CliError;

/// Enqueue `message` and return the assigned id.
pub fn enqueue(
    config: &ConfigFile,
    message: &str,
    priority: PriorityArg,
) -> Result<RecordId, CliError> {
    if message.is_empty() {
        return Err(CliError::Config("Event payload must not be empty".to_string()));
    }
    let store = open_store(config)?;
    let record = EventRecord::new(message.as_bytes(), priority.into());
    Ok(store.enqueue(record, Durability::Durable)?)
}

/// Run the record command.
pub fn run(config: &ConfigFile, message: &str, priority: PriorityArg) -> Result<(), CliError> {
    let id = enqueue(config, message, priority)?;
    println!("Recorded event {} ({} bytes)", id, message.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> ConfigFile {
        let mut config = ConfigFile::default();
        config.pipeline.storage_path = Some(dir.path().join("queue").join("events.db"));
        config
    }

    #[test]
    fn test_enqueue_assigns_increasing_ids() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let first = enqueue(&config, "app_start", PriorityArg::Normal).unwrap();
        let second = enqueue(&config, "crash", PriorityArg::Immediate).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_enqueue_rejects_empty_payload() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        assert!(matches!(
            enqueue(&config, "", PriorityArg::High),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_enqueue_requires_storage_path() {
        let mut config = ConfigFile::default();
        config.pipeline.storage_path = None;
        assert!(enqueue(&config, "event", PriorityArg::Normal).is_err());
    }
}
