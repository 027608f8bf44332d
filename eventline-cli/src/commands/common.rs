//! Common types and utilities shared across CLI commands.

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use eventline::config::{default_config_path, ConfigFile};
use eventline::store::RecordStore;
use eventline::Priority;

use crate::error::CliError;

/// Event priority selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum PriorityArg {
    /// Batched and sent once a size or latency threshold is reached
    Normal,
    /// Committed to disk before returning, batched like normal events
    High,
    /// Sent as soon as possible, ahead of queued events
    Immediate,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Immediate => Priority::Immediate,
        }
    }
}

/// Load the config file given with `--config`, or the default one.
///
/// An explicit path must exist. A missing default file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    match path {
        Some(path) => Ok(ConfigFile::load_from(path)?),
        None => Ok(ConfigFile::load()?),
    }
}

/// Config file path in effect for this invocation.
pub fn config_path(path: Option<&Path>) -> Result<PathBuf, CliError> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => default_config_path().ok_or_else(|| {
            CliError::Config("Could not determine a configuration directory".to_string())
        }),
    }
}

/// Open the persistent queue named by the config.
pub fn open_store(config: &ConfigFile) -> Result<RecordStore, CliError> {
    let path = config.pipeline.storage_path.as_ref().ok_or_else(|| {
        CliError::Config(
            "No storage path configured. Set path in the [storage] section of config.ini"
                .to_string(),
        )
    })?;
    Ok(RecordStore::open(path)?)
}
