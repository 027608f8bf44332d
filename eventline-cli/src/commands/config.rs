//! Configuration management CLI commands.
//!
//! Provides `config path`, `config show` and `config init`.

use std::path::Path;

use clap::Subcommand;
use eventline::config::ConfigFile;

use super::common::{config_path, load_config};
use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// Print the effective configuration as INI
    Show,

    /// Write a configuration file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands, path: Option<&Path>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Path => run_path(path),
        ConfigCommands::Show => run_show(path),
        ConfigCommands::Init { force } => run_init(path, force),
    }
}

fn run_path(path: Option<&Path>) -> Result<(), CliError> {
    let path = config_path(path)?;
    println!("{}", path.display());
    if !path.exists() {
        println!("(file does not exist, defaults are in effect)");
    }
    Ok(())
}

fn run_show(path: Option<&Path>) -> Result<(), CliError> {
    let config = load_config(path)?;
    let mut out = Vec::new();
    config
        .to_ini()
        .write_to(&mut out)
        .map_err(|e| CliError::Config(format!("Failed to render configuration: {}", e)))?;
    print!("{}", String::from_utf8_lossy(&out));
    Ok(())
}

/// Write defaults to the config path. Refuses to overwrite unless `force`.
pub fn run_init(path: Option<&Path>, force: bool) -> Result<(), CliError> {
    let path = config_path(path)?;
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite",
            path.display()
        )));
    }
    ConfigFile::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_loadable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("eventline").join("config.ini");

        run_init(Some(&path), false).unwrap();
        assert!(path.exists());

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(
            loaded.pipeline.max_batch_count,
            ConfigFile::default().pipeline.max_batch_count
        );
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.ini");

        run_init(Some(&path), false).unwrap();
        assert!(matches!(run_init(Some(&path), false), Err(CliError::Config(_))));
        assert!(run_init(Some(&path), true).is_ok());
    }
}
