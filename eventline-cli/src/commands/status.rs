//! `eventline status`: show what is waiting in the local queue.

use eventline::config::ConfigFile;
use eventline::store::{StoreLocation, StoreStats};

use super::common::open_store;
use crate::error::CliError;

/// Read queue statistics without modifying the store.
pub fn collect(config: &ConfigFile) -> Result<(StoreLocation, StoreStats), CliError> {
    let store = open_store(config)?;
    let stats = store.stats()?;
    Ok((store.location().clone(), stats))
}

/// Run the status command.
pub fn run(config: &ConfigFile) -> Result<(), CliError> {
    let (location, stats) = collect(config)?;

    println!("Eventline Queue");
    println!("===============");
    println!();
    match location {
        StoreLocation::File(path) => println!("Store:       {}", path.display()),
        StoreLocation::InMemory => println!("Store:       (in memory)"),
    }
    println!("Pending:     {}", stats.pending);
    println!("In flight:   {}", stats.in_flight);
    println!("Size:        {}", format_bytes(stats.total_bytes));
    match stats.oldest_pending_ms {
        Some(ms) => {
            let age_secs = (chrono::Utc::now().timestamp_millis() - ms).max(0) / 1000;
            println!("Oldest:      {}s ago", age_secs);
        }
        None => println!("Oldest:      -"),
    }
    if stats.immediate_pending {
        println!();
        println!("Immediate events are waiting to be sent.");
    }
    Ok(())
}

/// Format a byte count with binary units.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
