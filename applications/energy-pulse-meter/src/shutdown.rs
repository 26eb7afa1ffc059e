use crate::batch::MeasurementBatch;
use crate::error::Result;
use std::fmt;
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    Button,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Interrupt => write!(f, "SIGINT"),
            ShutdownTrigger::Terminate => write!(f, "SIGTERM"),
            ShutdownTrigger::Button => write!(f, "button"),
        }
    }
}

/// Resolve on SIGINT, SIGTERM or a trigger sent through `button`.
pub async fn wait_for_trigger(
    mut button: mpsc::Receiver<ShutdownTrigger>,
) -> Result<ShutdownTrigger> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            Ok(ShutdownTrigger::Interrupt)
        }
        _ = terminate => Ok(ShutdownTrigger::Terminate),
        Some(trigger) = button.recv() => Ok(trigger),
    }
}

/// Append the undelivered batch to `path`, creating the file if needed.
/// Returns the number of records written; an empty batch touches nothing.
pub fn persist_batch(path: &Path, batch: &MeasurementBatch) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(batch.as_str().as_bytes())?;
    file.sync_all()?;

    let records = batch.len();
    info!(path = %path.display(), records, "unsent measurements persisted");
    Ok(records)
}
