//! JSON-lines event journal.
//!
//! [`EventJournal`] subscribes to the [`EventBus`](crate::bus::EventBus) and
//! appends every [`ProgressEvent`] to a file, one JSON object per line. It
//! runs as a long-lived background task and exits when the bus is dropped.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::bus::ProgressEvent;

/// Background service that appends progress events to a file.
pub struct EventJournal;

impl EventJournal {
    /// Run the journal loop until the channel closes.
    ///
    /// Write failures are logged and the event is skipped; the loop keeps
    /// going so a transient disk error does not stop journalling.
    pub async fn run(path: PathBuf, mut receiver: broadcast::Receiver<ProgressEvent>) {
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::error!(
                    error = %e,
                    path = %parent.display(),
                    "Failed to create journal directory"
                );
            }
        }
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = Self::append(&path, &event).await {
                        tracing::error!(
                            error = %e,
                            job_id = %event.job_id,
                            stage = event.stage.as_str(),
                            "Failed to journal event"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        skipped = n,
                        "Event journal lagged, some events were not written"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, journal shutting down");
                    break;
                }
            }
        }
    }

    /// Append one event as a JSON line.
    async fn append(path: &Path, event: &ProgressEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}
