use crate::store::{CoordinationStore, StoreResult};
use crate::transcript::TranscriptEntry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Hands transcript entries to a background writer through a bounded queue.
///
/// Callers on latency-sensitive paths (the audio gate) enqueue and move on.
/// The writer task ends once every `AuditRecorder` clone is dropped and the
/// queue is flushed; awaiting its handle is how a host makes sure no audit
/// entry is lost at shutdown. A store failure stops the writer and is returned
/// from the handle.
#[derive(Clone)]
pub struct AuditRecorder {
    tx: mpsc::Sender<TranscriptEntry>,
}

impl AuditRecorder {
    pub fn spawn(
        store: Arc<dyn CoordinationStore>,
        stream_key: String,
        capacity: usize,
    ) -> (Self, JoinHandle<StoreResult<usize>>) {
        let (tx, mut rx) = mpsc::channel::<TranscriptEntry>(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut written = 0;
            while let Some(entry) = rx.recv().await {
                match store.add_to_stream(&stream_key, &entry.to_fields()).await {
                    Ok(id) => {
                        written += 1;
                        debug!(stream = %stream_key, stream_id = %id, "Audit entry appended");
                    }
                    Err(e) => {
                        error!(stream = %stream_key, error = %e, "Failed to append audit entry");
                        return Err(e);
                    }
                }
            }
            Ok(written)
        });
        (Self { tx }, handle)
    }

    /// Queues an entry, waiting for room if the writer is behind.
    /// Fails only when the writer has stopped.
    pub async fn record(&self, entry: TranscriptEntry) -> Result<(), AuditClosed> {
        self.tx.send(entry).await.map_err(|_| AuditClosed)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Audit writer has stopped")]
pub struct AuditClosed;
