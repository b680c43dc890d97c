use std::path::PathBuf;

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const QUEUE_DEPTH: usize = 256;

/// Append-only JSON-lines record of every received command.
///
/// `record` never waits: entries are queued to a writer task, and dropped
/// with a warning if the queue is full.
#[derive(Clone)]
pub struct CommandLog {
    tx: Option<mpsc::Sender<Value>>,
}

impl CommandLog {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the writer task. It exits after the last clone is dropped and
    /// the queue is drained. Must be called within a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> (Self, JoinHandle<()>) {
        let path = path.into();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(write_entries(path, rx));
        (Self { tx: Some(tx) }, task)
    }

    pub fn record(&self, raw: &Value) {
        let Some(tx) = &self.tx else { return };
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let entry = json!({ "timestamp": timestamp, "command": raw });
        if let Err(e) = tx.try_send(entry) {
            warn!("helm: command log entry dropped: {}", e);
        }
    }
}

async fn write_entries(path: PathBuf, mut rx: mpsc::Receiver<Value>) {
    let mut file = match tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!("helm: command log {} unavailable: {}", path.display(), e);
            while rx.recv().await.is_some() {}
            return;
        }
    };
    debug!("helm: command log at {}", path.display());
    while let Some(entry) = rx.recv().await {
        let mut line = entry.to_string();
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!("helm: command log write failed: {}", e);
            continue;
        }
        if let Err(e) = file.flush().await {
            warn!("helm: command log flush failed: {}", e);
        }
    }
}
