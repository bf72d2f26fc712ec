//! Outbound file transfer to an agent.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use tether_core::protocol::{FileChunk, ServerMessage};

use super::TransferError;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed { transfer_id: String, bytes: u64 },
    /// Stopped between chunks; the agent holds a partial transfer.
    Cancelled { transfer_id: String, bytes: u64 },
}

/// Streams local files to agents as ordered chunks.
#[derive(Clone)]
pub struct FileSender {
    registry: SessionRegistry,
    chunk_size: usize,
}

impl FileSender {
    pub fn new(registry: SessionRegistry, chunk_size: usize) -> Self {
        Self {
            registry,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Send `path` to `device_id`.
    ///
    /// `progress` receives the fraction sent (0.0 to 1.0) after every chunk.
    /// `cancel` is checked before each chunk.
    #[instrument(skip(self, path, progress, cancel), fields(path = %path.display()))]
    pub async fn send_file(
        &self,
        device_id: &str,
        path: &Path,
        progress: impl Fn(f64) + Send,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, TransferError> {
        let session = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| TransferError::NotOnline(device_id.to_string()))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?
            .to_string();
        let mut file = File::open(path).await?;
        let total = file.metadata().await?.len();
        let transfer_id = uuid::Uuid::new_v4().to_string();

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        let mut first = true;
        loop {
            if cancel.is_cancelled() {
                info!(transfer_id = %transfer_id, bytes = sent, "Outbound transfer cancelled");
                return Ok(SendOutcome::Cancelled {
                    transfer_id,
                    bytes: sent,
                });
            }

            let n = file.read(&mut buf).await?;
            let end = n == 0 || sent + n as u64 >= total;
            let chunk = FileChunk {
                transfer_id: transfer_id.clone(),
                file_name: file_name.clone(),
                data: buf[..n].to_vec(),
                start_of_file: first,
                end_of_file: end,
            };
            session
                .send(ServerMessage::FileChunk(chunk))
                .await
                .map_err(|_| TransferError::ConnectionClosed(device_id.to_string()))?;

            first = false;
            sent += n as u64;
            progress(fraction(sent, total));

            if end {
                break;
            }
        }

        info!(transfer_id = %transfer_id, bytes = sent, "Outbound transfer complete");
        Ok(SendOutcome::Completed {
            transfer_id,
            bytes: sent,
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(sent: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (sent as f64 / total as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;

    async fn setup(chunk_size: usize) -> (FileSender, mpsc::Receiver<ServerMessage>, tempfile::TempDir) {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel(64);
        registry
            .register("d1".into(), "c1".into(), "org".into(), tx)
            .await;
        (FileSender::new(registry, chunk_size), rx, tempfile::tempdir().unwrap())
    }

    fn chunks(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<FileChunk> {
        let mut out = Vec::new();
        while let Ok(ServerMessage::FileChunk(chunk)) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn file_is_split_with_markers_and_progress() {
        let (sender, mut rx, dir) = setup(4).await;
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let outcome = sender
            .send_file("d1", &path, move |p| sink.lock().unwrap().push(p), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Completed { bytes: 10, .. }));

        let chunks = chunks(&mut rx);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].start_of_file && !chunks[0].end_of_file);
        assert!(!chunks[1].start_of_file && !chunks[1].end_of_file);
        assert!(chunks[2].end_of_file);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, b"0123456789");
        assert!(chunks.iter().all(|c| c.file_name == "data.bin"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!((seen[2] - 1.0).abs() < f64::EPSILON);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn empty_file_sends_one_chunk_with_both_markers() {
        let (sender, mut rx, dir) = setup(4).await;
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();

        sender
            .send_file("d1", &path, |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        let chunks = chunks(&mut rx);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].start_of_file && chunks[0].end_of_file);
    }

    #[tokio::test]
    async fn cancelled_before_start_sends_nothing() {
        let (sender, mut rx, dir) = setup(4).await;
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"abcdef").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = sender.send_file("d1", &path, |_| {}, &cancel).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Cancelled { bytes: 0, .. }));
        assert!(chunks(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn cancel_from_progress_stops_between_chunks() {
        let (sender, mut rx, dir) = setup(2).await;
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let outcome = sender
            .send_file("d1", &path, move |_| trigger.cancel(), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Cancelled { bytes: 2, .. }));
        assert_eq!(chunks(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn offline_target_is_rejected() {
        let (sender, _rx, dir) = setup(4).await;
        let path = dir.path().join("x");
        tokio::fs::write(&path, b"x").await.unwrap();
        let err = sender
            .send_file("nobody", &path, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotOnline(_)));
    }
}
