//! Inbound chunk reassembly.
//!
//! A transfer opens on its start chunk, appends every non-empty payload in
//! arrival order, and closes on its end chunk. Chunks are assumed to arrive
//! in order over one connection; nothing is resequenced.
//!
//! Every transfer belongs to the sender that started it. Chunks from anyone
//! else are refused, and a sender that goes away can have its open
//! transfers abandoned in one call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use super::TransferError;
use super::lock::{GlobalWriteLock, WriteLock};

/// Published once a transfer's end chunk has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompleted {
    pub transfer_id: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// State of a transfer after one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveProgress {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub complete: bool,
}

struct TransferSession {
    /// Connection that sent the start chunk.
    owner: String,
    path: PathBuf,
    file: File,
    bytes_written: u64,
}

/// Receives chunked files into `base_dir`.
pub struct ChunkReceiver<L: WriteLock = GlobalWriteLock> {
    base_dir: PathBuf,
    lock: L,
    transfers: Mutex<HashMap<String, TransferSession>>,
    completions: broadcast::Sender<TransferCompleted>,
}

impl ChunkReceiver<GlobalWriteLock> {
    pub fn new(base_dir: PathBuf) -> Self {
        Self::with_lock(base_dir, GlobalWriteLock::new())
    }
}

impl<L: WriteLock> ChunkReceiver<L> {
    pub fn with_lock(base_dir: PathBuf, lock: L) -> Self {
        let (completions, _) = broadcast::channel(64);
        Self {
            base_dir,
            lock,
            transfers: Mutex::new(HashMap::new()),
            completions,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Completion events for transfers finished after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferCompleted> {
        self.completions.subscribe()
    }

    pub async fn is_active(&self, transfer_id: &str) -> bool {
        self.transfers.lock().await.contains_key(transfer_id)
    }

    pub async fn active_count(&self) -> usize {
        self.transfers.lock().await.len()
    }

    /// Handle one chunk of `transfer_id` sent by `owner`.
    ///
    /// Errors are logged here as well as returned. The write lock is released
    /// on every path; a failed transfer stays registered with whatever bytes
    /// it already wrote and must be restarted under a new id.
    pub async fn receive_chunk(
        &self,
        owner: &str,
        transfer_id: &str,
        file_name: &str,
        bytes: &[u8],
        is_start: bool,
        is_end: bool,
    ) -> Result<ReceiveProgress, TransferError> {
        let _guard = self.lock.acquire(&self.base_dir).await;
        let result = self
            .receive_locked(owner, transfer_id, file_name, bytes, is_start, is_end)
            .await;
        if let Err(e) = &result {
            warn!(owner = %owner, transfer_id = %transfer_id, file_name = %file_name, error = %e, "Chunk receive failed");
        }
        result
    }

    /// Close every open transfer started by `owner`, keeping the bytes already written.
    ///
    /// Returns how many transfers were dropped.
    pub async fn abandon_owned_by(&self, owner: &str) -> usize {
        let _guard = self.lock.acquire(&self.base_dir).await;
        let mut transfers = self.transfers.lock().await;
        let ids: Vec<String> = transfers
            .iter()
            .filter(|(_, session)| session.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(mut session) = transfers.remove(id) {
                if let Err(e) = session.file.flush().await {
                    warn!(transfer_id = %id, error = %e, "Flush of abandoned transfer failed");
                }
                info!(
                    transfer_id = %id,
                    path = %session.path.display(),
                    bytes = session.bytes_written,
                    "Transfer abandoned"
                );
            }
        }
        ids.len()
    }

    async fn receive_locked(
        &self,
        owner: &str,
        transfer_id: &str,
        file_name: &str,
        bytes: &[u8],
        is_start: bool,
        is_end: bool,
    ) -> Result<ReceiveProgress, TransferError> {
        let mut transfers = self.transfers.lock().await;

        if is_start {
            if transfers.contains_key(transfer_id) {
                return Err(TransferError::AlreadyActive(transfer_id.to_string()));
            }
            let (path, file) = self.create_destination(file_name).await?;
            info!(transfer_id = %transfer_id, path = %path.display(), "Transfer started");
            transfers.insert(
                transfer_id.to_string(),
                TransferSession {
                    owner: owner.to_string(),
                    path,
                    file,
                    bytes_written: 0,
                },
            );
        }

        let session = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if session.owner != owner {
            return Err(TransferError::NotOwner(transfer_id.to_string()));
        }

        if !bytes.is_empty() {
            session.file.write_all(bytes).await?;
            session.bytes_written += bytes.len() as u64;
        }

        if !is_end {
            return Ok(ReceiveProgress {
                path: session.path.clone(),
                bytes_written: session.bytes_written,
                complete: false,
            });
        }

        session.file.flush().await?;
        let Some(session) = transfers.remove(transfer_id) else {
            return Err(TransferError::UnknownTransfer(transfer_id.to_string()));
        };
        drop(transfers);

        info!(
            transfer_id = %transfer_id,
            path = %session.path.display(),
            bytes = session.bytes_written,
            "Transfer complete"
        );
        let event = TransferCompleted {
            transfer_id: transfer_id.to_string(),
            path: session.path.clone(),
            bytes: session.bytes_written,
        };
        let completions = self.completions.clone();
        tokio::spawn(async move {
            // No subscribers is fine.
            let _ = completions.send(event);
        });

        Ok(ReceiveProgress {
            path: session.path,
            bytes_written: session.bytes_written,
            complete: true,
        })
    }

    /// Create an empty file for `file_name` under `base_dir` without overwriting anything.
    async fn create_destination(&self, file_name: &str) -> Result<(PathBuf, File), TransferError> {
        let name = sanitize_file_name(file_name)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let mut candidates = candidate_names(&name);
        loop {
            let Some(candidate) = candidates.next() else {
                return Err(TransferError::InvalidName(file_name.to_string()));
            };
            let path = self.base_dir.join(candidate);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    normalize_permissions(&path, 0o664).await?;
                    return Ok((path, file));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Reduce a declared name to its final path component.
fn sanitize_file_name(file_name: &str) -> Result<String, TransferError> {
    let normalized = file_name.replace('\\', "/");
    match Path::new(&normalized).file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.trim().is_empty() => Ok(name.to_string()),
        _ => Err(TransferError::InvalidName(file_name.to_string())),
    }
}

/// `name`, then `stem-0.ext`, `stem-1.ext`, ...
fn candidate_names(name: &str) -> impl Iterator<Item = String> {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string();
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_string);

    std::iter::once(name.to_string()).chain((0..u32::MAX).map(move |i| match &ext {
        Some(ext) => format!("{stem}-{i}.{ext}"),
        None => format!("{stem}-{i}"),
    }))
}

#[cfg(unix)]
async fn normalize_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn normalize_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_reduced_to_last_component() {
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\a\\report.txt").unwrap(), "report.txt");
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("..").is_err());
    }

    #[test]
    fn candidates_insert_counter_before_extension() {
        let names: Vec<String> = candidate_names("report.txt").take(3).collect();
        assert_eq!(names, vec!["report.txt", "report-0.txt", "report-1.txt"]);

        let names: Vec<String> = candidate_names("README").take(2).collect();
        assert_eq!(names, vec!["README", "README-0"]);
    }
}
