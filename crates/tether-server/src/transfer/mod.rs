//! Chunked file transfer between the control plane and agents.

pub mod lock;
pub mod receiver;
pub mod sender;


pub use lock::{GlobalWriteLock, WriteLock};
pub use receiver::{ChunkReceiver, ReceiveProgress, TransferCompleted};
pub use sender::{FileSender, SendOutcome};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Device not online: {0}")]
    NotOnline(String),

    #[error("No active transfer: {0}")]
    UnknownTransfer(String),

    #[error("Transfer belongs to another sender: {0}")]
    NotOwner(String),

    #[error("Transfer already active: {0}")]
    AlreadyActive(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Connection closed during transfer: {0}")]
    ConnectionClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
