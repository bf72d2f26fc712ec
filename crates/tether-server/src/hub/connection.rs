//! Per-agent connection handling.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use tether_core::protocol::{AgentMessage, FileChunk, ServerMessage, decode_agent_line, encode_line};

use super::HubError;
use super::frame::{Frame, FrameReader};
use crate::dispatch::Dispatcher;
use crate::registry::SessionRegistry;
use crate::storage::Database;
use crate::transfer::ChunkReceiver;

/// Accepts agent connections and routes their frames.
#[derive(Clone)]
pub struct AgentHub {
    db: Database,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    receiver: Arc<ChunkReceiver>,
    queue_depth: usize,
}

impl AgentHub {
    pub fn new(
        db: Database,
        registry: SessionRegistry,
        dispatcher: Dispatcher,
        receiver: Arc<ChunkReceiver>,
        queue_depth: usize,
    ) -> Self {
        Self {
            db,
            registry,
            dispatcher,
            receiver,
            queue_depth: queue_depth.max(1),
        }
    }

    /// Serve one agent until it disconnects.
    ///
    /// The first frame must be `hello`. Everything after it is handled frame
    /// by frame; a bad frame is logged and skipped.
    #[instrument(skip(self, stream))]
    pub async fn handle_connection<S>(&self, stream: S, peer: &str) -> Result<(), HubError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FrameReader::new(read_half);

        let first = match frames.next_frame().await? {
            Some(Frame::Line(line)) => line,
            Some(Frame::Rejected(reason)) => {
                return Err(HubError::Handshake(format!("unreadable hello: {reason:?}")));
            }
            None => return Err(HubError::Handshake("connection closed before hello".into())),
        };
        let AgentMessage::Hello {
            device_id,
            organization_id,
            device_name,
            alias,
        } = decode_agent_line(&first)?
        else {
            return Err(HubError::Handshake("first frame must be hello".into()));
        };
        if device_id.trim().is_empty() || organization_id.trim().is_empty() {
            return Err(HubError::Handshake(
                "hello must name a device and an organization".into(),
            ));
        }

        self.db
            .upsert_device(&device_id, &organization_id, &device_name, alias.as_deref())
            .await?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel::<ServerMessage>(self.queue_depth);
        let writer = tokio::spawn(write_frames(write_half, rx));
        self.registry
            .register(
                device_id.clone(),
                connection_id.clone(),
                organization_id.clone(),
                tx,
            )
            .await;
        info!(device_id = %device_id, connection_id = %connection_id, "Agent connected");

        match self.dispatcher.replay_deferred(&device_id).await {
            Ok(count) if count > 0 => {
                info!(device_id = %device_id, count, "Replayed deferred runs on connect");
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Failed to replay deferred runs");
            }
            _ => {}
        }

        let result = self
            .read_frames(&mut frames, &device_id, &connection_id)
            .await;

        self.registry.unregister(&connection_id).await;
        writer.abort();
        let abandoned = self.receiver.abandon_owned_by(&connection_id).await;
        if abandoned > 0 {
            warn!(device_id = %device_id, abandoned, "Open transfers dropped on disconnect");
        }
        if let Err(e) = self.db.touch_device(&device_id).await {
            warn!(device_id = %device_id, error = %e, "Failed to update last online");
        }
        info!(device_id = %device_id, connection_id = %connection_id, "Agent disconnected");
        result
    }

    async fn read_frames<R>(
        &self,
        frames: &mut FrameReader<R>,
        device_id: &str,
        connection_id: &str,
    ) -> Result<(), HubError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frame_count = 0u64;
        while let Some(frame) = frames.next_frame().await? {
            frame_count += 1;
            let line = match frame {
                Frame::Line(line) => line,
                Frame::Rejected(reason) => {
                    warn!(device_id = %device_id, frame_count, reason = ?reason, "Unreadable frame skipped");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_agent_line(&line) {
                Ok(message) => self.handle_message(device_id, connection_id, message).await,
                Err(e) => {
                    warn!(device_id = %device_id, frame_count, error = %e, "Malformed frame skipped");
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&self, device_id: &str, connection_id: &str, message: AgentMessage) {
        match message {
            AgentMessage::Hello { .. } => {
                warn!(device_id = %device_id, "Repeated hello ignored");
            }
            AgentMessage::CommandResult {
                auth_token,
                request_id,
                input_type,
                result,
            } => {
                if result.device_id != device_id {
                    warn!(device_id = %device_id, reported = %result.device_id, "Result for another device dropped");
                    return;
                }
                match self
                    .dispatcher
                    .submit_result(&auth_token, &request_id, input_type, &result)
                    .await
                {
                    Ok(true) => debug!(request_id = %request_id, "Command result delivered"),
                    Ok(false) => debug!(request_id = %request_id, "Command result had no waiter"),
                    Err(e) => {
                        warn!(device_id = %device_id, request_id = %request_id, error = %e, "Command result rejected");
                    }
                }
            }
            AgentMessage::ScriptRunResult {
                auth_token,
                script_run_id,
                result,
            } => {
                if result.device_id != device_id {
                    warn!(device_id = %device_id, reported = %result.device_id, "Result for another device dropped");
                    return;
                }
                if let Err(e) = self
                    .dispatcher
                    .record_run_result(&auth_token, script_run_id, &result)
                    .await
                {
                    warn!(device_id = %device_id, run_id = script_run_id, error = %e, "Run result rejected");
                }
            }
            AgentMessage::FileChunk(FileChunk {
                transfer_id,
                file_name,
                data,
                start_of_file,
                end_of_file,
            }) => {
                // Failures are logged by the receiver.
                let _ = self
                    .receiver
                    .receive_chunk(
                        connection_id,
                        &transfer_id,
                        &file_name,
                        &data,
                        start_of_file,
                        end_of_file,
                    )
                    .await;
            }
            AgentMessage::Heartbeat => {
                if let Err(e) = self.db.touch_device(device_id).await {
                    warn!(device_id = %device_id, error = %e, "Heartbeat update failed");
                }
            }
        }
    }
}

/// Drain `rx` onto the agent's socket, one line per frame.
async fn write_frames<W>(mut writer: W, mut rx: mpsc::Receiver<ServerMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode outbound frame");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(error = %e, "Agent writer closed");
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "Agent writer closed");
            return;
        }
    }
}
