//! TCP accept loop for agent connections.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::HubError;
use super::connection::AgentHub;

/// Accept agents on `listener` until `shutdown` is cancelled.
///
/// Each connection runs on its own task and is dropped when shutdown starts.
pub async fn serve(
    listener: TcpListener,
    hub: AgentHub,
    shutdown: CancellationToken,
) -> Result<(), HubError> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Agent listener started");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!(addr = %addr, "Agent listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept agent connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                }

                let hub = hub.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let peer = peer.to_string();
                    tokio::select! {
                        () = shutdown.cancelled() => {}
                        result = hub.handle_connection(stream, &peer) => {
                            if let Err(e) = result {
                                warn!(peer = %peer, error = %e, "Agent connection ended with error");
                            }
                        }
                    }
                });
            }
        }
    }
}
