//! TCP listener and session spawning

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::Bridge;
use crate::session::run_session;

/// Accept MPD clients until shutdown. Each connection runs as its own
/// task; a failed accept is logged and the loop carries on.
pub async fn serve(
    listener: TcpListener,
    bridge: Arc<Bridge>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("listener address")?;
    info!(%addr, "listening for MPD clients");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(run_session(stream, Arc::clone(&bridge), shutdown.clone()));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }
    }
    Ok(())
}
