//! TCP accept loop and per-connection request handling.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::frame::{read_frame_head, write_frame, FrameError};
use crate::gateway::{error_frame, Gateway};
use crate::metrics;
use crate::state::AppState;

/// Back-off after a failed accept (e.g. descriptor exhaustion).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// MMP server.
pub struct Server {
    listener: TcpListener,
    gateway: Gateway,
    max_payload: u64,
}

impl Server {
    /// Bind the listener.
    pub async fn bind(addr: &str, state: AppState) -> ApiResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let max_payload = state.config.max_upload_bytes;
        Ok(Self {
            listener,
            gateway: Gateway::new(state),
            max_payload,
        })
    }

    pub fn local_addr(&self) -> ApiResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until `shutdown` is raised.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ApiResult<()> {
        info!(addr = %self.local_addr()?, "Gateway listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = raised(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            self.gateway.clone(),
                            self.max_payload,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open_connections = connections.len(), "Gateway stopping");
        while connections.join_next().await.is_some() {}
        info!("Gateway stopped");
        Ok(())
    }
}

/// Resolves once the flag is raised. A dropped sender never resolves.
async fn raised(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Gateway,
    max_payload: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    metrics::record_connection_opened();
    debug!(peer = %peer, "Connection opened");

    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let head = tokio::select! {
            _ = raised(&mut shutdown) => break,
            head = read_frame_head(&mut reader, max_payload) => head,
        };

        match head {
            Ok(Some(head)) => {
                let received = tokio::select! {
                    _ = raised(&mut shutdown) => break,
                    received = gateway.receive(head, &mut reader) => received,
                };
                let inbound = match received {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        metrics::record_frame_error();
                        warn!(peer = %peer, error = %e, "Failed to receive payload, closing connection");
                        let _ = write_frame(&mut writer, &error_frame(Value::Null, &e)).await;
                        break;
                    }
                };

                let response = gateway.handle(peer, inbound).await;
                if let Err(e) = write_frame(&mut writer, &response).await {
                    debug!(peer = %peer, error = %e, "Failed to write response");
                    break;
                }
            }
            Ok(None) => break,
            Err(FrameError::Io(e)) => {
                debug!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
            Err(e) => {
                metrics::record_frame_error();
                warn!(peer = %peer, error = %e, "Unrecoverable framing error, closing connection");
                let response = error_frame(Value::Null, &ApiError::from(e));
                let _ = write_frame(&mut writer, &response).await;
                break;
            }
        }
    }

    metrics::record_connection_closed();
    debug!(peer = %peer, "Connection closed");
}
