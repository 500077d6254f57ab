//! Receiving side of the data channel.
//!
//! Accepts point-to-point connections, reads the handshake to learn the
//! sending member, then hands every message frame to a [`MessageListener`]
//! exactly once and answers with an ack or nack when one was requested.

use crate::codec::{read_frame, write_frame};
use async_trait::async_trait;
use bytes::Bytes;
use cluster_core::protocol::{Frame, FrameKind};
use cluster_core::{Member, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a new connection may take to present its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer of delivered payloads.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Process one payload from `source`. Returning false answers with a nack.
    async fn on_message_received(&self, payload: Bytes, source: &Member) -> bool;
}

pub struct ReplicationReceiver {
    listener: TcpListener,
    handler: Arc<dyn MessageListener>,
}

impl ReplicationReceiver {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn MessageListener>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Replication receiver listening on {}", listener.local_addr()?);
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is aborted.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handler).await {
                            warn!("Connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn MessageListener>,
) -> Result<(), TransportError> {
    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!("No handshake from {} within {:?}", addr, HANDSHAKE_TIMEOUT);
            return Ok(());
        }
    };
    let Some(first) = first else {
        // Health checks connect and close without a handshake
        debug!("Connection closed before handshake from {}", addr);
        return Ok(());
    };

    let handshake = first.to_handshake()?;
    if handshake.should_warn_version() {
        warn!(
            "Protocol version mismatch from {}: {} (ours {})",
            addr,
            handshake.version,
            cluster_core::protocol::PROTOCOL_VERSION
        );
    }
    let source = handshake.into_member();
    debug!("Connection from {} ({})", source, addr);

    while let Some(frame) = read_frame(&mut stream).await? {
        match frame.kind {
            FrameKind::Message => {
                let ack_requested = frame.ack_requested();
                let id = frame.id;
                let ok = handler.on_message_received(frame.body, &source).await;
                if ack_requested {
                    let reply = if ok { Frame::ack(id) } else { Frame::nack(id) };
                    write_frame(&mut stream, &reply).await?;
                }
            }
            other => {
                warn!("Ignoring unexpected {} frame from {}", other.name(), source);
            }
        }
    }

    debug!("Connection from {} closed", source);
    Ok(())
}
