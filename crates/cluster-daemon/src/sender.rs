//! Point-to-point data sender.
//!
//! A [`PeerSender`] owns one persistent TCP connection to one peer. It writes
//! message frames, optionally waits for the matching ack, retries on a fresh
//! connection and reports every outcome into the peer's shared
//! [`SenderState`]. Callers never drive one sender concurrently (`&mut self`).

use crate::codec::{read_frame, write_frame};
use bytes::Bytes;
use cluster_core::protocol::{FRAME_HEADER_LEN, Frame, FrameKind, Handshake, MAX_FRAME_SIZE};
use cluster_core::{Member, ProtocolError, SenderConfig, SenderState, TransportError};
use socket2::SockRef;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tracing::{debug, info, warn};

pub struct PeerSender {
    config: SenderConfig,
    local: Handshake,
    destination: Member,
    state: Arc<SenderState>,
    stream: Option<TcpStream>,
    /// Messages written on the current connection
    request_count: u64,
    last_used: Option<Instant>,
    next_message_id: u64,
}

impl PeerSender {
    pub fn new(
        config: SenderConfig,
        local: Handshake,
        destination: Member,
        state: Arc<SenderState>,
    ) -> Self {
        Self {
            config,
            local,
            destination,
            state,
            stream: None,
            request_count: 0,
            last_used: None,
            next_message_id: 1,
        }
    }

    pub fn destination(&self) -> &Member {
        &self.destination
    }

    pub fn state(&self) -> &Arc<SenderState> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Connect and send the handshake. No-op when already connected.
    ///
    /// A failed connect marks the peer Suspect.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        match self.open().await {
            Ok(stream) => {
                debug!("Connected to {}", self.destination);
                self.stream = Some(stream);
                self.request_count = 0;
                self.last_used = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.state.mark_suspect();
                warn!("Failed to connect to {}: {}", self.destination, e);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<TcpStream, TransportError> {
        let addr = self.destination.address();
        let connect = async {
            let target = lookup_host(&addr).await?.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, format!("No address for {}", addr))
            })?;
            let socket = if target.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(size) = self.config.send_buffer_size {
                socket.set_send_buffer_size(size)?;
            }
            if let Some(size) = self.config.receive_buffer_size {
                socket.set_recv_buffer_size(size)?;
            }
            socket.set_keepalive(self.config.so_keepalive)?;
            socket.connect(target).await
        };

        let mut stream = tokio::time::timeout(self.config.connect_timeout(), connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: addr.clone(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        self.apply_stream_options(&stream)?;

        let handshake = Frame::handshake(&self.local)?;
        bounded(self.config.read_timeout(), write_frame(&mut stream, &handshake)).await?;
        Ok(stream)
    }

    fn apply_stream_options(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.config.tcp_no_delay)?;
        let sock = SockRef::from(stream);
        if let Some(secs) = self.config.so_linger {
            sock.set_linger(Some(Duration::from_secs(secs)))?;
        }
        if let Some(tos) = self.config.traffic_class {
            if stream.peer_addr()?.is_ipv4() {
                sock.set_tos(tos)?;
            }
        }
        Ok(())
    }

    /// Deliver one payload, retrying up to `max_retry_attempts` times on a
    /// fresh connection.
    ///
    /// Transient failures mark the peer Suspect. A nack (when configured to
    /// fail) is returned right away without retrying. A payload that cannot
    /// fit in one frame fails before any I/O and leaves the state untouched.
    pub async fn send_message(
        &mut self,
        payload: Bytes,
        wait_for_ack: bool,
    ) -> Result<(), TransportError> {
        let size = FRAME_HEADER_LEN + payload.len();
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size,
                limit: MAX_FRAME_SIZE,
            }
            .into());
        }

        let attempts = self.config.max_retry_attempts.saturating_add(1);
        let mut first: Option<TransportError> = None;
        let mut last: Option<TransportError> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.disconnect().await;
                debug!(
                    "Retrying send to {} (attempt {}/{})",
                    self.destination, attempt, attempts
                );
            }

            match self.try_send(payload.clone(), wait_for_ack).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    self.state.mark_suspect();
                    warn!(
                        "Send to {} failed (attempt {}/{}): {}",
                        self.destination, attempt, attempts, e
                    );
                    if first.is_none() {
                        first = Some(e);
                    } else {
                        last = Some(e);
                    }
                }
            }
        }

        self.disconnect().await;
        match (first, last) {
            (Some(first), Some(last)) => Err(TransportError::Exhausted {
                attempts,
                first: Box::new(first),
                last: Box::new(last),
            }),
            (Some(only), None) => Err(only),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn try_send(&mut self, payload: Bytes, wait_for_ack: bool) -> Result<(), TransportError> {
        self.connect().await?;

        let id = self.next_message_id;
        self.next_message_id += 1;
        let timeout = self.config.read_timeout();
        let frame = Frame::message(id, payload, wait_for_ack);

        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        bounded(timeout, write_frame(stream, &frame)).await?;
        self.request_count += 1;
        self.last_used = Some(Instant::now());

        if !wait_for_ack {
            self.state.mark_ready();
            return Ok(());
        }

        let addr = self.destination.address();
        let ack_timeout = || TransportError::AckTimeout {
            addr: addr.clone(),
            timeout_ms: self.config.read_timeout_ms,
        };
        let reply = match tokio::time::timeout(timeout, read_frame(stream)).await {
            Err(_) => return Err(ack_timeout()),
            // Peer closed before answering
            Ok(Ok(None)) => return Err(ack_timeout()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Some(reply))) => reply,
        };

        if reply.id != id {
            return Err(ProtocolError::MismatchedReply {
                expected: id,
                got: reply.id,
            }
            .into());
        }

        match reply.kind {
            FrameKind::Ack => {
                self.state.mark_ready();
                Ok(())
            }
            FrameKind::Nack if self.config.throw_on_failed_ack => {
                Err(TransportError::RemoteFailure { addr, id })
            }
            FrameKind::Nack => {
                warn!("{} failed to process message {}, ignoring", self.destination, id);
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedFrame {
                expected: FrameKind::Ack.name(),
                got: other.name(),
            }
            .into()),
        }
    }

    /// Close the connection. Safe to call when already closed.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Disconnected from {}", self.destination);
        }
        self.request_count = 0;
    }

    /// Close the connection once the request or idle limit is exceeded.
    /// Returns true if it disconnected.
    pub async fn keepalive(&mut self) -> bool {
        if self.stream.is_none() {
            return false;
        }

        let max = self.config.keepalive_max_requests;
        let too_many = max > 0 && self.request_count >= max;
        let idle = match (self.config.keepalive_idle(), self.last_used) {
            (Some(limit), Some(used)) => used.elapsed() >= limit,
            _ => false,
        };

        if too_many || idle {
            info!(
                "Recycling connection to {} ({} requests, idle: {})",
                self.destination, self.request_count, idle
            );
            self.disconnect().await;
            true
        } else {
            false
        }
    }
}

/// Bound an I/O future by `timeout`, mapping expiry to `TimedOut`.
async fn bounded<F>(timeout: Duration, fut: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::{HealthState, MemberId};
    use tokio::net::TcpListener;

    fn local() -> Handshake {
        Handshake::new(MemberId::from_bytes([1; 16]), "127.0.0.1", 4000)
    }

    fn sender_to(port: u16, config: SenderConfig) -> PeerSender {
        let destination = Member::new(MemberId::from_bytes([2; 16]), "127.0.0.1", port);
        PeerSender::new(config, local(), destination, Arc::new(SenderState::new()))
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_failure_marks_suspect() {
        let port = unused_port().await;
        let mut sender = sender_to(port, SenderConfig::default());

        assert!(sender.connect().await.is_err());
        assert_eq!(sender.state().state(), HealthState::Suspect);
        assert!(!sender.is_connected());
    }

    #[tokio::test]
    async fn test_connect_sends_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut sender = sender_to(port, SenderConfig::default());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap().unwrap()
        });

        sender.connect().await.unwrap();
        let frame = server.await.unwrap();
        assert_eq!(frame.to_handshake().unwrap(), local());
    }

    #[tokio::test]
    async fn test_send_without_ack_marks_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut sender = sender_to(port, SenderConfig::default());
        sender.state().mark_suspect();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap();
            read_frame(&mut stream).await.unwrap().unwrap()
        });

        sender
            .send_message(Bytes::from_static(b"fire-and-forget"), false)
            .await
            .unwrap();
        let frame = server.await.unwrap();
        assert!(!frame.ack_requested());
        assert_eq!(&frame.body[..], b"fire-and-forget");
        assert!(sender.state().is_ready());
        assert_eq!(sender.request_count(), 1);
    }

    #[tokio::test]
    async fn test_nack_is_remote_failure_when_configured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut sender = sender_to(port, SenderConfig::default());

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap();
            let msg = read_frame(&mut stream).await.unwrap().unwrap();
            write_frame(&mut stream, &Frame::nack(msg.id)).await.unwrap();
            // Keep the connection open until the sender is done
            let _ = read_frame(&mut stream).await;
        });

        let err = sender
            .send_message(Bytes::from_static(b"x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RemoteFailure { .. }));
        // Nack leaves the state where it was
        assert!(sender.state().is_ready());
        assert!(sender.is_connected());
    }

    #[tokio::test]
    async fn test_nack_ignored_when_not_configured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SenderConfig {
            throw_on_failed_ack: false,
            ..SenderConfig::default()
        };
        let mut sender = sender_to(port, config);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap();
            let msg = read_frame(&mut stream).await.unwrap().unwrap();
            write_frame(&mut stream, &Frame::nack(msg.id)).await.unwrap();
            let _ = read_frame(&mut stream).await;
        });

        sender
            .send_message(Bytes::from_static(b"x"), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_payload_fails_without_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut sender = sender_to(port, SenderConfig::default());

        let err = sender
            .send_message(Bytes::from(vec![0u8; MAX_FRAME_SIZE]), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::TooLarge { .. })
        ));
        assert!(sender.state().is_ready());
        assert!(!sender.is_connected());

        // Nobody ever dialed in
        let accepted = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_unbounded_retry_setting_does_not_overflow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SenderConfig {
            max_retry_attempts: u32::MAX,
            ..SenderConfig::default()
        };
        let mut sender = sender_to(port, config);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap();
            let msg = read_frame(&mut stream).await.unwrap().unwrap();
            write_frame(&mut stream, &Frame::nack(msg.id)).await.unwrap();
            let _ = read_frame(&mut stream).await;
        });

        // A nack is final, so the huge attempt budget is never spent
        let err = sender
            .send_message(Bytes::from_static(b"x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RemoteFailure { .. }));
    }

    #[tokio::test]
    async fn test_keepalive_request_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SenderConfig {
            keepalive_max_requests: 2,
            ..SenderConfig::default()
        };
        let mut sender = sender_to(port, config);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(_)) = read_frame(&mut stream).await {}
        });

        assert!(!sender.keepalive().await);
        sender.send_message(Bytes::from_static(b"1"), false).await.unwrap();
        assert!(!sender.keepalive().await);
        sender.send_message(Bytes::from_static(b"2"), false).await.unwrap();
        assert!(sender.keepalive().await);
        assert!(!sender.is_connected());
    }

    #[tokio::test]
    async fn test_keepalive_idle_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SenderConfig {
            keepalive_idle_ms: Some(20),
            ..SenderConfig::default()
        };
        let mut sender = sender_to(port, config);

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(_)) = read_frame(&mut stream).await {}
        });

        sender.connect().await.unwrap();
        assert!(!sender.keepalive().await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(sender.keepalive().await);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut sender = sender_to(1, SenderConfig::default());
        sender.disconnect().await;
        sender.disconnect().await;
        assert!(!sender.is_connected());
    }
}
