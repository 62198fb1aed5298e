use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::types::protocol::Command;
use crate::util::bytes_to_human_str;

/// Replies larger than this are truncated by the service anyway.
const MAX_DATAGRAM: usize = 2048;

/// One request/reply exchange with the remote service. The session client
/// never has more than one exchange in flight.
#[async_trait]
pub trait Transport: Send {
    /// Sends `request` and waits for the reply. A missing reply surfaces as
    /// [`io::ErrorKind::TimedOut`].
    async fn exchange(&mut self, request: &[u8]) -> io::Result<Bytes>;
}

/// Datagram transport bound to a fixed local port.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    timeout: Duration,
    buf: BytesMut,
}

impl UdpTransport {
    pub async fn connect(
        local_port: u16,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        socket.connect((host, port)).await?;
        debug!(local = %socket.local_addr()?, remote = %socket.peer_addr()?, "udp socket ready");

        Ok(Self {
            socket,
            timeout,
            buf: BytesMut::with_capacity(MAX_DATAGRAM),
        })
    }

    /// Discards replies that arrived after an earlier exchange timed out, so
    /// they can't be mistaken for the answer to the next request.
    fn drain_stale(&mut self) {
        loop {
            self.buf.clear();
            self.buf.reserve(MAX_DATAGRAM);
            match self.socket.try_recv_buf(&mut self.buf) {
                Ok(n) => {
                    debug!(
                        reply = bytes_to_human_str(&self.buf[..n]),
                        "discarding stale reply"
                    );
                },
                Err(_) => break,
            }
        }
    }
}

/// The request as it may appear in logs. Secrets are masked; anything
/// that doesn't parse as a command is shown by size only.
fn loggable(request: &[u8]) -> String {
    match Command::try_from(request) {
        Ok(command) => command.masked(),
        Err(_) => format!("<{} unparseable bytes>", request.len()),
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn exchange(&mut self, request: &[u8]) -> io::Result<Bytes> {
        self.drain_stale();

        trace!(request = loggable(request), "sending datagram");
        self.socket.send(request).await?;

        self.buf.clear();
        self.buf.reserve(MAX_DATAGRAM);
        match timeout(self.timeout, self.socket.recv_buf(&mut self.buf)).await {
            Ok(received) => {
                received?;
            },
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no reply from the remote service",
                ))
            },
        };

        Ok(self.buf.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loggable_masks_secrets() {
        assert_eq!(
            loggable(b"AUTH user=bob&pass=hunter2&protover=3"),
            "AUTH user=bob&pass=****&protover=3"
        );
        assert_eq!(loggable(b"FILE fid=1&s=abc"), "FILE fid=1&s=****");
        assert_eq!(loggable(b"PING"), "PING");
        assert_eq!(loggable(b"FILE pass"), "<9 unparseable bytes>");
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let server = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let server_port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PING");
            server.send_to(b"300 PONG\n", peer).await.unwrap();
        });

        let mut transport = UdpTransport::connect(
            0,
            "127.0.0.1",
            server_port,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let reply = transport.exchange(b"PING").await.unwrap();
        assert_eq!(&reply[..], b"300 PONG\n");
    }

    #[tokio::test]
    async fn test_udp_timeout() {
        // Bound but never answers.
        let server = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let server_port = server.local_addr().unwrap().port();

        let mut transport = UdpTransport::connect(
            0,
            "127.0.0.1",
            server_port,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let err = transport.exchange(b"PING").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(server);
    }
}
