//! Raw TCP upstream.

use super::{ProxyError, Upstream, UpstreamReply};
use crate::message::{Reply, Request};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_CHUNK: usize = 8192;

/// Split `tcp://host:port` into its socket address part.
pub(super) fn parse_target(to: &str) -> Result<(&str, u16), ProxyError> {
    let invalid = || ProxyError::InvalidTarget(to.to_string());
    let rest = to.strip_prefix("tcp://").ok_or_else(invalid)?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// Writes the request bytes and reads until the upstream closes its side or
/// stays quiet for `idle` after the first reply byte.
pub struct TcpUpstream {
    idle: Duration,
}

impl TcpUpstream {
    pub fn new(idle: Duration) -> Self {
        Self { idle }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn forward(&self, to: &str, request: &Request) -> Result<UpstreamReply, ProxyError> {
        let Request::Tcp(tcp) = request else {
            return Err(ProxyError::ProtocolMismatch {
                request: "non-tcp",
                upstream: "tcp",
            });
        };
        let (host, port) = parse_target(to)?;

        let start = Instant::now();
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| ProxyError::Connect {
                to: to.to_string(),
                source,
            })?;
        stream.write_all(&tcp.raw).await?;
        stream.flush().await?;

        let mut received = BytesMut::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = if received.is_empty() {
                stream.read(&mut chunk).await?
            } else {
                match tokio::time::timeout(self.idle, stream.read(&mut chunk)).await {
                    Ok(read) => read?,
                    Err(_) => break,
                }
            };
            if read == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..read]);
        }
        let latency = start.elapsed();
        debug!(
            "Proxied {} bytes to {} and received {} bytes in {:?}",
            tcp.raw.len(),
            to,
            received.len(),
            latency
        );

        let received = received.freeze();
        Ok(UpstreamReply {
            payload: serde_json::json!({ "data": tcp.mode.render(&received) }),
            reply: Reply::Bytes(received),
            latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Mode, TcpRequest};
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("tcp://localhost:8080").unwrap(), ("localhost", 8080));
        assert_eq!(parse_target("tcp://127.0.0.1:1/").unwrap(), ("127.0.0.1", 1));
        assert!(parse_target("tcp://:80").is_err());
        assert!(parse_target("tcp://host:http").is_err());
        assert!(parse_target("localhost:80").is_err());
    }

    #[tokio::test]
    async fn test_reply_ends_after_idle_window() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"echo:").await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            // keep the socket open; the idle window must end the reply
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let upstream = TcpUpstream::new(Duration::from_millis(100));
        let request = Request::Tcp(TcpRequest::new("a", Bytes::from_static(b"ping"), Mode::Text));
        let reply = upstream
            .forward(&format!("tcp://{addr}"), &request)
            .await
            .unwrap();

        assert!(matches!(&reply.reply, Reply::Bytes(b) if b.as_ref() == b"echo:ping"));
        assert_eq!(reply.payload["data"], "echo:ping");
        assert!(reply.latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = TcpUpstream::new(Duration::from_millis(100));
        let request = Request::Tcp(TcpRequest::new("a", Bytes::from_static(b"x"), Mode::Text));
        let err = upstream
            .forward(&format!("tcp://{addr}"), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }));
    }
}
