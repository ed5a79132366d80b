//! Raw TCP connection handling.
//!
//! Bytes are assembled into messages by [`FrameReader`]. Messages on one
//! connection are resolved strictly one after another, so replies leave in
//! the order their requests arrived.

use super::core::Imposter;
use crate::framing::FrameReader;
use crate::message::{Fault, Reply, Request, TcpRequest};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub(crate) async fn serve_connection(imposter: Arc<Imposter>, stream: TcpStream, peer: SocketAddr) {
    let port = imposter.port();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(read_half, imposter.frame_strategy(), port);

    loop {
        let next = tokio::select! {
            biased;
            _ = imposter.shutdown_token().cancelled() => break,
            next = frames.next_message() => next,
        };
        let message = match next {
            None => break,
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!("Closing connection from {} on port {}: {}", peer, port, e);
                break;
            }
        };

        let request = Request::Tcp(TcpRequest::new(peer.to_string(), message, imposter.mode()));
        match imposter.resolve(request).await {
            Reply::Bytes(bytes) if bytes.is_empty() => {}
            Reply::Bytes(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("Write to {} on port {} failed: {}", peer, port, e);
                    break;
                }
            }
            Reply::Fault(fault) => {
                let read_half = frames.into_inner();
                match read_half.reunite(write_half) {
                    Ok(stream) => apply_fault(stream, fault).await,
                    Err(e) => warn!("Could not apply {} on port {}: {}", fault.as_str(), port, e),
                }
                return;
            }
            Reply::Close => break,
            Reply::Http(_) => {
                warn!("Ignoring http reply on tcp imposter {}", port);
            }
        }
    }

    close(write_half).await;
}

async fn close(mut write_half: OwnedWriteHalf) {
    // peer may already be gone
    let _ = write_half.shutdown().await;
}

/// Misbehave on the wire as the fault asks, then drop the connection.
async fn apply_fault(mut stream: TcpStream, fault: Fault) {
    match fault {
        Fault::ConnectionResetByPeer => {
            // zero linger turns the close into a RST
            if let Err(e) = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
                debug!("Could not set SO_LINGER: {}", e);
            }
        }
        Fault::RandomDataThenClose => {
            let garbage: Vec<u8> = {
                let mut rng = rand::thread_rng();
                (0..rng.gen_range(16..=256)).map(|_| rng.gen()).collect()
            };
            let _ = stream.write_all(&garbage).await;
            let _ = stream.shutdown().await;
        }
    }
    drop(stream);
}
