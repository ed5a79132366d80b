use super::{FrameCodec, FrameError, FrameStrategy, ResolverBoundary};
use crate::metrics;
use crate::scripting::InjectionKind;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::FramedRead;
use tracing::warn;

const READ_CHUNK: usize = 8 * 1024;

/// Yields one connection's messages in arrival order.
pub struct FrameReader<R> {
    source: Source<R>,
}

enum Source<R> {
    Builtin(FramedRead<R, FrameCodec>),
    Resolver(ResolverFramer<R>),
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, strategy: FrameStrategy, port: u16) -> Self {
        let source = match strategy {
            FrameStrategy::Builtin(boundary) => {
                Source::Builtin(FramedRead::new(reader, FrameCodec::new(boundary)))
            }
            FrameStrategy::Resolver(resolver) => Source::Resolver(ResolverFramer {
                reader,
                buffer: BytesMut::new(),
                resolver,
                port,
            }),
        };
        Self { source }
    }

    /// Next complete message, or `None` once the peer has closed.
    pub async fn next_message(&mut self) -> Option<Result<Bytes, FrameError>> {
        match &mut self.source {
            Source::Builtin(frames) => frames.next().await,
            Source::Resolver(framer) => framer.next_message().await,
        }
    }

    pub fn into_inner(self) -> R {
        match self.source {
            Source::Builtin(frames) => frames.into_inner(),
            Source::Resolver(framer) => framer.reader,
        }
    }
}

/// Read loop that asks an injected resolver about the buffer after each read.
struct ResolverFramer<R> {
    reader: R,
    buffer: BytesMut,
    resolver: ResolverBoundary,
    port: u16,
}

impl<R: AsyncRead + Unpin> ResolverFramer<R> {
    async fn next_message(&mut self) -> Option<Result<Bytes, FrameError>> {
        loop {
            self.buffer.reserve(READ_CHUNK);
            match self.reader.read_buf(&mut self.buffer).await {
                Ok(0) => {
                    if !self.buffer.is_empty() {
                        warn!(
                            port = self.port,
                            bytes = self.buffer.len(),
                            "Connection closed with an incomplete request; discarding buffered bytes"
                        );
                        self.buffer.clear();
                    }
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }

            match self.is_complete().await {
                Ok(true) => return Some(Ok(self.buffer.split().freeze())),
                Ok(false) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Runs the resolver on the blocking pool against a copy of the buffer.
    async fn is_complete(&self) -> Result<bool, FrameError> {
        let snapshot = Bytes::copy_from_slice(&self.buffer);
        let resolver = self.resolver.clone();
        let result = tokio::task::spawn_blocking(move || {
            resolver
                .sandbox
                .evaluate_frame_boundary(&resolver.function, &snapshot, &resolver.ctx)
        })
        .await?;
        metrics::record_injection(InjectionKind::FrameBoundary.as_str(), result.is_ok());
        Ok(result?)
    }
}
