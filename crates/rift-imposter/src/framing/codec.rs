use super::Boundary;
use crate::scripting::InjectionError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("end-of-request resolver failed: {0}")]
    Resolver(#[from] InjectionError),

    #[error("end-of-request resolver did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Accumulates stream bytes and yields messages at a built-in [`Boundary`].
///
/// The buffer grows without bound until the boundary is found, so a single
/// message may span any number of transport reads.
#[derive(Debug)]
pub struct FrameCodec {
    boundary: Boundary,
    /// Resume point for delimiter scans
    next_index: usize,
}

impl FrameCodec {
    pub fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            next_index: 0,
        }
    }

    fn find_delimiter(&mut self, src: &BytesMut, delimiter: &[u8]) -> Option<usize> {
        if delimiter.is_empty() || src.len() < delimiter.len() {
            return None;
        }
        // a delimiter may straddle the previous scan end
        let start = self.next_index.saturating_sub(delimiter.len() - 1);
        let found = src[start..]
            .windows(delimiter.len())
            .position(|w| w == delimiter)
            .map(|offset| start + offset);
        self.next_index = if found.is_some() { 0 } else { src.len() };
        found
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }
        match &self.boundary {
            Boundary::Packet => Ok(Some(src.split().freeze())),
            Boundary::Connection => Ok(None),
            Boundary::Delimiter(delimiter) => {
                let delimiter = delimiter.clone();
                match self.find_delimiter(src, &delimiter) {
                    Some(at) => {
                        let message = src.split_to(at).freeze();
                        let _ = src.split_to(delimiter.len());
                        Ok(Some(message))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        Ok(Some(src.split().freeze()))
    }
}
