//! Request encoding and resumable response decoding.
//!
//! A [`Codec`] turns a request into bytes and hands out one
//! [`ResponseDecoder`] per in-flight request. The decoder is fed packets as
//! they arrive and reports whether the response is complete, so a reply
//! split across several datagrams or stream reads is reassembled in place.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{QueryError, Result};

/// Outcome of feeding one packet to a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<R> {
    /// The response is complete.
    Complete(R),
    /// More data is needed.
    Partial,
}

impl<R> Decoded<R> {
    /// Check if the response is complete.
    pub fn is_complete(&self) -> bool {
        matches!(self, Decoded::Complete(_))
    }
}

/// Per-request reassembly state.
pub trait ResponseDecoder: Send + 'static {
    /// Decoded response type.
    type Response: Send + 'static;

    /// Feed the next packet.
    ///
    /// Fails with [`QueryError::MalformedResponse`] when the bytes can never
    /// form a valid response.
    fn feed(&mut self, packet: Bytes) -> Result<Decoded<Self::Response>>;

    /// Bytes buffered so far.
    fn buffered(&self) -> usize;

    /// Total bytes expected, once known.
    fn expected(&self) -> Option<usize>;

    /// Error for a response that stopped arriving before it was complete.
    fn incomplete(&self) -> QueryError {
        QueryError::IncompletePacket {
            received: self.buffered(),
            expected: self.expected(),
        }
    }
}

/// Encodes requests and creates decoders for their responses.
pub trait Codec: Send + Sync + 'static {
    /// Request message type.
    type Request: Send + Sync + 'static;
    /// Response message type.
    type Response: Send + 'static;
    /// Decoder for one response.
    type Decoder: ResponseDecoder<Response = Self::Response>;

    /// Encode a request for the wire.
    fn encode(&self, request: &Self::Request) -> Result<Bytes>;

    /// Create the decoder for the response to `request`.
    fn decoder(&self, request: &Self::Request) -> Self::Decoder;
}

/// Size of the [`FramedCodec`] length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum [`FramedCodec`] payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// Length-prefixed framing: a 4-byte big-endian payload length followed by
/// the payload.
#[derive(Debug, Clone, Copy)]
pub struct FramedCodec {
    max_frame_size: usize,
}

impl FramedCodec {
    /// Create a codec with the default maximum frame size.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the largest payload accepted in either direction.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Frame `payload` without checking its size.
    pub fn frame(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf.freeze()
    }
}

impl Default for FramedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for FramedCodec {
    type Request = Bytes;
    type Response = Bytes;
    type Decoder = FrameDecoder;

    fn encode(&self, request: &Bytes) -> Result<Bytes> {
        if request.len() > self.max_frame_size || u32::try_from(request.len()).is_err() {
            return Err(QueryError::malformed(format!(
                "request of {} bytes exceeds frame limit of {}",
                request.len(),
                self.max_frame_size
            )));
        }
        Ok(Self::frame(request))
    }

    fn decoder(&self, _request: &Bytes) -> FrameDecoder {
        FrameDecoder::new(self.max_frame_size)
    }
}

/// Reassembles one length-prefixed frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads above `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    fn payload_len(&self) -> Option<usize> {
        let mut header = self.buffer.get(..FRAME_HEADER_SIZE)?;
        Some(header.get_u32() as usize)
    }
}

impl ResponseDecoder for FrameDecoder {
    type Response = Bytes;

    fn feed(&mut self, packet: Bytes) -> Result<Decoded<Bytes>> {
        self.buffer.extend_from_slice(&packet);

        let Some(len) = self.payload_len() else {
            return Ok(Decoded::Partial);
        };
        if len > self.max_frame_size {
            return Err(QueryError::malformed(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame_size
            )));
        }

        let total = FRAME_HEADER_SIZE + len;
        if self.buffer.len() < total {
            return Ok(Decoded::Partial);
        }
        if self.buffer.len() > total {
            return Err(QueryError::malformed(format!(
                "{} trailing bytes after frame",
                self.buffer.len() - total
            )));
        }

        let mut frame = std::mem::take(&mut self.buffer);
        frame.advance(FRAME_HEADER_SIZE);
        Ok(Decoded::Complete(frame.freeze()))
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn expected(&self) -> Option<usize> {
        self.payload_len().map(|len| FRAME_HEADER_SIZE + len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_chunks(chunks: &[&[u8]]) -> Result<Decoded<Bytes>> {
        let codec = FramedCodec::new();
        let mut decoder = codec.decoder(&Bytes::new());
        let mut last = Decoded::Partial;
        for chunk in chunks {
            last = decoder.feed(Bytes::copy_from_slice(chunk))?;
        }
        Ok(last)
    }

    #[test]
    fn test_encode_frame() {
        let codec = FramedCodec::new();
        let wire = codec.encode(&Bytes::from_static(b"info")).unwrap();
        assert_eq!(&wire[..], b"\x00\x00\x00\x04info");
    }

    #[test]
    fn test_fragmented_matches_whole() {
        let wire = FramedCodec::frame(b"hostname=arena;players=12;map=de_dust2");
        let whole = decode_chunks(&[&wire[..]]).unwrap();
        let split = decode_chunks(&[&wire[..3], &wire[3..17], &wire[17..]]).unwrap();

        assert!(whole.is_complete());
        assert_eq!(whole, split);
        assert_eq!(
            whole,
            Decoded::Complete(Bytes::from_static(b"hostname=arena;players=12;map=de_dust2"))
        );
    }

    #[test]
    fn test_partial_progress() {
        let wire = FramedCodec::frame(b"0123456789");
        let mut decoder = FrameDecoder::new(64);

        assert_eq!(decoder.feed(wire.slice(..2)).unwrap(), Decoded::Partial);
        assert_eq!(decoder.expected(), None);

        assert_eq!(decoder.feed(wire.slice(2..8)).unwrap(), Decoded::Partial);
        assert_eq!(decoder.buffered(), 8);
        assert_eq!(decoder.expected(), Some(14));
        assert!(matches!(
            decoder.incomplete(),
            QueryError::IncompletePacket {
                received: 8,
                expected: Some(14)
            }
        ));
    }

    #[test]
    fn test_empty_payload() {
        let result = decode_chunks(&[&b"\x00\x00\x00\x00"[..]]).unwrap();
        assert_eq!(result, Decoded::Complete(Bytes::new()));
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut decoder = FrameDecoder::new(8);
        let err = decoder
            .feed(Bytes::from_static(b"\x00\x00\x01\x00"))
            .unwrap_err();
        assert!(matches!(err, QueryError::MalformedResponse(_)));

        let codec = FramedCodec::new().with_max_frame_size(2);
        assert!(codec.encode(&Bytes::from_static(b"abc")).is_err());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let err = decode_chunks(&[&b"\x00\x00\x00\x01ab"[..]]).unwrap_err();
        assert!(matches!(err, QueryError::MalformedResponse(_)));
    }
}
