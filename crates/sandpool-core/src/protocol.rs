//! Stdin/stdout wire protocol between the host and the in-sandbox runner.
//!
//! Commands are written to the container's stdin and output records are
//! read back from its stdout. Results are matched by correlation id, never by
//! container identity, so a slot that is reused across sessions cannot hand
//! one request the output of another.
//!
//! ## Wire Format
//!
//! ```text
//! [1-byte tag][16-byte correlation id][4-byte length][payload]
//! ```
//!
//! - **tag**: u8 frame kind
//! - **correlation id**: raw UUID bytes (nil for `exit`)
//! - **length**: big-endian u32, size of payload
//! - **payload**: opaque bytes
//!
//! ## Frame Kinds
//!
//! | Tag  | Direction        | Name    | Payload |
//! |------|------------------|---------|---------|
//! | 0x01 | host → sandbox   | execute | submitted program bytes |
//! | 0x02 | host → sandbox   | exit    | (empty) |
//! | 0x81 | sandbox → host   | output  | captured stdout / diagnostics |

use crate::error::{FrameError, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use uuid::Uuid;

/// Header size: tag (1) + correlation id (16) + length (4).
pub const HEADER_SIZE: usize = 21;

/// Maximum payload size accepted by the default codec (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

pub const TAG_EXECUTE: u8 = 0x01;
pub const TAG_EXIT: u8 = 0x02;
pub const TAG_OUTPUT: u8 = 0x81;

// ============================================================================
// Frame types
// ============================================================================

/// Identifier tying one execution to its output.
///
/// Generated fresh for every execution, independent of the slot that
/// serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new random correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero id carried by frames that belong to no execution.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a frame, encoded as its tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Run the payload.
    Execute,
    /// No more input for this session.
    Exit,
    /// Output of a finished execution.
    Output,
}

impl FrameKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Execute => TAG_EXECUTE,
            Self::Exit => TAG_EXIT,
            Self::Output => TAG_OUTPUT,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_EXECUTE => Some(Self::Execute),
            TAG_EXIT => Some(Self::Exit),
            TAG_OUTPUT => Some(Self::Output),
            _ => None,
        }
    }
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
}

impl Frame {
    pub fn execute(correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Execute,
            correlation_id,
            payload,
        }
    }

    pub fn exit() -> Self {
        Self {
            kind: FrameKind::Exit,
            correlation_id: CorrelationId::nil(),
            payload: Bytes::new(),
        }
    }

    pub fn output(correlation_id: CorrelationId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Output,
            correlation_id,
            payload: payload.into(),
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Length-prefixed frame codec, usable on both ends of the stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    fn check_len(&self, kind: FrameKind, len: usize) -> Result<(), FrameError> {
        if len > self.max_payload {
            return Err(FrameError::TooLarge {
                size: len,
                limit: self.max_payload,
            });
        }
        if kind == FrameKind::Exit && len != 0 {
            return Err(FrameError::UnexpectedPayload(len));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let kind = FrameKind::from_tag(src[0]).ok_or(FrameError::UnknownTag(src[0]))?;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[17..HEADER_SIZE]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        self.check_len(kind, len)?;

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_SIZE);
        let mut id = [0u8; 16];
        id.copy_from_slice(&header[1..17]);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame {
            kind,
            correlation_id: CorrelationId::from_bytes(id),
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        self.check_len(frame.kind, len)?;

        dst.reserve(HEADER_SIZE + len);
        dst.put_u8(frame.kind.tag());
        dst.put_slice(frame.correlation_id.as_bytes());
        dst.put_u32(len as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

// ============================================================================
// Stream handle
// ============================================================================

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Duplex byte stream attached to a sandbox's stdin/stdout.
///
/// The read side keeps its decode buffer for the life of the slot, so
/// frames left over from an earlier session are still seen (and skipped)
/// by the next `read_output`.
pub struct SandboxStream {
    reader: FramedRead<BoxedReader, FrameCodec>,
    writer: FramedWrite<BoxedWriter, FrameCodec>,
}

impl SandboxStream {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::from_boxed(Box::pin(reader), Box::pin(writer))
    }

    pub fn from_boxed(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::default()),
            writer: FramedWrite::new(writer, FrameCodec::default()),
        }
    }
}

impl fmt::Debug for SandboxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxStream")
            .field("buffered", &self.reader.read_buffer().len())
            .finish()
    }
}

// ============================================================================
// Exchange
// ============================================================================

/// Write an `execute` command carrying `payload`.
///
/// # Errors
///
/// [`ProtocolError::Write`] on a broken stream, [`ProtocolError::Timeout`]
/// if backpressure holds the write past `deadline`.
pub async fn write_execute(
    stream: &mut SandboxStream,
    payload: Bytes,
    correlation_id: CorrelationId,
    deadline: Instant,
) -> Result<(), ProtocolError> {
    tracing::trace!(
        correlation_id = %correlation_id,
        payload_len = payload.len(),
        "Writing execute command"
    );
    send_frame(stream, Frame::execute(correlation_id, payload), deadline).await
}

/// Write the `exit` sentinel ending this session's input.
///
/// The stream stays open and the container keeps running.
pub async fn write_exit(stream: &mut SandboxStream, deadline: Instant) -> Result<(), ProtocolError> {
    tracing::trace!("Writing exit command");
    send_frame(stream, Frame::exit(), deadline).await
}

async fn send_frame(
    stream: &mut SandboxStream,
    frame: Frame,
    deadline: Instant,
) -> Result<(), ProtocolError> {
    match timeout_at(deadline, stream.writer.send(frame)).await {
        Ok(result) => result.map_err(ProtocolError::Write),
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Read frames until the output for `correlation_id` arrives.
///
/// Output frames carrying any other id are stale and are dropped.
///
/// # Errors
///
/// - [`ProtocolError::Read`] on malformed framing or I/O failure
/// - [`ProtocolError::Mismatch`] if the stream ends first
/// - [`ProtocolError::Timeout`] if `deadline` elapses first
pub async fn read_output(
    stream: &mut SandboxStream,
    correlation_id: CorrelationId,
    deadline: Instant,
) -> Result<Bytes, ProtocolError> {
    let read = async {
        while let Some(frame) = stream.reader.next().await {
            let frame = frame.map_err(ProtocolError::Read)?;
            if frame.kind != FrameKind::Output {
                return Err(ProtocolError::Read(FrameError::UnexpectedTag(
                    frame.kind.tag(),
                )));
            }
            if frame.correlation_id != correlation_id {
                tracing::debug!(
                    expected = %correlation_id,
                    received = %frame.correlation_id,
                    payload_len = frame.payload.len(),
                    "Discarding stale output frame"
                );
                continue;
            }
            tracing::trace!(
                correlation_id = %correlation_id,
                payload_len = frame.payload.len(),
                "Received output frame"
            );
            return Ok(frame.payload);
        }
        Err(ProtocolError::Mismatch(correlation_id))
    };

    match timeout_at(deadline, read).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    fn pair() -> (SandboxStream, Framed<DuplexStream, FrameCodec>) {
        let (host, guest) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(host);
        (
            SandboxStream::new(read_half, write_half),
            Framed::new(guest, FrameCodec::default()),
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_exit_frame_layout() {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(Frame::exit(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf[0], TAG_EXIT);
        assert!(buf[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_execute_frame_layout() {
        let id = CorrelationId::new();
        let mut buf = BytesMut::new();
        FrameCodec::default()
            .encode(Frame::execute(id, Bytes::from_static(b"abc")), &mut buf)
            .unwrap();
        assert_eq!(buf[0], TAG_EXECUTE);
        assert_eq!(&buf[1..17], id.as_bytes());
        assert_eq!(&buf[17..21], &[0, 0, 0, 3]);
        assert_eq!(&buf[21..], b"abc");
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let id = CorrelationId::new();
        let mut encoded = BytesMut::new();
        let mut codec = FrameCodec::default();
        codec
            .encode(Frame::output(id, Bytes::from_static(b"hello")), &mut encoded)
            .unwrap();

        let mut partial = BytesMut::from(&encoded[..HEADER_SIZE + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[HEADER_SIZE + 2..]);
        let frame = codec.decode(&mut partial).unwrap().expect("complete frame");
        assert_eq!(frame.correlation_id, id);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decoder_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_OUTPUT);
        buf.put_slice(&[0u8; 16]);
        buf.put_u32(5);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_exit_with_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_EXIT);
        buf.put_slice(&[0u8; 16]);
        buf.put_u32(1);
        buf.put_u8(0);
        assert!(matches!(
            FrameCodec::default().decode(&mut buf),
            Err(FrameError::UnexpectedPayload(1))
        ));
    }

    #[tokio::test]
    async fn test_read_output_skips_stale_frames() {
        let (mut host, mut guest) = pair();
        let wanted = CorrelationId::new();
        let stale = CorrelationId::new();

        guest.send(Frame::output(stale, "old")).await.unwrap();
        guest.send(Frame::output(wanted, "new")).await.unwrap();

        let output = read_output(&mut host, wanted, deadline()).await.unwrap();
        assert_eq!(&output[..], b"new");
    }

    #[tokio::test]
    async fn test_write_execute_then_exit() {
        let (mut host, mut guest) = pair();
        let id = CorrelationId::new();

        write_execute(&mut host, Bytes::from_static(b"program"), id, deadline())
            .await
            .unwrap();
        write_exit(&mut host, deadline()).await.unwrap();

        let execute = guest.next().await.unwrap().unwrap();
        assert_eq!(execute.kind, FrameKind::Execute);
        assert_eq!(execute.correlation_id, id);
        assert_eq!(&execute.payload[..], b"program");

        let exit = guest.next().await.unwrap().unwrap();
        assert_eq!(exit, Frame::exit());
    }

    #[tokio::test]
    async fn test_read_output_mismatch_on_close() {
        let (mut host, mut guest) = pair();
        let id = CorrelationId::new();
        guest.send(Frame::output(CorrelationId::new(), "other")).await.unwrap();
        drop(guest);

        let err = read_output(&mut host, id, deadline()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Mismatch(got) if got == id));
    }

    #[tokio::test]
    async fn test_read_output_malformed_tag() {
        let (mut host, guest) = pair();
        let mut raw = guest.into_inner();
        raw.write_all(&[0x7f; HEADER_SIZE]).await.unwrap();

        let err = read_output(&mut host, CorrelationId::new(), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Read(FrameError::UnknownTag(0x7f))));
    }

    #[tokio::test]
    async fn test_read_output_rejects_inbound_frames() {
        let (mut host, mut guest) = pair();
        guest.send(Frame::exit()).await.unwrap();

        let err = read_output(&mut host, CorrelationId::new(), deadline())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Read(FrameError::UnexpectedTag(TAG_EXIT))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_output_times_out() {
        let (mut host, _guest) = pair();
        let deadline = Instant::now() + Duration::from_millis(300);

        let err = read_output(&mut host, CorrelationId::new(), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
    }

    #[tokio::test]
    async fn test_write_to_closed_stream_fails() {
        let (mut host, guest) = pair();
        drop(guest);

        let err = write_execute(
            &mut host,
            Bytes::from_static(b"x"),
            CorrelationId::new(),
            deadline(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Write(FrameError::Io(_))));
    }
}
