//! IPC frame protocol
//!
//! A single length-prefixed binary frame on one stream. No sub-framing, no
//! identity prefix — every connection is a plain point-to-point TCP socket,
//! so there is nothing to route around the way a ZMQ ROUTER identity would
//! require.
//!
//! ## Wire format
//!
//! All integers are big-endian. Strings are UTF-8 with no further
//! validation beyond their declared byte length.
//!
//! ```text
//! [u32 length]            total bytes that follow
//! [u8  type]               1=REQUEST 2=RESPONSE 3=REGISTER 4=HEARTBEAT
//! [u16 id-len][id]
//! [u16 svc-len][svc]
//! [u16 meth-len][meth]
//! [u16 meta-count]
//!   meta-count × ( [u16 k-len][k] [u16 v-len][v] )
//! [payload]               remainder of the frame
//! ```
//!
//! `length` is filled in last by the encoder, over the already-serialized
//! tail. Decoding a frame whose `length` exceeds [`MAX_FRAME_SIZE`] fails
//! with [`FrameError::FrameTooLarge`]; decoding an unknown `type` byte fails
//! with [`FrameError::UnknownFrameType`]. Both are fatal to the connection
//! that produced them, never to the process.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on total frame size (header + payload).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Hard cap on any individual length-prefixed string field.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// The four frame types the broker distinguishes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Request = 1,
    Response = 2,
    Register = 3,
    Heartbeat = 4,
}

impl FrameType {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameType::Request),
            2 => Ok(FrameType::Response),
            3 => Ok(FrameType::Register),
            4 => Ok(FrameType::Heartbeat),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Errors the codec can report. All are fatal to the owning connection
/// session, never to the broker process.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge { size: usize },

    #[error("field {field} is {len} bytes, exceeds the {MAX_FIELD_LEN} byte limit")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("connection closed mid-frame")]
    UnexpectedEof,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One decoded IPC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Correlation id. Empty for REGISTER and HEARTBEAT.
    pub id: String,
    pub service: String,
    pub method: String,
    pub metadata: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            id: String::new(),
            service: String::new(),
            method: String::new(),
            metadata: BTreeMap::new(),
            payload: Bytes::new(),
        }
    }

    pub fn request(id: impl Into<String>, service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            method: method.into(),
            ..Self::new(FrameType::Request)
        }
    }

    pub fn response(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::new(FrameType::Response)
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat)
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Encode this frame to its wire representation, capped at the compiled-in
    /// [`MAX_FRAME_SIZE`]. Callers enforcing a configured `ipc.maxMessageSize`
    /// should use [`Frame::encode_with_limit`] instead.
    ///
    /// Fails if any string field (id/service/method/metadata key or value)
    /// exceeds [`MAX_FIELD_LEN`], or if the assembled frame would exceed
    /// [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        self.encode_with_limit(MAX_FRAME_SIZE)
    }

    /// Encode this frame, failing with [`FrameError::FrameTooLarge`] if the
    /// assembled frame exceeds `max_frame_size` rather than the compiled-in
    /// default. This is how the broker enforces a configured
    /// `ipc.maxMessageSize` on outbound frames.
    pub fn encode_with_limit(&self, max_frame_size: usize) -> Result<Bytes, FrameError> {
        check_field_len("id", &self.id)?;
        check_field_len("service", &self.service)?;
        check_field_len("method", &self.method)?;
        for (k, v) in &self.metadata {
            check_field_len("metadata key", k)?;
            check_field_len("metadata value", v)?;
        }

        let mut tail = BytesMut::new();
        tail.extend_from_slice(&[self.frame_type.to_u8()]);
        put_string(&mut tail, &self.id);
        put_string(&mut tail, &self.service);
        put_string(&mut tail, &self.method);
        tail.extend_from_slice(&(self.metadata.len() as u16).to_be_bytes());
        for (k, v) in &self.metadata {
            put_string(&mut tail, k);
            put_string(&mut tail, v);
        }
        tail.extend_from_slice(&self.payload);

        let total = tail.len();
        if total > max_frame_size {
            return Err(FrameError::FrameTooLarge { size: total });
        }

        let mut out = BytesMut::with_capacity(4 + total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&tail);
        Ok(out.freeze())
    }

    /// Decode one frame from an async reader, blocking until a full frame
    /// arrives, capped at the compiled-in [`MAX_FRAME_SIZE`]. Callers
    /// enforcing a configured `ipc.maxMessageSize` should use
    /// [`Frame::decode_with_limit`] instead. A clean EOF before any bytes are
    /// read returns [`FrameError::UnexpectedEof`]; a short read mid-frame does
    /// too.
    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, FrameError> {
        Self::decode_with_limit(reader, MAX_FRAME_SIZE).await
    }

    /// Decode one frame, failing with [`FrameError::FrameTooLarge`] if the
    /// declared `length` exceeds `max_frame_size` rather than the compiled-in
    /// default. This is how the broker enforces a configured
    /// `ipc.maxMessageSize` on inbound frames.
    pub async fn decode_with_limit<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame_size: usize,
    ) -> Result<Self, FrameError> {
        let mut len_buf = [0u8; 4];
        read_exact_or_eof(reader, &mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf) as usize;
        if length > max_frame_size {
            return Err(FrameError::FrameTooLarge { size: length });
        }

        let mut body = vec![0u8; length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
                _ => FrameError::Io(e),
            })?;

        Self::decode_body(&body)
    }

    fn decode_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.is_empty() {
            // length == 0: yield an empty-payload frame. Type byte is required
            // by the wire format, but a zero-length tail has none — treat this
            // as a degenerate heartbeat, the only frame type with no required
            // fields at all.
            return Ok(Frame::heartbeat());
        }

        let mut cursor = body;
        let frame_type = FrameType::from_u8(take_u8(&mut cursor)?)?;
        let id = take_string(&mut cursor)?;
        let service = take_string(&mut cursor)?;
        let method = take_string(&mut cursor)?;

        let meta_count = take_u16(&mut cursor)? as usize;
        let mut metadata = BTreeMap::new();
        for _ in 0..meta_count {
            let k = take_string(&mut cursor)?;
            let v = take_string(&mut cursor)?;
            metadata.insert(k, v);
        }

        let payload = Bytes::copy_from_slice(cursor);

        Ok(Frame {
            frame_type,
            id,
            service,
            method,
            metadata,
            payload,
        })
    }

    /// Write this frame's encoded bytes to an async writer, capped at the
    /// compiled-in [`MAX_FRAME_SIZE`].
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), FrameError> {
        self.write_to_with_limit(writer, MAX_FRAME_SIZE).await
    }

    /// Write this frame's encoded bytes to an async writer, enforcing a
    /// configured `ipc.maxMessageSize` rather than the compiled-in default.
    pub async fn write_to_with_limit<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        max_frame_size: usize,
    ) -> Result<(), FrameError> {
        let bytes = self.encode_with_limit(max_frame_size)?;
        writer.write_all(&bytes).await?;
        Ok(())
    }
}

fn check_field_len(field: &'static str, s: &str) -> Result<(), FrameError> {
    if s.len() > MAX_FIELD_LEN {
        return Err(FrameError::FieldTooLong { field, len: s.len() });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::UnexpectedEof),
        Err(e) => Err(FrameError::Io(e)),
    }
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, FrameError> {
    if cursor.is_empty() {
        return Err(FrameError::UnexpectedEof);
    }
    let v = cursor[0];
    *cursor = &cursor[1..];
    Ok(v)
}

fn take_u16(cursor: &mut &[u8]) -> Result<u16, FrameError> {
    if cursor.len() < 2 {
        return Err(FrameError::UnexpectedEof);
    }
    let v = u16::from_be_bytes([cursor[0], cursor[1]]);
    *cursor = &cursor[2..];
    Ok(v)
}

fn take_string(cursor: &mut &[u8]) -> Result<String, FrameError> {
    let len = take_u16(cursor)? as usize;
    if cursor.len() < len {
        return Err(FrameError::UnexpectedEof);
    }
    let (field, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(String::from_utf8_lossy(field).into_owned())
}
