//! MMP framing.
//!
//! Every message is an 8-byte header followed by a JSON object, a media type
//! string and a binary payload:
//!
//! | bytes  | field                          |
//! |--------|--------------------------------|
//! | 0..2   | JSON length, big endian        |
//! | 2      | media type length              |
//! | 3..8   | payload length, big endian     |
//!
//! The media type names a file extension (`mp4`, `gif`, ...) and is empty
//! when no payload is attached.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 8;
pub const MAX_JSON_BYTES: usize = u16::MAX as usize;
pub const MAX_MEDIA_TYPE_BYTES: usize = u8::MAX as usize;
/// Largest payload a 5-byte length can describe.
pub const MAX_PAYLOAD_BYTES: u64 = (1 << 40) - 1;

pub type FrameResult<T> = Result<T, FrameError>;

/// Framing failures. All of them leave the stream unusable.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON body too large: {0} bytes")]
    JsonTooLarge(usize),

    #[error("Media type too long: {0} bytes")]
    MediaTypeTooLong(usize),

    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Connection closed mid-frame")]
    Truncated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub json: Vec<u8>,
    pub media_type: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(json: Vec<u8>) -> Self {
        Self {
            json,
            ..Default::default()
        }
    }

    /// Frame carrying a serialized message and no payload.
    pub fn from_message<T: Serialize>(message: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(message)?))
    }

    pub fn with_payload(mut self, media_type: impl Into<String>, payload: Vec<u8>) -> Self {
        self.media_type = media_type.into();
        self.payload = payload;
        self
    }

    /// Decode the JSON part.
    pub fn message<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.json)
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }
}

/// JSON and media type of a frame whose payload is still unread.
///
/// The reader is positioned at the first payload byte; exactly
/// `payload_len` bytes must be consumed before the next frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHead {
    pub json: Vec<u8>,
    pub media_type: String,
    pub payload_len: u64,
}

impl FrameHead {
    pub fn message<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.json)
    }
}

/// Pack the three section lengths.
pub fn encode_header(
    json_len: usize,
    media_type_len: usize,
    payload_len: u64,
) -> FrameResult<[u8; HEADER_LEN]> {
    if json_len > MAX_JSON_BYTES {
        return Err(FrameError::JsonTooLarge(json_len));
    }
    if media_type_len > MAX_MEDIA_TYPE_BYTES {
        return Err(FrameError::MediaTypeTooLong(media_type_len));
    }
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            limit: MAX_PAYLOAD_BYTES,
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&(json_len as u16).to_be_bytes());
    header[2] = media_type_len as u8;
    header[3..8].copy_from_slice(&payload_len.to_be_bytes()[3..8]);
    Ok(header)
}

/// Unpack `(json_len, media_type_len, payload_len)`.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> (usize, usize, u64) {
    let json_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let media_type_len = header[2] as usize;
    let mut payload = [0u8; 8];
    payload[3..8].copy_from_slice(&header[3..8]);
    (json_len, media_type_len, u64::from_be_bytes(payload))
}

/// Read one frame, buffering its payload.
///
/// Returns `Ok(None)` when the peer closes the stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_payload: u64) -> FrameResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let Some(head) = read_frame_head(reader, max_payload).await? else {
        return Ok(None);
    };
    let payload_len = usize::try_from(head.payload_len).map_err(|_| FrameError::PayloadTooLarge {
        size: head.payload_len,
        limit: usize::MAX as u64,
    })?;
    let payload = read_section(reader, payload_len).await?;

    Ok(Some(Frame {
        json: head.json,
        media_type: head.media_type,
        payload,
    }))
}

/// Read the header, JSON and media type of one frame, leaving the payload
/// on the stream.
///
/// The payload length is checked against `max_payload` before anything else
/// is read.
pub async fn read_frame_head<R>(reader: &mut R, max_payload: u64) -> FrameResult<Option<FrameHead>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += n;
    }

    let (json_len, media_type_len, payload_len) = decode_header(&header);
    let limit = max_payload.min(MAX_PAYLOAD_BYTES);
    if payload_len > limit {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            limit,
        });
    }

    let json = read_section(reader, json_len).await?;
    let media_type = read_section(reader, media_type_len).await?;

    Ok(Some(FrameHead {
        json,
        media_type: String::from_utf8_lossy(&media_type).into_owned(),
        payload_len,
    }))
}

async fn read_section<R>(reader: &mut R, len: usize) -> FrameResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(buf)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(
        frame.json.len(),
        frame.media_type.len(),
        frame.payload.len() as u64,
    )?;

    writer.write_all(&header).await?;
    writer.write_all(&frame.json).await?;
    writer.write_all(frame.media_type.as_bytes()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_layout() {
        let header = encode_header(0x0102, 3, 0x01_0203_0405).unwrap();
        assert_eq!(header, [0x01, 0x02, 0x03, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(decode_header(&header), (0x0102, 3, 0x01_0203_0405));
    }

    #[test]
    fn test_header_limits() {
        assert!(encode_header(MAX_JSON_BYTES, MAX_MEDIA_TYPE_BYTES, MAX_PAYLOAD_BYTES).is_ok());
        assert!(matches!(
            encode_header(MAX_JSON_BYTES + 1, 0, 0),
            Err(FrameError::JsonTooLarge(_))
        ));
        assert!(matches!(
            encode_header(0, 256, 0),
            Err(FrameError::MediaTypeTooLong(256))
        ));
        assert!(matches!(
            encode_header(0, 0, MAX_PAYLOAD_BYTES + 1),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let upload = Frame::from_message(&json!({"method": "submit", "operation": "compress"}))
            .unwrap()
            .with_payload("mp4", vec![7u8; 3000]);
        let status = Frame::from_message(&json!({"method": "status", "jobId": "j"})).unwrap();

        let writer = {
            let upload = upload.clone();
            let status = status.clone();
            tokio::spawn(async move {
                write_frame(&mut client, &upload).await.unwrap();
                write_frame(&mut client, &status).await.unwrap();
            })
        };

        let first = read_frame(&mut server, 1 << 20).await.unwrap().unwrap();
        assert_eq!(first, upload);
        assert!(first.has_payload());
        let second = read_frame(&mut server, 1 << 20).await.unwrap().unwrap();
        assert_eq!(second.media_type, "");
        assert_eq!(second.message::<serde_json::Value>().unwrap()["jobId"], "j");

        writer.await.unwrap();
        assert!(read_frame(&mut server, 1 << 20).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_before_reading() {
        let header = encode_header(2, 0, 1_000).unwrap();
        let mut input: &[u8] = &header;
        match read_frame(&mut input, 999).await {
            Err(FrameError::PayloadTooLarge { size, limit }) => {
                assert_eq!(size, 1_000);
                assert_eq!(limit, 999);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_head_leaves_payload_on_stream() {
        let frame = Frame::from_message(&json!({"method": "submit"}))
            .unwrap()
            .with_payload("mp4", b"0123456789".to_vec());
        let next = Frame::from_message(&json!({"method": "status"})).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).await.unwrap();
        write_frame(&mut wire, &next).await.unwrap();

        let mut input: &[u8] = &wire;
        let head = read_frame_head(&mut input, 1 << 20).await.unwrap().unwrap();
        assert_eq!(head.media_type, "mp4");
        assert_eq!(head.payload_len, 10);
        assert_eq!(&input[..10], b"0123456789");

        input = &input[10..];
        let second = read_frame(&mut input, 1 << 20).await.unwrap().unwrap();
        assert_eq!(second, next);
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let mut bytes = encode_header(10, 0, 0).unwrap().to_vec();
        bytes.extend_from_slice(b"{\"a\"");
        let mut input: &[u8] = &bytes;
        assert!(matches!(
            read_frame(&mut input, 0).await,
            Err(FrameError::Truncated)
        ));

        let mut partial_header: &[u8] = &[0, 1, 0];
        assert!(matches!(
            read_frame(&mut partial_header, 0).await,
            Err(FrameError::Truncated)
        ));
    }
}
