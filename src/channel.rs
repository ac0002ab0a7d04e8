//! Length-framed message channel between the filesystem front-end and the mount helper.
//!
//! Every frame on the wire is a 4 byte big-endian length followed by that many bytes of JSON:
//!
//! ```text
//! +----------------+------------------------------------------------+
//! | len: u32 (BE)  | {"kind":"data-request","path":"/etc/hostname",  |
//! |                |  "offset":0,"length":4096}                     |
//! +----------------+------------------------------------------------+
//! ```
//!
//! The channel is a strict request/response ping-pong: there are no request IDs, so a session
//! must never have more than one request outstanding.  Both a blocking ([`Channel::send()`],
//! [`Channel::receive()`]) and an async ([`Channel::send_async()`],
//! [`Channel::receive_async()`]) flavour are provided over the same framing; the FUSE side is
//! blocking while the helper serves sessions on tokio.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::{read_exactish, read_exactish_async};

/// Frames larger than this are refused before anything is allocated for them.
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Largest payload a `data-response` can carry, leaving room for base64 and the JSON around it.
pub const MAX_DATA_SIZE: u64 = (MAX_FRAME_SIZE as u64 - 1024) / 4 * 3;

/// One unit of the helper protocol.
///
/// Requests are [`Message::IndexRequest`], [`Message::DataRequest`] and
/// [`Message::SessionEnd`].  Each request has one success response
/// ([`Message::IndexResponse`], [`Message::DataResponse`]; `SessionEnd` gets no reply) and may
/// always be answered with [`Message::ErrorResponse`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Message {
    /// Ask for the merged index of the image.
    IndexRequest,
    /// Ask for a byte range of a regular file.
    DataRequest {
        /// Absolute, normalized path of the file.
        path: String,
        /// Offset into the file content.
        #[serde(default)]
        offset: u64,
        /// Number of bytes wanted; `0` means "up to the end of the file".
        #[serde(default)]
        length: u32,
    },
    /// The client is done with this session; the helper closes the connection.
    SessionEnd,
    /// The JSON encoded [`MergedIndex`](crate::index::MergedIndex).
    IndexResponse {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// File content answering a [`Message::DataRequest`].
    DataResponse {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// The request failed; `error` is a human readable reason.
    ErrorResponse { error: String },
}

impl Message {
    /// The wire name of this message kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::IndexRequest => "index-request",
            Message::DataRequest { .. } => "data-request",
            Message::SessionEnd => "session-end",
            Message::IndexResponse { .. } => "index-response",
            Message::DataResponse { .. } => "data-response",
            Message::ErrorResponse { .. } => "error-response",
        }
    }

    /// Shorthand for an [`Message::ErrorResponse`].
    pub fn error(error: impl std::fmt::Display) -> Self {
        Message::ErrorResponse {
            error: error.to_string(),
        }
    }
}

mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Errors from sending or receiving frames.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Reading or writing the underlying stream failed.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection at a frame boundary.
    #[error("channel closed by peer")]
    Closed,

    /// The length prefix announced a frame larger than [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// The frame body was not a valid message.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(ChannelError::FrameTooLarge(body.len()));
    }
    let len = body.len() as u32;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn frame_len(prefix: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE as usize {
        return Err(ChannelError::FrameTooLarge(len));
    }
    Ok(len)
}

fn decode_body(body: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(body)?)
}

/// A framed message stream over any byte stream.
#[derive(Debug)]
pub struct Channel<T> {
    stream: T,
}

impl<T> Channel<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Read + Write> Channel<T> {
    /// Writes one frame and flushes it.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let frame = encode_frame(message)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Blocks until one complete frame has been read.
    pub fn receive(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 4];
        if !read_exactish(&mut self.stream, &mut prefix)? {
            return Err(ChannelError::Closed);
        }

        let mut body = vec![0u8; frame_len(prefix)?];
        self.stream.read_exact(&mut body)?;
        decode_body(&body)
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Channel<T> {
    /// Writes one frame and flushes it.
    pub async fn send_async(&mut self, message: &Message) -> Result<()> {
        let frame = encode_frame(message)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Waits until one complete frame has been read.
    pub async fn receive_async(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 4];
        if !read_exactish_async(&mut self.stream, &mut prefix).await? {
            return Err(ChannelError::Closed);
        }

        let mut body = vec![0u8; frame_len(prefix)?];
        self.stream.read_exact(&mut body).await?;
        decode_body(&body)
    }
}
