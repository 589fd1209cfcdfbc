//! Peer protocol messages and frame codec.
//!
//! All traffic between two nodes multiplexes over a single TLS stream
//! as length-prefixed frames:
//!
//! ```text
//! [u32 BE payload length][u8 flags][payload]
//! ```
//!
//! The payload is a postcard-serialized [`Message`]; flag bit 0 marks
//! a deflate-compressed payload. Varint-encoded postcard plus a hard
//! frame cap keeps a hostile peer from forcing large allocations.
//!
//! Requests carry a per-connection monotonically increasing id and
//! responses may arrive out of order.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::files::FileRecord;
use crate::identity::NodeId;

/// Hard cap on a frame payload, compressed or not.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Payloads at or above this size are deflate-compressed.
const COMPRESS_THRESHOLD: usize = 1024;

const FLAG_COMPRESSED: u8 = 0x01;

/// A repository as announced in a [`Message::ClusterConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoAnnouncement {
    pub id: String,
    pub peers: Vec<NodeId>,
}

/// Everything that can travel between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message in each direction after the handshake.
    ClusterConfig {
        client_name: String,
        client_version: String,
        repos: Vec<RepoAnnouncement>,
    },
    /// Full record list for a repository: the sender's local view.
    Index {
        repo: String,
        records: Vec<FileRecord>,
    },
    /// Records past the receiver's last-seen watermark.
    IndexUpdate {
        repo: String,
        records: Vec<FileRecord>,
    },
    /// Ask for one block of a file.
    Request {
        id: u64,
        repo: String,
        name: String,
        offset: u64,
        size: u32,
    },
    /// Reply to a [`Message::Request`]. `error` is set instead of
    /// `data` when the block could not be served.
    Response {
        id: u64,
        data: Vec<u8>,
        error: Option<String>,
    },
    Ping,
    Pong,
    /// Graceful shutdown with a reason.
    Close { reason: String },
}

/// Codec failures. I/O errors tear the connection down as transient;
/// everything else is a protocol error charged to the peer.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("malformed message: {0}")]
    Decode(postcard::Error),
    #[error("corrupt compressed payload: {0}")]
    Decompress(std::io::Error),
}

/// Serialize a message into a ready-to-send frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    let raw = postcard::to_allocvec(msg).map_err(ProtoError::Decode)?;

    let (flags, payload) = if raw.len() >= COMPRESS_THRESHOLD {
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut enc, &raw)?;
        let compressed = enc.finish()?;
        if compressed.len() < raw.len() {
            (FLAG_COMPRESSED, compressed)
        } else {
            (0, raw)
        }
    } else {
        (0, raw)
    };

    if payload.len() > MAX_FRAME {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.push(flags);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one message as a frame. The caller decides when to flush.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one message frame. Returns `Io` with `UnexpectedEof` when the
/// peer closes between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let flags = header[4];
    if len > MAX_FRAME {
        return Err(ProtoError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let raw = if flags & FLAG_COMPRESSED != 0 {
        decompress(&payload)?
    } else {
        payload
    };

    postcard::from_bytes(&raw).map_err(ProtoError::Decode)
}

/// Inflate with the same cap as the frame itself, so a compression
/// bomb cannot outgrow the limit.
fn decompress(payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    use std::io::Read;
    let mut out = Vec::new();
    let decoder = flate2::read::DeflateDecoder::new(payload);
    let mut limited = decoder.take(MAX_FRAME as u64 + 1);
    limited
        .read_to_end(&mut out)
        .map_err(ProtoError::Decompress)?;
    if out.len() > MAX_FRAME {
        return Err(ProtoError::FrameTooLarge(out.len()));
    }
    Ok(out)
}
