//! Frame-level TCP plumbing: one reader half, one writer half.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use bitmessage_core::{CoreResult, Cryptography};

use crate::message::{FrameHeader, NetworkMessage, HEADER_LENGTH};

/// Splits a fresh stream into framed halves.
pub fn split(
    stream: TcpStream,
    crypto: Arc<dyn Cryptography>,
) -> CoreResult<(FrameReader, FrameWriter)> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        FrameReader {
            stream: read_half,
            crypto: crypto.clone(),
        },
        FrameWriter {
            stream: write_half,
            crypto,
        },
    ))
}

pub struct FrameReader {
    stream: OwnedReadHalf,
    crypto: Arc<dyn Cryptography>,
}

impl FrameReader {
    /// Reads one checksummed frame. Header-level failures (bad magic,
    /// oversize, broken socket) are connection-fatal; the caller
    /// decides what payload-level errors cost the peer.
    pub async fn read_frame(&mut self) -> CoreResult<(FrameHeader, Vec<u8>)> {
        let mut header_bytes = [0u8; HEADER_LENGTH];
        self.stream.read_exact(&mut header_bytes).await?;
        let header = FrameHeader::decode(&header_bytes)?;

        let mut payload = vec![0u8; header.length];
        self.stream.read_exact(&mut payload).await?;
        header.verify_checksum(self.crypto.as_ref(), &payload)?;

        trace!(command = %header.command, bytes = header.length, "frame in");
        Ok((header, payload))
    }
}

pub struct FrameWriter {
    stream: OwnedWriteHalf,
    crypto: Arc<dyn Cryptography>,
}

impl FrameWriter {
    pub async fn write_message(&mut self, message: &NetworkMessage) -> CoreResult<()> {
        let frame = message.encode_frame(self.crypto.as_ref());
        trace!(command = message.command(), bytes = frame.len(), "frame out");
        self.stream.write_all(&frame).await?;
        Ok(())
    }
}
