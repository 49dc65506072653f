use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::obfuscation::Obfuscation;
use crate::protocol::{Header, Message, HEADER_LEN};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Frames messages onto a byte stream and obfuscates every frame.
#[derive(Debug, Clone)]
pub struct WireCodec {
    obfuscation: Arc<dyn Obfuscation>,
    chunk_size: usize,
}

impl WireCodec {
    pub fn new(obfuscation: Arc<dyn Obfuscation>, chunk_size: usize) -> Self {
        Self {
            obfuscation,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Writes the header followed by the inline payload, if any.
    pub async fn write_message<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        msg: &Message,
    ) -> Result<()> {
        self.write_header(writer, msg.header()).await?;
        if let Some(payload) = &msg.payload {
            self.write_frame(writer, payload).await?;
        }
        writer.flush().await.map_err(SyncError::ShortWrite)?;
        Ok(())
    }

    /// Writes a bare header; the caller streams the announced payload itself.
    pub async fn write_header<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        header: Header,
    ) -> Result<()> {
        self.write_frame(writer, &header.encode()).await
    }

    /// Reads one header.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly before the
    /// first byte; a header cut short is a `ShortRead`.
    pub async fn read_message<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Option<Header>> {
        let mut buf = [0u8; HEADER_LEN];
        let received = read_full(reader, &mut buf).await?;
        if received == 0 {
            return Ok(None);
        }
        if received < HEADER_LEN {
            return Err(SyncError::ShortRead {
                expected: HEADER_LEN,
                received,
            });
        }
        self.obfuscation.apply(&mut buf, 0);
        Header::decode(&buf).map(Some)
    }

    /// Reads the inline payload announced by `header`, refusing anything above `limit`.
    pub async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        header: &Header,
        limit: u64,
    ) -> Result<Vec<u8>> {
        if header.payload_size > limit {
            return Err(SyncError::Protocol(format!(
                "{} payload of {} bytes exceeds limit of {limit}",
                header.kind, header.payload_size
            )));
        }
        self.read_frame(reader, header.payload_size as usize).await
    }

    /// Sends an 8 byte size field as its own frame.
    pub async fn write_field<W: AsyncWrite + Unpin>(&self, writer: &mut W, value: u64) -> Result<()> {
        self.write_frame(writer, &value.to_be_bytes()).await
    }

    pub async fn read_field<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<u64> {
        let bytes = self.read_frame(reader, 8).await?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_be_bytes(buf))
    }

    /// Sends `bytes` as a single frame, in chunks of at most `chunk_size`.
    pub async fn write_frame<W: AsyncWrite + Unpin>(&self, writer: &mut W, bytes: &[u8]) -> Result<()> {
        let mut offset = 0u64;
        for chunk in bytes.chunks(self.chunk_size) {
            let mut buf = chunk.to_vec();
            self.obfuscation.apply(&mut buf, offset);
            writer.write_all(&buf).await.map_err(SyncError::ShortWrite)?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    pub async fn read_frame<R: AsyncRead + Unpin>(&self, reader: &mut R, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let received = read_full(reader, &mut buf).await?;
        if received < len {
            return Err(SyncError::ShortRead {
                expected: len,
                received,
            });
        }
        self.obfuscation.apply(&mut buf, 0);
        Ok(buf)
    }

    /// Streams exactly `len` bytes from `source` onto the wire as one frame.
    pub async fn send_stream<S, W>(&self, source: &mut S, writer: &mut W, len: u64) -> Result<()>
    where
        S: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;
        while offset < len {
            let n = (len - offset).min(self.chunk_size as u64) as usize;
            let chunk = &mut buf[..n];
            source.read_exact(chunk).await.map_err(|e| {
                SyncError::Transfer(format!(
                    "source ended after {offset} of {len} bytes: {e}"
                ))
            })?;
            self.obfuscation.apply(chunk, offset);
            writer.write_all(chunk).await.map_err(SyncError::ShortWrite)?;
            offset += n as u64;
        }
        writer.flush().await.map_err(SyncError::ShortWrite)?;
        Ok(())
    }

    /// Receives exactly `len` bytes of one frame into `sink`.
    pub async fn receive_stream<R, S>(&self, reader: &mut R, sink: &mut S, len: u64) -> Result<()>
    where
        R: AsyncRead + Unpin,
        S: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;
        while offset < len {
            let want = (len - offset).min(self.chunk_size as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(SyncError::ShortRead {
                    expected: len as usize,
                    received: offset as usize,
                });
            }
            let chunk = &mut buf[..n];
            self.obfuscation.apply(chunk, offset);
            sink.write_all(chunk).await?;
            offset += n as u64;
        }
        sink.flush().await?;
        Ok(())
    }
}

/// Fills `buf` until it is full or the stream ends; returns the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
