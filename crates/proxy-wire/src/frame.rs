use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compress::{self, CompressError};

pub const HEADER_MAGIC: &[u8; 4] = b"ZBXD";
const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Header flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const PROTOCOL: u8 = 0x01;
    pub const COMPRESS: u8 = 0x02;
    pub const LARGE: u8 = 0x04;

    pub fn protocol(self) -> bool {
        self.0 & Self::PROTOCOL != 0
    }

    pub fn compressed(self) -> bool {
        self.0 & Self::COMPRESS != 0
    }

    pub fn large(self) -> bool {
        self.0 & Self::LARGE != 0
    }
}

#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Upper bound on both the wire length and the uncompressed length.
    pub max_size: u64,
    pub compress: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            compress: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed before a message was received")]
    Closed,
    #[error("message size {size} exceeds the maximum size {max} bytes")]
    TooLarge { size: u64, max: u64 },
    #[error("malformed frame header: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Compression(#[from] CompressError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A received message with its header facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    /// Payload after decompression.
    pub payload: Bytes,
    /// The stream carried no header; it is a legacy line-protocol message.
    pub legacy: bool,
}

impl Frame {
    pub fn compressed(&self) -> bool {
        self.flags.compressed()
    }
}

/// Builds the header and body for `payload`, compressing when requested.
pub fn encode_frame(payload: &[u8], config: &FrameConfig) -> Result<Vec<u8>, FrameError> {
    let mut flags = FrameFlags::PROTOCOL;
    let (body, reserved) = if config.compress {
        flags |= FrameFlags::COMPRESS;
        (compress::compress(payload)?, payload.len() as u64)
    } else {
        (payload.to_vec(), 0u64)
    };

    let len = body.len() as u64;
    for size in [len, reserved] {
        if size > config.max_size {
            return Err(FrameError::TooLarge {
                size,
                max: config.max_size,
            });
        }
    }

    let large = len > u32::MAX as u64 || reserved > u32::MAX as u64;
    if large {
        flags |= FrameFlags::LARGE;
    }

    let mut out = Vec::with_capacity(body.len() + 21);
    out.extend_from_slice(HEADER_MAGIC);
    out.push(flags);
    if large {
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&reserved.to_le_bytes());
    } else {
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&(reserved as u32).to_le_bytes());
    }
    out.extend_from_slice(&body);
    Ok(out)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], config: &FrameConfig) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(payload, config)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one message. Streams without the header are read to EOF as legacy text.
pub async fn read_frame<R>(reader: &mut R, config: &FrameConfig) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    let filled = read_up_to(reader, &mut magic).await?;
    if filled == 0 {
        return Err(FrameError::Closed);
    }
    if filled < magic.len() || &magic != HEADER_MAGIC {
        return read_legacy(reader, &magic[..filled], config.max_size).await;
    }

    let flags = FrameFlags(reader.read_u8().await?);
    if !flags.protocol() {
        return Err(FrameError::Malformed("protocol flag not set"));
    }

    let (len, reserved) = if flags.large() {
        (reader.read_u64_le().await?, reader.read_u64_le().await?)
    } else {
        (
            reader.read_u32_le().await? as u64,
            reader.read_u32_le().await? as u64,
        )
    };

    for size in [len, reserved] {
        if size > config.max_size {
            return Err(FrameError::TooLarge {
                size,
                max: config.max_size,
            });
        }
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let payload = if flags.compressed() {
        compress::decompress(&body, reserved as usize)?
    } else {
        body
    };

    Ok(Frame {
        flags,
        payload: Bytes::from(payload),
        legacy: false,
    })
}

async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
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

async fn read_legacy<R>(reader: &mut R, prefix: &[u8], max_size: u64) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = prefix.to_vec();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        payload.extend_from_slice(&chunk[..n]);
        if payload.len() as u64 > max_size {
            return Err(FrameError::TooLarge {
                size: payload.len() as u64,
                max: max_size,
            });
        }
    }

    Ok(Frame {
        flags: FrameFlags::default(),
        payload: Bytes::from(payload),
        legacy: true,
    })
}
