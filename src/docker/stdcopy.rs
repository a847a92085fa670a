//! Docker's multiplexed stream framing for non-TTY attach sessions.
//!
//! Every frame starts with an 8 byte header: the stream selector, three
//! padding bytes, and the payload length as a big-endian `u32`.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

pub const HEADER_LEN: usize = 8;

// Longest daemon error message kept from a system-error frame.
const MAX_ERROR_FRAME: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
    Systemerr,
}

impl StdStream {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StdStream::Stdin),
            1 => Some(StdStream::Stdout),
            2 => Some(StdStream::Stderr),
            3 => Some(StdStream::Systemerr),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
            StdStream::Systemerr => 3,
        }
    }
}

pub fn encode_frame(stream: StdStream, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(stream.as_byte());
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Demultiplexes `src` into `stdout` and `stderr` until EOF, returning the
/// number of payload bytes written. Stdin frames echoed back by the engine go
/// to `stdout`. A system-error frame ends the copy with its message.
pub async fn demux<R, O, E>(src: &mut R, stdout: &mut O, stderr: &mut E) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut written = 0u64;

    loop {
        // EOF on a frame boundary is the normal end of stream.
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = src.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(written);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ));
            }
            filled += n;
        }

        let stream = StdStream::from_byte(header[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized stream selector {}", header[0]),
            )
        })?;
        let len = u64::from(u32::from_be_bytes([header[4], header[5], header[6], header[7]]));

        let mut frame = (&mut *src).take(len);
        let copied = match stream {
            StdStream::Stdin | StdStream::Stdout => tokio::io::copy(&mut frame, stdout).await?,
            StdStream::Stderr => tokio::io::copy(&mut frame, stderr).await?,
            StdStream::Systemerr => {
                let mut message = Vec::new();
                frame.take(MAX_ERROR_FRAME).read_to_end(&mut message).await?;
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("error from daemon in stream: {}", String::from_utf8_lossy(&message)),
                ));
            }
        };
        if copied < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame payload",
            ));
        }
        written += len;
    }
}
