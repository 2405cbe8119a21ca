use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tracing::trace;

use crate::transport::Connection;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16*1024*1024;

/// One-way switch from 'open' to 'closed' that async code can wait on
pub(crate) struct CloseFlag {
    closed: watch::Sender<bool>,
}
impl CloseFlag {
    pub fn new() -> CloseFlag {
        CloseFlag {
            closed: watch::Sender::new(false),
        }
    }

    /// returns `true` if this call closed the flag, `false` if it was closed before
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn wait(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

/// Frames on top of an arbitrary byte stream: each frame is a u32 length (big endian) followed
///  by the payload.
pub struct FramedConnection<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    max_frame_len: usize,
    closed: CloseFlag,
    peer: String,
}

impl<R, W> FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, max_frame_len: usize, peer: impl Into<String>) -> FramedConnection<R, W> {
        FramedConnection {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_len,
            closed: CloseFlag::new(),
            peer: peer.into(),
        }
    }

    async fn do_read(&self) -> anyhow::Result<Bytes> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len > self.max_frame_len {
            bail!("received a frame that was longer than the configured maximum ({} > {}) - the stream is apparently corrupt", frame_len, self.max_frame_len);
        }

        let mut buf = BytesMut::zeroed(frame_len);
        reader.read_exact(&mut buf).await?;
        trace!("received frame of {} bytes from {}", frame_len, self.peer);
        Ok(buf.freeze())
    }

    async fn do_write(&self, frame: Bytes) -> anyhow::Result<()> {
        if frame.len() > self.max_frame_len {
            bail!("frame length {} exceeds the configured maximum of {}", frame.len(), self.max_frame_len);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> Connection for FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.closed.is_closed() {
            bail!("connection to {} is closed", self.peer);
        }
        select! {
            r = self.do_write(frame) => r,
            _ = self.closed.wait() => bail!("connection to {} was closed", self.peer),
        }
    }

    async fn read_frame(&self) -> anyhow::Result<Bytes> {
        if self.closed.is_closed() {
            bail!("connection to {} is closed", self.peer);
        }
        select! {
            r = self.do_read() => r,
            _ = self.closed.wait() => bail!("connection to {} was closed", self.peer),
        }
    }

    fn close(&self) {
        if self.closed.close() {
            trace!("closing connection to {}", self.peer);
        }
    }
}
