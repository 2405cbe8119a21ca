use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::debug;

use crate::transport::framing::{CloseFlag, FramedConnection, DEFAULT_MAX_FRAME_LEN};
use crate::transport::{Connection, TransportContext, TransportListener};

/// Connections over TCP/IP. Addresses are anything `tokio` can resolve, e.g. `127.0.0.1:0`.
pub struct TcpTransport {
    max_frame_len: usize,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> TcpTransport {
        TcpTransport { max_frame_len }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new()
    }
}

fn framed(stream: TcpStream, max_frame_len: usize) -> anyhow::Result<Arc<dyn Connection>> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    Ok(Arc::new(FramedConnection::new(read_half, write_half, max_frame_len, peer.to_string())))
}

#[async_trait]
impl TransportContext for TcpTransport {
    fn domain_descriptor(&self) -> String {
        // any two TCP endpoints can try to reach each other
        "tcp:*".to_string()
    }

    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>> {
        let stream = TcpStream::connect(address).await?;
        framed(stream, self.max_frame_len)
    }

    async fn listen(&self, address: &str) -> anyhow::Result<Arc<dyn TransportListener>> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        debug!("listening for TCP connections on {}", local_addr);

        Ok(Arc::new(TcpTransportListener {
            listener,
            address: local_addr.to_string(),
            max_frame_len: self.max_frame_len,
            closed: CloseFlag::new(),
        }))
    }
}

struct TcpTransportListener {
    listener: TcpListener,
    address: String,
    max_frame_len: usize,
    closed: CloseFlag,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn accept(&self) -> anyhow::Result<Arc<dyn Connection>> {
        if self.closed.is_closed() {
            bail!("listener on {} is closed", self.address);
        }
        select! {
            r = self.listener.accept() => {
                let (stream, peer) = r?;
                debug!("accepted TCP connection from {}", peer);
                framed(stream, self.max_frame_len)
            }
            _ = self.closed.wait() => bail!("listener on {} was closed", self.address),
        }
    }

    fn close(&self) {
        self.closed.close();
    }
}
