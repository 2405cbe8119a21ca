use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tracing::{debug, warn};

use crate::transport::framing::{CloseFlag, FramedConnection, DEFAULT_MAX_FRAME_LEN};
use crate::transport::{Connection, TransportContext, TransportListener};

/// Connections over Unix domain sockets; addresses are file system paths
pub struct UdsTransport {
    max_frame_len: usize,
    domain_descriptor: String,
}

impl UdsTransport {
    pub fn new() -> UdsTransport {
        UdsTransport::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> UdsTransport {
        UdsTransport {
            max_frame_len,
            domain_descriptor: format!("uds:{}", host_identity()),
        }
    }
}

impl Default for UdsTransport {
    fn default() -> Self {
        UdsTransport::new()
    }
}

/// Unix sockets only work between processes sharing a kernel, so peers are compared by boot id
fn host_identity() -> String {
    match std::fs::read_to_string("/proc/sys/kernel/random/boot_id") {
        Ok(id) => id.trim().to_string(),
        Err(_) => "localhost".to_string(),
    }
}

fn framed(stream: UnixStream, max_frame_len: usize, peer: &str) -> Arc<dyn Connection> {
    let (read_half, write_half) = stream.into_split();
    Arc::new(FramedConnection::new(read_half, write_half, max_frame_len, peer))
}

#[async_trait]
impl TransportContext for UdsTransport {
    fn domain_descriptor(&self) -> String {
        self.domain_descriptor.clone()
    }

    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>> {
        let stream = UnixStream::connect(address).await?;
        Ok(framed(stream, self.max_frame_len, address))
    }

    async fn listen(&self, address: &str) -> anyhow::Result<Arc<dyn TransportListener>> {
        if address.is_empty() {
            bail!("a Unix domain socket listener needs a path");
        }
        let listener = UnixListener::bind(address)?;
        debug!("listening for Unix domain socket connections on {}", address);

        Ok(Arc::new(UdsTransportListener {
            listener,
            path: address.to_string(),
            max_frame_len: self.max_frame_len,
            closed: CloseFlag::new(),
        }))
    }
}

struct UdsTransportListener {
    listener: UnixListener,
    path: String,
    max_frame_len: usize,
    closed: CloseFlag,
}

#[async_trait]
impl TransportListener for UdsTransportListener {
    fn address(&self) -> String {
        self.path.clone()
    }

    async fn accept(&self) -> anyhow::Result<Arc<dyn Connection>> {
        if self.closed.is_closed() {
            bail!("listener on {} is closed", self.path);
        }
        select! {
            r = self.listener.accept() => {
                let (stream, _) = r?;
                debug!("accepted Unix domain socket connection on {}", self.path);
                Ok(framed(stream, self.max_frame_len, &self.path))
            }
            _ = self.closed.wait() => bail!("listener on {} was closed", self.path),
        }
    }

    fn close(&self) {
        if self.closed.close() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("could not remove socket file {}: {}", self.path, e);
            }
        }
    }
}
