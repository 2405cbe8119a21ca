use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{duplex, DuplexStream};
use tokio::select;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::framing::{CloseFlag, FramedConnection, DEFAULT_MAX_FRAME_LEN};
use crate::transport::{Connection, TransportContext, TransportListener};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

const DUPLEX_BUFFER_SIZE: usize = 64*1024;

/// Connections between contexts inside the same process, backed by in-memory duplex streams.
///
/// Contexts can only reach each other if they share a clone of the same `InprocTransport`;
///  separately created instances have different domain descriptors and separate address
///  spaces.
#[derive(Clone)]
pub struct InprocTransport {
    inner: Arc<InprocInner>,
}

struct InprocInner {
    instance_id: u64,
    next_address: AtomicU64,
    max_frame_len: usize,
    listeners: Mutex<FxHashMap<String, mpsc::UnboundedSender<DuplexStream>>>,
}

impl InprocTransport {
    pub fn new() -> InprocTransport {
        InprocTransport::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> InprocTransport {
        InprocTransport {
            inner: Arc::new(InprocInner {
                instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                next_address: AtomicU64::new(0),
                max_frame_len,
                listeners: Default::default(),
            })
        }
    }
}

impl Default for InprocTransport {
    fn default() -> Self {
        InprocTransport::new()
    }
}

fn framed(stream: DuplexStream, max_frame_len: usize, peer: &str) -> Arc<dyn Connection> {
    let (read_half, write_half) = tokio::io::split(stream);
    Arc::new(FramedConnection::new(read_half, write_half, max_frame_len, peer))
}

#[async_trait]
impl TransportContext for InprocTransport {
    fn domain_descriptor(&self) -> String {
        format!("inproc:{}:{}", std::process::id(), self.inner.instance_id)
    }

    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>> {
        let incoming = self.inner.listeners.lock()
            .map_err(|_| anyhow!("inproc listener table is poisoned"))?
            .get(address)
            .cloned();
        let Some(incoming) = incoming else {
            bail!("connection refused: nobody listens on inproc address {}", address);
        };

        let (local, remote) = duplex(DUPLEX_BUFFER_SIZE);
        incoming.send(remote)
            .map_err(|_| anyhow!("connection refused: inproc listener {} is closed", address))?;
        Ok(framed(local, self.inner.max_frame_len, address))
    }

    /// An empty address is replaced by a generated unique one
    async fn listen(&self, address: &str) -> anyhow::Result<Arc<dyn TransportListener>> {
        let address = if address.is_empty() {
            format!("inproc-{}", self.inner.next_address.fetch_add(1, Ordering::Relaxed))
        }
        else {
            address.to_string()
        };

        let (send, recv) = mpsc::unbounded_channel();
        {
            let mut listeners = self.inner.listeners.lock()
                .map_err(|_| anyhow!("inproc listener table is poisoned"))?;
            if listeners.contains_key(&address) {
                bail!("inproc address {} is already in use", address);
            }
            listeners.insert(address.clone(), send);
        }
        debug!("listening for inproc connections on {}", address);

        Ok(Arc::new(InprocTransportListener {
            transport: self.inner.clone(),
            address,
            incoming: tokio::sync::Mutex::new(recv),
            closed: CloseFlag::new(),
        }))
    }
}

struct InprocTransportListener {
    transport: Arc<InprocInner>,
    address: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: CloseFlag,
}

#[async_trait]
impl TransportListener for InprocTransportListener {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn accept(&self) -> anyhow::Result<Arc<dyn Connection>> {
        if self.closed.is_closed() {
            bail!("listener on {} is closed", self.address);
        }
        let mut incoming = self.incoming.lock().await;
        select! {
            stream = incoming.recv() => match stream {
                Some(stream) => Ok(framed(stream, self.transport.max_frame_len, &self.address)),
                None => bail!("listener on {} was closed", self.address),
            },
            _ = self.closed.wait() => bail!("listener on {} was closed", self.address),
        }
    }

    fn close(&self) {
        if self.closed.close() {
            if let Ok(mut listeners) = self.transport.listeners.lock() {
                listeners.remove(&self.address);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let transport = InprocTransport::new();
        let listener = transport.listen("").await.unwrap();
        let address = listener.address();

        let (client, server) = tokio::join!(transport.connect(&address), listener.accept());
        let client = client.unwrap();
        let server = server.unwrap();

        client.write_frame(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(server.read_frame().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_addresses() {
        let transport = InprocTransport::new();
        let a = transport.listen("").await.unwrap();
        let b = transport.listen("").await.unwrap();
        assert_ne!(a.address(), b.address());

        let named = transport.listen("server").await.unwrap();
        assert_eq!(named.address(), "server");
        assert!(transport.listen("server").await.is_err());

        named.close();
        assert!(transport.connect("server").await.is_err());
        assert!(transport.listen("server").await.is_ok());
    }

    #[tokio::test]
    async fn test_separate_instances() {
        let a = InprocTransport::new();
        let b = InprocTransport::new();
        assert_ne!(a.domain_descriptor(), b.domain_descriptor());
        assert_eq!(a.domain_descriptor(), a.clone().domain_descriptor());

        let _listener = a.listen("x").await.unwrap();
        assert!(b.connect("x").await.is_err());
    }
}
