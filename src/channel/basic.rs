use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelContext, ChannelSend};
use crate::pipe::message::Domain;
use crate::transport::Connection;

/// Buffers are split into frames of this size, the last one holding the rest. Both peers derive
///  the frame sizes from the buffer length, so the transport's maximum frame length must not be
///  smaller than this.
pub const CHUNK_LEN: usize = 1024*1024;

/// Streams every buffer in [CHUNK_LEN] frames over a dedicated connection
pub struct BasicChannelContext {
    domains: BTreeSet<Domain>,
}

impl BasicChannelContext {
    pub fn new() -> BasicChannelContext {
        BasicChannelContext::for_domains([Domain::cpu()])
    }

    pub fn for_domains(domains: impl IntoIterator<Item = Domain>) -> BasicChannelContext {
        BasicChannelContext {
            domains: domains.into_iter().collect(),
        }
    }
}

impl Default for BasicChannelContext {
    fn default() -> Self {
        BasicChannelContext::new()
    }
}

impl ChannelContext for BasicChannelContext {
    fn domains(&self) -> BTreeSet<Domain> {
        self.domains.clone()
    }

    fn domain_descriptor(&self) -> String {
        "basic".to_string()
    }

    fn needs_connection(&self) -> bool {
        true
    }

    fn create_channel(&self, connection: Option<Arc<dyn Connection>>) -> anyhow::Result<Box<dyn Channel>> {
        let Some(connection) = connection else {
            bail!("the basic channel requires a dedicated connection");
        };
        Ok(Box::new(BasicChannel::new(connection)))
    }
}

type SendRequest = (Bytes, oneshot::Sender<anyhow::Result<()>>);
type RecvRequest = (usize, oneshot::Sender<anyhow::Result<Bytes>>);

struct BasicChannel {
    connection: Arc<dyn Connection>,
    sends: mpsc::UnboundedSender<SendRequest>,
    recvs: mpsc::UnboundedSender<RecvRequest>,
}

impl BasicChannel {
    fn new(connection: Arc<dyn Connection>) -> BasicChannel {
        let (sends, send_requests) = mpsc::unbounded_channel();
        let (recvs, recv_requests) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(connection.clone(), send_requests));
        tokio::spawn(read_loop(connection.clone(), recv_requests));

        BasicChannel {
            connection,
            sends,
            recvs,
        }
    }
}

/// Lengths of the frames a buffer of `length` bytes is sent in. An empty buffer is sent as one
///  empty frame.
fn chunk_lengths(length: usize) -> impl Iterator<Item = usize> {
    let num_chunks = length.div_ceil(CHUNK_LEN).max(1);
    (0..num_chunks).map(move |i| CHUNK_LEN.min(length - i*CHUNK_LEN))
}

async fn write_buffer(connection: &dyn Connection, buffer: Bytes) -> anyhow::Result<()> {
    let mut offset = 0;
    for chunk_len in chunk_lengths(buffer.len()) {
        connection.write_frame(buffer.slice(offset..offset + chunk_len)).await?;
        offset += chunk_len;
    }
    Ok(())
}

async fn read_buffer(connection: &dyn Connection, length: usize) -> anyhow::Result<Bytes> {
    if length <= CHUNK_LEN {
        let frame = connection.read_frame().await?;
        if frame.len() != length {
            bail!("expected a buffer of {} bytes, received {}", length, frame.len());
        }
        return Ok(frame);
    }

    let mut buffer = BytesMut::with_capacity(length);
    for chunk_len in chunk_lengths(length) {
        let frame = connection.read_frame().await?;
        if frame.len() != chunk_len {
            bail!("expected a chunk of {} bytes at offset {} of a {} byte buffer, received {}", chunk_len, buffer.len(), length, frame.len());
        }
        buffer.extend_from_slice(&frame);
    }
    Ok(buffer.freeze())
}

/// The first failure ends the loop; requests still queued then see their completion dropped
async fn write_loop(connection: Arc<dyn Connection>, mut requests: mpsc::UnboundedReceiver<SendRequest>) {
    while let Some((buffer, done)) = requests.recv().await {
        trace!("sending buffer of {} bytes", buffer.len());
        let result = write_buffer(connection.as_ref(), buffer).await;
        let failed = result.is_err();
        let _ = done.send(result);
        if failed {
            debug!("basic channel: write failed, discarding pending sends");
            break;
        }
    }
}

async fn read_loop(connection: Arc<dyn Connection>, mut requests: mpsc::UnboundedReceiver<RecvRequest>) {
    while let Some((length, done)) = requests.recv().await {
        let result = read_buffer(connection.as_ref(), length).await;
        let failed = result.is_err();
        let _ = done.send(result);
        if failed {
            debug!("basic channel: read failed, discarding pending receives");
            break;
        }
    }
}

impl Channel for BasicChannel {
    fn send(&self, buffer: Bytes) -> ChannelSend {
        let (done, completion) = oneshot::channel();
        // if the writer is gone, dropping `done` fails the completion
        let _ = self.sends.send((buffer, done));
        ChannelSend {
            descriptor: Bytes::new(),
            completion,
        }
    }

    fn recv(&self, _descriptor: Bytes, length: usize) -> oneshot::Receiver<anyhow::Result<Bytes>> {
        let (done, completion) = oneshot::channel();
        let _ = self.recvs.send((length, done));
        completion
    }

    fn close(&self) {
        self.connection.close();
    }
}
