//! Byte-stream transports. A transport opens and accepts connections that carry
//!  length-delimited frames; everything above that (handshake, channels) is built on
//!  [Connection].

pub mod framing;
pub mod inproc;
pub mod tcp;
#[cfg(unix)]
pub mod uds;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

/// A reliable, ordered connection that carries frames. Reading and writing can happen
///  concurrently from different tasks, but frames in one direction are never interleaved.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    async fn write_frame(&self, frame: Bytes) -> anyhow::Result<()>;

    async fn read_frame(&self) -> anyhow::Result<Bytes>;

    /// Closes the connection without flushing. Pending and subsequent reads and writes fail.
    ///  Calling this more than once has no additional effect.
    fn close(&self);
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    /// the address peers can use to connect, materialized (e.g. with the actual port number)
    fn address(&self) -> String;

    async fn accept(&self) -> anyhow::Result<Arc<dyn Connection>>;

    fn close(&self);
}

#[async_trait]
pub trait TransportContext: Send + Sync {
    /// Two transports with the same name can only talk to each other if their domain
    ///  descriptors are equal, e.g. shared memory requires both peers to be on the same host.
    fn domain_descriptor(&self) -> String;

    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>>;

    async fn listen(&self, address: &str) -> anyhow::Result<Arc<dyn TransportListener>>;
}
