//! Channels move the buffers of one domain between the two ends of a pipe. A channel either
//!  owns a dedicated connection that was set up during the handshake, or it piggybacks on the
//!  pipe's primary connection by putting everything into its descriptors.

pub mod basic;
pub mod inline;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::pipe::message::Domain;
use crate::transport::Connection;

/// Result of handing a buffer to a channel: the descriptor travels to the peer with the message
///  header, the completion fires when the channel is done with the buffer.
pub struct ChannelSend {
    pub descriptor: Bytes,
    pub completion: oneshot::Receiver<anyhow::Result<()>>,
}

pub trait ChannelContext: Send + Sync {
    fn domains(&self) -> BTreeSet<Domain>;

    /// Peers can only use a channel if both have the same name registered with equal domain
    ///  descriptors
    fn domain_descriptor(&self) -> String;

    fn needs_connection(&self) -> bool;

    /// `connection` is the dedicated connection if [ChannelContext::needs_connection] is true,
    ///  `None` otherwise
    fn create_channel(&self, connection: Option<Arc<dyn Connection>>) -> anyhow::Result<Box<dyn Channel>>;
}

/// Sends and receives are processed in the order they were issued. The receiving side must
///  issue its receives in the order the descriptors arrived.
pub trait Channel: Send + Sync {
    fn send(&self, buffer: Bytes) -> ChannelSend;

    fn recv(&self, descriptor: Bytes, length: usize) -> oneshot::Receiver<anyhow::Result<Bytes>>;

    /// Larger buffers are rejected before they are handed to the channel
    fn max_buffer_len(&self) -> Option<usize> {
        None
    }

    fn close(&self);
}
