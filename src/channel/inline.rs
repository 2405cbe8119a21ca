use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelContext, ChannelSend};
use crate::pipe::message::Domain;
use crate::transport::framing::DEFAULT_MAX_FRAME_LEN;
use crate::transport::Connection;

/// Leaves room for the message header and further tensors in the same primary frame
pub const DEFAULT_MAX_INLINE_LEN: usize = DEFAULT_MAX_FRAME_LEN / 2;

/// Carries buffers inside their descriptors, i.e. on the pipe's primary connection. It needs no
///  connection of its own, which makes it cheap to set up but puts all data on one stream.
///
/// A whole message has to fit into one frame of the primary connection, so buffers are limited
///  to `max_buffer_len`. Writing a larger buffer fails without affecting the pipe.
pub struct InlineChannelContext {
    domains: BTreeSet<Domain>,
    max_buffer_len: usize,
}

impl InlineChannelContext {
    pub fn new() -> InlineChannelContext {
        InlineChannelContext::for_domains([Domain::cpu()])
    }

    pub fn for_domains(domains: impl IntoIterator<Item = Domain>) -> InlineChannelContext {
        InlineChannelContext {
            domains: domains.into_iter().collect(),
            max_buffer_len: DEFAULT_MAX_INLINE_LEN,
        }
    }

    pub fn with_max_buffer_len(mut self, max_buffer_len: usize) -> InlineChannelContext {
        self.max_buffer_len = max_buffer_len;
        self
    }
}

impl Default for InlineChannelContext {
    fn default() -> Self {
        InlineChannelContext::new()
    }
}

impl ChannelContext for InlineChannelContext {
    fn domains(&self) -> BTreeSet<Domain> {
        self.domains.clone()
    }

    fn domain_descriptor(&self) -> String {
        "inline".to_string()
    }

    fn needs_connection(&self) -> bool {
        false
    }

    fn create_channel(&self, connection: Option<Arc<dyn Connection>>) -> anyhow::Result<Box<dyn Channel>> {
        if connection.is_some() {
            bail!("the inline channel does not use a dedicated connection");
        }
        Ok(Box::new(InlineChannel { max_buffer_len: self.max_buffer_len }))
    }
}

struct InlineChannel {
    max_buffer_len: usize,
}

impl Channel for InlineChannel {
    fn send(&self, buffer: Bytes) -> ChannelSend {
        let (done, completion) = oneshot::channel();
        let _ = done.send(Ok(()));
        ChannelSend {
            descriptor: buffer,
            completion,
        }
    }

    fn recv(&self, descriptor: Bytes, length: usize) -> oneshot::Receiver<anyhow::Result<Bytes>> {
        let (done, completion) = oneshot::channel();
        let result = if descriptor.len() == length {
            Ok(descriptor)
        }
        else {
            Err(anyhow!("expected a buffer of {} bytes, the descriptor holds {}", length, descriptor.len()))
        };
        let _ = done.send(result);
        completion
    }

    fn max_buffer_len(&self) -> Option<usize> {
        Some(self.max_buffer_len)
    }

    fn close(&self) {}
}
