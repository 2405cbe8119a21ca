use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use anyhow::bail;

use crate::channel::basic::BasicChannelContext;
use crate::channel::ChannelContext;
use crate::error::{PipeError, PipeResult};
use crate::pipe::message::Domain;
use crate::transport::tcp::TcpTransport;
use crate::transport::TransportContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCategory {
    Transport,
    Channel,
}

impl Display for BackendCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendCategory::Transport => write!(f, "transport"),
            BackendCategory::Channel => write!(f, "channel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub name: String,
    pub priority: i64,
    pub domains: BTreeSet<Domain>,
}

#[derive(Clone)]
pub enum Backend {
    Transport(Arc<dyn TransportContext>),
    Channel(Arc<dyn ChannelContext>),
}

impl Backend {
    pub fn category(&self) -> BackendCategory {
        match self {
            Backend::Transport(_) => BackendCategory::Transport,
            Backend::Channel(_) => BackendCategory::Channel,
        }
    }

    fn domains(&self) -> BTreeSet<Domain> {
        match self {
            // transports only carry frames of host memory
            Backend::Transport(_) => [Domain::cpu()].into_iter().collect(),
            Backend::Channel(channel) => channel.domains(),
        }
    }
}

struct Entry {
    descriptor: BackendDescriptor,
    backend: Backend,
}

/// All transports and channels a context can use, by name. Entries of each category are kept
///  ordered by descending priority, ties in registration order.
///
/// The registry is filled before it is handed to a [crate::pipe::context::Context], which then
///  only shares it immutably.
#[derive(Default)]
pub struct BackendRegistry {
    transports: Vec<Entry>,
    channels: Vec<Entry>,
}

impl BackendRegistry {
    pub fn new() -> BackendRegistry {
        Default::default()
    }

    /// TCP, Unix domain sockets where available, and the basic channel for host memory
    pub fn with_defaults() -> BackendRegistry {
        let mut result = BackendRegistry::new();
        // names are distinct, so registration can not fail
        let _ = result.register_transport("tcp", 0, TcpTransport::new());
        #[cfg(unix)]
        let _ = result.register_transport("uds", 100, crate::transport::uds::UdsTransport::new());
        let _ = result.register_channel("basic", 0, BasicChannelContext::new());
        result
    }

    fn entries(&self, category: BackendCategory) -> &Vec<Entry> {
        match category {
            BackendCategory::Transport => &self.transports,
            BackendCategory::Channel => &self.channels,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, priority: i64, backend: Backend) -> anyhow::Result<()> {
        let name = name.into();
        let category = backend.category();
        let entries = match category {
            BackendCategory::Transport => &mut self.transports,
            BackendCategory::Channel => &mut self.channels,
        };

        if entries.iter().any(|e| e.descriptor.name == name) {
            bail!("{} backend {} is already registered", category, name);
        }

        let descriptor = BackendDescriptor {
            name,
            priority,
            domains: backend.domains(),
        };
        let pos = entries.iter()
            .position(|e| e.descriptor.priority < priority)
            .unwrap_or(entries.len());
        entries.insert(pos, Entry { descriptor, backend });
        Ok(())
    }

    pub fn register_transport(&mut self, name: impl Into<String>, priority: i64, transport: impl TransportContext + 'static) -> anyhow::Result<()> {
        self.register(name, priority, Backend::Transport(Arc::new(transport)))
    }

    pub fn register_channel(&mut self, name: impl Into<String>, priority: i64, channel: impl ChannelContext + 'static) -> anyhow::Result<()> {
        self.register(name, priority, Backend::Channel(Arc::new(channel)))
    }

    pub fn resolve(&self, category: BackendCategory, name: &str) -> PipeResult<Backend> {
        self.entries(category).iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.backend.clone())
            .ok_or_else(|| PipeError::NotFound {
                category,
                name: name.to_string(),
            })
    }

    pub fn transport(&self, name: &str) -> PipeResult<Arc<dyn TransportContext>> {
        match self.resolve(BackendCategory::Transport, name)? {
            Backend::Transport(t) => Ok(t),
            Backend::Channel(_) => unreachable!("channel stored in the transport table"),
        }
    }

    pub fn channel(&self, name: &str) -> PipeResult<Arc<dyn ChannelContext>> {
        match self.resolve(BackendCategory::Channel, name)? {
            Backend::Channel(c) => Ok(c),
            Backend::Transport(_) => unreachable!("transport stored in the channel table"),
        }
    }

    pub fn enumerate(&self, category: BackendCategory) -> Vec<BackendDescriptor> {
        self.entries(category).iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub(crate) fn transports(&self) -> impl Iterator<Item = (&BackendDescriptor, &Arc<dyn TransportContext>)> {
        self.transports.iter()
            .filter_map(|e| match &e.backend {
                Backend::Transport(t) => Some((&e.descriptor, t)),
                Backend::Channel(_) => None,
            })
    }

    pub(crate) fn channels(&self) -> impl Iterator<Item = (&BackendDescriptor, &Arc<dyn ChannelContext>)> {
        self.channels.iter()
            .filter_map(|e| match &e.backend {
                Backend::Channel(c) => Some((&e.descriptor, c)),
                Backend::Transport(_) => None,
            })
    }
}
