//! Helpers for tests that run complete contexts in-process

use crate::channel::basic::BasicChannelContext;
use crate::config::ContextConfig;
use crate::pipe::context::Context;
use crate::pipe::registry::BackendRegistry;
use crate::transport::inproc::InprocTransport;

/// `inproc` over the shared `transport`, with the `basic` channel for the CPU domain
pub fn inproc_registry(transport: &InprocTransport) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register_transport("inproc", 0, transport.clone()).unwrap();
    registry.register_channel("basic", 0, BasicChannelContext::new()).unwrap();
    registry
}

pub fn test_context(name: &str, registry: BackendRegistry) -> Context {
    Context::new(ContextConfig::new(name), registry).unwrap()
}

/// A server context listening on `inproc`, and a client context sharing the same transport
pub async fn connected_contexts(transport: &InprocTransport) -> (Context, crate::pipe::listener::Listener, Context) {
    let server = test_context("server", inproc_registry(transport));
    let listener = server.listen(&["inproc://"]).await.unwrap();
    let client = test_context("client", inproc_registry(transport));
    (server, listener, client)
}
