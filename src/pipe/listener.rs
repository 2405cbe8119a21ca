use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, instrument, trace, warn, Instrument, Span};

use crate::error::{PipeError, PipeResult};
use crate::pipe::connection_requests::{ConnectionRequestCallback, ConnectionRequestRegistry};
use crate::pipe::context::{ConstructorToken, ContextInner};
use crate::pipe::pipe::Pipe;
use crate::pipe::protocol::Hello;
use crate::pipe::registry::BackendCategory;
use crate::pipe::url::{make_url, parse_url};
use crate::transport::{Connection, TransportListener};

/// What a server pipe needs from the listener that accepted it
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait ListenerPrivateIface: Send + Sync {
    /// Returns the id the peer has to announce on a new connection to this listener. The
    ///  callback is invoked exactly once, unless the request is unregistered first.
    async fn register_connection_request(&self, callback: ConnectionRequestCallback) -> PipeResult<u64>;
    fn unregister_connection_request(&self, id: u64);
    /// transport name -> address the listener is bound to
    fn addresses(&self) -> Arc<BTreeMap<String, String>>;
    /// The pipe is ready to be accepted, or it failed before that
    fn handshake_finished(&self, pipe_id: u64, established: bool);
}

enum ListenerEvent {
    Accept(oneshot::Sender<PipeResult<Pipe>>),
    Close,
    Incoming { transport: String, connection: Arc<dyn Connection>, hello: Hello },
    HandshakeFinished { pipe_id: u64, established: bool },
    RegisterConnectionRequest { callback: ConnectionRequestCallback, responder: oneshot::Sender<u64> },
    UnregisterConnectionRequest(u64),
}

fn send_event(events: &mpsc::WeakUnboundedSender<ListenerEvent>, event: ListenerEvent) -> bool {
    match events.upgrade() {
        Some(events) => events.send(event).is_ok(),
        None => false,
    }
}

/// Given to server pipes. It does not keep the listener alive.
struct ListenerHandle {
    events: mpsc::WeakUnboundedSender<ListenerEvent>,
    addresses: Arc<BTreeMap<String, String>>,
}

#[async_trait]
impl ListenerPrivateIface for ListenerHandle {
    async fn register_connection_request(&self, callback: ConnectionRequestCallback) -> PipeResult<u64> {
        let (responder, id) = oneshot::channel();
        if !send_event(&self.events, ListenerEvent::RegisterConnectionRequest { callback, responder }) {
            return Err(PipeError::Closed);
        }
        id.await
            .map_err(|_| PipeError::Closed)
    }

    fn unregister_connection_request(&self, id: u64) {
        send_event(&self.events, ListenerEvent::UnregisterConnectionRequest(id));
    }

    fn addresses(&self) -> Arc<BTreeMap<String, String>> {
        self.addresses.clone()
    }

    fn handshake_finished(&self, pipe_id: u64, established: bool) {
        send_event(&self.events, ListenerEvent::HandshakeFinished { pipe_id, established });
    }
}

/// Accepts pipes on one or more transports. Clones refer to the same listener; it is closed
///  when the last handle is dropped.
///
/// Incoming connections either start a new pipe, or they are auxiliary connections of a pipe
///  that is already handshaking. The latter are matched to the pipe by the id it asked the peer
///  to announce, and are never seen by [Listener::accept].
#[derive(Clone)]
pub struct Listener {
    events: mpsc::UnboundedSender<ListenerEvent>,
    addresses: Arc<BTreeMap<String, String>>,
}

impl Listener {
    pub(crate) async fn new(_token: ConstructorToken, context: Arc<ContextInner>, urls: &[&str]) -> PipeResult<Listener> {
        let mut bound: Vec<(String, Arc<dyn TransportListener>)> = Vec::new();
        let result = Listener::bind_all(&context, urls, &mut bound).await;
        if let Err(e) = result {
            for (_, transport_listener) in bound {
                transport_listener.close();
            }
            return Err(e);
        }

        let addresses: Arc<BTreeMap<String, String>> = Arc::new(bound.iter()
            .map(|(transport, l)| (transport.clone(), l.address()))
            .collect());
        info!("listening on {:?}", addresses);

        let (events_sender, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_receiver) = watch::channel(false);

        for (transport, transport_listener) in &bound {
            context.spawn(accept_loop(
                context.clone(),
                transport.clone(),
                transport_listener.clone(),
                events_sender.downgrade(),
                shutdown_receiver.clone(),
            ));
        }

        let listener_impl = ListenerImpl {
            context: context.clone(),
            handle: Arc::new(ListenerHandle {
                events: events_sender.downgrade(),
                addresses: addresses.clone(),
            }),
            events,
            transport_listeners: bound.into_iter().map(|(_, l)| l).collect(),
            shutdown,
            requests: ConnectionRequestRegistry::new(),
            pending_accepts: Default::default(),
            established: Default::default(),
            handshaking: Default::default(),
        };
        context.spawn(listener_impl.run());

        Ok(Listener {
            events: events_sender,
            addresses,
        })
    }

    async fn bind_all(context: &ContextInner, urls: &[&str], bound: &mut Vec<(String, Arc<dyn TransportListener>)>) -> PipeResult<()> {
        for url in urls {
            let (transport, address) = parse_url(url)?;
            if bound.iter().any(|(t, _)| t == transport) {
                return Err(PipeError::InvalidUrl(format!("more than one url for transport {}: {}", transport, url)));
            }

            let transport_context = context.registry.transport(transport)?;
            let transport_listener = transport_context.listen(address).await
                .map_err(PipeError::transport)?;
            debug!("bound {} to {}", url, transport_listener.address());
            bound.push((transport.to_string(), transport_listener));
        }
        Ok(())
    }

    /// Returns the next pipe that completed its handshake. Pipes are handed out in the order
    ///  they were established, and calls are served in the order they were made.
    pub fn accept(&self) -> impl Future<Output = PipeResult<Pipe>> + Send + 'static {
        let (responder, result) = oneshot::channel();
        let _ = self.events.send(ListenerEvent::Accept(responder));
        async move {
            result.await
                .unwrap_or(Err(PipeError::Closed))
        }
    }

    /// transport name -> the address the listener is bound to
    pub fn addresses(&self) -> &BTreeMap<String, String> {
        &self.addresses
    }

    pub fn address(&self, transport: &str) -> PipeResult<&str> {
        self.addresses.get(transport)
            .map(|a| a.as_str())
            .ok_or_else(|| PipeError::NotFound { category: BackendCategory::Transport, name: transport.to_string() })
    }

    /// the url a client can connect to for `transport`
    pub fn url(&self, transport: &str) -> PipeResult<String> {
        Ok(make_url(transport, self.address(transport)?))
    }

    /// Stops accepting, fails pending [Listener::accept] calls and closes pipes that were not
    ///  accepted yet. Idempotent.
    pub fn close(&self) {
        let _ = self.events.send(ListenerEvent::Close);
    }

    pub(crate) fn closer(&self) -> ListenerCloser {
        ListenerCloser(self.events.downgrade())
    }
}

impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addresses", &self.addresses)
            .finish()
    }
}

pub(crate) struct ListenerCloser(mpsc::WeakUnboundedSender<ListenerEvent>);

impl ListenerCloser {
    pub fn close(&self) {
        send_event(&self.0, ListenerEvent::Close);
    }

    pub fn is_alive(&self) -> bool {
        self.0.upgrade().is_some()
    }
}

/// pause after a failed accept, e.g. when the process ran out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[instrument(name = "accept_loop", skip_all, fields(transport = %transport))]
async fn accept_loop(context: Arc<ContextInner>, transport: String, transport_listener: Arc<dyn TransportListener>, events: mpsc::WeakUnboundedSender<ListenerEvent>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let connection = match transport_listener.accept().await {
            Ok(connection) => connection,
            Err(_) if *shutdown.borrow() => {
                debug!("listener closed");
                break;
            }
            Err(e) => {
                warn!("error accepting connection, retrying: {:#}", e);
                select! {
                    _ = sleep(ACCEPT_RETRY_DELAY) => continue,
                    _ = shutdown.wait_for(|closed| *closed) => {
                        debug!("listener closed");
                        break;
                    }
                }
            }
        };
        trace!("accepted connection");

        context.spawn(read_hello(transport.clone(), connection, events.clone(), shutdown.clone())
            .instrument(Span::current()));
    }
}

/// The first frame on a connection tells whether it starts a new pipe or belongs to an
///  existing one
#[instrument(name = "accepted_connection", skip_all)]
async fn read_hello(transport: String, connection: Arc<dyn Connection>, events: mpsc::WeakUnboundedSender<ListenerEvent>, mut shutdown: watch::Receiver<bool>) {
    let frame = select! {
        frame = connection.read_frame() => frame,
        _ = shutdown.wait_for(|closed| *closed) => {
            connection.close();
            return;
        }
    };

    let hello = match frame.and_then(|frame| Hello::deser(&frame)) {
        Ok(hello) => hello,
        Err(e) => {
            warn!("dropping connection without a valid hello: {:#}", e);
            connection.close();
            return;
        }
    };
    trace!("received {:?}", hello);

    if !send_event(&events, ListenerEvent::Incoming { transport, connection: connection.clone(), hello }) {
        connection.close();
    }
}

struct ListenerImpl {
    context: Arc<ContextInner>,
    handle: Arc<ListenerHandle>,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
    transport_listeners: Vec<Arc<dyn TransportListener>>,
    shutdown: watch::Sender<bool>,

    requests: ConnectionRequestRegistry,
    pending_accepts: VecDeque<oneshot::Sender<PipeResult<Pipe>>>,
    /// established, but not accepted yet
    established: VecDeque<Pipe>,
    handshaking: FxHashMap<u64, Pipe>,
}

impl ListenerImpl {
    #[instrument(name = "listener", skip_all, fields(context = %self.context.name()))]
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                ListenerEvent::Accept(responder) => {
                    self.pending_accepts.push_back(responder);
                    self.dispatch();
                }
                ListenerEvent::Close => break,
                ListenerEvent::Incoming { transport, connection, hello } => self.on_incoming(transport, connection, hello),
                ListenerEvent::HandshakeFinished { pipe_id, established } => self.on_handshake_finished(pipe_id, established),
                ListenerEvent::RegisterConnectionRequest { callback, responder } => {
                    let id = self.requests.register(callback);
                    let _ = responder.send(id);
                }
                ListenerEvent::UnregisterConnectionRequest(id) => self.requests.unregister(id),
            }
        }
        self.shut_down();
    }

    fn on_incoming(&mut self, transport: String, connection: Arc<dyn Connection>, hello: Hello) {
        match hello {
            Hello::Primary => {
                if self.context.is_closed() {
                    connection.close();
                    return;
                }
                let handle: Arc<dyn ListenerPrivateIface> = self.handle.clone();
                let pipe = self.context.create_server_pipe(transport, connection, handle);
                trace!("started handshake of pipe {}", pipe.id());
                self.handshaking.insert(pipe.id(), pipe);
            }
            Hello::ConnectionRequest(id) => {
                if !self.requests.match_connection(id, &transport, connection.clone()) {
                    warn!("{}", PipeError::UnknownConnectionRequest(id));
                    connection.close();
                }
            }
        }
    }

    fn on_handshake_finished(&mut self, pipe_id: u64, established: bool) {
        let Some(pipe) = self.handshaking.remove(&pipe_id) else {
            return;
        };
        if established {
            debug!("pipe {} is ready to be accepted", pipe_id);
            self.established.push_back(pipe);
            self.dispatch();
        }
        else {
            debug!("handshake of pipe {} failed: {:?}", pipe_id, pipe.status().error);
        }
    }

    fn dispatch(&mut self) {
        while let Some(pipe) = self.established.pop_front() {
            let Some(responder) = self.pending_accepts.pop_front() else {
                self.established.push_front(pipe);
                break;
            };
            if let Err(Ok(pipe)) = responder.send(Ok(pipe)) {
                // the caller lost interest
                self.established.push_front(pipe);
            }
        }
        self.pending_accepts.retain(|r| !r.is_closed());
    }

    fn shut_down(&mut self) {
        debug!("closing listener");
        self.shutdown.send_replace(true);
        for transport_listener in &self.transport_listeners {
            transport_listener.close();
        }
        self.requests.close();

        for responder in self.pending_accepts.drain(..) {
            let _ = responder.send(Err(PipeError::Closed));
        }
        for pipe in self.established.drain(..) {
            pipe.close();
        }
        for (_, pipe) in self.handshaking.drain() {
            pipe.close();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::channel::inline::InlineChannelContext;
    use crate::error::ErrorKind;
    use crate::pipe::message::Message;
    use crate::pipe::registry::BackendRegistry;
    use crate::pipe::state::PipeState;
    use crate::test_util::*;
    use crate::transport::inproc::InprocTransport;
    use crate::transport::TransportContext;
    use rstest::rstest;

    /// the server is established before the client sees the allowance
    fn inline_registry(transport: &InprocTransport) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry.register_transport("inproc", 0, transport.clone()).unwrap();
        registry.register_channel("inline", 0, InlineChannelContext::new()).unwrap();
        registry
    }

    #[rstest]
    #[case::invalid_url(vec!["inproc:/x"], ErrorKind::InvalidUrl)]
    #[case::unknown_transport(vec!["inproc://", "shm://x"], ErrorKind::NotFound)]
    #[case::same_transport_twice(vec!["inproc://a", "inproc://b"], ErrorKind::InvalidUrl)]
    #[case::bind_failure(vec!["inproc://taken"], ErrorKind::Transport)]
    #[tokio::test]
    async fn test_listen_errors(#[case] urls: Vec<&str>, #[case] expected: ErrorKind) {
        let transport = InprocTransport::new();
        let _taken = transport.listen("taken").await.unwrap();
        let context = test_context("server", inproc_registry(&transport));

        match context.listen(&urls).await {
            Ok(_) => panic!("listening on {:?} should fail", urls),
            Err(e) => assert_eq!(e.kind(), expected),
        }

        // partially bound addresses were released
        assert!(context.listen(&["inproc://a"]).await.is_ok());
    }

    #[tokio::test]
    async fn test_addresses() {
        let transport = InprocTransport::new();
        let mut registry = inproc_registry(&transport);
        registry.register_transport("other", 0, transport.clone()).unwrap();
        let context = test_context("server", registry);

        let listener = context.listen(&["inproc://fixed", "other://"]).await.unwrap();
        assert_eq!(listener.addresses().len(), 2);
        assert_eq!(listener.address("inproc"), Ok("fixed"));
        assert_eq!(listener.url("inproc"), Ok("inproc://fixed".to_string()));
        assert!(!listener.address("other").unwrap().is_empty());
        assert_eq!(listener.address("tcp").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_accept_in_order_of_establishment() {
        let transport = InprocTransport::new();
        let server = test_context("server", inline_registry(&transport));
        let listener = server.listen(&["inproc://"]).await.unwrap();
        let url = listener.url("inproc").unwrap();

        let mut clients = Vec::new();
        for name in ["c1", "c2", "c3"] {
            let client = test_context(name, inline_registry(&transport));
            let pipe = client.connect(&url);
            pipe.wait_established().await.unwrap();
            clients.push((client, pipe));
        }

        let first = listener.accept();
        // a caller that lost interest is skipped
        drop(listener.accept());
        let second = listener.accept();
        let third = listener.accept();

        assert_eq!(first.await.unwrap().remote_name().as_deref(), Some("c1"));
        assert_eq!(second.await.unwrap().remote_name().as_deref(), Some("c2"));
        assert_eq!(third.await.unwrap().remote_name().as_deref(), Some("c3"));
    }

    #[tokio::test]
    async fn test_pending_accepts_are_served_in_order() {
        let transport = InprocTransport::new();
        let server = test_context("server", inline_registry(&transport));
        let listener = server.listen(&["inproc://"]).await.unwrap();
        let url = listener.url("inproc").unwrap();

        let first = listener.accept();
        let second = listener.accept();

        let c1 = test_context("c1", inline_registry(&transport));
        let p1 = c1.connect(&url);
        p1.wait_established().await.unwrap();
        let c2 = test_context("c2", inline_registry(&transport));
        let p2 = c2.connect(&url);
        p2.wait_established().await.unwrap();

        assert_eq!(first.await.unwrap().remote_name().as_deref(), Some("c1"));
        assert_eq!(second.await.unwrap().remote_name().as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_accept_before_connect() {
        let transport = InprocTransport::new();
        let (_server, listener, client) = connected_contexts(&transport).await;

        let accepted = listener.accept();
        let pipe = client.connect(&listener.url("inproc").unwrap());
        let accepted = accepted.await.unwrap();
        assert_eq!(accepted.state(), PipeState::Established);

        pipe.write(Message::new("hello")).await.unwrap();
        assert_eq!(accepted.read().await.unwrap(), Message::new("hello"));
    }

    #[tokio::test]
    async fn test_close() {
        let transport = InprocTransport::new();
        let server = test_context("server", inline_registry(&transport));
        let client = test_context("client", inline_registry(&transport));
        let listener = server.listen(&["inproc://"]).await.unwrap();
        let url = listener.url("inproc").unwrap();

        // established, but never accepted
        let pipe = client.connect(&url);
        pipe.wait_established().await.unwrap();

        let pending = listener.clone().accept();
        let pending_after_pipe = listener.accept();
        assert_eq!(pending.await.unwrap().remote_name().as_deref(), Some("client"));

        listener.close();
        listener.close();
        assert_eq!(pending_after_pipe.await.unwrap_err(), PipeError::Closed);
        assert_eq!(listener.accept().await.unwrap_err(), PipeError::Closed);

        // the address is released
        let refused = client.connect(&url);
        assert_eq!(refused.wait_established().await.unwrap_err().kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_unaccepted_pipes_are_closed_with_listener() {
        let transport = InprocTransport::new();
        let server = test_context("server", inline_registry(&transport));
        let client = test_context("client", inline_registry(&transport));
        let listener = server.listen(&["inproc://"]).await.unwrap();

        let pipe = client.connect(&listener.url("inproc").unwrap());
        pipe.wait_established().await.unwrap();
        drop(listener);

        let status = pipe.wait_terminated().await;
        assert_eq!(status.error.map(|e| e.kind()), Some(ErrorKind::Transport));
    }

    #[tokio::test]
    async fn test_connection_without_hello() {
        let transport = InprocTransport::new();
        let (_server, listener, client) = connected_contexts(&transport).await;
        let address = listener.address("inproc").unwrap().to_string();

        let silent = transport.connect(&address).await.unwrap();
        let invalid = transport.connect(&address).await.unwrap();
        invalid.write_frame(bytes::Bytes::from_static(&[9, 9])).await.unwrap();
        assert!(invalid.read_frame().await.is_err());

        let pipe = client.connect(&listener.url("inproc").unwrap());
        let accepted = listener.accept().await.unwrap();
        pipe.wait_established().await.unwrap();
        assert_eq!(accepted.remote_name().as_deref(), Some("client"));

        listener.close();
        assert!(tokio::time::timeout(Duration::from_secs(5), silent.read_frame()).await.unwrap().is_err());
    }

    /// Fails its first accept, then behaves like the wrapped listener
    struct FlakyListener {
        inner: Arc<dyn TransportListener>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl TransportListener for FlakyListener {
        fn address(&self) -> String {
            self.inner.address()
        }

        async fn accept(&self) -> anyhow::Result<Arc<dyn Connection>> {
            if !self.failed.swap(true, Ordering::AcqRel) {
                anyhow::bail!("too many open files");
            }
            self.inner.accept().await
        }

        fn close(&self) {
            self.inner.close()
        }
    }

    struct FlakyTransport(InprocTransport);

    #[async_trait]
    impl TransportContext for FlakyTransport {
        fn domain_descriptor(&self) -> String {
            self.0.domain_descriptor()
        }

        async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>> {
            self.0.connect(address).await
        }

        async fn listen(&self, address: &str) -> anyhow::Result<Arc<dyn TransportListener>> {
            Ok(Arc::new(FlakyListener {
                inner: self.0.listen(address).await?,
                failed: AtomicBool::new(false),
            }))
        }
    }

    #[tokio::test]
    async fn test_accept_error_does_not_stop_listener() {
        let transport = InprocTransport::new();
        let mut registry = BackendRegistry::new();
        registry.register_transport("inproc", 0, FlakyTransport(transport.clone())).unwrap();
        registry.register_channel("inline", 0, InlineChannelContext::new()).unwrap();
        let server = test_context("server", registry);
        let listener = server.listen(&["inproc://"]).await.unwrap();

        let client = test_context("client", inline_registry(&transport));
        let pipe = client.connect(&listener.url("inproc").unwrap());

        let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
        pipe.wait_established().await.unwrap();
        assert_eq!(accepted.remote_name().as_deref(), Some("client"));
        assert!(format!("{:?}", listener).contains("inproc"));
    }
}
