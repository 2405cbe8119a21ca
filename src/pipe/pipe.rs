use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, trace, warn, Instrument, Span};

use crate::channel::Channel;
use crate::error::{PipeError, PipeResult};
use crate::pipe::connection_requests::{ConnectionRequestCallback, IncomingConnection};
use crate::pipe::context::{ConstructorToken, ContextInner};
use crate::pipe::listener::ListenerPrivateIface;
use crate::pipe::message::{Domain, Message, Tensor};
use crate::pipe::negotiation::{negotiate, validate_allowance};
use crate::pipe::protocol::{Allowance, Brochure, ChannelSelection, ConnectionRequest, Hello, MessageDescriptor, Packet, TensorDescriptor};
use crate::pipe::state::{PipeState, PipeStatus};
use crate::pipe::url::parse_url;
use crate::transport::{Connection, TransportContext};

/// What a dedicated auxiliary connection is for
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionTarget {
    /// replaces the primary connection with one over the negotiated transport
    Primary,
    Channel { domain: Domain, channel: String },
}

enum Start {
    Connect(String),
    Accepted { transport: String, connection: Arc<dyn Connection> },
}

enum PipeEvent {
    Read(oneshot::Sender<PipeResult<Message>>),
    Write(Message, oneshot::Sender<PipeResult<()>>),
    Close,

    PrimaryConnected(PipeResult<IncomingConnection>),
    PrimaryFrame { generation: u32, frame: PipeResult<Bytes> },
    PrimaryWriteFailed { generation: u32, error: PipeError },
    /// client side: an auxiliary connection was opened and announced
    AuxiliaryConnected { target: ConnectionTarget, transport: String, result: PipeResult<Arc<dyn Connection>> },
    /// server side: the listener matched (or gave up on) a connection request
    ConnectionRequestCompleted { id: u64, result: PipeResult<IncomingConnection> },
    WriteCompleted { responder: oneshot::Sender<PipeResult<()>>, result: PipeResult<()> },
    ReadCompleted { responder: oneshot::Sender<PipeResult<Message>>, result: PipeResult<Message> },
    EstablishmentTimedOut,
}

fn send_event(events: &mpsc::WeakUnboundedSender<PipeEvent>, event: PipeEvent) {
    if let Some(events) = events.upgrade() {
        let _ = events.send(event);
    }
}

fn flatten<T>(result: Result<anyhow::Result<T>, oneshot::error::RecvError>) -> anyhow::Result<T> {
    result.unwrap_or_else(|_| Err(anyhow!("operation was dropped before it completed")))
}

/// Handle to a pipe. Clones refer to the same pipe; the pipe is closed when the last handle is
///  dropped.
///
/// Reads and writes are queued at the time of the call, even before the returned future is
///  polled, so the order of calls is the order in which they are processed.
#[derive(Clone)]
pub struct Pipe {
    id: u64,
    events: mpsc::UnboundedSender<PipeEvent>,
    status: watch::Receiver<PipeStatus>,
}

impl Pipe {
    pub(crate) fn new_client(_token: ConstructorToken, context: Arc<ContextInner>, url: &str) -> Pipe {
        Pipe::spawn(context, None, Start::Connect(url.to_string()))
    }

    pub(crate) fn new_server(_token: ConstructorToken, context: Arc<ContextInner>, transport: String, connection: Arc<dyn Connection>, listener: Arc<dyn ListenerPrivateIface>) -> Pipe {
        Pipe::spawn(context, Some(listener), Start::Accepted { transport, connection })
    }

    fn spawn(context: Arc<ContextInner>, listener: Option<Arc<dyn ListenerPrivateIface>>, start: Start) -> Pipe {
        let (events_sender, events) = mpsc::unbounded_channel();
        let (status_sender, status) = watch::channel(PipeStatus::new());
        let id = context.next_pipe_id();

        let pipe_impl = PipeImpl {
            id,
            context: context.clone(),
            events,
            weak_self: events_sender.downgrade(),
            status: status_sender,
            state: PipeState::Uninitialized,
            listener,
            primary: None,
            generation: 0,
            switching: false,
            brochure: None,
            pending_requests: Default::default(),
            outstanding: 0,
            channels: Default::default(),
            pending_reads: Default::default(),
            pending_writes: Default::default(),
            arrived: Default::default(),
            deadline: None,
        };
        context.spawn(pipe_impl.run(start));

        Pipe {
            id,
            events: events_sender,
            status,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn read(&self) -> impl Future<Output = PipeResult<Message>> + Send + 'static {
        let (responder, result) = oneshot::channel();
        let _ = self.events.send(PipeEvent::Read(responder));
        let status = self.status.clone();
        async move {
            match result.await {
                Ok(result) => result,
                Err(_) => Err(final_error(&status)),
            }
        }
    }

    pub fn write(&self, message: Message) -> impl Future<Output = PipeResult<()>> + Send + 'static {
        let (responder, result) = oneshot::channel();
        let _ = self.events.send(PipeEvent::Write(message, responder));
        let status = self.status.clone();
        async move {
            match result.await {
                Ok(result) => result,
                Err(_) => Err(final_error(&status)),
            }
        }
    }

    /// Closes the pipe, failing all pending operations with [PipeError::Closed]. Idempotent.
    pub fn close(&self) {
        let _ = self.events.send(PipeEvent::Close);
    }

    pub fn state(&self) -> PipeState {
        self.status.borrow().state
    }

    pub fn status(&self) -> PipeStatus {
        self.status.borrow().clone()
    }

    pub fn remote_name(&self) -> Option<String> {
        self.status.borrow().remote_name.clone()
    }

    /// Waits for the handshake to finish, returning the pipe's error if it failed
    pub async fn wait_established(&self) -> PipeResult<()> {
        let mut status = self.status.clone();
        let outcome = match status.wait_for(|s| !s.state.is_handshake()).await {
            Ok(s) if s.state == PipeState::Established => Ok(()),
            Ok(s) => Err(s.error.clone().unwrap_or(PipeError::Closed)),
            Err(_) => Err(final_error(&self.status)),
        };
        outcome
    }

    /// Waits until the pipe is closed or failed
    pub async fn wait_terminated(&self) -> PipeStatus {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.state.is_terminal()).await;
        let result = status.borrow().clone();
        result
    }

    pub(crate) fn closer(&self) -> PipeCloser {
        PipeCloser(self.events.downgrade())
    }
}

impl Debug for Pipe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn final_error(status: &watch::Receiver<PipeStatus>) -> PipeError {
    status.borrow().error.clone().unwrap_or(PipeError::Closed)
}

/// Closes a pipe without keeping it alive
pub(crate) struct PipeCloser(mpsc::WeakUnboundedSender<PipeEvent>);

impl PipeCloser {
    pub fn close(&self) {
        send_event(&self.0, PipeEvent::Close);
    }

    pub fn is_alive(&self) -> bool {
        self.0.upgrade().is_some()
    }
}

enum WriterOp {
    Frame(Bytes, Option<oneshot::Sender<anyhow::Result<()>>>),
    CloseAfterFlush,
}

/// The primary connection with a reader task that feeds incoming frames into the pipe's event
///  queue and a writer task that keeps outgoing frames in order. `generation` identifies the
///  connection, so that events from a replaced connection can be told apart.
struct PrimaryConnection {
    transport: String,
    connection: Arc<dyn Connection>,
    writer: mpsc::UnboundedSender<WriterOp>,
}

impl PrimaryConnection {
    fn start(context: &ContextInner, transport: String, connection: Arc<dyn Connection>, generation: u32, events: mpsc::WeakUnboundedSender<PipeEvent>) -> PrimaryConnection {
        let (writer, ops) = mpsc::unbounded_channel();
        context.spawn(primary_read_loop(connection.clone(), generation, events.clone()).instrument(Span::current()));
        context.spawn(primary_write_loop(connection.clone(), ops, generation, events).instrument(Span::current()));

        PrimaryConnection {
            transport,
            connection,
            writer,
        }
    }

    fn send(&self, packet: &Packet) {
        trace!("sending {} packet", packet.name());
        let _ = self.writer.send(WriterOp::Frame(packet.ser(), None));
    }

    fn send_tracked(&self, packet: &Packet) -> oneshot::Receiver<anyhow::Result<()>> {
        let (done, completion) = oneshot::channel();
        let _ = self.writer.send(WriterOp::Frame(packet.ser(), Some(done)));
        completion
    }

    fn close(self) {
        self.connection.close();
    }

    fn flush_and_close(self) {
        if self.writer.send(WriterOp::CloseAfterFlush).is_err() {
            self.connection.close();
        }
    }
}

async fn primary_read_loop(connection: Arc<dyn Connection>, generation: u32, events: mpsc::WeakUnboundedSender<PipeEvent>) {
    loop {
        let frame = connection.read_frame().await
            .map_err(PipeError::transport);
        let failed = frame.is_err();

        let Some(events) = events.upgrade() else {
            break;
        };
        if events.send(PipeEvent::PrimaryFrame { generation, frame }).is_err() || failed {
            break;
        }
    }
}

async fn primary_write_loop(connection: Arc<dyn Connection>, mut ops: mpsc::UnboundedReceiver<WriterOp>, generation: u32, events: mpsc::WeakUnboundedSender<PipeEvent>) {
    while let Some(op) = ops.recv().await {
        match op {
            WriterOp::Frame(frame, done) => {
                let result = connection.write_frame(frame).await;
                let failed = result.is_err();
                match (done, result) {
                    (Some(done), result) => {
                        let _ = done.send(result);
                    }
                    (None, Err(e)) => send_event(&events, PipeEvent::PrimaryWriteFailed { generation, error: PipeError::transport(e) }),
                    (None, Ok(())) => {}
                }
                if failed {
                    break;
                }
            }
            WriterOp::CloseAfterFlush => {
                connection.close();
                break;
            }
        }
    }
}

async fn connect_with_hello(transport: Arc<dyn TransportContext>, address: String, hello: Hello) -> PipeResult<Arc<dyn Connection>> {
    let connection = transport.connect(&address).await
        .map_err(PipeError::transport)?;
    if let Err(e) = connection.write_frame(hello.ser()).await {
        connection.close();
        return Err(PipeError::transport(e));
    }
    Ok(connection)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The pipe's state, owned by a single task that processes one [PipeEvent] at a time
struct PipeImpl {
    id: u64,
    context: Arc<ContextInner>,
    events: mpsc::UnboundedReceiver<PipeEvent>,
    weak_self: mpsc::WeakUnboundedSender<PipeEvent>,
    status: watch::Sender<PipeStatus>,
    state: PipeState,

    /// server side only
    listener: Option<Arc<dyn ListenerPrivateIface>>,
    primary: Option<PrimaryConnection>,
    generation: u32,
    /// a transport switch was agreed on: the current primary connection is about to be
    ///  replaced, and its failure is expected
    switching: bool,

    /// client side: what was offered, to check the server's choice against
    brochure: Option<Brochure>,
    /// server side: connection requests registered with the listener
    pending_requests: FxHashMap<u64, ConnectionTarget>,
    outstanding: usize,

    channels: BTreeMap<Domain, Box<dyn Channel>>,

    pending_reads: VecDeque<oneshot::Sender<PipeResult<Message>>>,
    pending_writes: VecDeque<(Message, oneshot::Sender<PipeResult<()>>)>,
    /// descriptors of incoming messages that were not read yet
    arrived: VecDeque<MessageDescriptor>,

    deadline: Option<Instant>,
}

impl PipeImpl {
    #[instrument(name = "pipe", skip_all, fields(id = self.id, context = %self.context.name()))]
    async fn run(mut self, start: Start) {
        match start {
            Start::Connect(url) => self.start_client(&url),
            Start::Accepted { transport, connection } => self.start_server(transport, connection),
        }

        while !self.state.is_terminal() {
            let event = select! {
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("all handles were dropped");
                        PipeEvent::Close
                    }
                },
                _ = sleep_until_deadline(self.deadline) => PipeEvent::EstablishmentTimedOut,
            };
            self.on_event(event).await;
        }
        debug!("pipe terminated in state {:?}", self.state);
    }

    async fn on_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Read(responder) => {
                self.pending_reads.push_back(responder);
                self.process_reads();
            }
            PipeEvent::Write(message, responder) => {
                if self.state.is_handshake() {
                    self.pending_writes.push_back((message, responder));
                }
                else {
                    self.do_write(message, responder);
                }
            }
            PipeEvent::Close => self.terminate(PipeError::Closed, false),
            PipeEvent::PrimaryConnected(result) => self.on_primary_connected(result),
            PipeEvent::PrimaryFrame { generation, frame } => {
                if generation == self.generation {
                    self.on_primary_frame(frame).await;
                }
            }
            PipeEvent::PrimaryWriteFailed { generation, error } => {
                if generation == self.generation && !self.switching {
                    self.fail(error);
                }
            }
            PipeEvent::AuxiliaryConnected { target, transport, result } => match result {
                Ok(connection) => self.attach(target, transport, connection),
                Err(e) => self.fail(e),
            },
            PipeEvent::ConnectionRequestCompleted { id, result } => self.on_connection_request_completed(id, result),
            PipeEvent::WriteCompleted { responder, result } => {
                let _ = responder.send(result.clone());
                if let Err(e) = result {
                    self.fail(e);
                }
            }
            PipeEvent::ReadCompleted { responder, result } => {
                let failure = result.as_ref().err().cloned();
                let _ = responder.send(result);
                if let Some(e) = failure {
                    self.fail(e);
                }
            }
            PipeEvent::EstablishmentTimedOut => {
                let timeout = self.context.config.connection_request_timeout.unwrap_or_default();
                self.fail(PipeError::Timeout(format!("{} auxiliary connection(s) did not arrive within {:?}", self.outstanding, timeout)));
            }
        }
    }

    fn advance(&mut self, next: PipeState) {
        debug_assert!(self.state.can_advance_to(next), "illegal transition {:?} -> {:?}", self.state, next);
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
        self.status.send_modify(|s| s.state = next);
    }

    fn install_primary(&mut self, transport: String, connection: Arc<dyn Connection>) {
        if let Some(previous) = self.primary.take() {
            debug!("moving primary connection from {} to {}", previous.transport, transport);
            previous.close();
        }
        self.generation += 1;
        self.switching = false;
        self.primary = Some(PrimaryConnection::start(&self.context, transport, connection, self.generation, self.weak_self.clone()));
    }

    fn send_packet(&self, packet: &Packet) {
        if let Some(primary) = &self.primary {
            primary.send(packet);
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = self.context.config.connection_request_timeout
            .map(|timeout| Instant::now() + timeout);
    }

    //------------------------------------------- client side

    fn start_client(&mut self, url: &str) {
        if self.context.is_closed() {
            return self.terminate(PipeError::Closed, false);
        }

        let (transport_name, address) = match parse_url(url) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(e),
        };
        let transport = match self.context.registry.transport(transport_name) {
            Ok(transport) => transport,
            Err(e) => return self.fail(e),
        };

        debug!("connecting to {}", url);
        self.advance(PipeState::ClientConnecting);

        let events = self.weak_self.clone();
        let transport_name = transport_name.to_string();
        let address = address.to_string();
        self.context.spawn(async move {
            let result = connect_with_hello(transport, address, Hello::Primary).await
                .map(|connection| (transport_name, connection));
            send_event(&events, PipeEvent::PrimaryConnected(result));
        }.instrument(Span::current()));
    }

    fn on_primary_connected(&mut self, result: PipeResult<IncomingConnection>) {
        let (transport, connection) = match result {
            Ok(connected) => connected,
            Err(e) => return self.fail(e),
        };
        self.install_primary(transport, connection);

        let brochure = Brochure::from_registry(self.context.name(), &self.context.registry, |_| true);
        self.send_packet(&Packet::Brochure(brochure.clone()));
        self.brochure = Some(brochure);
        self.advance(PipeState::ClientWaitingForAllowance);
    }

    fn on_allowance(&mut self, allowance: Allowance) {
        let Some(brochure) = &self.brochure else {
            return self.protocol_error(anyhow!("received an allowance without having sent a brochure"));
        };
        if let Err(e) = validate_allowance(brochure, &allowance) {
            return self.protocol_error(e);
        }

        let current_transport = self.primary.as_ref().map(|p| p.transport.clone()).unwrap_or_default();
        if (allowance.transport != current_transport) != allowance.transport_switch.is_some() {
            return self.protocol_error(anyhow!("transport {} was chosen, but the request for switching to it does not match", allowance.transport));
        }
        let transport = match self.context.registry.transport(&allowance.transport) {
            Ok(transport) => transport,
            Err(e) => return self.fail(e),
        };

        let mut to_connect = Vec::new();
        if let Some(request) = allowance.transport_switch.clone() {
            to_connect.push((ConnectionTarget::Primary, request));
            self.switching = true;
        }
        for (domain, selection) in &allowance.channels {
            let context = match self.context.registry.channel(&selection.channel) {
                Ok(context) => context,
                Err(e) => return self.fail(e),
            };
            match (context.needs_connection(), &selection.connection) {
                (true, Some(request)) => {
                    to_connect.push((ConnectionTarget::Channel { domain: domain.clone(), channel: selection.channel.clone() }, request.clone()));
                }
                (false, None) => match context.create_channel(None) {
                    Ok(channel) => {
                        self.channels.insert(domain.clone(), channel);
                    }
                    Err(e) => return self.fail(PipeError::channel(e)),
                },
                (true, None) => return self.protocol_error(anyhow!("channel {} needs a connection, but none was requested", selection.channel)),
                (false, Some(_)) => return self.protocol_error(anyhow!("channel {} does not use a connection, but one was requested", selection.channel)),
            }
        }

        debug!("received allowance from {:?}: transport {}, channels {:?}", allowance.context_name, allowance.transport, allowance.channels.keys());
        self.outstanding = to_connect.len();
        self.status.send_modify(|s| {
            s.remote_name = Some(allowance.context_name.clone());
            s.transport = Some(allowance.transport.clone());
            s.channels = allowance.channels.iter()
                .map(|(domain, selection)| (domain.clone(), selection.channel.clone()))
                .collect();
            s.connections_required = to_connect.len();
        });

        for (target, request) in to_connect {
            let events = self.weak_self.clone();
            let transport = transport.clone();
            let transport_name = allowance.transport.clone();
            self.context.spawn(async move {
                trace!("opening auxiliary connection for {:?}", target);
                let result = connect_with_hello(transport, request.address, Hello::ConnectionRequest(request.id)).await;
                send_event(&events, PipeEvent::AuxiliaryConnected { target, transport: transport_name, result });
            }.instrument(Span::current()));
        }

        if self.outstanding == 0 {
            self.on_established();
        }
        else {
            self.advance(PipeState::ClientEstablishingChannels);
            self.arm_deadline();
        }
    }

    //------------------------------------------- server side

    fn start_server(&mut self, transport: String, connection: Arc<dyn Connection>) {
        if self.context.is_closed() {
            connection.close();
            return self.terminate(PipeError::Closed, false);
        }
        debug!("accepted pipe on {}", transport);
        self.install_primary(transport, connection);
        self.advance(PipeState::ServerWaitingForBrochure);
    }

    async fn register_connection_request(&mut self, listener: &Arc<dyn ListenerPrivateIface>, target: ConnectionTarget) -> PipeResult<u64> {
        let events = self.weak_self.clone();
        let callback: ConnectionRequestCallback = Box::new(move |id, result| {
            send_event(&events, PipeEvent::ConnectionRequestCompleted { id, result });
        });
        let id = listener.register_connection_request(callback).await?;
        trace!("waiting for connection request {} for {:?}", id, target);
        self.pending_requests.insert(id, target);
        Ok(id)
    }

    async fn on_brochure(&mut self, brochure: Brochure) {
        let Some(listener) = self.listener.clone() else {
            return self.protocol_error(anyhow!("received a brochure on a client pipe"));
        };
        let addresses = listener.addresses();
        self.status.send_modify(|s| s.remote_name = Some(brochure.context_name.clone()));

        let own = Brochure::from_registry(self.context.name(), &self.context.registry, |t| addresses.contains_key(t));
        let negotiated = match negotiate(&brochure, &own) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!("handshake with {:?} failed: {}", brochure.context_name, e);
                self.send_packet(&Packet::HandshakeFailure(e.to_string()));
                return self.terminate(e, true);
            }
        };
        let Some(address) = addresses.get(&negotiated.transport).cloned() else {
            return self.fail(PipeError::Handshake(format!("not listening on transport {}", negotiated.transport)));
        };

        let incoming_transport = self.primary.as_ref().map(|p| p.transport.clone()).unwrap_or_default();
        let transport_switch = if negotiated.transport != incoming_transport {
            match self.register_connection_request(&listener, ConnectionTarget::Primary).await {
                Ok(id) => {
                    self.switching = true;
                    Some(ConnectionRequest { address: address.clone(), id })
                }
                Err(e) => return self.fail(e),
            }
        }
        else {
            None
        };

        let mut channels = BTreeMap::new();
        for (domain, channel_name) in &negotiated.channels {
            let context = match self.context.registry.channel(channel_name) {
                Ok(context) => context,
                Err(e) => return self.fail(e),
            };
            let connection = if context.needs_connection() {
                let target = ConnectionTarget::Channel { domain: domain.clone(), channel: channel_name.clone() };
                match self.register_connection_request(&listener, target).await {
                    Ok(id) => Some(ConnectionRequest { address: address.clone(), id }),
                    Err(e) => return self.fail(e),
                }
            }
            else {
                match context.create_channel(None) {
                    Ok(channel) => {
                        self.channels.insert(domain.clone(), channel);
                    }
                    Err(e) => return self.fail(PipeError::channel(e)),
                }
                None
            };
            channels.insert(domain.clone(), ChannelSelection { channel: channel_name.clone(), connection });
        }

        debug!("agreed with {:?} on transport {}, channels {:?}", brochure.context_name, negotiated.transport, negotiated.channels);
        self.outstanding = self.pending_requests.len();
        self.status.send_modify(|s| {
            s.transport = Some(negotiated.transport.clone());
            s.channels = negotiated.channels.clone();
            s.connections_required = self.pending_requests.len();
        });

        self.send_packet(&Packet::Allowance(Allowance {
            context_name: self.context.name().to_string(),
            transport: negotiated.transport,
            transport_switch,
            channels,
        }));

        if self.outstanding == 0 {
            self.on_established();
        }
        else {
            self.advance(PipeState::ServerEstablishingChannels);
            self.arm_deadline();
        }
    }

    fn on_connection_request_completed(&mut self, id: u64, result: PipeResult<IncomingConnection>) {
        let Some(target) = self.pending_requests.remove(&id) else {
            if let Ok((_, connection)) = result {
                debug!("connection request {} is no longer pending - dropping connection", id);
                connection.close();
            }
            return;
        };
        match result {
            Ok((transport, connection)) => self.attach(target, transport, connection),
            Err(e) => self.fail(e),
        }
    }

    //------------------------------------------- both sides

    fn attach(&mut self, target: ConnectionTarget, transport: String, connection: Arc<dyn Connection>) {
        if self.outstanding == 0 || !matches!(self.state, PipeState::ClientEstablishingChannels | PipeState::ServerEstablishingChannels) {
            warn!("unexpected auxiliary connection for {:?} in state {:?}", target, self.state);
            connection.close();
            return;
        }

        match target {
            ConnectionTarget::Primary => self.install_primary(transport, connection),
            ConnectionTarget::Channel { domain, channel } => {
                let created = self.context.registry.channel(&channel)
                    .and_then(|context| context.create_channel(Some(connection)).map_err(PipeError::channel));
                match created {
                    Ok(channel) => {
                        self.channels.insert(domain, channel);
                    }
                    Err(e) => return self.fail(e),
                }
            }
        }

        self.outstanding -= 1;
        self.status.send_modify(|s| s.connections_matched += 1);
        if self.outstanding == 0 {
            self.on_established();
        }
    }

    fn on_established(&mut self) {
        let status = self.status.borrow().clone();
        debug_assert_eq!(status.connections_matched, status.connections_required);

        self.deadline = None;
        self.advance(PipeState::Established);
        if let Some(listener) = &self.listener {
            listener.handshake_finished(self.id, true);
        }
        info!("pipe to {:?} established: transport {:?}, channels {:?}", status.remote_name.unwrap_or_default(), status.transport.unwrap_or_default(), status.channels);

        let writes: Vec<_> = self.pending_writes.drain(..).collect();
        for (message, responder) in writes {
            self.do_write(message, responder);
        }
        self.process_reads();
    }

    async fn on_primary_frame(&mut self, frame: PipeResult<Bytes>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if self.switching => {
                debug!("previous primary connection ended: {}", e);
                return;
            }
            Err(e) => return self.fail(e),
        };
        let packet = match Packet::deser(&frame) {
            Ok(packet) => packet,
            Err(e) if self.state == PipeState::ServerWaitingForBrochure => {
                let e = e.context("malformed brochure");
                warn!("protocol error: {:#}", e);
                self.send_packet(&Packet::HandshakeFailure(format!("{:#}", e)));
                return self.terminate(PipeError::protocol(e), true);
            }
            Err(e) => return self.protocol_error(e.context("malformed packet")),
        };
        trace!("received {} packet", packet.name());

        match (self.state, packet) {
            (PipeState::ClientWaitingForAllowance, Packet::Allowance(allowance)) => self.on_allowance(allowance),
            (PipeState::ClientWaitingForAllowance, Packet::HandshakeFailure(reason)) => {
                warn!("server rejected the handshake: {}", reason);
                self.fail(PipeError::Handshake(reason));
            }
            (PipeState::ServerWaitingForBrochure, Packet::Brochure(brochure)) => self.on_brochure(brochure).await,
            (PipeState::ClientEstablishingChannels | PipeState::ServerEstablishingChannels | PipeState::Established, Packet::Message(descriptor)) => {
                self.arrived.push_back(descriptor);
                self.process_reads();
            }
            (state, packet) => self.protocol_error(anyhow!("unexpected {} packet in state {:?}", packet.name(), state)),
        }
    }

    fn do_write(&mut self, message: Message, responder: oneshot::Sender<PipeResult<()>>) {
        if let Some(tensor) = message.tensors.iter().find(|t| !self.channels.contains_key(&t.domain)) {
            debug!("rejecting write: no channel for domain {}", tensor.domain);
            let _ = responder.send(Err(PipeError::DomainNotNegotiated(tensor.domain.to_string())));
            return;
        }
        for tensor in &message.tensors {
            let max = self.channels.get(&tensor.domain).and_then(|c| c.max_buffer_len());
            if let Some(max) = max.filter(|&max| tensor.data.len() > max) {
                debug!("rejecting write: buffer of {} bytes for domain {} exceeds {}", tensor.data.len(), tensor.domain, max);
                let _ = responder.send(Err(PipeError::BufferTooLarge { domain: tensor.domain.to_string(), length: tensor.data.len(), max }));
                return;
            }
        }
        let Some(primary) = &self.primary else {
            let _ = responder.send(Err(PipeError::Closed));
            return;
        };

        let mut tensors = Vec::with_capacity(message.tensors.len());
        let mut completions = Vec::with_capacity(message.tensors.len());
        for tensor in message.tensors {
            let length = tensor.data.len() as u64;
            let Some(channel) = self.channels.get(&tensor.domain) else {
                continue;
            };
            let sent = channel.send(tensor.data);
            tensors.push(TensorDescriptor {
                domain: tensor.domain,
                length,
                channel_descriptor: sent.descriptor,
            });
            completions.push(sent.completion);
        }

        let header_written = primary.send_tracked(&Packet::Message(MessageDescriptor {
            metadata: message.metadata,
            tensors,
        }));

        let events = self.weak_self.clone();
        self.context.spawn(async move {
            let mut result = flatten(header_written.await).map_err(PipeError::transport);
            for completion in completions {
                let completed = flatten(completion.await).map_err(PipeError::channel);
                if result.is_ok() {
                    result = completed;
                }
            }
            send_event(&events, PipeEvent::WriteCompleted { responder, result });
        }.instrument(Span::current()));
    }

    /// Pairs pending reads with arrived descriptors, in order
    fn process_reads(&mut self) {
        if self.state != PipeState::Established {
            return;
        }

        while !self.pending_reads.is_empty() && !self.arrived.is_empty() {
            let (Some(responder), Some(descriptor)) = (self.pending_reads.pop_front(), self.arrived.pop_front()) else {
                break;
            };

            let mut receptions = Vec::with_capacity(descriptor.tensors.len());
            let mut invalid = None;
            for tensor in descriptor.tensors {
                let Ok(length) = usize::try_from(tensor.length) else {
                    invalid = Some(anyhow!("tensor length {} is out of range", tensor.length));
                    break;
                };
                match self.channels.get(&tensor.domain) {
                    Some(channel) => receptions.push((tensor.domain, channel.recv(tensor.channel_descriptor, length))),
                    None => {
                        invalid = Some(anyhow!("peer sent a tensor for domain {} which was not negotiated", tensor.domain));
                        break;
                    }
                }
            }
            if let Some(error) = invalid {
                let _ = responder.send(Err(PipeError::Protocol(error.to_string())));
                return self.protocol_error(error);
            }

            let metadata = descriptor.metadata;
            let events = self.weak_self.clone();
            self.context.spawn(async move {
                let mut tensors = Vec::with_capacity(receptions.len());
                let mut failure = None;
                for (domain, reception) in receptions {
                    match flatten(reception.await) {
                        Ok(data) => tensors.push(Tensor { domain, data }),
                        Err(e) => {
                            failure = Some(PipeError::channel(e));
                            break;
                        }
                    }
                }
                let result = match failure {
                    None => Ok(Message { metadata, tensors }),
                    Some(e) => Err(e),
                };
                send_event(&events, PipeEvent::ReadCompleted { responder, result });
            }.instrument(Span::current()));
        }
    }

    //------------------------------------------- shutdown

    fn protocol_error(&mut self, error: anyhow::Error) {
        warn!("protocol error: {:#}", error);
        self.fail(PipeError::protocol(error));
    }

    fn fail(&mut self, error: PipeError) {
        self.terminate(error, false);
    }

    /// Releases everything the pipe holds and fails all pending operations with `error`. With
    ///  `flush_primary`, frames already queued on the primary connection are still sent.
    fn terminate(&mut self, error: PipeError, flush_primary: bool) {
        if self.state.is_terminal() || self.state == PipeState::Closing {
            return;
        }
        match &error {
            PipeError::Closed => debug!("closing pipe"),
            e => debug!("pipe failed in state {:?}: {}", self.state, e),
        }

        self.status.send_modify(|s| s.error = Some(error.clone()));
        if let (Some(listener), true) = (&self.listener, self.state.is_handshake()) {
            listener.handshake_finished(self.id, false);
        }
        if error.is_closed() || self.state == PipeState::Established {
            self.advance(PipeState::Closing);
        }
        self.deadline = None;

        if let Some(primary) = self.primary.take() {
            if flush_primary {
                primary.flush_and_close();
            }
            else {
                primary.close();
            }
        }
        for (_, channel) in std::mem::take(&mut self.channels) {
            channel.close();
        }
        if let Some(listener) = &self.listener {
            for (id, _) in self.pending_requests.drain() {
                listener.unregister_connection_request(id);
            }
        }
        for responder in self.pending_reads.drain(..) {
            let _ = responder.send(Err(error.clone()));
        }
        for (_, responder) in self.pending_writes.drain(..) {
            let _ = responder.send(Err(error.clone()));
        }
        self.arrived.clear();

        self.advance(if error.is_closed() { PipeState::Closed } else { PipeState::Error });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::channel::basic::BasicChannelContext;
    use crate::channel::inline::InlineChannelContext;
    use crate::error::ErrorKind;
    use crate::pipe::listener::MockListenerPrivateIface;
    use crate::pipe::registry::BackendRegistry;
    use crate::test_util::*;
    use crate::transport::inproc::InprocTransport;
    use crate::transport::tcp::TcpTransport;
    use crate::transport::TransportListener;

    fn sample_message() -> Message {
        Message::new("meta")
            .with_tensor(Tensor::cpu(vec![7u8; 100_000]))
            .with_tensor(Tensor::cpu(""))
            .with_tensor(Tensor::cpu("abc"))
    }

    async fn exchange(from: &Pipe, to: &Pipe, message: Message) {
        let written = from.write(message.clone());
        let received = to.read().await.unwrap();
        written.await.unwrap();
        assert_eq!(received, message);
    }

    async fn connect_pair(client: &crate::pipe::context::Context, listener: &crate::pipe::listener::Listener, transport: &str) -> (Pipe, Pipe) {
        let pipe = client.connect(&listener.url(transport).unwrap());
        let accepted = listener.accept().await.unwrap();
        pipe.wait_established().await.unwrap();
        accepted.wait_established().await.unwrap();
        (pipe, accepted)
    }

    #[tokio::test]
    async fn test_exchange_over_basic_channel() {
        let transport = InprocTransport::new();
        let (server, listener, client) = connected_contexts(&transport).await;

        let pipe = client.connect(&listener.url("inproc").unwrap());
        // queued until the handshake is done
        let early = pipe.write(Message::new("early"));

        let accepted = listener.accept().await.unwrap();
        pipe.wait_established().await.unwrap();
        early.await.unwrap();
        assert_eq!(accepted.read().await.unwrap(), Message::new("early"));

        assert_eq!(pipe.remote_name().as_deref(), Some("server"));
        assert_eq!(accepted.remote_name().as_deref(), Some("client"));
        for status in [pipe.status(), accepted.status()] {
            assert_eq!(status.state, PipeState::Established);
            assert_eq!(status.transport.as_deref(), Some("inproc"));
            assert_eq!(status.channels, [(Domain::cpu(), "basic".to_string())].into_iter().collect());
            assert_eq!(status.connections_required, 1);
            assert_eq!(status.connections_matched, 1);
            assert_eq!(status.error, None);
        }

        exchange(&pipe, &accepted, sample_message()).await;
        exchange(&accepted, &pipe, sample_message()).await;

        // reads are matched with messages in order
        let first = accepted.read();
        let second = accepted.read();
        pipe.write(Message::new("1").with_tensor(Tensor::cpu("x"))).await.unwrap();
        pipe.write(Message::new("2")).await.unwrap();
        assert_eq!(first.await.unwrap().metadata, Bytes::from_static(b"1"));
        assert_eq!(second.await.unwrap().metadata, Bytes::from_static(b"2"));

        client.join().await;
        server.join().await;
    }

    #[tokio::test]
    async fn test_exchange_over_inline_channel() {
        let transport = InprocTransport::new();
        let mut registry = BackendRegistry::new();
        registry.register_transport("inproc", 0, transport.clone()).unwrap();
        registry.register_channel("inline", 0, InlineChannelContext::new()).unwrap();
        let server = test_context("server", registry);
        let listener = server.listen(&["inproc://"]).await.unwrap();

        let mut registry = BackendRegistry::new();
        registry.register_transport("inproc", 0, transport.clone()).unwrap();
        registry.register_channel("basic", 10, BasicChannelContext::new()).unwrap();
        registry.register_channel("inline", 0, InlineChannelContext::new()).unwrap();
        let client = test_context("client", registry);

        let (pipe, accepted) = connect_pair(&client, &listener, "inproc").await;
        assert_eq!(pipe.status().channels, [(Domain::cpu(), "inline".to_string())].into_iter().collect());
        assert_eq!(pipe.status().connections_required, 0);

        exchange(&pipe, &accepted, sample_message()).await;
        exchange(&accepted, &pipe, Message::default()).await;
    }

    #[tokio::test]
    async fn test_exchange_over_tcp() {
        let mut registry = BackendRegistry::new();
        registry.register_transport("tcp", 0, TcpTransport::new()).unwrap();
        registry.register_channel("basic", 0, BasicChannelContext::new()).unwrap();
        let server = test_context("server", registry);
        let listener = server.listen(&["tcp://127.0.0.1:0"]).await.unwrap();

        let mut registry = BackendRegistry::new();
        registry.register_transport("tcp", 0, TcpTransport::new()).unwrap();
        registry.register_channel("basic", 0, BasicChannelContext::new()).unwrap();
        let client = test_context("client", registry);

        let (pipe, accepted) = connect_pair(&client, &listener, "tcp").await;
        assert_eq!(accepted.status().transport.as_deref(), Some("tcp"));
        exchange(&pipe, &accepted, sample_message()).await;
        exchange(&accepted, &pipe, sample_message()).await;

        client.join().await;
        server.join().await;
    }

    #[tokio::test]
    async fn test_tensor_larger_than_a_frame() {
        let transport = InprocTransport::new();
        let (_server, listener, client) = connected_contexts(&transport).await;
        let (pipe, accepted) = connect_pair(&client, &listener, "inproc").await;

        let big: Bytes = (0..17*1024*1024).map(|i| (i % 253) as u8).collect::<Vec<_>>().into();
        exchange(&pipe, &accepted, Message::new("big").with_tensor(Tensor::cpu(big))).await;
        exchange(&accepted, &pipe, sample_message()).await;

        assert_eq!(pipe.state(), PipeState::Established);
        assert_eq!(accepted.state(), PipeState::Established);
    }

    #[tokio::test]
    async fn test_oversized_inline_buffer_is_rejected() {
        let transport = InprocTransport::new();
        let registry = || {
            let mut registry = BackendRegistry::new();
            registry.register_transport("inproc", 0, transport.clone()).unwrap();
            registry.register_channel("inline", 0, InlineChannelContext::new().with_max_buffer_len(10)).unwrap();
            registry
        };
        let server = test_context("server", registry());
        let listener = server.listen(&["inproc://"]).await.unwrap();
        let client = test_context("client", registry());
        let (pipe, accepted) = connect_pair(&client, &listener, "inproc").await;

        let result = pipe.write(Message::new("x").with_tensor(Tensor::cpu(vec![0u8; 11]))).await;
        assert_eq!(result, Err(PipeError::BufferTooLarge { domain: "cpu".to_string(), length: 11, max: 10 }));

        assert_eq!(pipe.state(), PipeState::Established);
        exchange(&pipe, &accepted, Message::new("y").with_tensor(Tensor::cpu(vec![1u8; 10]))).await;
    }

    fn switching_registry(transport: &InprocTransport, priority_a: i64, priority_b: i64) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry.register_transport("a", priority_a, transport.clone()).unwrap();
        registry.register_transport("b", priority_b, transport.clone()).unwrap();
        registry.register_channel("basic", 0, BasicChannelContext::new()).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_transport_switch() {
        let transport = InprocTransport::new();
        let server = test_context("server", switching_registry(&transport, 0, 100));
        let listener = server.listen(&["a://", "b://"]).await.unwrap();
        let client = test_context("client", switching_registry(&transport, 100, 0));

        let (pipe, accepted) = connect_pair(&client, &listener, "a").await;
        for status in [pipe.status(), accepted.status()] {
            assert_eq!(status.transport.as_deref(), Some("b"));
            assert_eq!(status.connections_required, 2);
            assert_eq!(status.connections_matched, 2);
        }

        exchange(&pipe, &accepted, sample_message()).await;
        exchange(&accepted, &pipe, sample_message()).await;
        assert_eq!(pipe.state(), PipeState::Established);
        assert_eq!(accepted.state(), PipeState::Established);
    }

    #[tokio::test]
    async fn test_no_switch_when_incoming_transport_is_preferred() {
        let transport = InprocTransport::new();
        let server = test_context("server", switching_registry(&transport, 0, 100));
        let listener = server.listen(&["a://", "b://"]).await.unwrap();
        let client = test_context("client", switching_registry(&transport, 100, 0));

        let (pipe, _accepted) = connect_pair(&client, &listener, "b").await;
        assert_eq!(pipe.status().transport.as_deref(), Some("b"));
        assert_eq!(pipe.status().connections_required, 1);
    }

    #[tokio::test]
    async fn test_write_to_domain_that_was_not_negotiated() {
        let transport = InprocTransport::new();
        let (_server, listener, client) = connected_contexts(&transport).await;
        let (pipe, accepted) = connect_pair(&client, &listener, "inproc").await;

        let result = pipe.write(Message::new("x").with_tensor(Tensor::cpu("a")).with_tensor(Tensor::new(Domain::cuda(), "b"))).await;
        assert_eq!(result, Err(PipeError::DomainNotNegotiated("cuda".to_string())));
        assert_eq!(pipe.state(), PipeState::Established);

        exchange(&pipe, &accepted, sample_message()).await;
    }

    #[tokio::test]
    async fn test_no_common_transport() {
        let transport = InprocTransport::new();
        let (_server, listener, _) = connected_contexts(&transport).await;

        let mut registry = BackendRegistry::new();
        registry.register_transport("other", 0, transport.clone()).unwrap();
        registry.register_channel("basic", 0, BasicChannelContext::new()).unwrap();
        let client = test_context("client", registry);

        let pipe = client.connect(&format!("other://{}", listener.address("inproc").unwrap()));
        let error = pipe.wait_established().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Handshake);
        assert_eq!(pipe.state(), PipeState::Error);
        assert_eq!(pipe.write(Message::new("x")).await.unwrap_err().kind(), ErrorKind::Handshake);

        assert!(tokio::time::timeout(Duration::from_millis(100), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_server_fails_without_common_transport() {
        let transport = InprocTransport::new();
        let server = test_context("server", inproc_registry(&transport));
        let raw_listener = transport.listen("").await.unwrap();
        let address = raw_listener.address();
        let (client_side, server_side) = tokio::join!(transport.connect(&address), raw_listener.accept());
        let (client_side, server_side) = (client_side.unwrap(), server_side.unwrap());

        let (finished, mut finished_receiver) = mpsc::unbounded_channel();
        let mut listener = MockListenerPrivateIface::new();
        listener.expect_addresses()
            .return_const(Arc::new([("inproc".to_string(), address.clone())].into_iter().collect::<BTreeMap<_, _>>()));
        listener.expect_handshake_finished()
            .returning(move |pipe_id, established| {
                let _ = finished.send((pipe_id, established));
            });
        let pipe = server.inner().create_server_pipe("inproc".to_string(), server_side, Arc::new(listener));

        let mut registry = BackendRegistry::new();
        registry.register_transport("other", 0, transport.clone()).unwrap();
        registry.register_channel("basic", 0, BasicChannelContext::new()).unwrap();
        let brochure = Brochure::from_registry("client", &registry, |_| true);
        client_side.write_frame(Packet::Brochure(brochure).ser()).await.unwrap();

        let rejection = Packet::deser(&client_side.read_frame().await.unwrap()).unwrap();
        assert!(matches!(rejection, Packet::HandshakeFailure(_)));

        let status = pipe.wait_terminated().await;
        assert_eq!(status.state, PipeState::Error);
        assert_eq!(status.error.map(|e| e.kind()), Some(ErrorKind::Handshake));
        assert_eq!(finished_receiver.recv().await, Some((pipe.id(), false)));
    }

    #[tokio::test]
    async fn test_malformed_brochure() {
        let transport = InprocTransport::new();
        let (_server, listener, client) = connected_contexts(&transport).await;
        let address = listener.address("inproc").unwrap().to_string();

        let raw = transport.connect(&address).await.unwrap();
        raw.write_frame(Hello::Primary.ser()).await.unwrap();
        raw.write_frame(Bytes::from_static(&[0xff, 1, 2])).await.unwrap();
        let rejection = Packet::deser(&raw.read_frame().await.unwrap()).unwrap();
        assert!(matches!(rejection, Packet::HandshakeFailure(_)));
        assert!(raw.read_frame().await.is_err());

        // the listener is not affected
        let (_pipe, accepted) = connect_pair(&client, &listener, "inproc").await;
        assert_eq!(accepted.remote_name().as_deref(), Some("client"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_gives_up_on_missing_connections() {
        let transport = InprocTransport::new();
        let (server, listener, _) = connected_contexts(&transport).await;
        let address = listener.address("inproc").unwrap().to_string();

        let raw = transport.connect(&address).await.unwrap();
        raw.write_frame(Hello::Primary.ser()).await.unwrap();
        let brochure = Brochure::from_registry("raw", &inproc_registry(&transport), |_| true);
        raw.write_frame(Packet::Brochure(brochure).ser()).await.unwrap();

        let Packet::Allowance(allowance) = Packet::deser(&raw.read_frame().await.unwrap()).unwrap() else {
            panic!("expected an allowance");
        };
        assert_eq!(allowance.context_name, "server");
        assert_eq!(allowance.transport_switch, None);
        let request = allowance.channels[&Domain::cpu()].connection.clone().unwrap();
        assert_eq!(request.address, address);

        // an id nobody asked for
        let stray = transport.connect(&address).await.unwrap();
        stray.write_frame(Hello::ConnectionRequest(request.id + 1000).ser()).await.unwrap();
        assert!(stray.read_frame().await.is_err());

        // the server pipe times out and drops the primary connection
        assert!(raw.read_frame().await.is_err());

        // ... and the request is gone
        let late = transport.connect(&address).await.unwrap();
        late.write_frame(Hello::ConnectionRequest(request.id).ser()).await.unwrap();
        assert!(late.read_frame().await.is_err());

        assert!(tokio::time::timeout(Duration::from_secs(60), listener.accept()).await.is_err());
        server.join().await;
    }

    /// Connects the primary connection, but never completes any further connection
    struct StallingTransport {
        inner: InprocTransport,
        connected: AtomicBool,
    }

    #[async_trait]
    impl TransportContext for StallingTransport {
        fn domain_descriptor(&self) -> String {
            self.inner.domain_descriptor()
        }

        async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn Connection>> {
            if self.connected.swap(true, Ordering::AcqRel) {
                std::future::pending::<()>().await;
            }
            self.inner.connect(address).await
        }

        async fn listen(&self, address: &str) -> anyhow::Result<Arc<dyn TransportListener>> {
            self.inner.listen(address).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_gives_up_on_missing_connections() {
        let transport = InprocTransport::new();
        let (_server, listener, _) = connected_contexts(&transport).await;

        let mut registry = BackendRegistry::new();
        registry.register_transport("inproc", 0, StallingTransport { inner: transport.clone(), connected: AtomicBool::new(false) }).unwrap();
        registry.register_channel("basic", 0, BasicChannelContext::new()).unwrap();
        let client = test_context("client", registry);

        let pipe = client.connect(&listener.url("inproc").unwrap());
        let pending_read = pipe.read();

        let error = pipe.wait_established().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(pending_read.await.unwrap_err().kind(), ErrorKind::Timeout);

        let status = pipe.status();
        assert_eq!(status.state, PipeState::Error);
        assert_eq!(status.connections_required, 1);
        assert_eq!(status.connections_matched, 0);
    }

    #[tokio::test]
    async fn test_close() {
        let transport = InprocTransport::new();
        let (_server, listener, client) = connected_contexts(&transport).await;
        let (pipe, accepted) = connect_pair(&client, &listener, "inproc").await;

        let pending_read = pipe.read();
        pipe.close();
        pipe.close();

        assert_eq!(pending_read.await, Err(PipeError::Closed));
        let status = pipe.wait_terminated().await;
        assert_eq!(status.state, PipeState::Closed);
        assert_eq!(status.error, Some(PipeError::Closed));
        assert_eq!(pipe.write(Message::new("x")).await, Err(PipeError::Closed));
        pipe.close();

        let status = accepted.wait_terminated().await;
        assert_eq!(status.state, PipeState::Error);
        assert_eq!(status.error.map(|e| e.kind()), Some(ErrorKind::Transport));
    }

    #[tokio::test]
    async fn test_dropping_all_handles_closes_pipe() {
        let transport = InprocTransport::new();
        let (_server, listener, client) = connected_contexts(&transport).await;
        let (pipe, accepted) = connect_pair(&client, &listener, "inproc").await;

        let clone = pipe.clone();
        drop(pipe);
        exchange(&clone, &accepted, Message::new("still open")).await;
        drop(clone);

        assert_eq!(accepted.read().await.unwrap_err().kind(), ErrorKind::Transport);
    }
}
