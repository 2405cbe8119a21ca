use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ContextConfig;
use crate::error::{PipeError, PipeResult};
use crate::pipe::listener::{Listener, ListenerCloser, ListenerPrivateIface};
use crate::pipe::pipe::{Pipe, PipeCloser};
use crate::pipe::registry::BackendRegistry;
use crate::transport::Connection;

/// Proof that a listener or pipe is being created through the context. Only this module can
///  create one.
pub(crate) struct ConstructorToken(());

#[derive(Default)]
struct Tracked {
    listeners: Vec<ListenerCloser>,
    pipes: Vec<PipeCloser>,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct ContextInner {
    pub config: ContextConfig,
    pub registry: BackendRegistry,
    runtime: Handle,
    next_pipe_id: AtomicU64,
    closed: AtomicBool,
    tracked: Mutex<Tracked>,
}

impl ContextInner {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn next_pipe_id(&self) -> u64 {
        self.next_pipe_id.fetch_add(1, Ordering::Relaxed)
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `future` on the context's runtime; [Context::join] waits for it
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        let handle = self.runtime.spawn(future);
        let mut tracked = self.tracked();
        tracked.tasks.retain(|t| !t.is_finished());
        tracked.tasks.push(handle);
    }

    fn track_pipe(&self, pipe: &Pipe) {
        let mut tracked = self.tracked();
        tracked.pipes.retain(|p| p.is_alive());
        tracked.pipes.push(pipe.closer());
    }

    pub fn create_server_pipe(self: &Arc<Self>, transport: String, connection: Arc<dyn Connection>, listener: Arc<dyn ListenerPrivateIface>) -> Pipe {
        let pipe = Pipe::new_server(ConstructorToken(()), self.clone(), transport, connection, listener);
        self.track_pipe(&pipe);
        pipe
    }
}

/// Entry point of the library: owns the backends and creates listeners and client pipes. All
///  background work of its pipes and listeners runs on the tokio runtime the context was
///  created with.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Uses the runtime of the calling task
    pub fn new(config: ContextConfig, registry: BackendRegistry) -> anyhow::Result<Context> {
        let runtime = Handle::try_current()?;
        Context::with_runtime(runtime, config, registry)
    }

    pub fn with_runtime(runtime: Handle, config: ContextConfig, registry: BackendRegistry) -> anyhow::Result<Context> {
        config.validate()?;
        debug!("creating context {:?}", config.name);

        Ok(Context {
            inner: Arc::new(ContextInner {
                config,
                registry,
                runtime,
                next_pipe_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                tracked: Default::default(),
            })
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.inner.registry
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    /// Starts a client pipe to `url` (`transport://address`). This never fails right away:
    ///  problems, including an invalid url, show up as the pipe's error.
    pub fn connect(&self, url: &str) -> Pipe {
        let pipe = Pipe::new_client(ConstructorToken(()), self.inner.clone(), url);
        self.inner.track_pipe(&pipe);
        pipe
    }

    /// Binds a listener to each of `urls`, at most one per transport. An empty address lets
    ///  the transport pick one, see [Listener::addresses] for the result.
    pub async fn listen(&self, urls: &[&str]) -> PipeResult<Listener> {
        if self.inner.is_closed() {
            return Err(PipeError::Closed);
        }
        let listener = Listener::new(ConstructorToken(()), self.inner.clone(), urls).await?;

        let mut tracked = self.inner.tracked();
        tracked.listeners.retain(|l| l.is_alive());
        tracked.listeners.push(listener.closer());
        Ok(listener)
    }

    /// Closes all listeners, then all pipes. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing context {:?}", self.inner.name());

        let (listeners, pipes) = {
            let mut tracked = self.inner.tracked();
            (std::mem::take(&mut tracked.listeners), std::mem::take(&mut tracked.pipes))
        };
        for listener in listeners {
            listener.close();
        }
        for pipe in pipes {
            pipe.close();
        }
    }

    /// Closes the context and waits until the tasks of its pipes and listeners have finished,
    ///  including the tasks serving their connections. Tasks that a channel backend starts on
    ///  its own are not covered.
    pub async fn join(&self) {
        self.close();
        loop {
            let tasks = std::mem::take(&mut self.inner.tracked().tasks);
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
        debug!("context {:?} joined", self.inner.name());
    }
}
