use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{PipeError, PipeResult};
use crate::transport::Connection;

/// An accepted connection: the name of the transport it arrived on, and the connection itself
pub(crate) type IncomingConnection = (String, Arc<dyn Connection>);

/// Invoked exactly once, with the connection that announced the request's id, or with the
///  error that ended the wait
pub(crate) type ConnectionRequestCallback = Box<dyn FnOnce(u64, PipeResult<IncomingConnection>) + Send>;

/// Routes auxiliary connections to whoever asked for them. Ids are handed out in increasing
///  order and never reused during the registry's lifetime.
pub(crate) struct ConnectionRequestRegistry {
    next_id: u64,
    pending: FxHashMap<u64, ConnectionRequestCallback>,
    closed: bool,
}

impl ConnectionRequestRegistry {
    pub fn new() -> ConnectionRequestRegistry {
        ConnectionRequestRegistry {
            next_id: 0,
            pending: Default::default(),
            closed: false,
        }
    }

    /// After [ConnectionRequestRegistry::close], the callback is failed right away. It still
    ///  gets a fresh id, which will never match.
    pub fn register(&mut self, callback: ConnectionRequestCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        if self.closed {
            callback(id, Err(PipeError::Closed));
        }
        else {
            trace!("registered connection request {}", id);
            self.pending.insert(id, callback);
        }
        id
    }

    pub fn unregister(&mut self, id: u64) {
        if self.pending.remove(&id).is_some() {
            trace!("unregistered connection request {}", id);
        }
    }

    pub fn match_connection(&mut self, id: u64, transport: &str, connection: Arc<dyn Connection>) -> bool {
        match self.pending.remove(&id) {
            Some(callback) => {
                trace!("matched connection request {} on transport {}", id, transport);
                callback(id, Ok((transport.to_string(), connection)));
                true
            }
            None => false,
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
        for (id, callback) in self.pending.drain() {
            callback(id, Err(PipeError::Closed));
        }
    }

    #[cfg(test)]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }
}
