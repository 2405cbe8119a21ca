pub(crate) mod connection_requests;
pub mod context;
pub mod listener;
pub mod message;
pub(crate) mod negotiation;
#[allow(clippy::module_inception)]
pub mod pipe;
pub(crate) mod protocol;
pub mod registry;
pub mod state;
pub mod url;
