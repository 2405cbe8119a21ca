pub mod channel;
pub mod config;
pub mod error;
pub mod pipe;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::ContextConfig;
pub use error::{ErrorKind, PipeError, PipeResult};
pub use pipe::context::Context;
pub use pipe::listener::Listener;
pub use pipe::message::{Domain, Message, Tensor};
pub use pipe::pipe::Pipe;
pub use pipe::registry::{Backend, BackendCategory, BackendDescriptor, BackendRegistry};
pub use pipe::state::{PipeState, PipeStatus};


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
