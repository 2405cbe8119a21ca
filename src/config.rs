use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Human-readable name of this context. It is sent to peers during the handshake and is
    ///  available there as the pipe's remote name, which is handy for logging.
    pub name: String,

    /// Upper bound for the time a pipe waits for its dedicated auxiliary connections (and for
    ///  the switch of its primary connection) after the capabilities were agreed on. When the
    ///  bound is exceeded, the pipe fails with a timeout and unregisters its pending connection
    ///  requests.
    ///
    /// `None` means waiting until the pipe or its listener is closed.
    pub connection_request_timeout: Option<Duration>,
}

impl ContextConfig {
    pub fn new(name: impl Into<String>) -> ContextConfig {
        ContextConfig {
            name: name.into(),
            connection_request_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_request_timeout == Some(Duration::ZERO) {
            bail!("connection request timeout must not be zero - use None to wait indefinitely");
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig::new("")
    }
}
