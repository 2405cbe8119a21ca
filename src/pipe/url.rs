use crate::error::{PipeError, PipeResult};

/// Splits `transport://address` into its parts. The address may be empty, its meaning is up to
///  the transport.
pub fn parse_url(url: &str) -> PipeResult<(&str, &str)> {
    match url.split_once("://") {
        Some((transport, address)) if !transport.is_empty() => Ok((transport, address)),
        _ => Err(PipeError::InvalidUrl(url.to_string())),
    }
}

pub fn make_url(transport: &str, address: &str) -> String {
    format!("{}://{}", transport, address)
}
