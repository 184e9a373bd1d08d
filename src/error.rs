//! Gateway-layer error taxonomy
//!
//! Everything here is recoverable: connect/send errors drive the
//! reconnect loop, parse errors drop the offending payload. Fatal
//! conditions exist only in startup config validation.

use thiserror::Error;

/// Errors from the gateway connection layer
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Initial handshake failed or timed out
    #[error("gateway connect failed: {0}")]
    Connect(String),

    /// Outbound action could not be transmitted (connection down)
    #[error("gateway send failed: {0}")]
    Send(String),

    /// Inbound payload did not match the expected event schema
    #[error("malformed gateway payload: {0}")]
    Parse(String),
}
