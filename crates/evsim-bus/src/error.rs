//! Signal bus errors

use thiserror::Error;

use crate::catalog::CatalogError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Unknown signal: {message}.{signal}")]
    UnknownSignal { message: String, signal: String },

    #[error("Message {0} is received from the device under test and cannot be written")]
    NotWritable(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CatalogError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Bus medium closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
