//! Error types for the message catalog and frame codec

use thiserror::Error;

/// Errors that can occur while loading a catalog or converting frames
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Message name not defined
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// CAN id not defined
    #[error("unknown CAN id: 0x{0:X}")]
    UnknownCanId(u32),

    /// CAN id string could not be parsed
    #[error("invalid CAN id '{0}'")]
    InvalidCanId(String),

    /// Two messages share a CAN id
    #[error("duplicate CAN id 0x{id:X} ({first} and {second})")]
    DuplicateCanId {
        id: u32,
        first: String,
        second: String,
    },

    /// Signal does not fit the frame
    #[error("invalid layout for {message}.{signal}: {detail}")]
    InvalidLayout {
        message: String,
        signal: String,
        detail: String,
    },

    /// Received payload shorter than the message's DLC
    #[error("frame for {message} has {actual} bytes, expected {expected}")]
    FrameTooShort {
        message: String,
        expected: usize,
        actual: usize,
    },

    /// DLC beyond a classic CAN frame
    #[error("invalid DLC {dlc} for {message}")]
    InvalidDlc { message: String, dlc: u8 },

    /// Label not present in the signal's value table
    #[error("unknown label '{label}' for signal {signal}")]
    UnknownLabel { signal: String, label: String },

    /// Physical value outside the encodable range
    #[error("value out of range for {signal}: {value} not in [{min}, {max}]")]
    ValueOutOfRange {
        signal: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Parse a CAN id string
///
/// Accepts formats: "0x6A0", "0X6A0", "1696"
pub fn parse_can_id(s: &str) -> CatalogResult<u32> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|_| CatalogError::InvalidCanId(s.to_string()))
}
