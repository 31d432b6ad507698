//! Message and signal definitions
//!
//! Represents the layout of a CAN message: identifier, length, cycle time,
//! transmitting nodes, and the bit position and scaling of every signal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Bit numbering of a signal inside the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel: start bit is the least significant bit
    #[default]
    LittleEndian,
    /// Motorola: start bit is the most significant bit
    BigEndian,
}

/// Complete definition of one CAN message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDefinition {
    /// Message name (set from the catalog key)
    #[serde(skip)]
    pub name: String,

    /// CAN identifier in hex ("0x6A0") or decimal
    pub id: String,

    /// 29-bit identifier
    #[serde(default)]
    pub extended: bool,

    /// Payload length in bytes
    #[serde(default = "default_dlc")]
    pub dlc: u8,

    /// Transmit cycle in milliseconds
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,

    /// Nodes that transmit this message
    #[serde(default)]
    pub senders: Vec<String>,

    /// Signals keyed by name
    #[serde(default)]
    pub signals: BTreeMap<String, SignalDefinition>,
}

fn default_dlc() -> u8 {
    8
}

fn default_cycle_ms() -> u64 {
    100
}

impl MessageDefinition {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id: format!("0x{:X}", id),
            extended: false,
            dlc: default_dlc(),
            cycle_ms: default_cycle_ms(),
            senders: Vec::new(),
            signals: BTreeMap::new(),
        }
    }

    pub fn with_signal(mut self, name: impl Into<String>, signal: SignalDefinition) -> Self {
        self.signals.insert(name.into(), signal);
        self
    }

    /// Whether `node` transmits this message
    pub fn is_sent_by(&self, node: &str) -> bool {
        self.senders.iter().any(|s| s == node)
    }
}

/// Layout and scaling of a single signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDefinition {
    /// Start bit (DBC numbering)
    #[serde(rename = "start")]
    pub start_bit: u16,

    /// Length in bits
    pub length: u16,

    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Raw value is two's complement
    #[serde(default)]
    pub signed: bool,

    /// Scale factor: physical = raw * scale + offset
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Offset: physical = raw * scale + offset
    #[serde(default)]
    pub offset: f64,

    /// Minimum physical value accepted for encoding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Maximum physical value accepted for encoding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Value table (raw -> label)
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_map: Option<BTreeMap<u64, String>>,

    /// Raw value meaning "signal not available"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sna: Option<u64>,
}

fn default_scale() -> f64 {
    1.0
}

impl SignalDefinition {
    /// Unscaled little-endian signal
    pub fn new(start_bit: u16, length: u16) -> Self {
        Self {
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            unit: None,
            enum_map: None,
            sna: None,
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.byte_order = ByteOrder::BigEndian;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_sna(mut self, raw: u64) -> Self {
        self.sna = Some(raw);
        self
    }

    /// Add a value table entry
    pub fn with_label(mut self, raw: u64, label: impl Into<String>) -> Self {
        self.enum_map
            .get_or_insert_with(BTreeMap::new)
            .insert(raw, label.into());
        self
    }

    /// Mask covering `length` bits
    pub fn mask(&self) -> u64 {
        if self.length >= 64 {
            u64::MAX
        } else {
            (1u64 << self.length) - 1
        }
    }

    /// Raw value for a value table label
    pub fn raw_for_label(&self, label: &str) -> Option<u64> {
        self.enum_map
            .as_ref()?
            .iter()
            .find(|(_, l)| l.as_str() == label)
            .map(|(raw, _)| *raw)
    }
}
