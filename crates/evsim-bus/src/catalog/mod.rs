//! Message catalog - the DBC stand-in for the SocketCAN transport
//!
//! A catalog describes every message on a network: CAN id, payload length,
//! transmit cycle, transmitting nodes and signal layouts. Catalogs are loaded
//! from YAML:
//!
//! ```yaml
//! meta:
//!   name: ISC_CME
//!   version: "1.0"
//!
//! messages:
//!   ChargeInfo:
//!     id: "0x600"
//!     cycle_ms: 100
//!     senders: [CME]
//!     signals:
//!       StateMachineState:
//!         start: 0
//!         length: 4
//!         enum:
//!           0: Default
//!           1: Init
//! ```

pub mod codec;
pub mod definition;
pub mod error;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use codec::{decode_frame, encode_frame};
pub use definition::{ByteOrder, MessageDefinition, SignalDefinition};
pub use error::{parse_can_id, CatalogError, CatalogResult};

use crate::signal::SignalSnapshot;

/// Metadata about the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// On-disk catalog layout
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    meta: Option<CatalogMeta>,
    #[serde(default)]
    messages: BTreeMap<String, MessageDefinition>,
}

/// Lookup of message definitions by name and CAN id
#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    meta: CatalogMeta,
    messages: BTreeMap<String, MessageDefinition>,
    /// Reverse index: CAN id -> message name
    id_index: HashMap<u32, String>,
}

impl MessageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load a catalog from a YAML string
    pub fn from_yaml(yaml: &str) -> CatalogResult<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;
        let mut catalog = Self::new();

        if let Some(meta) = file.meta {
            catalog.meta = meta;
        }

        for (name, mut def) in file.messages {
            def.name = name;
            catalog.register(def)?;
        }

        Ok(catalog)
    }

    /// Add a message definition
    ///
    /// Every signal layout is validated against the payload before the
    /// message is accepted.
    pub fn register(&mut self, def: MessageDefinition) -> CatalogResult<()> {
        let id = parse_can_id(&def.id)?;

        if let Some(existing) = self.id_index.get(&id) {
            if existing != &def.name {
                return Err(CatalogError::DuplicateCanId {
                    id,
                    first: existing.clone(),
                    second: def.name.clone(),
                });
            }
        }

        if def.dlc == 0 || def.dlc > 8 {
            return Err(CatalogError::InvalidDlc {
                message: def.name.clone(),
                dlc: def.dlc,
            });
        }

        // An all-zero payload exercises every layout check
        decode_frame(&def, &[0u8; 8])?;

        self.id_index.insert(id, def.name.clone());
        self.messages.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn meta(&self) -> &CatalogMeta {
        &self.meta
    }

    pub fn get(&self, name: &str) -> Option<&MessageDefinition> {
        self.messages.get(name)
    }

    /// Find the message carried by a CAN id
    pub fn by_id(&self, id: u32) -> Option<&MessageDefinition> {
        self.id_index.get(&id).and_then(|name| self.messages.get(name))
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.values()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Decode a received frame
    pub fn decode(&self, id: u32, data: &[u8]) -> CatalogResult<(&MessageDefinition, SignalSnapshot)> {
        let def = self.by_id(id).ok_or(CatalogError::UnknownCanId(id))?;
        Ok((def, decode_frame(def, data)?))
    }

    /// Encode a message by name
    pub fn encode(&self, name: &str, snapshot: &SignalSnapshot) -> CatalogResult<Vec<u8>> {
        let def = self
            .get(name)
            .ok_or_else(|| CatalogError::UnknownMessage(name.to_string()))?;
        encode_frame(def, snapshot)
    }
}
