//! evsim-bus - Named-signal bus for CAN restbus simulation
//!
//! This crate provides the signal-level view of a CAN network that the
//! charge session drivers are written against: messages are addressed by
//! name, signals by name within a message, and values are physical numbers,
//! enumeration labels, or the "not available" sentinel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SignalBus                              │
//! │  set_signal / await_message / flush_inbox / start / stop    │
//! │                                                             │
//! │  ┌─────────────────────┐      ┌──────────────────────────┐  │
//! │  │ MemoryBus           │      │ CanSignalBus             │  │
//! │  │ (VirtualCan medium) │      │ (SocketCAN + catalog)    │  │
//! │  └─────────────────────┘      └────────────┬─────────────┘  │
//! │                                            │                │
//! │                                  ┌─────────┴─────────┐      │
//! │                                  │ MessageCatalog    │      │
//! │                                  │ (bit layout codec)│      │
//! │                                  └───────────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod catalog;
pub mod error;
pub mod memory;
pub mod signal;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use bus::SignalBus;
pub use catalog::{CatalogError, MessageCatalog, MessageDefinition, SignalDefinition};
pub use error::BusError;
pub use memory::{MemoryBus, VirtualCan};
pub use signal::{Expectation, SignalSnapshot, SignalValue};

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use socketcan::CanSignalBus;
