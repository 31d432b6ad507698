//! SocketCAN signal bus (Linux only)

mod adapter;

pub use adapter::CanSignalBus;
