//! In-memory CAN medium for hardware-free simulation
//!
//! [`VirtualCan`] is the shared medium; every [`MemoryBus`] node created from
//! it sees the frames of all other nodes, never its own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error as broadcast_error};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bus::SignalBus;
use crate::error::BusError;
use crate::signal::{Expectation, SignalSnapshot, SignalValue};

/// Default transmit cycle of owned messages
pub const DEFAULT_CYCLE: Duration = Duration::from_millis(100);

const MEDIUM_CAPACITY: usize = 1024;

/// A decoded frame travelling on the virtual medium
#[derive(Debug, Clone)]
pub struct BusFrame {
    /// Transmitting node
    pub sender: String,
    /// Message name
    pub message: String,
    /// Signal values carried by the frame
    pub signals: SignalSnapshot,
}

/// Shared virtual CAN medium
#[derive(Debug, Clone)]
pub struct VirtualCan {
    tx: broadcast::Sender<BusFrame>,
    cycle: Duration,
}

impl Default for VirtualCan {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualCan {
    pub fn new() -> Self {
        Self::with_cycle(DEFAULT_CYCLE)
    }

    /// Create a medium whose nodes transmit every `cycle`
    pub fn with_cycle(cycle: Duration) -> Self {
        let (tx, _) = broadcast::channel(MEDIUM_CAPACITY);
        Self { tx, cycle }
    }

    /// Attach a new node to the medium
    pub fn node(&self, name: impl Into<String>) -> MemoryBus {
        MemoryBus {
            name: name.into(),
            medium: self.tx.clone(),
            cycle: self.cycle,
            outbox: Arc::new(RwLock::new(BTreeMap::new())),
            inbox: tokio::sync::Mutex::new(self.tx.subscribe()),
            tx_handle: Mutex::new(None),
        }
    }

    /// Passive listener seeing every frame on the medium
    pub fn monitor(&self) -> broadcast::Receiver<BusFrame> {
        self.tx.subscribe()
    }
}

/// A node on a [`VirtualCan`] medium
pub struct MemoryBus {
    name: String,
    medium: broadcast::Sender<BusFrame>,
    cycle: Duration,
    /// Owned messages and their current signal values
    outbox: Arc<RwLock<BTreeMap<String, SignalSnapshot>>>,
    inbox: tokio::sync::Mutex<broadcast::Receiver<BusFrame>>,
    tx_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBus {
    /// Current buffered values of an owned message
    pub fn transmitted(&self, message: &str) -> Option<SignalSnapshot> {
        self.outbox.read().get(message).cloned()
    }

    /// Current buffered value of a single owned signal
    pub fn transmitted_signal(&self, message: &str, signal: &str) -> Option<SignalValue> {
        self.outbox
            .read()
            .get(message)
            .and_then(|snapshot| snapshot.get(signal).cloned())
    }

    pub fn is_started(&self) -> bool {
        self.tx_handle.lock().is_some()
    }

    fn transmit_all(
        name: &str,
        medium: &broadcast::Sender<BusFrame>,
        outbox: &RwLock<BTreeMap<String, SignalSnapshot>>,
    ) {
        let messages: Vec<(String, SignalSnapshot)> = outbox
            .read()
            .iter()
            .map(|(message, signals)| (message.clone(), signals.clone()))
            .collect();

        for (message, signals) in messages {
            trace!(node = %name, message = %message, "Cyclic transmit");
            // No receivers is fine, the medium may be idle
            let _ = medium.send(BusFrame {
                sender: name.to_string(),
                message,
                signals,
            });
        }
    }
}

#[async_trait]
impl SignalBus for MemoryBus {
    fn set_signal(&self, message: &str, signal: &str, value: SignalValue) -> Result<(), BusError> {
        self.outbox
            .write()
            .entry(message.to_string())
            .or_default()
            .insert(signal, value);
        Ok(())
    }

    async fn await_message(
        &self,
        message: &str,
        expect: &Expectation,
        timeout: Option<Duration>,
    ) -> Result<Option<SignalSnapshot>, BusError> {
        let mut inbox = self.inbox.lock().await;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, inbox.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Ok(None),
                },
                None => inbox.recv().await,
            };

            match received {
                Ok(frame) => {
                    if frame.sender == self.name || frame.message != message {
                        continue;
                    }
                    if expect.matches(&frame.signals) {
                        return Ok(Some(frame.signals));
                    }
                }
                Err(broadcast_error::RecvError::Lagged(skipped)) => {
                    debug!(node = %self.name, skipped, "Inbox lagged, oldest frames dropped");
                    continue;
                }
                Err(broadcast_error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    async fn flush_inbox(&self) {
        let mut inbox = self.inbox.lock().await;
        loop {
            match inbox.try_recv() {
                Ok(_) | Err(broadcast_error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast_error::TryRecvError::Empty)
                | Err(broadcast_error::TryRecvError::Closed) => break,
            }
        }
    }

    async fn start(&self) -> Result<(), BusError> {
        let mut handle = self.tx_handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let name = self.name.clone();
        let medium = self.medium.clone();
        let outbox = self.outbox.clone();
        let cycle = self.cycle;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cycle);
            loop {
                ticker.tick().await;
                Self::transmit_all(&name, &medium, &outbox);
            }
        }));

        debug!(node = %self.name, cycle_ms = cycle.as_millis() as u64, "Cyclic transmission started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        if let Some(handle) = self.tx_handle.lock().take() {
            handle.abort();
            debug!(node = %self.name, "Cyclic transmission stopped");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        if let Some(handle) = self.tx_handle.get_mut().take() {
            handle.abort();
        }
    }
}
