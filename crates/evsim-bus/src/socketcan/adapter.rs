//! Restbus simulation over a raw SocketCAN socket
//!
//! Every catalog message that the device under test does not send is owned
//! by this node and transmitted on its own cycle once the bus is started.
//! Frames sent by the device are decoded through the catalog and queued for
//! [`SignalBus::await_message`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use tokio::sync::broadcast::{self, error as broadcast_error};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::bus::SignalBus;
use crate::catalog::{codec, parse_can_id, MessageCatalog, MessageDefinition};
use crate::error::BusError;
use crate::signal::{Expectation, SignalSnapshot, SignalValue};

/// A raw frame read from the interface
#[derive(Debug, Clone)]
struct RawFrame {
    id: u32,
    data: Vec<u8>,
}

/// Signal bus bound to a CAN interface and a message catalog
pub struct CanSignalBus {
    name: String,
    dut_node: String,
    catalog: Arc<MessageCatalog>,
    socket: Arc<Mutex<CanSocket>>,
    outbox: Arc<RwLock<BTreeMap<String, SignalSnapshot>>>,
    incoming_tx: broadcast::Sender<RawFrame>,
    inbox: tokio::sync::Mutex<broadcast::Receiver<RawFrame>>,
    listening: Arc<AtomicBool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
    tx_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CanSignalBus {
    /// Open `interface` and simulate every node except `dut_node`
    pub fn open(
        interface: &str,
        catalog: MessageCatalog,
        dut_node: impl Into<String>,
    ) -> Result<Self, BusError> {
        let dut_node = dut_node.into();

        let socket = CanSocket::open(interface).map_err(|e| {
            BusError::ConnectionFailed(format!("Failed to open CAN socket on {}: {}", interface, e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| BusError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        Self::drain_socket(&socket);

        // Owned messages start out with every signal at raw zero
        let outbox: BTreeMap<String, SignalSnapshot> = catalog
            .messages()
            .filter(|def| !def.is_sent_by(&dut_node))
            .map(|def| (def.name.clone(), SignalSnapshot::new()))
            .collect();

        info!(
            interface = %interface,
            dut = %dut_node,
            owned = outbox.len(),
            received = catalog.len() - outbox.len(),
            "CAN signal bus opened"
        );

        let (incoming_tx, inbox) = broadcast::channel(1024);

        let bus = Self {
            name: format!("{}:{}", interface, dut_node),
            dut_node,
            catalog: Arc::new(catalog),
            socket: Arc::new(Mutex::new(socket)),
            outbox: Arc::new(RwLock::new(outbox)),
            incoming_tx,
            inbox: tokio::sync::Mutex::new(inbox),
            listening: Arc::new(AtomicBool::new(true)),
            listener_handle: Mutex::new(None),
            tx_handles: Mutex::new(Vec::new()),
        };

        bus.start_listener();
        Ok(bus)
    }

    /// Drop frames that were queued before the bus was opened
    fn drain_socket(socket: &CanSocket) {
        while let Ok(frame) = socket.read_frame() {
            trace!(id = format!("0x{:X}", frame.raw_id()), "Drained stale frame");
        }
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let incoming_tx = self.incoming_tx.clone();
        let listening = self.listening.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while listening.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(frame) => {
                        trace!(
                            id = format!("0x{:X}", frame.raw_id()),
                            data = %hex::encode(frame.data()),
                            "Frame received"
                        );
                        // No receivers is fine, nobody may be waiting yet
                        let _ = incoming_tx.send(RawFrame {
                            id: frame.raw_id(),
                            data: frame.data().to_vec(),
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!(?e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!("SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }

    /// Look up a message this node is allowed to write
    fn owned_message(&self, message: &str) -> Result<&MessageDefinition, BusError> {
        let def = self
            .catalog
            .get(message)
            .ok_or_else(|| BusError::UnknownMessage(message.to_string()))?;
        if def.is_sent_by(&self.dut_node) {
            return Err(BusError::NotWritable(message.to_string()));
        }
        Ok(def)
    }

    /// Encode and write one owned message
    fn transmit(
        socket: &Mutex<CanSocket>,
        def: &MessageDefinition,
        signals: &SignalSnapshot,
    ) -> Result<(), BusError> {
        let data = codec::encode_frame(def, signals)?;
        let frame = build_frame(def, &data)?;

        trace!(message = %def.name, data = %hex::encode(&data), "Cyclic transmit");
        socket
            .lock()
            .write_frame(&frame)
            .map_err(|e| BusError::SendFailed(format!("{}: {}", def.name, e)))
    }
}

/// Build a CAN frame for `def` carrying `data`
fn build_frame(def: &MessageDefinition, data: &[u8]) -> Result<CanFrame, BusError> {
    let id = parse_can_id(&def.id)?;

    let frame = if def.extended {
        let id = ExtendedId::new(id).ok_or_else(|| {
            BusError::InvalidConfig(format!("Invalid extended CAN ID: 0x{:X}", id))
        })?;
        CanFrame::new(id, data)
    } else {
        let id = u16::try_from(id)
            .ok()
            .and_then(StandardId::new)
            .ok_or_else(|| BusError::InvalidConfig(format!("Invalid standard CAN ID: 0x{:X}", id)))?;
        CanFrame::new(id, data)
    };

    frame.ok_or_else(|| {
        BusError::InvalidConfig(format!(
            "{}: payload of {} bytes does not fit a CAN frame",
            def.name,
            data.len()
        ))
    })
}

#[async_trait]
impl SignalBus for CanSignalBus {
    fn set_signal(&self, message: &str, signal: &str, value: SignalValue) -> Result<(), BusError> {
        let def = self.owned_message(message)?;
        let sig = def.signals.get(signal).ok_or_else(|| BusError::UnknownSignal {
            message: message.to_string(),
            signal: signal.to_string(),
        })?;

        // Reject values the codec cannot represent before they reach the cyclic task
        codec::encode_signal(signal, sig, &value)?;

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
        let def = self
            .catalog
            .get(message)
            .ok_or_else(|| BusError::UnknownMessage(message.to_string()))?;
        let id = parse_can_id(&def.id)?;

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
                Ok(frame) if frame.id == id => match codec::decode_frame(def, &frame.data) {
                    Ok(signals) if expect.matches(&signals) => return Ok(Some(signals)),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(message = %message, error = %e, "Dropping undecodable frame");
                    }
                },
                Ok(_) => continue,
                Err(broadcast_error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Inbox lagged, oldest frames dropped");
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
        let mut handles = self.tx_handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }

        for def in self.catalog.messages() {
            if def.is_sent_by(&self.dut_node) {
                continue;
            }

            let def = def.clone();
            let socket = self.socket.clone();
            let outbox = self.outbox.clone();
            let cycle = Duration::from_millis(def.cycle_ms.max(1));

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cycle);
                loop {
                    ticker.tick().await;
                    let signals = outbox.read().get(&def.name).cloned().unwrap_or_default();
                    if let Err(e) = Self::transmit(&socket, &def, &signals) {
                        warn!(message = %def.name, error = %e, "Cyclic transmit failed");
                    }
                }
            }));
        }

        info!(bus = %self.name, messages = handles.len(), "Cyclic transmission started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        let handles: Vec<_> = self.tx_handles.lock().drain(..).collect();
        if !handles.is_empty() {
            for handle in handles {
                handle.abort();
            }
            info!(bus = %self.name, "Cyclic transmission stopped");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CanSignalBus {
    fn drop(&mut self) {
        self.listening.store(false, Ordering::SeqCst);
        for handle in self.tx_handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}
