//! Signal bus trait

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BusError;
use crate::signal::{Expectation, SignalSnapshot, SignalValue};

/// Transport-agnostic interface to a CAN network at signal level
///
/// A bus node owns the messages it transmits: writing a signal only updates
/// the buffered value, which goes out on the node's own cyclic schedule while
/// the bus is started. Received messages queue in an inbox until they are
/// consumed by [`SignalBus::await_message`] or discarded by
/// [`SignalBus::flush_inbox`].
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Buffer a signal value for cyclic transmission
    fn set_signal(&self, message: &str, signal: &str, value: SignalValue) -> Result<(), BusError>;

    /// Wait for a received message matching `expect`
    ///
    /// Queued messages with a different name, or that do not match, are
    /// consumed and discarded. `timeout = None` waits without bound.
    ///
    /// # Returns
    /// `Ok(None)` if nothing matched before the timeout
    async fn await_message(
        &self,
        message: &str,
        expect: &Expectation,
        timeout: Option<Duration>,
    ) -> Result<Option<SignalSnapshot>, BusError>;

    /// Discard every received message not yet consumed
    async fn flush_inbox(&self);

    /// Start cyclic transmission of owned messages
    async fn start(&self) -> Result<(), BusError>;

    /// Stop cyclic transmission
    async fn stop(&self) -> Result<(), BusError>;

    /// Node name, used for logging
    fn name(&self) -> &str;
}
