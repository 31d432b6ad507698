//! evsim-charge - DC charge session restbus driver
//!
//! [`ChargeSessionDriver`] simulates the charge station side of a DC fast
//! charging session around a charge controller, talking to it only through
//! named signals on a [`SignalBus`](evsim_bus::SignalBus).
//! [`ControllerSimulator`] plays the controller for hardware-free runs.
//!
//! # Example
//!
//! ```ignore
//! use evsim_bus::VirtualCan;
//! use evsim_charge::{ChargeSessionDriver, ControllerSimulator, DriverConfig, SimulatorConfig};
//!
//! let can = VirtualCan::new();
//! let station = can.node("EVSE");
//! let controller = can.node("CME");
//!
//! tokio::spawn(async move {
//!     ControllerSimulator::new(SimulatorConfig::default())
//!         .run(&controller, &|| true)
//!         .await
//! });
//!
//! let driver = ChargeSessionDriver::new(DriverConfig::default());
//! driver.run_session(&station, &|| true, None).await?;
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod signals;
pub mod simulator;
pub mod state;

pub use config::{ChargeLimits, DriverConfig, SessionTimings};
pub use driver::{ramp_voltage, ChargeSessionDriver, ChargeTargets, EvMaxLimits, SessionOutcome};
pub use error::{ConfigError, SessionError, SessionResult};
pub use events::SessionEvent;
pub use simulator::{ControllerSimulator, SimulatorConfig};
pub use state::{Phase, PilotState, ProximityState, SessionState};
