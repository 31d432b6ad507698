//! Charge controller simulator
//!
//! Plays the controller under test, and the vehicle behind it, on a virtual
//! bus so the station driver can run without hardware. The simulator reports
//! `ChargeInfo` on every cycle and advances its state machine when the
//! station answers:
//!
//! | State | Leaves when |
//! |---|---|
//! | Default | plug-in delay elapsed (pilot B) |
//! | Init | state delay elapsed |
//! | Authentication | `EVSEProcessingCA = Finished` |
//! | Parameter | `EVSEProcessingCPD = Finished` |
//! | Isolation | `EVSEIsolationStatus = Valid` and `EVSEProcessingCC = Finished` |
//! | PreCharge | present voltage within tolerance of the pre-charge voltage |
//! | Charge | charge duration elapsed |
//! | StopCharge | unplug delay elapsed (pilot A) |

use std::time::Duration;

use evsim_bus::{BusError, Expectation, SignalBus, SignalValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::signals::{charge_info, ev_charge_targets, ev_max_limits, evse_status, labels};
use crate::state::{PilotState, SessionState};

/// Behaviour of the simulated controller and vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Time between unplugged and pilot B
    pub plug_in_delay_ms: u64,
    /// Dwell in states that advance on their own
    pub state_delay_ms: u64,
    /// Wait for each station answer before giving up on the cycle
    pub response_timeout_ms: u64,
    pub ev_max_voltage: f64,
    pub ev_max_power: f64,
    pub ev_max_current: f64,
    pub precharge_voltage: f64,
    pub target_current: f64,
    pub target_voltage: f64,
    /// Accepted deviation of the station's present voltage at the end of PreCharge
    pub voltage_tolerance: f64,
    pub charge_duration_ms: u64,
    /// Time between StopCharge and unplug
    pub unplug_delay_ms: u64,
    /// Never leave this state
    pub stall_at: Option<SessionState>,
    /// Number of leading sessions that stall
    pub stall_sessions: u32,
    /// Time spent stalled before the vehicle is unplugged
    pub stall_hold_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            plug_in_delay_ms: 2_000,
            state_delay_ms: 500,
            response_timeout_ms: 60_000,
            ev_max_voltage: 500.0,
            ev_max_power: 150_000.0,
            ev_max_current: 350.0,
            precharge_voltage: 400.0,
            target_current: 100.0,
            target_voltage: 400.0,
            voltage_tolerance: 20.0,
            charge_duration_ms: 5_000,
            unplug_delay_ms: 2_000,
            stall_at: None,
            stall_sessions: 1,
            stall_hold_ms: 30_000,
        }
    }
}

#[derive(Debug, Error)]
enum CycleError {
    #[error("{0}")]
    Aborted(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Reactive counterpart of the station driver
pub struct ControllerSimulator {
    config: SimulatorConfig,
}

impl ControllerSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    /// Run plug-in cycles until `should_continue` returns false
    ///
    /// Returns the number of cycles started.
    pub async fn run<F>(&self, bus: &dyn SignalBus, should_continue: &F) -> Result<u32, BusError>
    where
        F: Fn() -> bool + Sync,
    {
        self.reset(bus)?;
        self.publish_ev_limits(bus)?;
        bus.start().await?;

        let mut cycles = 0;
        while should_continue() {
            cycles += 1;
            let stall = self
                .config
                .stall_at
                .filter(|_| cycles <= self.config.stall_sessions);

            match self.cycle(bus, stall).await {
                Ok(()) => debug!(cycle = cycles, "Simulated charge cycle finished"),
                Err(CycleError::Aborted(reason)) => {
                    warn!(cycle = cycles, reason = %reason, "Simulated charge cycle aborted");
                }
                Err(CycleError::Bus(e)) => {
                    let _ = bus.stop().await;
                    return Err(e);
                }
            }

            info!("Vehicle unplugged");
            self.reset(bus)?;
        }

        bus.stop().await?;
        Ok(cycles)
    }

    async fn cycle(&self, bus: &dyn SignalBus, stall: Option<SessionState>) -> Result<(), CycleError> {
        sleep_ms(self.config.plug_in_delay_ms).await;
        info!("Vehicle plugged in");
        self.report(bus, SessionState::Idle, PilotState::B)?;
        self.dwell(SessionState::Idle, stall).await?;

        sleep_ms(self.config.state_delay_ms).await;
        self.report(bus, SessionState::Init, PilotState::B)?;
        self.dwell(SessionState::Init, stall).await?;

        sleep_ms(self.config.state_delay_ms).await;
        self.report(bus, SessionState::Authentication, PilotState::B)?;
        self.dwell(SessionState::Authentication, stall).await?;
        self.await_station(
            bus,
            Expectation::signal(evse_status::PROCESSING_CA, labels::FINISHED),
        )
        .await?;

        self.report(bus, SessionState::Parameter, PilotState::B)?;
        self.dwell(SessionState::Parameter, stall).await?;
        self.await_station(
            bus,
            Expectation::signal(evse_status::PROCESSING_CPD, labels::FINISHED),
        )
        .await?;

        self.report(bus, SessionState::Isolation, PilotState::C)?;
        self.dwell(SessionState::Isolation, stall).await?;
        self.await_station(
            bus,
            Expectation::signal(evse_status::ISOLATION_STATUS, labels::VALID)
                .and(evse_status::PROCESSING_CC, labels::FINISHED),
        )
        .await?;

        bus.set_signal(
            ev_charge_targets::MESSAGE,
            ev_charge_targets::PRECHARGE_VOLTAGE,
            self.config.precharge_voltage.into(),
        )?;
        self.report(bus, SessionState::PreCharge, PilotState::C)?;
        self.dwell(SessionState::PreCharge, stall).await?;
        self.await_precharged(bus).await?;

        bus.set_signal(
            ev_charge_targets::MESSAGE,
            ev_charge_targets::TARGET_CURRENT,
            self.config.target_current.into(),
        )?;
        bus.set_signal(
            ev_charge_targets::MESSAGE,
            ev_charge_targets::TARGET_VOLTAGE,
            self.config.target_voltage.into(),
        )?;
        self.report(bus, SessionState::Charge, PilotState::C)?;
        self.dwell(SessionState::Charge, stall).await?;
        sleep_ms(self.config.charge_duration_ms).await;

        self.report(bus, SessionState::StopCharge, PilotState::B)?;
        self.dwell(SessionState::StopCharge, stall).await?;
        sleep_ms(self.config.unplug_delay_ms).await;
        Ok(())
    }

    /// Hold `state` for the stall time if the cycle is meant to stall there
    async fn dwell(&self, state: SessionState, stall: Option<SessionState>) -> Result<(), CycleError> {
        info!(state = %state, "Controller state");
        if stall == Some(state) {
            warn!(state = %state, "Stalling");
            sleep_ms(self.config.stall_hold_ms).await;
            return Err(CycleError::Aborted(format!("stalled in {}", state)));
        }
        Ok(())
    }

    /// Flush, then wait for the station status to match `expect`
    async fn await_station(&self, bus: &dyn SignalBus, expect: Expectation) -> Result<(), CycleError> {
        bus.flush_inbox().await;
        bus.await_message(
            evse_status::MESSAGE,
            &expect,
            Some(Duration::from_millis(self.config.response_timeout_ms)),
        )
        .await?
        .map(|_| ())
        .ok_or_else(|| CycleError::Aborted(format!("no station answer matching {}", expect)))
    }

    async fn await_precharged(&self, bus: &dyn SignalBus) -> Result<(), CycleError> {
        let target = self.config.precharge_voltage;
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.response_timeout_ms);

        bus.flush_inbox().await;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let status = bus
                .await_message(evse_status::MESSAGE, &Expectation::any(), Some(remaining))
                .await?
                .ok_or_else(|| {
                    CycleError::Aborted(format!("present voltage never reached {:.1}V", target))
                })?;

            if let Some(voltage) = status.number(evse_status::PRESENT_VOLTAGE) {
                if (voltage - target).abs() <= self.config.voltage_tolerance {
                    debug!(voltage, target, "Pre-charge voltage reached");
                    return Ok(());
                }
            }
        }
    }

    fn report(&self, bus: &dyn SignalBus, state: SessionState, pilot: PilotState) -> Result<(), BusError> {
        bus.set_signal(
            charge_info::MESSAGE,
            charge_info::STATE_MACHINE_STATE,
            state.into(),
        )?;
        bus.set_signal(
            charge_info::MESSAGE,
            charge_info::CONTROL_PILOT_STATE,
            pilot.into(),
        )
    }

    /// Unplugged: state Default, pilot A, no charge targets
    fn reset(&self, bus: &dyn SignalBus) -> Result<(), BusError> {
        self.report(bus, SessionState::Idle, PilotState::A)?;
        for signal in [
            ev_charge_targets::PRECHARGE_VOLTAGE,
            ev_charge_targets::TARGET_CURRENT,
            ev_charge_targets::TARGET_VOLTAGE,
        ] {
            bus.set_signal(ev_charge_targets::MESSAGE, signal, SignalValue::NotAvailable)?;
        }
        Ok(())
    }

    fn publish_ev_limits(&self, bus: &dyn SignalBus) -> Result<(), BusError> {
        bus.set_signal(
            ev_max_limits::MESSAGE,
            ev_max_limits::MAX_VOLTAGE,
            self.config.ev_max_voltage.into(),
        )?;
        bus.set_signal(
            ev_max_limits::MESSAGE,
            ev_max_limits::MAX_POWER,
            self.config.ev_max_power.into(),
        )?;
        bus.set_signal(
            ev_max_limits::MESSAGE,
            ev_max_limits::MAX_CURRENT,
            self.config.ev_max_current.into(),
        )
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
