//! Charge station session driver
//!
//! Walks one charge session from the station side: waits for the charge
//! controller to report each state machine state in turn, answers with the
//! station's status, limits and present values, and ramps the output voltage
//! through PreCharge. Transitions are driven solely by the `StateMachineState`
//! the controller reports on `ChargeInfo`.
//!
//! ```text
//! Preflight -> PlugIn -> Init -> Authentication -> Parameter -> Isolation
//!     -> PreCharge -> Charge -> ShutOff -> Unplug
//! ```

use std::time::Duration;

use evsim_bus::{Expectation, SignalBus, SignalSnapshot, SignalValue};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{millis, DriverConfig};
use crate::error::{SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::signals::{
    charge_info, ev_charge_targets, ev_max_limits, ev_plug_status, evse_id, evse_max_limits,
    evse_regulation_limits, evse_status, labels,
};
use crate::state::{Phase, PilotState, ProximityState, SessionState};

const EVENT_CAPACITY: usize = 256;

/// Present current published once PreCharge begins
const PRECHARGE_CURRENT: f64 = 0.1;

/// Fraction of the last charge targets published when charging ends
const SHUTDOWN_FRACTION: f64 = 0.9;

/// How a session attempt ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The session ran through unplug
    Completed,
    /// The stop flag cleared while waiting for plug-in
    Stopped,
}

/// Vehicle maximum ratings read during Parameter
///
/// Values are kept as received, including "not available".
#[derive(Debug, Clone, PartialEq)]
pub struct EvMaxLimits {
    pub max_voltage: SignalValue,
    pub max_power: SignalValue,
    pub max_current: SignalValue,
}

impl EvMaxLimits {
    fn from_snapshot(snapshot: &SignalSnapshot) -> SessionResult<Self> {
        let field = |signal: &str| {
            snapshot
                .get(signal)
                .cloned()
                .ok_or_else(|| SessionError::Violation {
                    phase: Phase::Parameter,
                    detail: format!("{} carries no {}", ev_max_limits::MESSAGE, signal),
                })
        };

        Ok(Self {
            max_voltage: field(ev_max_limits::MAX_VOLTAGE)?,
            max_power: field(ev_max_limits::MAX_POWER)?,
            max_current: field(ev_max_limits::MAX_CURRENT)?,
        })
    }
}

/// Last set points read from `EVDCChargeTargets` during Charge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeTargets {
    pub current: f64,
    pub voltage: f64,
}

/// Present voltage published at `step` of a PreCharge ramp with `steps` steps
pub fn ramp_voltage(step: u32, steps: u32, target: f64) -> f64 {
    f64::from(step) / f64::from(steps) * target
}

/// Simulated charge station that walks charge sessions on a signal bus
pub struct ChargeSessionDriver {
    config: DriverConfig,
    events: broadcast::Sender<SessionEvent>,
}

impl ChargeSessionDriver {
    pub fn new(config: DriverConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { config, events }
    }

    /// Receive progress events of every following session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Run one session attempt
    ///
    /// `peer_bus` is the vehicle-side bus; when attached, the plug status is
    /// mirrored onto it as the session progresses.
    pub async fn run_session<F>(
        &self,
        bus: &dyn SignalBus,
        should_continue: &F,
        peer_bus: Option<&dyn SignalBus>,
    ) -> SessionResult<SessionOutcome>
    where
        F: Fn() -> bool + Sync,
    {
        self.session(Uuid::new_v4(), bus, peer_bus)
            .run(should_continue)
            .await
    }

    /// Run sessions until `should_continue` returns false
    ///
    /// The flag is checked before every attempt and during the plug-in wait;
    /// an attempt already past plug-in runs to its end. A protocol failure
    /// waits for the connector to be unplugged and starts over from
    /// preflight. Bus errors end the loop.
    pub async fn run_session_loop<F>(
        &self,
        bus: &dyn SignalBus,
        should_continue: &F,
        peer_bus: Option<&dyn SignalBus>,
    ) -> SessionResult<()>
    where
        F: Fn() -> bool + Sync,
    {
        while should_continue() {
            bus.start().await?;

            let session = self.session(Uuid::new_v4(), bus, peer_bus);
            match session.run(should_continue).await {
                Ok(outcome) => {
                    debug!(session = %session.id, ?outcome, "Session attempt ended");
                }
                Err(e) if e.is_protocol() => {
                    if let Err(e) = session.recover(&e).await {
                        let _ = bus.stop().await;
                        return Err(e);
                    }
                }
                Err(e) => {
                    error!(session = %session.id, error = %e, "Bus failure, leaving session loop");
                    let _ = bus.stop().await;
                    return Err(e);
                }
            }

            bus.stop().await?;
        }

        info!("Session loop stopped");
        let _ = self.events.send(SessionEvent::Stopped);
        Ok(())
    }

    fn session<'a>(
        &'a self,
        id: Uuid,
        bus: &'a dyn SignalBus,
        peer: Option<&'a dyn SignalBus>,
    ) -> Session<'a> {
        Session {
            id,
            bus,
            peer,
            config: &self.config,
            events: &self.events,
        }
    }
}

/// State of a single session attempt
struct Session<'a> {
    id: Uuid,
    bus: &'a dyn SignalBus,
    peer: Option<&'a dyn SignalBus>,
    config: &'a DriverConfig,
    events: &'a broadcast::Sender<SessionEvent>,
}

impl Session<'_> {
    async fn run<F>(&self, should_continue: &F) -> SessionResult<SessionOutcome>
    where
        F: Fn() -> bool + Sync,
    {
        self.emit(SessionEvent::Started { session: self.id });

        self.preflight().await?;
        if !self.plug_in(should_continue).await? {
            info!(session = %self.id, "Stopped while waiting for plug-in");
            return Ok(SessionOutcome::Stopped);
        }
        self.init().await?;
        self.authentication().await?;
        let ev_limits = self.parameter().await?;
        self.isolation(&ev_limits).await?;
        self.precharge().await?;
        let targets = self.charge().await?;
        self.shut_off(targets).await?;
        self.unplug().await?;

        info!(session = %self.id, "Session completed");
        self.emit(SessionEvent::Completed { session: self.id });
        Ok(SessionOutcome::Completed)
    }

    /// Report a protocol failure and wait until the connector is unplugged
    async fn recover(&self, failure: &SessionError) -> SessionResult<()> {
        let phase = failure.phase().unwrap_or(Phase::Preflight);
        error!(session = %self.id, phase = %phase, error = %failure, "Session failed");
        self.emit(SessionEvent::Failed {
            session: self.id,
            phase,
            reason: failure.to_string(),
        });

        info!(session = %self.id, "Restarting charge cycle, waiting for unplug");
        let unplugged = self
            .bus
            .await_message(
                charge_info::MESSAGE,
                &Expectation::signal(charge_info::CONTROL_PILOT_STATE, PilotState::A),
                millis(self.config.timings.unplug_timeout_ms),
            )
            .await?;
        if unplugged.is_none() {
            warn!(session = %self.id, "No unplug seen, restarting anyway");
        }
        self.mirror_plug(0.0, PilotState::E, ProximityState::NotConnected)?;

        self.emit(SessionEvent::Restarting { session: self.id });
        Ok(())
    }

    async fn preflight(&self) -> SessionResult<()> {
        self.enter(Phase::Preflight);
        self.write_defaults()?;

        let timeout = Some(self.config.timings.preflight_timeout());
        self.bus.flush_inbox().await;
        self.expect(Phase::Preflight, charge_info::MESSAGE, Expectation::any(), timeout)
            .await?;
        self.expect(
            Phase::Preflight,
            charge_info::MESSAGE,
            Expectation::signal(charge_info::STATE_MACHINE_STATE, SessionState::Idle),
            timeout,
        )
        .await?;
        Ok(())
    }

    /// Returns false if the stop flag cleared before pilot B was seen
    async fn plug_in<F>(&self, should_continue: &F) -> SessionResult<bool>
    where
        F: Fn() -> bool + Sync,
    {
        self.enter(Phase::PlugIn);
        info!(session = %self.id, "Please plug in...");

        let poll = Some(self.config.timings.plugin_poll());
        let plugged = Expectation::signal(charge_info::CONTROL_PILOT_STATE, PilotState::B);

        self.bus.flush_inbox().await;
        let mut detected = false;
        while should_continue() && !detected {
            detected = self
                .bus
                .await_message(charge_info::MESSAGE, &plugged, poll)
                .await?
                .is_some();
        }
        if !should_continue() {
            return Ok(false);
        }

        info!(session = %self.id, "Pilot state B detected");
        self.mirror_plug(5.0, PilotState::B, ProximityState::Type2Connected13A)?;
        Ok(true)
    }

    async fn init(&self) -> SessionResult<()> {
        self.enter(Phase::Init);
        self.expect_state(
            Phase::Init,
            SessionState::Init,
            Some(self.config.timings.init_timeout_ms),
        )
        .await
    }

    async fn authentication(&self) -> SessionResult<()> {
        self.enter(Phase::Authentication);
        self.expect_state(
            Phase::Authentication,
            SessionState::Authentication,
            Some(self.config.timings.authentication_timeout_ms),
        )
        .await?;

        self.publish_limits()?;
        self.set(evse_status::MESSAGE, evse_status::PROCESSING_CA, labels::ONGOING)?;
        tokio::time::sleep(self.config.timings.response_delay()).await;
        self.set(evse_status::MESSAGE, evse_status::PROCESSING_CA, labels::FINISHED)?;
        Ok(())
    }

    async fn parameter(&self) -> SessionResult<EvMaxLimits> {
        self.enter(Phase::Parameter);
        self.expect_state(
            Phase::Parameter,
            SessionState::Parameter,
            Some(self.config.timings.parameter_timeout_ms),
        )
        .await?;

        self.set(evse_status::MESSAGE, evse_status::PROCESSING_CPD, labels::ONGOING)?;
        tokio::time::sleep(self.config.timings.response_delay()).await;

        let snapshot = self
            .expect(
                Phase::Parameter,
                ev_max_limits::MESSAGE,
                Expectation::any(),
                millis(self.config.timings.ev_limits_timeout_ms),
            )
            .await?;
        let ev_limits = EvMaxLimits::from_snapshot(&snapshot)?;
        info!(
            session = %self.id,
            max_voltage = %ev_limits.max_voltage,
            max_power = %ev_limits.max_power,
            max_current = %ev_limits.max_current,
            "EV limits received"
        );

        self.set(evse_status::MESSAGE, evse_status::PROCESSING_CPD, labels::FINISHED)?;
        Ok(ev_limits)
    }

    async fn isolation(&self, ev_limits: &EvMaxLimits) -> SessionResult<()> {
        self.enter(Phase::Isolation);
        self.expect_state(
            Phase::Isolation,
            SessionState::Isolation,
            self.config.timings.isolation_timeout_ms,
        )
        .await?;

        self.set(
            evse_status::MESSAGE,
            evse_status::PRESENT_VOLTAGE,
            ev_limits.max_voltage.clone(),
        )?;
        self.set(evse_status::MESSAGE, evse_status::PROCESSING_CC, labels::ONGOING)?;
        self.set(evse_status::MESSAGE, evse_status::ISOLATION_STATUS, labels::INVALID)?;

        if let Some(peer) = self.peer {
            self.expect(
                Phase::Isolation,
                charge_info::MESSAGE,
                Expectation::signal(charge_info::CONTROL_PILOT_STATE, PilotState::C),
                Some(Duration::from_millis(self.config.timings.pilot_c_timeout_ms)),
            )
            .await?;
            info!(session = %self.id, "Pilot state C detected");
            peer.set_signal(
                ev_plug_status::MESSAGE,
                ev_plug_status::CONTROL_PILOT_STATE,
                PilotState::C.into(),
            )?;
        }

        tokio::time::sleep(self.config.timings.response_delay()).await;

        self.set(evse_status::MESSAGE, evse_status::ISOLATION_STATUS, labels::VALID)?;
        self.set(evse_status::MESSAGE, evse_status::PRESENT_VOLTAGE, 0.0)?;
        self.set(evse_status::MESSAGE, evse_status::PROCESSING_CC, labels::FINISHED)?;
        Ok(())
    }

    async fn precharge(&self) -> SessionResult<()> {
        self.enter(Phase::PreCharge);
        self.expect_state(
            Phase::PreCharge,
            SessionState::PreCharge,
            Some(self.config.timings.precharge_timeout_ms),
        )
        .await?;

        let target = loop {
            let targets = self.read_targets(Phase::PreCharge).await?;
            if let Some(voltage) =
                available_number(Phase::PreCharge, &targets, ev_charge_targets::PRECHARGE_VOLTAGE)?
            {
                break voltage;
            }
        };
        info!(session = %self.id, target, "Pre-charge voltage received");

        self.set(evse_status::MESSAGE, evse_status::PRESENT_CURRENT, PRECHARGE_CURRENT)?;

        let steps = self.config.timings.ramp_steps;
        for step in 1..=steps {
            let targets = self.read_targets(Phase::PreCharge).await?;
            let target =
                required_number(Phase::PreCharge, &targets, ev_charge_targets::PRECHARGE_VOLTAGE)?;
            let voltage = ramp_voltage(step, steps, target);

            tokio::time::sleep(self.config.timings.ramp_step()).await;

            info!(
                session = %self.id,
                step,
                "Present voltage {:.1}V target {:.1}V",
                voltage,
                target
            );
            self.set(evse_status::MESSAGE, evse_status::PRESENT_VOLTAGE, voltage)?;
            self.emit(SessionEvent::PreChargeStep {
                session: self.id,
                step,
                voltage,
                target,
            });
        }
        Ok(())
    }

    /// Returns the last targets observed before the state left Charge
    async fn charge(&self) -> SessionResult<ChargeTargets> {
        self.enter(Phase::Charge);
        self.expect_state(
            Phase::Charge,
            SessionState::Charge,
            Some(self.config.timings.charge_timeout_ms),
        )
        .await?;

        loop {
            let targets = self.read_targets(Phase::Charge).await?;
            let current =
                available_number(Phase::Charge, &targets, ev_charge_targets::TARGET_CURRENT)?;
            let voltage =
                available_number(Phase::Charge, &targets, ev_charge_targets::TARGET_VOLTAGE)?;
            if current.is_some() && voltage.is_some() {
                break;
            }
        }

        let charging = SignalValue::from(SessionState::Charge);
        let started = Instant::now();
        let last = loop {
            let targets = self.read_targets(Phase::Charge).await?;
            let last = ChargeTargets {
                current: required_number(Phase::Charge, &targets, ev_charge_targets::TARGET_CURRENT)?,
                voltage: required_number(Phase::Charge, &targets, ev_charge_targets::TARGET_VOLTAGE)?,
            };

            let elapsed_secs = started.elapsed().as_secs();
            info!(
                session = %self.id,
                "{:>10} sec Voltage: {:.1}, Current: {:.1}",
                elapsed_secs,
                last.voltage,
                last.current
            );
            self.emit(SessionEvent::ChargeStatus {
                session: self.id,
                elapsed_secs,
                voltage: last.voltage,
                current: last.current,
            });

            tokio::time::sleep(self.config.timings.status_interval()).await;

            self.bus.flush_inbox().await;
            let status = self
                .expect(
                    Phase::Charge,
                    charge_info::MESSAGE,
                    Expectation::any(),
                    millis(self.config.timings.charge_info_timeout_ms),
                )
                .await?;
            match status.get(charge_info::STATE_MACHINE_STATE) {
                Some(state) if !state.matches(&charging) => {
                    info!(session = %self.id, state = %state, "Charging ended");
                    break last;
                }
                _ => {}
            }
        };

        self.set(
            evse_status::MESSAGE,
            evse_status::PRESENT_CURRENT,
            last.current * SHUTDOWN_FRACTION,
        )?;
        self.set(
            evse_status::MESSAGE,
            evse_status::PRESENT_VOLTAGE,
            last.voltage * SHUTDOWN_FRACTION,
        )?;
        Ok(last)
    }

    async fn shut_off(&self, targets: ChargeTargets) -> SessionResult<()> {
        self.enter(Phase::ShutOff);
        debug!(session = %self.id, ?targets, "Waiting for the controller to stop");

        self.bus.flush_inbox().await;
        loop {
            let status = self
                .expect(
                    Phase::ShutOff,
                    charge_info::MESSAGE,
                    Expectation::any(),
                    millis(self.config.timings.charge_info_timeout_ms),
                )
                .await?;
            let stopped = status
                .label(charge_info::STATE_MACHINE_STATE)
                .and_then(SessionState::from_label)
                .is_some_and(|state| state.is_terminal());
            if stopped {
                break;
            }
        }

        if self.peer.is_some() {
            self.expect(
                Phase::ShutOff,
                charge_info::MESSAGE,
                Expectation::signal(charge_info::CONTROL_PILOT_STATE, PilotState::B),
                Some(Duration::from_millis(self.config.timings.pilot_b_timeout_ms)),
            )
            .await?;
            info!(session = %self.id, "Vehicle back to pilot state B at 100%");
            self.mirror_plug(100.0, PilotState::B, ProximityState::Type2Connected13A)?;
        }

        info!(session = %self.id, "Shut off");
        Ok(())
    }

    async fn unplug(&self) -> SessionResult<()> {
        self.enter(Phase::Unplug);
        info!(session = %self.id, "Waiting for unplug");

        self.expect_state_signal(
            Phase::Unplug,
            charge_info::CONTROL_PILOT_STATE,
            PilotState::A.into(),
            millis(self.config.timings.unplug_timeout_ms),
        )
        .await?;

        self.mirror_plug(0.0, PilotState::E, ProximityState::NotConnected)
    }

    /// Initial station status written before preflight
    fn write_defaults(&self) -> SessionResult<()> {
        use evse_status::*;

        self.set(MESSAGE, PRESENT_CURRENT, SignalValue::NotAvailable)?;
        self.set(MESSAGE, PRESENT_VOLTAGE, SignalValue::NotAvailable)?;
        self.set(MESSAGE, ISOLATION_STATUS, labels::INVALID)?;
        self.set(MESSAGE, FREE_SERVICE, 1.0)?;
        self.set(MESSAGE, VOLTAGE_LIMIT_ACHIEVED, labels::FALSE)?;
        self.set(MESSAGE, STATUS_CODE, labels::EVSE_READY)?;
        self.set(MESSAGE, CURRENT_LIMIT_ACHIEVED, labels::FALSE)?;
        self.set(MESSAGE, POWER_LIMIT_ACHIEVED, labels::FALSE)?;
        self.set(MESSAGE, PROCESSING_CA, SignalValue::NotAvailable)?;
        self.set(MESSAGE, PROCESSING_CPD, SignalValue::NotAvailable)?;
        self.set(MESSAGE, PROCESSING_CC, SignalValue::NotAvailable)?;

        self.set(
            evse_id::MESSAGE,
            evse_id::EVSE_ID,
            f64::from(self.config.evse_id),
        )
    }

    fn publish_limits(&self) -> SessionResult<()> {
        let limits = &self.config.limits;

        self.set(evse_max_limits::MESSAGE, evse_max_limits::MAX_CURRENT, limits.max_current)?;
        self.set(evse_max_limits::MESSAGE, evse_max_limits::MAX_VOLTAGE, limits.max_voltage)?;
        self.set(evse_max_limits::MESSAGE, evse_max_limits::MAX_POWER, limits.max_power)?;
        self.set(
            evse_max_limits::MESSAGE,
            evse_max_limits::ENERGY_TO_BE_DELIVERED,
            limits.energy_to_be_delivered,
        )?;

        use evse_regulation_limits as regulation;
        self.set(regulation::MESSAGE, regulation::MIN_CURRENT, limits.min_current)?;
        self.set(regulation::MESSAGE, regulation::MIN_VOLTAGE, limits.min_voltage)?;
        self.set(
            regulation::MESSAGE,
            regulation::PEAK_CURRENT_RIPPLE,
            limits.peak_current_ripple,
        )?;
        self.set(
            regulation::MESSAGE,
            regulation::CURRENT_REGULATION_TOLERANCE,
            limits.current_regulation_tolerance,
        )?;

        debug!(session = %self.id, ?limits, "Station limits published");
        self.emit(SessionEvent::LimitsPublished { session: self.id });
        Ok(())
    }

    /// Write the plug status onto the vehicle-side bus, if attached
    fn mirror_plug(
        &self,
        duty_cycle: f64,
        pilot: PilotState,
        proximity: ProximityState,
    ) -> SessionResult<()> {
        let Some(peer) = self.peer else {
            return Ok(());
        };

        debug!(session = %self.id, duty_cycle, pilot = %pilot, "Mirroring plug status");
        peer.set_signal(ev_plug_status::MESSAGE, ev_plug_status::DUTY_CYCLE, duty_cycle.into())?;
        peer.set_signal(
            ev_plug_status::MESSAGE,
            ev_plug_status::CONTROL_PILOT_STATE,
            pilot.into(),
        )?;
        peer.set_signal(
            ev_plug_status::MESSAGE,
            ev_plug_status::PROXIMITY_PIN_STATE,
            proximity.into(),
        )?;
        Ok(())
    }

    /// Flush the inbox, then wait for the controller to report `state`
    async fn expect_state(
        &self,
        phase: Phase,
        state: SessionState,
        timeout_ms: Option<u64>,
    ) -> SessionResult<()> {
        self.expect_state_signal(
            phase,
            charge_info::STATE_MACHINE_STATE,
            state.into(),
            millis(timeout_ms),
        )
        .await?;
        info!(session = %self.id, state = %state, "Controller state reached");
        Ok(())
    }

    async fn expect_state_signal(
        &self,
        phase: Phase,
        signal: &str,
        value: SignalValue,
        timeout: Option<Duration>,
    ) -> SessionResult<()> {
        self.bus.flush_inbox().await;
        self.expect(
            phase,
            charge_info::MESSAGE,
            Expectation::signal(signal, value),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn read_targets(&self, phase: Phase) -> SessionResult<SignalSnapshot> {
        self.expect(
            phase,
            ev_charge_targets::MESSAGE,
            Expectation::any(),
            millis(self.config.timings.targets_timeout_ms),
        )
        .await
    }

    async fn expect(
        &self,
        phase: Phase,
        message: &str,
        expect: Expectation,
        timeout: Option<Duration>,
    ) -> SessionResult<SignalSnapshot> {
        self.bus
            .await_message(message, &expect, timeout)
            .await?
            .ok_or_else(|| SessionError::Timeout {
                phase,
                expectation: format!("{}({})", message, expect),
            })
    }

    fn set(
        &self,
        message: &str,
        signal: &str,
        value: impl Into<SignalValue>,
    ) -> SessionResult<()> {
        self.bus.set_signal(message, signal, value.into())?;
        Ok(())
    }

    fn enter(&self, phase: Phase) {
        debug!(session = %self.id, phase = %phase, "Entering phase");
        self.emit(SessionEvent::PhaseEntered {
            session: self.id,
            phase,
        });
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Numeric value of `signal`, `None` while it is not available
fn available_number(
    phase: Phase,
    snapshot: &SignalSnapshot,
    signal: &str,
) -> SessionResult<Option<f64>> {
    match snapshot.get(signal) {
        Some(SignalValue::Number(value)) => Ok(Some(*value)),
        Some(SignalValue::NotAvailable) | None => Ok(None),
        Some(SignalValue::Label(label)) => Err(SessionError::Violation {
            phase,
            detail: format!("{} is '{}', expected a number", signal, label),
        }),
    }
}

/// Numeric value of `signal`, which must be available
fn required_number(phase: Phase, snapshot: &SignalSnapshot, signal: &str) -> SessionResult<f64> {
    available_number(phase, snapshot, signal)?.ok_or_else(|| SessionError::Violation {
        phase,
        detail: format!("{} became not available", signal),
    })
}
