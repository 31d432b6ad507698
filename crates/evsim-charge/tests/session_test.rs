//! End-to-end charge sessions on the virtual bus
//!
//! The station driver and the controller simulator run as separate tasks
//! that only share a `VirtualCan` medium. Tokio's clock is paused, so the
//! protocol's timeouts and holds run on virtual time.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evsim_bus::{MemoryBus, SignalBus, SignalValue, VirtualCan};
use evsim_charge::signals::{charge_info, ev_charge_targets};
use evsim_charge::{
    ramp_voltage, ChargeSessionDriver, ControllerSimulator, DriverConfig, Phase, SessionEvent,
    SessionOutcome, SessionResult, SessionState, SimulatorConfig,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// =============================================================================
// Helpers
// =============================================================================

struct Rig {
    can: VirtualCan,
    station: Arc<MemoryBus>,
    /// Simulator's node, for overriding what it transmits
    controller: Arc<MemoryBus>,
    simulator: JoinHandle<()>,
}

impl Rig {
    fn start(config: SimulatorConfig) -> Self {
        let can = VirtualCan::new();
        let station = Arc::new(can.node("EVSE"));
        let controller = Arc::new(can.node("CME"));

        let simulator = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let _ = ControllerSimulator::new(config)
                    .run(controller.as_ref(), &|| true)
                    .await;
            })
        };

        Self {
            can,
            station,
            controller,
            simulator,
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.simulator.abort();
    }
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

fn phases(events: &[SessionEvent]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::PhaseEntered { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect()
}

fn transmitted_number(bus: &MemoryBus, message: &str, signal: &str) -> f64 {
    bus.transmitted_signal(message, signal)
        .and_then(|value| value.as_f64())
        .unwrap_or_else(|| panic!("{}.{} is not a number", message, signal))
}

/// Run one session in its own task, handing every event to `on_event` as
/// it arrives
async fn run_session_with(
    rig: &Rig,
    config: DriverConfig,
    mut on_event: impl FnMut(&SessionEvent),
) -> (SessionResult<SessionOutcome>, Vec<SessionEvent>) {
    let driver = Arc::new(ChargeSessionDriver::new(config));
    let mut events = driver.subscribe();

    rig.station.start().await.unwrap();
    let mut task = {
        let driver = driver.clone();
        let station = rig.station.clone();
        tokio::spawn(async move { driver.run_session(station.as_ref(), &|| true, None).await })
    };

    let mut received = Vec::new();
    let result = loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let event = event.unwrap();
                on_event(&event);
                received.push(event);
            }
            result = &mut task => break result.unwrap(),
        }
    };
    received.extend(drain(&mut events));
    (result, received)
}

const ALL_PHASES: [Phase; 10] = [
    Phase::Preflight,
    Phase::PlugIn,
    Phase::Init,
    Phase::Authentication,
    Phase::Parameter,
    Phase::Isolation,
    Phase::PreCharge,
    Phase::Charge,
    Phase::ShutOff,
    Phase::Unplug,
];

// =============================================================================
// Single session
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_session_walks_every_phase_in_order() {
    let rig = Rig::start(SimulatorConfig::default());
    let driver = ChargeSessionDriver::new(DriverConfig::default());
    let mut events = driver.subscribe();

    rig.station.start().await.unwrap();
    let outcome = driver
        .run_session(rig.station.as_ref(), &|| true, None)
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    let events = drain(&mut events);
    assert_eq!(phases(&events), ALL_PHASES.to_vec());

    let limits_published = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::LimitsPublished { .. }))
        .count();
    assert_eq!(limits_published, 1);

    assert!(matches!(events.first(), Some(SessionEvent::Started { .. })));
    assert!(matches!(events.last(), Some(SessionEvent::Completed { .. })));

    // Every event belongs to the same attempt
    let session = events[0].session().unwrap();
    assert!(events.iter().all(|event| event.session() == Some(session)));
}

#[tokio::test(start_paused = true)]
async fn test_precharge_ramp_ends_on_target() {
    let rig = Rig::start(SimulatorConfig::default());
    let driver = ChargeSessionDriver::new(DriverConfig::default());
    let mut events = driver.subscribe();

    rig.station.start().await.unwrap();
    driver
        .run_session(rig.station.as_ref(), &|| true, None)
        .await
        .unwrap();

    let ramp: Vec<(u32, f64, f64)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::PreChargeStep {
                step,
                voltage,
                target,
                ..
            } => Some((step, voltage, target)),
            _ => None,
        })
        .collect();

    assert_eq!(ramp.len(), 13);
    assert_eq!(
        ramp.iter().map(|(step, _, _)| *step).collect::<Vec<_>>(),
        (1..=13).collect::<Vec<_>>()
    );
    assert!(ramp.windows(2).all(|w| w[0].1 <= w[1].1));
    assert!(ramp.iter().all(|(_, _, target)| *target == 400.0));
    assert_eq!(ramp[12].1, 400.0);
}

#[tokio::test(start_paused = true)]
async fn test_precharge_ramp_follows_changed_target() {
    let rig = Rig::start(SimulatorConfig {
        precharge_voltage: 400.0,
        voltage_tolerance: 101.0,
        ..SimulatorConfig::default()
    });
    let controller = rig.controller.clone();

    let (result, events) = run_session_with(&rig, DriverConfig::default(), |event| {
        if let SessionEvent::PreChargeStep { step: 2, .. } = event {
            controller
                .set_signal(
                    ev_charge_targets::MESSAGE,
                    ev_charge_targets::PRECHARGE_VOLTAGE,
                    SignalValue::Number(300.0),
                )
                .unwrap();
        }
    })
    .await;
    assert_eq!(result.unwrap(), SessionOutcome::Completed);

    let ramp: Vec<(u32, f64, f64)> = events
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::PreChargeStep {
                step,
                voltage,
                target,
                ..
            } => Some((step, voltage, target)),
            _ => None,
        })
        .collect();
    assert_eq!(ramp.len(), 13);

    // Every step is computed from the target read for that step
    for (step, voltage, target) in &ramp {
        assert_eq!(*voltage, ramp_voltage(*step, 13, *target));
    }

    let targets: Vec<f64> = ramp.iter().map(|(_, _, target)| *target).collect();
    assert_eq!(targets[0], 400.0);
    assert_eq!(targets[12], 300.0);
    assert_eq!(targets.windows(2).filter(|w| w[0] != w[1]).count(), 1);
    assert_eq!(ramp[12].1, 300.0);
}

#[tokio::test(start_paused = true)]
async fn test_charge_loop_ends_one_iteration_after_state_change() {
    let rig = Rig::start(SimulatorConfig {
        charge_duration_ms: 60_000,
        ..SimulatorConfig::default()
    });
    let controller = rig.controller.clone();

    let mut statuses = 0;
    let (result, events) = run_session_with(&rig, DriverConfig::default(), |event| {
        if matches!(event, SessionEvent::ChargeStatus { .. }) {
            statuses += 1;
            if statuses == 3 {
                controller
                    .set_signal(
                        charge_info::MESSAGE,
                        charge_info::STATE_MACHINE_STATE,
                        SessionState::StopCharge.into(),
                    )
                    .unwrap();
            }
        }
    })
    .await;
    assert_eq!(result.unwrap(), SessionOutcome::Completed);

    let status_count = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::ChargeStatus { .. }))
        .count();
    assert_eq!(status_count, 3);

    // Shut-off follows the third status report directly
    let last_status = events
        .iter()
        .rposition(|event| matches!(event, SessionEvent::ChargeStatus { .. }))
        .unwrap();
    assert!(matches!(
        events[last_status + 1],
        SessionEvent::PhaseEntered {
            phase: Phase::ShutOff,
            ..
        }
    ));

    let current = transmitted_number(&rig.station, "EVSEDCStatus", "EVSEPresentCurrent");
    assert!((current - 90.0).abs() < 1e-9, "present current {}", current);
}

#[tokio::test(start_paused = true)]
async fn test_final_present_values_follow_last_targets() {
    let rig = Rig::start(SimulatorConfig {
        target_current: 100.0,
        target_voltage: 400.0,
        ..SimulatorConfig::default()
    });
    let driver = ChargeSessionDriver::new(DriverConfig::default());
    let mut events = driver.subscribe();

    rig.station.start().await.unwrap();
    driver
        .run_session(rig.station.as_ref(), &|| true, None)
        .await
        .unwrap();

    let current = transmitted_number(&rig.station, "EVSEDCStatus", "EVSEPresentCurrent");
    let voltage = transmitted_number(&rig.station, "EVSEDCStatus", "EVSEPresentVoltage");
    assert!((current - 90.0).abs() < 1e-9, "present current {}", current);
    assert!((voltage - 360.0).abs() < 1e-9, "present voltage {}", voltage);

    let status: Vec<(f64, f64)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::ChargeStatus {
                voltage, current, ..
            } => Some((voltage, current)),
            _ => None,
        })
        .collect();
    assert!(!status.is_empty());
    assert!(status.iter().all(|s| *s == (400.0, 100.0)));

    // Station side of the handshake
    assert_eq!(
        rig.station.transmitted_signal("EVSEDCStatus", "EVSEIsolationStatus"),
        Some(SignalValue::label("Valid"))
    );
    assert_eq!(
        rig.station.transmitted_signal("EVSEDCStatus", "EVSEProcessingCC"),
        Some(SignalValue::label("Finished"))
    );
    assert_eq!(
        transmitted_number(&rig.station, "EVSEDCMaxLimits", "EVSEMaxCurrent"),
        500.0
    );
    assert_eq!(
        transmitted_number(&rig.station, "EVSEDCRegulationLimits", "EVSEMinVoltage"),
        10.0
    );
}

#[tokio::test(start_paused = true)]
async fn test_plug_status_is_mirrored_on_peer_bus() {
    let rig = Rig::start(SimulatorConfig::default());
    let peer = rig.can.node("CMS");
    let driver = ChargeSessionDriver::new(DriverConfig::default());

    rig.station.start().await.unwrap();
    let outcome = driver
        .run_session(rig.station.as_ref(), &|| true, Some(&peer))
        .await
        .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    // Disconnected after unplug
    assert_eq!(
        peer.transmitted_signal("EVPlugStatus", "EVControlPilotState"),
        Some(SignalValue::label("E"))
    );
    assert_eq!(
        peer.transmitted_signal("EVPlugStatus", "EVControlPilotDutyCycle"),
        Some(SignalValue::Number(0.0))
    );
    assert_eq!(
        peer.transmitted_signal("EVPlugStatus", "EVProximityPinState"),
        Some(SignalValue::label("Not_Connected"))
    );
}

// =============================================================================
// Session loop
// =============================================================================

/// Run the session loop in its own task, clearing the stop flag once
/// `stop_on` matches. Returns every event with the time it arrived.
async fn run_loop_until(
    rig: &Rig,
    config: DriverConfig,
    stop_on: impl Fn(&SessionEvent) -> bool,
) -> Vec<(Instant, SessionEvent)> {
    let driver = Arc::new(ChargeSessionDriver::new(config));
    let mut events = driver.subscribe();
    let running = Arc::new(AtomicBool::new(true));

    let task = {
        let driver = driver.clone();
        let station = rig.station.clone();
        let running = running.clone();
        tokio::spawn(async move {
            let should_continue = move || running.load(Ordering::SeqCst);
            driver
                .run_session_loop(station.as_ref(), &should_continue, None)
                .await
        })
    };

    let mut received = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        if stop_on(&event) {
            running.store(false, Ordering::SeqCst);
        }
        let stopped = event == SessionEvent::Stopped;
        received.push((Instant::now(), event));
        if stopped {
            break;
        }
    }

    task.await.unwrap().unwrap();
    received
}

#[tokio::test(start_paused = true)]
async fn test_missing_init_times_out_and_restarts_after_unplug() {
    let rig = Rig::start(SimulatorConfig {
        stall_at: Some(SessionState::Idle),
        stall_sessions: 1,
        stall_hold_ms: 30_000,
        plug_in_delay_ms: 2_000,
        ..SimulatorConfig::default()
    });
    let started = Instant::now();

    // Clear the flag once the second attempt is past plug-in so it is the last
    let inits = Cell::new(0);
    let events = run_loop_until(&rig, DriverConfig::default(), |event| {
        if matches!(
            event,
            SessionEvent::PhaseEntered {
                phase: Phase::Init,
                ..
            }
        ) {
            inits.set(inits.get() + 1);
        }
        inits.get() == 2
    })
    .await;

    let (failed_at, failed) = events
        .iter()
        .find(|(_, event)| matches!(event, SessionEvent::Failed { .. }))
        .expect("first session should fail");
    match failed {
        SessionEvent::Failed { phase, reason, .. } => {
            assert_eq!(*phase, Phase::Init);
            assert!(reason.contains("StateMachineState == Init"), "{}", reason);
        }
        _ => unreachable!(),
    }

    // 20s init timeout after plug-in
    assert!(failed_at.duration_since(started) >= Duration::from_secs(20));

    // Restart only once the simulator unplugged at the end of its stall
    let (restarted_at, _) = events
        .iter()
        .find(|(_, event)| matches!(event, SessionEvent::Restarting { .. }))
        .expect("driver should restart");
    assert!(restarted_at.duration_since(started) >= Duration::from_secs(32));

    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|(_, event)| match event {
            SessionEvent::Started { .. } => Some("started"),
            SessionEvent::Failed { .. } => Some("failed"),
            SessionEvent::Restarting { .. } => Some("restarting"),
            SessionEvent::Completed { .. } => Some("completed"),
            SessionEvent::Stopped => Some("stopped"),
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["started", "failed", "restarting", "started", "completed", "stopped"]
    );

    // The second attempt is a new session
    let sessions: Vec<_> = events
        .iter()
        .filter_map(|(_, event)| match event {
            SessionEvent::Started { session } => Some(*session),
            _ => None,
        })
        .collect();
    assert_ne!(sessions[0], sessions[1]);
}

#[tokio::test(start_paused = true)]
async fn test_violation_in_charge_recovers_after_unplug() {
    let rig = Rig::start(SimulatorConfig::default());
    let controller = rig.controller.clone();

    let inits = Cell::new(0);
    let statuses = Cell::new(0);
    let events = run_loop_until(&rig, DriverConfig::default(), |event| {
        match event {
            SessionEvent::PhaseEntered {
                phase: Phase::Init,
                ..
            } => inits.set(inits.get() + 1),
            // First attempt only: the controller starts sending a label
            SessionEvent::ChargeStatus { .. } if inits.get() == 1 => {
                statuses.set(statuses.get() + 1);
                if statuses.get() == 1 {
                    controller
                        .set_signal(
                            ev_charge_targets::MESSAGE,
                            ev_charge_targets::TARGET_CURRENT,
                            SignalValue::label("Paused"),
                        )
                        .unwrap();
                }
            }
            _ => {}
        }
        inits.get() == 2
    })
    .await;

    let failed = events
        .iter()
        .find_map(|(_, event)| match event {
            SessionEvent::Failed { phase, reason, .. } => Some((*phase, reason.clone())),
            _ => None,
        })
        .expect("first session should fail");
    assert_eq!(failed.0, Phase::Charge);
    assert!(failed.1.contains("EVTargetCurrent"), "{}", failed.1);

    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|(_, event)| match event {
            SessionEvent::Started { .. } => Some("started"),
            SessionEvent::Failed { .. } => Some("failed"),
            SessionEvent::Restarting { .. } => Some("restarting"),
            SessionEvent::Completed { .. } => Some("completed"),
            SessionEvent::Stopped => Some("stopped"),
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["started", "failed", "restarting", "started", "completed", "stopped"]
    );

    // The restart waited for the simulator to finish charging and unplug
    let (failed_at, _) = events
        .iter()
        .find(|(_, event)| matches!(event, SessionEvent::Failed { .. }))
        .unwrap();
    let (restarted_at, _) = events
        .iter()
        .find(|(_, event)| matches!(event, SessionEvent::Restarting { .. }))
        .unwrap();
    assert!(restarted_at.duration_since(*failed_at) >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_stop_flag_does_not_abort_running_session() {
    let rig = Rig::start(SimulatorConfig::default());

    let events = run_loop_until(&rig, DriverConfig::default(), |event| {
        matches!(
            event,
            SessionEvent::PhaseEntered {
                phase: Phase::Init,
                ..
            }
        )
    })
    .await;

    let events: Vec<SessionEvent> = events.into_iter().map(|(_, event)| event).collect();
    assert_eq!(phases(&events), ALL_PHASES.to_vec());

    let started = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::Started { .. }))
        .count();
    assert_eq!(started, 1);
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::Completed { .. })));
    assert_eq!(events.last(), Some(&SessionEvent::Stopped));
    assert!(!rig.station.is_started());
}
