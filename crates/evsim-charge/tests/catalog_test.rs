//! The bundled message catalogs carry every value the driver and the
//! simulator put on the bus

use std::path::PathBuf;

use evsim_bus::{MessageCatalog, SignalSnapshot, SignalValue};
use evsim_charge::signals::{
    charge_info, ev_charge_targets, ev_max_limits, ev_plug_status, evse_id, evse_max_limits,
    evse_regulation_limits, evse_status, labels,
};
use evsim_charge::{PilotState, ProximityState, SessionState};
use pretty_assertions::assert_eq;
use rstest::rstest;

fn bundled(name: &str) -> MessageCatalog {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../config/catalogs")
        .join(name);
    MessageCatalog::from_file(&path).unwrap()
}

#[rstest]
#[case::init(SessionState::Init)]
#[case::charge(SessionState::Charge)]
#[case::shut_off(SessionState::ShutOff)]
#[case::error(SessionState::Error)]
fn test_state_labels_survive_the_wire(#[case] state: SessionState) {
    let catalog = bundled("isc_cme.yaml");
    let def = catalog.get(charge_info::MESSAGE).unwrap();
    let id = evsim_bus::catalog::parse_can_id(&def.id).unwrap();

    let bytes = catalog
        .encode(
            charge_info::MESSAGE,
            &SignalSnapshot::new()
                .with(charge_info::STATE_MACHINE_STATE, state)
                .with(charge_info::CONTROL_PILOT_STATE, PilotState::C),
        )
        .unwrap();
    let (_, decoded) = catalog.decode(id, &bytes).unwrap();

    assert_eq!(
        decoded.label(charge_info::STATE_MACHINE_STATE),
        Some(state.label())
    );
    assert_eq!(decoded.label(charge_info::CONTROL_PILOT_STATE), Some("C"));
}

#[rstest]
#[case::max_limits(ev_max_limits::MESSAGE, ev_max_limits::MAX_POWER, 150_000.0)]
#[case::precharge(ev_charge_targets::MESSAGE, ev_charge_targets::PRECHARGE_VOLTAGE, 400.0)]
#[case::ramp_step(evse_status::MESSAGE, evse_status::PRESENT_VOLTAGE, 30.8)]
#[case::precharge_current(evse_status::MESSAGE, evse_status::PRESENT_CURRENT, 0.1)]
#[case::evse_id(evse_id::MESSAGE, evse_id::EVSE_ID, 3_735_928_559.0)]
#[case::max_power(evse_max_limits::MESSAGE, evse_max_limits::MAX_POWER, 500_000.0)]
#[case::ripple(
    evse_regulation_limits::MESSAGE,
    evse_regulation_limits::PEAK_CURRENT_RIPPLE,
    5.0
)]
fn test_numbers_survive_the_wire(
    #[case] message: &str,
    #[case] signal: &str,
    #[case] value: f64,
) {
    let catalog = bundled("isc_cme.yaml");
    let def = catalog.get(message).unwrap();
    let id = evsim_bus::catalog::parse_can_id(&def.id).unwrap();

    let bytes = catalog
        .encode(message, &SignalSnapshot::new().with(signal, value))
        .unwrap();
    let (_, decoded) = catalog.decode(id, &bytes).unwrap();

    let decoded = decoded.number(signal).unwrap();
    assert!((decoded - value).abs() < 1e-6, "{} decoded as {}", value, decoded);
}

#[test]
fn test_station_defaults_encode() {
    let catalog = bundled("isc_cme.yaml");
    let defaults = SignalSnapshot::new()
        .with(evse_status::PRESENT_CURRENT, SignalValue::NotAvailable)
        .with(evse_status::PRESENT_VOLTAGE, SignalValue::NotAvailable)
        .with(evse_status::ISOLATION_STATUS, labels::INVALID)
        .with(evse_status::FREE_SERVICE, 1.0)
        .with(evse_status::VOLTAGE_LIMIT_ACHIEVED, labels::FALSE)
        .with(evse_status::STATUS_CODE, labels::EVSE_READY)
        .with(evse_status::CURRENT_LIMIT_ACHIEVED, labels::FALSE)
        .with(evse_status::POWER_LIMIT_ACHIEVED, labels::FALSE)
        .with(evse_status::PROCESSING_CA, SignalValue::NotAvailable)
        .with(evse_status::PROCESSING_CPD, SignalValue::NotAvailable)
        .with(evse_status::PROCESSING_CC, SignalValue::NotAvailable);

    let bytes = catalog.encode(evse_status::MESSAGE, &defaults).unwrap();
    let (_, decoded) = catalog.decode(0x610, &bytes).unwrap();
    assert_eq!(decoded, defaults);
}

#[test]
fn test_station_only_receives_controller_messages() {
    let catalog = bundled("isc_cme.yaml");
    let from_controller: Vec<&str> = catalog
        .messages()
        .filter(|def| def.is_sent_by("CME"))
        .map(|def| def.name.as_str())
        .collect();
    assert_eq!(
        from_controller,
        vec![
            charge_info::MESSAGE,
            ev_charge_targets::MESSAGE,
            ev_max_limits::MESSAGE
        ]
    );
}

#[rstest]
#[case::plugged(5.0, PilotState::B, ProximityState::Type2Connected13A)]
#[case::unplugged(0.0, PilotState::E, ProximityState::NotConnected)]
fn test_plug_status_encodes(
    #[case] duty_cycle: f64,
    #[case] pilot: PilotState,
    #[case] proximity: ProximityState,
) {
    let catalog = bundled("isc_cms.yaml");
    let def = catalog.get(ev_plug_status::MESSAGE).unwrap();
    assert!(!def.is_sent_by("CMS"));

    let snapshot = SignalSnapshot::new()
        .with(ev_plug_status::DUTY_CYCLE, duty_cycle)
        .with(ev_plug_status::CONTROL_PILOT_STATE, pilot)
        .with(ev_plug_status::PROXIMITY_PIN_STATE, proximity);
    let bytes = catalog.encode(ev_plug_status::MESSAGE, &snapshot).unwrap();
    let (_, decoded) = catalog.decode(0x620, &bytes).unwrap();
    assert_eq!(decoded, snapshot);
}
