//! Charge controller states, pilot states and driver phases

use std::fmt;

use evsim_bus::SignalValue;
use serde::{Deserialize, Serialize};

/// State machine state reported on `ChargeInfo.StateMachineState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionState {
    /// Unplugged, reported as "Default" on the wire
    #[default]
    #[serde(rename = "Default")]
    Idle,
    Init,
    Authentication,
    Parameter,
    Isolation,
    PreCharge,
    Charge,
    Welding,
    StopCharge,
    ShutOff,
    Error,
}

impl SessionState {
    pub const ALL: [SessionState; 11] = [
        Self::Idle,
        Self::Init,
        Self::Authentication,
        Self::Parameter,
        Self::Isolation,
        Self::PreCharge,
        Self::Charge,
        Self::Welding,
        Self::StopCharge,
        Self::ShutOff,
        Self::Error,
    ];

    /// Value table label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Default",
            Self::Init => "Init",
            Self::Authentication => "Authentication",
            Self::Parameter => "Parameter",
            Self::Isolation => "Isolation",
            Self::PreCharge => "PreCharge",
            Self::Charge => "Charge",
            Self::Welding => "Welding",
            Self::StopCharge => "StopCharge",
            Self::ShutOff => "ShutOff",
            Self::Error => "Error",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.label() == label)
    }

    /// States that end the energy transfer
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ShutOff | Self::Welding | Self::Error | Self::StopCharge
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<SessionState> for SignalValue {
    fn from(state: SessionState) -> Self {
        SignalValue::label(state.label())
    }
}

/// IEC 61851 control pilot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PilotState {
    /// Not connected
    A,
    /// Connected, not ready
    B,
    /// Connected, ready to charge
    C,
    /// Ready to charge, ventilation required
    D,
    /// No power (station disabled)
    E,
    /// Fault
    F,
}

impl PilotState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
        }
    }
}

impl fmt::Display for PilotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<PilotState> for SignalValue {
    fn from(state: PilotState) -> Self {
        SignalValue::label(state.label())
    }
}

/// Proximity pin state reported on the vehicle-side bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProximityState {
    NotConnected,
    Type2Connected13A,
    Type2Connected20A,
    Type2Connected32A,
    Type2Connected63A,
}

impl ProximityState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotConnected => "Not_Connected",
            Self::Type2Connected13A => "Type2_Connected13A",
            Self::Type2Connected20A => "Type2_Connected20A",
            Self::Type2Connected32A => "Type2_Connected32A",
            Self::Type2Connected63A => "Type2_Connected63A",
        }
    }
}

impl From<ProximityState> for SignalValue {
    fn from(state: ProximityState) -> Self {
        SignalValue::label(state.label())
    }
}

/// Step of the station driver's session walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Preflight,
    PlugIn,
    Init,
    Authentication,
    Parameter,
    Isolation,
    PreCharge,
    Charge,
    ShutOff,
    Unplug,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::PlugIn => "plug-in",
            Self::Init => "init",
            Self::Authentication => "authentication",
            Self::Parameter => "parameter",
            Self::Isolation => "isolation",
            Self::PreCharge => "pre-charge",
            Self::Charge => "charge",
            Self::ShutOff => "shut-off",
            Self::Unplug => "unplug",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
