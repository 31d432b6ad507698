//! Progress events published by the station driver

use serde::Serialize;
use uuid::Uuid;

use crate::state::Phase;

/// Something observable happened during a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new session attempt began
    Started { session: Uuid },
    PhaseEntered { session: Uuid, phase: Phase },
    /// Station limits were written at the start of Authentication
    LimitsPublished { session: Uuid },
    PreChargeStep {
        session: Uuid,
        step: u32,
        voltage: f64,
        target: f64,
    },
    /// One iteration of the charge loop
    ChargeStatus {
        session: Uuid,
        elapsed_secs: u64,
        voltage: f64,
        current: f64,
    },
    Completed { session: Uuid },
    Failed {
        session: Uuid,
        phase: Phase,
        reason: String,
    },
    /// The driver is going back to preflight after a failure
    Restarting { session: Uuid },
    /// The stop flag ended the session loop
    Stopped,
}

impl SessionEvent {
    pub fn session(&self) -> Option<Uuid> {
        match self {
            Self::Started { session }
            | Self::PhaseEntered { session, .. }
            | Self::LimitsPublished { session }
            | Self::PreChargeStep { session, .. }
            | Self::ChargeStatus { session, .. }
            | Self::Completed { session }
            | Self::Failed { session, .. }
            | Self::Restarting { session } => Some(*session),
            Self::Stopped => None,
        }
    }
}
