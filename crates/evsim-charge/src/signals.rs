//! Message and signal names of the charging network

/// Charge controller status, received by the station
pub mod charge_info {
    pub const MESSAGE: &str = "ChargeInfo";
    pub const STATE_MACHINE_STATE: &str = "StateMachineState";
    pub const CONTROL_PILOT_STATE: &str = "ControlPilotState";
}

/// Vehicle maximum ratings, received during Parameter
pub mod ev_max_limits {
    pub const MESSAGE: &str = "EVDCMaxLimits";
    pub const MAX_VOLTAGE: &str = "EVMaxVoltage";
    pub const MAX_POWER: &str = "EVMaxPower";
    pub const MAX_CURRENT: &str = "EVMaxCurrent";
}

/// Vehicle set points, received during PreCharge and Charge
pub mod ev_charge_targets {
    pub const MESSAGE: &str = "EVDCChargeTargets";
    pub const PRECHARGE_VOLTAGE: &str = "EVPreChargeVoltage";
    pub const TARGET_CURRENT: &str = "EVTargetCurrent";
    pub const TARGET_VOLTAGE: &str = "EVTargetVoltage";
}

/// Station status, transmitted by the station
pub mod evse_status {
    pub const MESSAGE: &str = "EVSEDCStatus";
    pub const PRESENT_CURRENT: &str = "EVSEPresentCurrent";
    pub const PRESENT_VOLTAGE: &str = "EVSEPresentVoltage";
    pub const ISOLATION_STATUS: &str = "EVSEIsolationStatus";
    pub const FREE_SERVICE: &str = "EVSEFreeService";
    pub const VOLTAGE_LIMIT_ACHIEVED: &str = "EVSEVoltageLimitAchieved";
    pub const STATUS_CODE: &str = "EVSEStatusCode";
    pub const CURRENT_LIMIT_ACHIEVED: &str = "EVSECurrentLimitAchieved";
    pub const POWER_LIMIT_ACHIEVED: &str = "EVSEPowerLimitAchieved";
    pub const PROCESSING_CA: &str = "EVSEProcessingCA";
    pub const PROCESSING_CPD: &str = "EVSEProcessingCPD";
    pub const PROCESSING_CC: &str = "EVSEProcessingCC";
}

/// Station identifier
pub mod evse_id {
    pub const MESSAGE: &str = "EVSEID";
    pub const EVSE_ID: &str = "EVSEID";
}

pub mod evse_max_limits {
    pub const MESSAGE: &str = "EVSEDCMaxLimits";
    pub const MAX_CURRENT: &str = "EVSEMaxCurrent";
    pub const MAX_VOLTAGE: &str = "EVSEMaxVoltage";
    pub const MAX_POWER: &str = "EVSEMaxPower";
    pub const ENERGY_TO_BE_DELIVERED: &str = "EVSEEnergyToBeDelivered";
}

pub mod evse_regulation_limits {
    pub const MESSAGE: &str = "EVSEDCRegulationLimits";
    pub const MIN_CURRENT: &str = "EVSEMinCurrent";
    pub const MIN_VOLTAGE: &str = "EVSEMinVoltage";
    pub const PEAK_CURRENT_RIPPLE: &str = "EVSEPeakCurrentRipple";
    pub const CURRENT_REGULATION_TOLERANCE: &str = "EVSECurrentRegulationTolerance";
}

/// Plug status on the vehicle-side bus
pub mod ev_plug_status {
    pub const MESSAGE: &str = "EVPlugStatus";
    pub const DUTY_CYCLE: &str = "EVControlPilotDutyCycle";
    pub const CONTROL_PILOT_STATE: &str = "EVControlPilotState";
    pub const PROXIMITY_PIN_STATE: &str = "EVProximityPinState";
}

/// Enumeration labels shared by several signals
pub mod labels {
    pub const ONGOING: &str = "Ongoing";
    pub const FINISHED: &str = "Finished";
    pub const VALID: &str = "Valid";
    pub const INVALID: &str = "Invalid";
    pub const FALSE: &str = "False";
    pub const EVSE_READY: &str = "EVSE_Ready";
}
