//! Charge session configuration
//!
//! Loaded from TOML, every field has a default:
//!
//! ```toml
//! evse_id = 3735928559
//!
//! [limits]
//! max_current = 500.0
//! max_voltage = 1000.0
//!
//! [timings]
//! init_timeout_ms = 20000
//! isolation_timeout_ms = 60000   # omit to wait without bound
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Station ratings published at the start of Authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeLimits {
    /// Maximum current in A
    pub max_current: f64,
    /// Maximum voltage in V
    pub max_voltage: f64,
    /// Maximum power in W
    pub max_power: f64,
    /// Energy to be delivered in Wh
    pub energy_to_be_delivered: f64,
    /// Minimum current in A
    pub min_current: f64,
    /// Minimum voltage in V
    pub min_voltage: f64,
    /// Peak current ripple in A
    pub peak_current_ripple: f64,
    /// Current regulation tolerance in A
    pub current_regulation_tolerance: f64,
}

impl Default for ChargeLimits {
    fn default() -> Self {
        Self {
            max_current: 500.0,
            max_voltage: 1000.0,
            max_power: 500_000.0,
            energy_to_be_delivered: 500_000.0,
            min_current: 0.0,
            min_voltage: 10.0,
            peak_current_ripple: 5.0,
            current_regulation_tolerance: 3.0,
        }
    }
}

/// Timeouts and holds of the session walk, in milliseconds
///
/// Optional timeouts wait without bound when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTimings {
    /// Wait for the first `ChargeInfo` and for the unplugged state
    #[serde(default = "default_preflight_timeout")]
    pub preflight_timeout_ms: u64,

    /// Granularity of the plug-in poll
    #[serde(default = "default_plugin_poll")]
    pub plugin_poll_ms: u64,

    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,

    #[serde(default = "default_authentication_timeout")]
    pub authentication_timeout_ms: u64,

    #[serde(default = "default_parameter_timeout")]
    pub parameter_timeout_ms: u64,

    /// Wait for the `EVDCMaxLimits` snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ev_limits_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_timeout_ms: Option<u64>,

    /// Wait for pilot C when a vehicle-side bus is attached
    #[serde(default = "default_pilot_c_timeout")]
    pub pilot_c_timeout_ms: u64,

    #[serde(default = "default_precharge_timeout")]
    pub precharge_timeout_ms: u64,

    /// Wait for each `EVDCChargeTargets` read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets_timeout_ms: Option<u64>,

    /// Number of PreCharge ramp steps
    #[serde(default = "default_ramp_steps")]
    pub ramp_steps: u32,

    /// Hold before each ramp step is published
    #[serde(default = "default_ramp_step")]
    pub ramp_step_ms: u64,

    #[serde(default = "default_charge_timeout")]
    pub charge_timeout_ms: u64,

    /// Interval of the charge loop
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,

    /// Wait for `ChargeInfo` inside the charge loop and the shut-off poll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_info_timeout_ms: Option<u64>,

    /// Wait for pilot B after shut-off when a vehicle-side bus is attached
    #[serde(default = "default_pilot_b_timeout")]
    pub pilot_b_timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unplug_timeout_ms: Option<u64>,

    /// Hold between "Ongoing" and "Finished" of CA, CPD and CC
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,
}

fn default_preflight_timeout() -> u64 {
    10_000
}

fn default_plugin_poll() -> u64 {
    1_000
}

fn default_init_timeout() -> u64 {
    20_000
}

fn default_authentication_timeout() -> u64 {
    20_000
}

fn default_parameter_timeout() -> u64 {
    3_000
}

fn default_pilot_c_timeout() -> u64 {
    30_000
}

fn default_precharge_timeout() -> u64 {
    10_000
}

fn default_ramp_steps() -> u32 {
    13
}

fn default_ramp_step() -> u64 {
    200
}

fn default_charge_timeout() -> u64 {
    3_000
}

fn default_status_interval() -> u64 {
    1_000
}

fn default_pilot_b_timeout() -> u64 {
    40_000
}

fn default_response_delay() -> u64 {
    1_000
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            preflight_timeout_ms: default_preflight_timeout(),
            plugin_poll_ms: default_plugin_poll(),
            init_timeout_ms: default_init_timeout(),
            authentication_timeout_ms: default_authentication_timeout(),
            parameter_timeout_ms: default_parameter_timeout(),
            ev_limits_timeout_ms: None,
            isolation_timeout_ms: None,
            pilot_c_timeout_ms: default_pilot_c_timeout(),
            precharge_timeout_ms: default_precharge_timeout(),
            targets_timeout_ms: None,
            ramp_steps: default_ramp_steps(),
            ramp_step_ms: default_ramp_step(),
            charge_timeout_ms: default_charge_timeout(),
            status_interval_ms: default_status_interval(),
            charge_info_timeout_ms: None,
            pilot_b_timeout_ms: default_pilot_b_timeout(),
            unplug_timeout_ms: None,
            response_delay_ms: default_response_delay(),
        }
    }
}

/// Milliseconds to a bounded or unbounded timeout
pub(crate) fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

impl SessionTimings {
    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_millis(self.preflight_timeout_ms)
    }

    pub fn plugin_poll(&self) -> Duration {
        Duration::from_millis(self.plugin_poll_ms)
    }

    pub fn ramp_step(&self) -> Duration {
        Duration::from_millis(self.ramp_step_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

/// Complete station driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Value published on `EVSEID`
    #[serde(default = "default_evse_id")]
    pub evse_id: u32,

    #[serde(default)]
    pub limits: ChargeLimits,

    #[serde(default)]
    pub timings: SessionTimings,
}

fn default_evse_id() -> u32 {
    0xDEAD_BEEF
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            evse_id: default_evse_id(),
            limits: ChargeLimits::default(),
            timings: SessionTimings::default(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session walk cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timings.ramp_steps == 0 {
            return Err(ConfigError::Invalid(
                "timings.ramp_steps must be at least 1".to_string(),
            ));
        }
        if self.timings.plugin_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "timings.plugin_poll_ms must be greater than 0".to_string(),
            ));
        }
        if self.limits.min_voltage > self.limits.max_voltage {
            return Err(ConfigError::Invalid(format!(
                "limits.min_voltage ({}) exceeds limits.max_voltage ({})",
                self.limits.min_voltage, self.limits.max_voltage
            )));
        }
        if self.limits.min_current > self.limits.max_current {
            return Err(ConfigError::Invalid(format!(
                "limits.min_current ({}) exceeds limits.max_current ({})",
                self.limits.min_current, self.limits.max_current
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.evse_id, 0xDEADBEEF);
        assert_eq!(config.limits.max_current, 500.0);
        assert_eq!(config.limits.min_voltage, 10.0);
        assert_eq!(config.timings.ramp_steps, 13);
        assert_eq!(config.timings.isolation_timeout_ms, None);
        assert_eq!(config.timings.preflight_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml() {
        let config = DriverConfig::from_toml(
            r#"
evse_id = 42

[limits]
max_current = 200.0

[timings]
isolation_timeout_ms = 60000
ramp_steps = 5
"#,
        )
        .unwrap();

        assert_eq!(config.evse_id, 42);
        assert_eq!(config.limits.max_current, 200.0);
        assert_eq!(config.limits.max_voltage, 1000.0);
        assert_eq!(config.timings.isolation_timeout_ms, Some(60_000));
        assert_eq!(config.timings.ramp_steps, 5);
        assert_eq!(config.timings.init_timeout_ms, 20_000);
    }

    #[test]
    fn test_invalid_ramp_rejected() {
        let err = DriverConfig::from_toml("[timings]\nramp_steps = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        std::fs::write(&path, "evse_id = 7\n").unwrap();

        let config = DriverConfig::load(&path).unwrap();
        assert_eq!(config.evse_id, 7);
        assert_eq!(config.limits, ChargeLimits::default());
    }
}
