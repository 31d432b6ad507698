//! evsim configuration
//!
//! One TOML file holds the station driver, the controller simulator and the
//! transport settings. Every section is optional.

use std::path::{Path, PathBuf};

use anyhow::Context;
use evsim_charge::{DriverConfig, SimulatorConfig};
use serde::{Deserialize, Serialize};

/// Complete evsim configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvsimConfig {
    /// Station driver
    #[serde(default)]
    pub driver: DriverConfig,

    /// Controller simulator (virtual transport only)
    #[serde(default)]
    pub simulator: SimulatorConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl EvsimConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.driver.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// CAN interface for the SocketCAN transport
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Transmit cycle of the virtual bus
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,

    /// Catalog of the charge controller network
    #[serde(default = "default_station_catalog")]
    pub station_catalog: PathBuf,

    /// Catalog of the vehicle-side network (CAN mode)
    #[serde(default = "default_vehicle_catalog")]
    pub vehicle_catalog: PathBuf,

    /// Node under test on the controller network
    #[serde(default = "default_station_dut")]
    pub station_dut: String,

    /// Node under test on the vehicle-side network
    #[serde(default = "default_vehicle_dut")]
    pub vehicle_dut: String,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_cycle_ms() -> u64 {
    100
}

fn default_station_catalog() -> PathBuf {
    PathBuf::from("config/catalogs/isc_cme.yaml")
}

fn default_vehicle_catalog() -> PathBuf {
    PathBuf::from("config/catalogs/isc_cms.yaml")
}

fn default_station_dut() -> String {
    "CME".to_string()
}

fn default_vehicle_dut() -> String {
    "CMS".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            cycle_ms: default_cycle_ms(),
            station_catalog: default_station_catalog(),
            vehicle_catalog: default_vehicle_catalog(),
            station_dut: default_station_dut(),
            vehicle_dut: default_vehicle_dut(),
        }
    }
}
