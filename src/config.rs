// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for the pipeline

use crate::error::ConfigError;
use crate::protocol::NetId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Maximum number of CFList frequencies in a join accept
pub const MAX_CF_LIST_LEN: usize = 5;

/// Downlink settings sent in every join accept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinSettings {
    /// RX1 data-rate offset
    pub rx1_dr_offset: u8,
    /// RX2 data rate
    pub rx2_data_rate: u8,
    /// RX1 delay in seconds announced to the device
    pub rx_delay: u8,
    /// Extra channel frequencies in Hz
    pub cf_list: Vec<u32>,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            rx1_dr_offset: 0,
            rx2_data_rate: 0,
            rx_delay: 1,
            cf_list: Vec::new(),
        }
    }
}

/// Pipeline-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Network identifier used for key derivation and address assignment
    pub net_id: NetId,

    /// Time after uplink arrival before a response is built (ms)
    pub collect_window_ms: u64,

    /// RX1 delay for data downlinks (s)
    pub rx1_delay_secs: u64,

    /// JOIN_ACCEPT_DELAY1 (s)
    pub join_accept_delay_secs: u64,

    /// Settings advertised in join accepts
    pub join: JoinSettings,

    /// Accept reused join nonces
    pub skip_dev_nonce_check: bool,

    /// Number of join nonces remembered per device
    pub dev_nonce_history: usize,

    /// Capacity of the channels between stages
    pub channel_capacity: usize,

    /// Downlink transmit power (dBm)
    pub tx_power: i8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            net_id: NetId([0x00, 0x00, 0x01]),
            collect_window_ms: 200,
            rx1_delay_secs: 1,
            join_accept_delay_secs: 5,
            join: JoinSettings::default(),
            skip_dev_nonce_check: false,
            dev_nonce_history: 10,
            channel_capacity: 1,
            tx_power: 14,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with a custom collect window
    pub fn with_collect_window(window: Duration) -> Self {
        Self {
            collect_window_ms: window.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Create a configuration for a specific network
    pub fn with_net_id(net_id: NetId) -> Self {
        Self {
            net_id,
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be > 0".into()));
        }
        if self.dev_nonce_history == 0 {
            return Err(ConfigError::Invalid(
                "dev_nonce_history must be > 0".into(),
            ));
        }
        if self.join.cf_list.len() > MAX_CF_LIST_LEN {
            return Err(ConfigError::Invalid(format!(
                "cf_list holds at most {} frequencies, got {}",
                MAX_CF_LIST_LEN,
                self.join.cf_list.len()
            )));
        }
        if self.join.rx1_dr_offset > 7 || self.join.rx2_data_rate > 15 {
            return Err(ConfigError::Invalid("join data-rate settings out of range".into()));
        }
        if self.collect_window() > self.rx1_delay() {
            return Err(ConfigError::Invalid(
                "collect window must not exceed the RX1 delay".into(),
            ));
        }
        Ok(())
    }

    pub fn collect_window(&self) -> Duration {
        Duration::from_millis(self.collect_window_ms)
    }

    pub fn rx1_delay(&self) -> Duration {
        Duration::from_secs(self.rx1_delay_secs)
    }

    pub fn join_accept_delay(&self) -> Duration {
        Duration::from_secs(self.join_accept_delay_secs)
    }
}
