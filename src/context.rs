// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-frame envelopes threaded through the pipeline
//!
//! An [`RxPacket`] enters from the gateway transport, a [`FrameContext`]
//! travels between the stages and is enriched as it goes, and a
//! [`TxPacket`] leaves towards the gateway transport.

use crate::model::{Application, Device};
use crate::protocol::{Eui64, PhyPayload};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Radio metadata reported by the receiving gateway
#[derive(Debug, Clone, PartialEq)]
pub struct RxInfo {
    pub gateway_eui: Eui64,
    /// Wall-clock reception time
    pub time: DateTime<Utc>,
    /// Concentrator counter at reception (µs)
    pub timestamp: u32,
    /// Frequency in Hz
    pub frequency: u32,
    /// e.g. "SF7BW125"
    pub data_rate: String,
    /// e.g. "4/5"
    pub code_rate: String,
    pub rssi: i16,
    pub lora_snr: f64,
}

impl RxInfo {
    /// Metadata with common EU868 defaults
    pub fn new(gateway_eui: Eui64) -> Self {
        Self {
            gateway_eui,
            time: Utc::now(),
            timestamp: 0,
            frequency: 868_100_000,
            data_rate: "SF7BW125".to_string(),
            code_rate: "4/5".to_string(),
            rssi: -60,
            lora_snr: 7.0,
        }
    }
}

/// Raw uplink as handed over by the gateway transport
#[derive(Debug, Clone)]
pub struct RxPacket {
    pub phy_payload: Vec<u8>,
    pub rx_info: RxInfo,
    /// Local arrival instant; downlink deadlines count from here
    pub received_at: Instant,
}

impl RxPacket {
    /// Packet that arrived now
    pub fn new(phy_payload: Vec<u8>, rx_info: RxInfo) -> Self {
        Self {
            phy_payload,
            rx_info,
            received_at: Instant::now(),
        }
    }
}

/// Transmission parameters for a downlink
#[derive(Debug, Clone, PartialEq)]
pub struct TxInfo {
    pub gateway_eui: Eui64,
    /// Send as soon as possible instead of at `timestamp`
    pub immediately: bool,
    /// Concentrator counter at which to transmit (µs)
    pub timestamp: u32,
    pub frequency: u32,
    pub data_rate: String,
    pub code_rate: String,
    /// dBm
    pub power: i8,
}

/// Encoded downlink for the gateway transport
#[derive(Debug, Clone)]
pub struct TxPacket {
    pub phy_payload: Vec<u8>,
    pub tx_info: TxInfo,
    /// Latest instant at which the gateway must have the frame
    pub deadline: Instant,
}

/// Frame envelope passed between stages
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// The uplink that triggered this context
    pub rx: RxPacket,
    /// Decoded uplink; replaced by the response frame from the scheduler on
    pub frame: PhyPayload,
    /// Resolved by the verifier
    pub device: Option<Device>,
    /// Resolved by the verifier
    pub application: Option<Application>,
    /// `created_at` of the downstream message carried by `frame`
    pub downstream: Option<DateTime<Utc>>,
}

impl FrameContext {
    pub fn new(rx: RxPacket, frame: PhyPayload) -> Self {
        Self {
            rx,
            frame,
            device: None,
            application: None,
            downstream: None,
        }
    }

    pub fn dev_eui(&self) -> Option<Eui64> {
        self.device.as_ref().map(|d| d.dev_eui)
    }

    /// RX1 parameters: same channel as the uplink, `delay` after it
    pub fn tx_info(&self, delay: Duration, power: i8) -> TxInfo {
        let info = &self.rx.rx_info;
        TxInfo {
            gateway_eui: info.gateway_eui,
            immediately: false,
            timestamp: info.timestamp.wrapping_add(delay.as_micros() as u32),
            frequency: info.frequency,
            data_rate: info.data_rate.clone(),
            code_rate: info.code_rate.clone(),
            power,
        }
    }

    /// Arrival instant plus `delay`
    pub fn deadline(&self, delay: Duration) -> Instant {
        self.rx.received_at + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MType, MacPayload};

    #[test]
    fn test_tx_info_follows_uplink() {
        let mut rx_info = RxInfo::new(Eui64([1; 8]));
        rx_info.timestamp = u32::MAX - 10;
        let ctx = FrameContext::new(
            RxPacket::new(vec![], rx_info),
            PhyPayload::new(MType::UnconfirmedDataUp, MacPayload::Raw(vec![])),
        );

        let tx = ctx.tx_info(Duration::from_secs(1), 14);
        assert_eq!(tx.gateway_eui, Eui64([1; 8]));
        assert_eq!(tx.frequency, 868_100_000);
        assert_eq!(tx.timestamp, 999_989);
        assert!(!tx.immediately);
        assert_eq!(tx.power, 14);

        assert_eq!(
            ctx.deadline(Duration::from_secs(5)) - ctx.rx.received_at,
            Duration::from_secs(5)
        );
        assert!(ctx.dev_eui().is_none());
    }
}
