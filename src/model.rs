// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Persistent records: devices, applications and queued messages
//!
//! These are the values the [`Storage`](crate::storage::Storage)
//! collaborator holds. Pipeline stages always read a fresh copy, mutate it
//! locally and write it back; storage is the only source of truth between
//! stages.

use crate::protocol::{AppNonce, DevAddr, DevNonce, Eui64};
use crate::security::{Aes128Key, SessionKeys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A provisioned end device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Globally unique identity
    pub dev_eui: Eui64,
    /// Owning application
    pub app_eui: Eui64,
    /// Network address, assigned on join for OTAA devices
    pub dev_addr: Option<DevAddr>,
    pub app_key: Aes128Key,
    pub app_s_key: Aes128Key,
    pub nwk_s_key: Aes128Key,
    /// Next expected uplink counter (last accepted + 1)
    pub fcnt_up: u32,
    /// Counter for the next downlink
    pub fcnt_down: u32,
    /// Accept counter regressions instead of rejecting them
    pub relax_fcnt: bool,
    /// Recently consumed join nonces, oldest first
    pub used_dev_nonces: Vec<DevNonce>,
    /// Another device matched the same frame MIC
    pub duplicate_key_warning: bool,
}

impl Device {
    /// OTAA device: only the AppKey is known until it joins
    pub fn otaa(dev_eui: Eui64, app_eui: Eui64, app_key: Aes128Key) -> Self {
        Self {
            dev_eui,
            app_eui,
            dev_addr: None,
            app_key,
            app_s_key: Aes128Key::default(),
            nwk_s_key: Aes128Key::default(),
            fcnt_up: 0,
            fcnt_down: 0,
            relax_fcnt: false,
            used_dev_nonces: Vec::new(),
            duplicate_key_warning: false,
        }
    }

    /// ABP device with statically provisioned session keys
    pub fn abp(
        dev_eui: Eui64,
        app_eui: Eui64,
        dev_addr: DevAddr,
        nwk_s_key: Aes128Key,
        app_s_key: Aes128Key,
    ) -> Self {
        Self {
            dev_addr: Some(dev_addr),
            nwk_s_key,
            app_s_key,
            ..Self::otaa(dev_eui, app_eui, Aes128Key::default())
        }
    }

    /// Enable relaxed frame-counter checking
    pub fn with_relaxed_fcnt(mut self) -> Self {
        self.relax_fcnt = true;
        self
    }

    /// Session keys as a pair
    pub fn session_keys(&self) -> SessionKeys {
        SessionKeys {
            nwk_s_key: self.nwk_s_key,
            app_s_key: self.app_s_key,
        }
    }

    /// Install freshly derived session keys
    pub fn set_session_keys(&mut self, keys: SessionKeys) {
        self.nwk_s_key = keys.nwk_s_key;
        self.app_s_key = keys.app_s_key;
    }

    /// Whether a join nonce has already been consumed
    pub fn has_used_nonce(&self, nonce: DevNonce) -> bool {
        self.used_dev_nonces.contains(&nonce)
    }

    /// Record a join nonce, evicting the oldest beyond `history`
    pub fn record_nonce(&mut self, nonce: DevNonce, history: usize) {
        if !self.has_used_nonce(nonce) {
            self.used_dev_nonces.push(nonce);
        }
        if self.used_dev_nonces.len() > history {
            let excess = self.used_dev_nonces.len() - history;
            self.used_dev_nonces.drain(..excess);
        }
    }

    /// Reset both frame counters (new session)
    pub fn reset_frame_counters(&mut self) {
        self.fcnt_up = 0;
        self.fcnt_down = 0;
    }
}

/// An application routing decrypted payloads to its subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub app_eui: Eui64,
    pub name: String,
}

impl Application {
    pub fn new(app_eui: Eui64, name: impl Into<String>) -> Self {
        Self {
            app_eui,
            name: name.into(),
        }
    }

    /// Fresh nonce for a join accept
    pub fn next_app_nonce(&self) -> AppNonce {
        AppNonce(rand::random())
    }
}

/// One authenticated, decrypted uplink. Write-once per (device, time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub dev_eui: Eui64,
    pub time: DateTime<Utc>,
    /// Address declared in the frame
    pub dev_addr: DevAddr,
    pub fcnt: u32,
    pub f_port: Option<u8>,
    pub payload: Vec<u8>,
    pub gateway_eui: Eui64,
    pub rssi: i16,
    pub lora_snr: f64,
    pub frequency: u32,
    pub data_rate: String,
}

/// Lifecycle of a queued downlink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamState {
    /// Waiting for a transmission opportunity
    Unsent,
    /// Transmitted, no acknowledgment recorded
    Sent,
    /// Acknowledged by the device
    Acknowledged,
}

/// A queued application payload for a device. At most one per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamMessage {
    pub dev_eui: Eui64,
    /// Identity of this message within the device's queue
    pub created_at: DateTime<Utc>,
    pub f_port: u8,
    /// Request an acknowledgment from the device
    pub confirmed: bool,
    pub payload: Vec<u8>,
    pub sent_at: Option<DateTime<Utc>>,
    pub ack_at: Option<DateTime<Utc>>,
}

impl DownstreamMessage {
    pub fn new(dev_eui: Eui64, f_port: u8, confirmed: bool, payload: Vec<u8>) -> Self {
        Self {
            dev_eui,
            created_at: Utc::now(),
            f_port,
            confirmed,
            payload,
            sent_at: None,
            ack_at: None,
        }
    }

    pub fn state(&self) -> DownstreamState {
        match (self.sent_at, self.ack_at) {
            (_, Some(_)) => DownstreamState::Acknowledged,
            (Some(_), None) => DownstreamState::Sent,
            (None, None) => DownstreamState::Unsent,
        }
    }

    /// Sent (unconfirmed) or acknowledged (confirmed)
    pub fn is_complete(&self) -> bool {
        if self.confirmed {
            self.ack_at.is_some()
        } else {
            self.sent_at.is_some()
        }
    }

    /// Record a transmission
    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.sent_at = Some(at);
    }

    /// Record an acknowledgment. Only the first ack of a sent, confirmed
    /// message has an effect; returns whether the state changed.
    pub fn acknowledge(&mut self, at: DateTime<Utc>) -> bool {
        if !self.confirmed || self.sent_at.is_none() || self.ack_at.is_some() {
            return false;
        }
        self.ack_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn eui(b: u8) -> Eui64 {
        Eui64([b; 8])
    }

    #[test]
    fn test_unconfirmed_lifecycle() {
        let mut msg = DownstreamMessage::new(eui(1), 10, false, vec![1, 2, 3]);
        assert_eq!(msg.state(), DownstreamState::Unsent);
        assert!(!msg.is_complete());

        msg.mark_sent(Utc::now());
        assert_eq!(msg.state(), DownstreamState::Sent);
        assert!(msg.is_complete());

        // Ack is meaningless for unconfirmed messages
        assert!(!msg.acknowledge(Utc::now()));
        assert_eq!(msg.state(), DownstreamState::Sent);
    }

    #[test]
    fn test_confirmed_lifecycle() {
        let mut msg = DownstreamMessage::new(eui(1), 10, true, vec![1]);
        assert!(!msg.acknowledge(Utc::now()), "unsent message cannot be acked");

        msg.mark_sent(Utc::now());
        assert!(!msg.is_complete());

        let first = Utc::now();
        assert!(msg.acknowledge(first));
        assert_eq!(msg.state(), DownstreamState::Acknowledged);
        assert!(msg.is_complete());
    }

    #[test]
    fn test_repeated_ack_keeps_first_time() {
        let mut msg = DownstreamMessage::new(eui(1), 1, true, vec![]);
        msg.mark_sent(Utc::now());

        let first = Utc::now();
        assert!(msg.acknowledge(first));
        assert!(!msg.acknowledge(first + Duration::seconds(30)));
        assert_eq!(msg.ack_at, Some(first));
    }

    #[test]
    fn test_nonce_history_bounded() {
        let mut device = Device::otaa(eui(1), eui(2), Aes128Key([1; 16]));
        for n in 0..15 {
            device.record_nonce(DevNonce(n), 10);
        }
        assert_eq!(device.used_dev_nonces.len(), 10);
        assert!(!device.has_used_nonce(DevNonce(4)));
        assert!(device.has_used_nonce(DevNonce(5)));
        assert!(device.has_used_nonce(DevNonce(14)));

        device.record_nonce(DevNonce(14), 10);
        assert_eq!(device.used_dev_nonces.len(), 10);
    }

    #[test]
    fn test_abp_device() {
        let device = Device::abp(
            eui(1),
            eui(2),
            DevAddr([1, 2, 3, 4]),
            Aes128Key([3; 16]),
            Aes128Key([4; 16]),
        )
        .with_relaxed_fcnt();
        assert_eq!(device.dev_addr, Some(DevAddr([1, 2, 3, 4])));
        assert!(device.relax_fcnt);
        assert_eq!(device.session_keys().app_s_key, Aes128Key([4; 16]));
    }

    #[test]
    fn test_device_serde_roundtrip() {
        let device = Device::otaa(eui(1), eui(2), Aes128Key([7; 16]));
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"0101010101010101\""));
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(back, device);
    }
}
