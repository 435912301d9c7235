// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Application payload publication
//!
//! Decrypted uplinks are handed to application-facing services through a
//! fire-and-forget [`Publisher`]. [`BroadcastPublisher`] fans them out to
//! in-process subscribers, optionally filtered by application.

use crate::protocol::{DevAddr, Eui64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Decrypted uplink as seen by an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationPayload {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub fcnt: u32,
    pub f_port: u8,
    pub payload: Vec<u8>,
    pub time: DateTime<Utc>,
    pub gateway_eui: Eui64,
    pub rssi: i16,
    pub lora_snr: f64,
}

/// Route for decrypted payloads, keyed by application
pub trait Publisher: Send + Sync {
    /// Fire-and-forget; must not block
    fn publish(&self, payload: ApplicationPayload);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, payload: ApplicationPayload) {
        trace!(dev_eui = %payload.dev_eui, "Payload discarded");
    }
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ApplicationPayload>,
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastPublisher {
    /// Publisher keeping up to `capacity` payloads for slow subscribers
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to one application, or to all with `None`
    pub fn subscribe(&self, app_eui: Option<Eui64>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            app_eui,
        }
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, payload: ApplicationPayload) {
        // No subscribers is not an error
        let _ = self.tx.send(payload);
    }
}

/// Receiving side of a [`BroadcastPublisher`]
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ApplicationPayload>,
    app_eui: Option<Eui64>,
}

impl Subscription {
    /// Next payload for this subscription; `None` once the publisher is gone
    pub async fn recv(&mut self) -> Option<ApplicationPayload> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => {
                    if self.app_eui.map_or(true, |eui| eui == payload.app_eui) {
                        return Some(payload);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} payloads skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
