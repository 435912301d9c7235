// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Frame output buffer
//!
//! The verifier records what a device is owed (an acknowledgment, a queued
//! downstream payload); the scheduler later turns that into at most one
//! downlink frame and clears the entry.

use crate::model::DownstreamMessage;
use crate::protocol::{DataPayload, DevAddr, Eui64, FCtrl, Fhdr, MType, MacPayload, PhyPayload};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct PendingData {
    f_port: u8,
    payload: Vec<u8>,
    confirmed: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct DeviceOutput {
    ack: bool,
    data: Option<PendingData>,
}

/// A plaintext downlink ready for the encoder
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingFrame {
    /// Unsigned frame; FCnt and MIC are filled in by the encoder
    pub frame: PhyPayload,
    /// `created_at` of the downstream message it carries
    pub downstream: Option<DateTime<Utc>>,
}

/// Per-device pending output
#[derive(Debug, Default)]
pub struct FrameOutputBuffer {
    entries: Mutex<HashMap<Eui64, DeviceOutput>>,
}

impl FrameOutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Eui64, DeviceOutput>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An acknowledgment is owed to the device
    pub fn set_ack(&self, dev_eui: Eui64) {
        self.entries().entry(dev_eui).or_default().ack = true;
    }

    /// Attach a downstream payload to the next downlink
    pub fn set_data(&self, message: &DownstreamMessage) {
        self.entries().entry(message.dev_eui).or_default().data = Some(PendingData {
            f_port: message.f_port,
            payload: message.payload.clone(),
            confirmed: message.confirmed,
            created_at: message.created_at,
        });
    }

    /// Whether anything is due for the device
    pub fn pending(&self, dev_eui: &Eui64) -> bool {
        self.entries()
            .get(dev_eui)
            .map_or(false, |e| e.ack || e.data.is_some())
    }

    /// Drop whatever is pending for the device
    pub fn clear(&self, dev_eui: &Eui64) {
        self.entries().remove(dev_eui);
    }

    /// Take the next frame due for the device, if any.
    ///
    /// Data goes out confirmed or unconfirmed as the queued message asks;
    /// an owed ack alone produces an empty port-0 frame.
    pub fn next_frame(&self, dev_eui: &Eui64, dev_addr: DevAddr) -> Option<OutgoingFrame> {
        let entry = self.entries().remove(dev_eui)?;

        let f_ctrl = FCtrl {
            ack: entry.ack,
            ..Default::default()
        };
        let (mtype, f_port, frm_payload, downstream) = match entry.data {
            Some(data) => (
                if data.confirmed {
                    MType::ConfirmedDataDown
                } else {
                    MType::UnconfirmedDataDown
                },
                data.f_port,
                data.payload,
                Some(data.created_at),
            ),
            None if entry.ack => (MType::UnconfirmedDataDown, 0, Vec::new(), None),
            None => return None,
        };

        let payload = DataPayload {
            fhdr: Fhdr {
                dev_addr,
                f_ctrl,
                f_cnt: 0,
                f_opts: Vec::new(),
            },
            f_port: Some(f_port),
            frm_payload,
        };
        Some(OutgoingFrame {
            frame: PhyPayload::new(mtype, MacPayload::Data(payload)),
            downstream,
        })
    }
}
