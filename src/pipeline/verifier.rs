// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Verifier / decrypter stage
//!
//! Resolves the sending device(s) of a data uplink, authenticates the frame
//! against every device registered under its address, enforces the frame
//! counter policy, decrypts, persists and publishes. Join requests are
//! handed to [`join`](super::join).
//!
//! A device address is not unique, so one frame may yield several accepted
//! contexts: one per device whose NwkSKey verifies the MIC.

use super::{join, Shared};
use crate::context::FrameContext;
use crate::metrics::PipelineEvent;
use crate::model::{Device, UpstreamMessage};
use crate::protocol::{expand_fcnt, DataPayload, MType, MIC_SIZE};
use crate::publish::ApplicationPayload;
use crate::security::{data_mic, Direction};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut input: mpsc::Receiver<FrameContext>,
    output: mpsc::Sender<FrameContext>,
) {
    while let Some(ctx) = input.recv().await {
        let shared = shared.clone();
        let output = output.clone();
        tokio::spawn(async move {
            let accepted = if ctx.frame.mhdr.mtype == MType::JoinRequest {
                join::handle(&shared, ctx).into_iter().collect()
            } else {
                verify(&shared, ctx)
            };
            for ctx in accepted {
                if output.send(ctx).await.is_err() {
                    break;
                }
            }
        });
    }
    debug!("Verifier input closed");
}

/// A candidate whose NwkSKey verified the MIC, with the counter it used
struct Matched {
    device: Device,
    fcnt: u32,
}

/// 32-bit counters the device may have signed a frame with, most likely
/// first. Forward jumps of [`MAX_FCNT_GAP`](crate::protocol::MAX_FCNT_GAP)
/// or more are covered by the current and next 16-bit epochs; relaxed
/// devices that restarted their counter also get the bare 16-bit value.
fn fcnt_candidates(device: &Device, received: u16) -> Vec<u32> {
    let expanded = expand_fcnt(device.fcnt_up, received);
    let in_epoch = (device.fcnt_up & 0xffff_0000) | u32::from(received);

    let mut candidates = vec![expanded];
    let mut push = |fcnt: u32| {
        if !candidates.contains(&fcnt) {
            candidates.push(fcnt);
        }
    };
    push(in_epoch);
    if let Some(next_epoch) = in_epoch.checked_add(0x1_0000) {
        push(next_epoch);
    }
    if device.relax_fcnt {
        push(u32::from(received));
    }
    candidates
}

/// Check the raw MIC against one candidate. Whether the counter is
/// acceptable is decided afterwards, in [`accept`].
fn match_device(raw: &[u8], data: &DataPayload, device: Device) -> Option<Matched> {
    let (signed, mic) = raw.split_at(raw.len() - MIC_SIZE);
    let addr = &data.fhdr.dev_addr;
    let key = &device.nwk_s_key;
    let candidates = fcnt_candidates(&device, data.fhdr.f_cnt);

    candidates
        .into_iter()
        .find(|&fcnt| data_mic(key, Direction::Uplink, addr, fcnt, signed) == mic)
        .map(|fcnt| Matched { device, fcnt })
}

/// Verify one data uplink, returning a context per accepted device
pub(crate) fn verify(shared: &Shared, ctx: FrameContext) -> Vec<FrameContext> {
    let mtype = ctx.frame.mhdr.mtype;
    let data = match ctx.frame.data() {
        Some(data) if mtype.is_uplink() => data,
        _ => {
            debug!(mtype = %mtype, "Not a data uplink, dropped");
            return Vec::new();
        }
    };
    let dev_addr = data.fhdr.dev_addr;

    let candidates = match shared.storage.get_devices_by_addr(&dev_addr) {
        Ok(devices) => devices,
        Err(e) => {
            shared.storage_failed("looking up devices by address", &e);
            return Vec::new();
        }
    };

    let raw = &ctx.rx.phy_payload;
    if raw.len() < 1 + MIC_SIZE {
        warn!(dev_addr = %dev_addr, "Frame too short to carry a MIC");
        shared.metrics.record(PipelineEvent::MicRejected);
        return Vec::new();
    }

    if candidates.is_empty() {
        debug!(dev_addr = %dev_addr, "No device registered under address");
        return Vec::new();
    }

    let checked = candidates.len();
    let matched: Vec<Matched> = candidates
        .into_iter()
        .filter_map(|device| match_device(raw, data, device))
        .collect();

    if matched.is_empty() {
        warn!(
            dev_addr = %dev_addr,
            candidates = checked,
            "MIC verification failed for every candidate"
        );
        shared.metrics.record(PipelineEvent::MicRejected);
        return Vec::new();
    }

    let duplicate_keys = matched.len() > 1;
    matched
        .into_iter()
        .filter_map(|m| accept(shared, &ctx, m, duplicate_keys))
        .collect()
}

/// Steps after authentication, for one matching device
fn accept(
    shared: &Shared,
    ctx: &FrameContext,
    matched: Matched,
    duplicate_keys: bool,
) -> Option<FrameContext> {
    let Matched { mut device, fcnt } = matched;
    let dev_eui = device.dev_eui;

    if duplicate_keys {
        warn!(dev_eui = %dev_eui, "Several devices share this address and key");
        device.duplicate_key_warning = true;
        if let Err(e) = shared.storage.set_duplicate_key_warning(&dev_eui, true) {
            shared.storage_failed("flagging duplicate key", &e);
        }
    }

    if !device.relax_fcnt && fcnt == u32::MAX && device.fcnt_up == u32::MAX {
        warn!(dev_eui = %dev_eui, "Uplink counter exhausted, device must rejoin");
        shared.metrics.record(PipelineEvent::FCntRejected);
        return None;
    }

    if fcnt < device.fcnt_up {
        if !device.relax_fcnt {
            info!(
                dev_eui = %dev_eui,
                fcnt,
                expected = device.fcnt_up,
                "Frame counter behind, rejected"
            );
            shared.metrics.record(PipelineEvent::FCntRejected);
            return None;
        }
        warn!(
            dev_eui = %dev_eui,
            fcnt,
            expected = device.fcnt_up,
            "Frame counter mismatch on relaxed device, accepted"
        );
    }

    device.fcnt_up = match shared.storage.advance_fcnt_up(&dev_eui, fcnt) {
        Ok(stored) => stored,
        Err(e) => {
            shared.storage_failed("advancing uplink counter", &e);
            return None;
        }
    };

    let mut frame = ctx.frame.clone();
    if let Err(e) = frame.crypt_frm_payload(&device.session_keys(), fcnt) {
        warn!(dev_eui = %dev_eui, "Payload decryption failed: {}", e);
        return None;
    }
    let data = frame.data()?.clone();

    let rx_info = &ctx.rx.rx_info;
    let upstream = UpstreamMessage {
        dev_eui,
        time: rx_info.time,
        dev_addr: data.fhdr.dev_addr,
        fcnt,
        f_port: data.f_port,
        payload: data.frm_payload.clone(),
        gateway_eui: rx_info.gateway_eui,
        rssi: rx_info.rssi,
        lora_snr: rx_info.lora_snr,
        frequency: rx_info.frequency,
        data_rate: rx_info.data_rate.clone(),
    };
    if let Err(e) = shared.storage.create_upstream(upstream) {
        if e.is_already_exists() {
            debug!(dev_eui = %dev_eui, "Uplink already stored");
        } else {
            shared.storage_failed("storing uplink", &e);
        }
    }

    let application = match shared.storage.get_application(&device.app_eui) {
        Ok(app) => app,
        Err(e) => {
            shared.storage_failed("resolving application", &e);
            return None;
        }
    };

    if frame.mhdr.mtype.is_confirmed() {
        shared.output.set_ack(dev_eui);
    }

    match shared.storage.get_downstream(&dev_eui) {
        Ok(mut message) => {
            if data.fhdr.f_ctrl.ack && message.acknowledge(Utc::now()) {
                match shared.storage.update_downstream(&message) {
                    Ok(()) => info!(dev_eui = %dev_eui, "Downstream message acknowledged"),
                    Err(e) => shared.storage_failed("recording acknowledgment", &e),
                }
            }
            if !message.is_complete() {
                shared.output.set_data(&message);
            }
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => shared.storage_failed("reading downstream message", &e),
    }

    if let Some(f_port) = data.f_port.filter(|&p| p > 0) {
        shared.publisher.publish(ApplicationPayload {
            app_eui: application.app_eui,
            dev_eui,
            dev_addr: data.fhdr.dev_addr,
            fcnt,
            f_port,
            payload: data.frm_payload.clone(),
            time: rx_info.time,
            gateway_eui: rx_info.gateway_eui,
            rssi: rx_info.rssi,
            lora_snr: rx_info.lora_snr,
        });
    }

    debug!(dev_eui = %dev_eui, fcnt, "Uplink accepted");
    shared.metrics.record(PipelineEvent::UplinkAccepted);

    Some(FrameContext {
        rx: ctx.rx.clone(),
        frame,
        device: Some(device),
        application: Some(application),
        downstream: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::{RxInfo, RxPacket};
    use crate::model::{Application, DownstreamMessage};
    use crate::protocol::{DevAddr, Eui64, FCtrl, Fhdr, MacPayload, PhyPayload};
    use crate::security::{Aes128Key, SessionKeys};
    use crate::storage::{MemoryStore, Storage};

    const APP: Eui64 = Eui64([0xaa; 8]);
    const ADDR: DevAddr = DevAddr([0x26, 0x01, 0x02, 0x03]);

    fn device(b: u8) -> Device {
        Device::abp(Eui64([b; 8]), APP, ADDR, Aes128Key([b; 16]), Aes128Key([b + 1; 16]))
    }

    fn setup(devices: &[Device]) -> (Arc<Shared>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.create_application(Application::new(APP, "test")).unwrap();
        for d in devices {
            store.create_device(d.clone()).unwrap();
        }
        (Shared::for_tests(PipelineConfig::default(), store.clone()), store)
    }

    /// Frame as the device would send it
    fn uplink(device: &Device, mtype: MType, fcnt: u32, ack: bool, payload: &[u8]) -> FrameContext {
        let mut frame = PhyPayload::new(
            mtype,
            MacPayload::Data(DataPayload {
                fhdr: Fhdr {
                    dev_addr: ADDR,
                    f_ctrl: FCtrl {
                        ack,
                        ..Default::default()
                    },
                    f_cnt: fcnt as u16,
                    f_opts: vec![],
                },
                f_port: Some(10),
                frm_payload: payload.to_vec(),
            }),
        );
        let keys = SessionKeys {
            nwk_s_key: device.nwk_s_key,
            app_s_key: device.app_s_key,
        };
        frame.crypt_frm_payload(&keys, fcnt).unwrap();
        frame.set_data_mic(&device.nwk_s_key, fcnt).unwrap();
        let bytes = frame.to_bytes().unwrap();
        let decoded = PhyPayload::from_bytes(&bytes).unwrap();
        FrameContext::new(RxPacket::new(bytes, RxInfo::new(Eui64([0xee; 8]))), decoded)
    }

    #[test]
    fn test_accepts_and_decrypts() {
        let d = device(1);
        let (shared, store) = setup(&[d.clone()]);

        let out = verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 3, false, b"hello"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame.data().unwrap().frm_payload, b"hello");
        assert_eq!(out[0].dev_eui(), Some(d.dev_eui));
        assert!(out[0].application.is_some());

        assert_eq!(store.get_device(&d.dev_eui).unwrap().fcnt_up, 4);
        let stored = store.upstream_messages(&d.dev_eui).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, b"hello");
        assert!(!shared.output.pending(&d.dev_eui));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let d = device(1);
        let (shared, store) = setup(&[d.clone()]);
        let mut impostor = d.clone();
        impostor.nwk_s_key = Aes128Key([0x55; 16]);

        let out = verify(&shared, uplink(&impostor, MType::UnconfirmedDataUp, 1, false, b"x"));
        assert!(out.is_empty());
        assert_eq!(store.get_device(&d.dev_eui).unwrap().fcnt_up, 0);
        assert_eq!(shared.metrics.get(PipelineEvent::MicRejected), 1);
    }

    #[test]
    fn test_strict_counter_rejects_replay() {
        let d = device(1);
        let (shared, store) = setup(&[d.clone()]);

        assert_eq!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 5, false, b"a")).len(), 1);
        let replay = uplink(&d, MType::UnconfirmedDataUp, 5, false, b"a");
        assert!(verify(&shared, replay).is_empty());
        assert!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 2, false, b"b")).is_empty());

        assert_eq!(store.get_device(&d.dev_eui).unwrap().fcnt_up, 6);
        assert_eq!(store.upstream_messages(&d.dev_eui).unwrap().len(), 1);
        assert_eq!(shared.metrics.get(PipelineEvent::FCntRejected), 2);
    }

    #[test]
    fn test_strict_counter_accepts_large_forward_jump() {
        let d = device(1);
        let (shared, store) = setup(&[d.clone()]);

        let out = verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 20_000, false, b"j"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame.data().unwrap().frm_payload, b"j");
        assert_eq!(store.get_device(&d.dev_eui).unwrap().fcnt_up, 20_001);
        assert_eq!(shared.metrics.get(PipelineEvent::MicRejected), 0);

        // Still strict afterwards
        assert!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 19_999, false, b"k")).is_empty());
        assert_eq!(shared.metrics.get(PipelineEvent::FCntRejected), 1);
    }

    #[test]
    fn test_strict_counter_accepts_jump_into_next_epoch() {
        let mut d = device(1);
        d.fcnt_up = 0xfff0;
        let (shared, store) = setup(&[d.clone()]);

        // 0x1_4e20 is more than MAX_FCNT_GAP ahead of 0xfff0
        let fcnt = 0x1_4e20;
        assert_eq!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, fcnt, false, b"e")).len(), 1);
        assert_eq!(store.get_device(&d.dev_eui).unwrap().fcnt_up, fcnt + 1);
    }

    #[test]
    fn test_exhausted_counter_is_not_replayable() {
        let mut d = device(1);
        d.fcnt_up = u32::MAX - 1;
        let (shared, store) = setup(&[d.clone()]);

        assert_eq!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, u32::MAX, false, b"m")).len(), 1);
        assert_eq!(store.get_device(&d.dev_eui).unwrap().fcnt_up, u32::MAX);
        assert!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, u32::MAX, false, b"m")).is_empty());
        assert_eq!(store.upstream_messages(&d.dev_eui).unwrap().len(), 1);
    }

    #[test]
    fn test_fcnt_candidates_are_unique() {
        let d = device(1).with_relaxed_fcnt();
        let candidates = fcnt_candidates(&d, 5);
        assert_eq!(candidates, vec![5, 0x1_0005]);

        let mut d = device(1);
        d.fcnt_up = 0x2_0010;
        assert_eq!(fcnt_candidates(&d, 0x0012), vec![0x2_0012, 0x3_0012]);
    }

    #[test]
    fn test_relaxed_counter_accepts_but_never_regresses() {
        let d = device(1).with_relaxed_fcnt();
        let (shared, store) = setup(&[d.clone()]);

        assert_eq!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 10, false, b"a")).len(), 1);
        assert_eq!(verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 2, false, b"b")).len(), 1);
        assert_eq!(store.get_device(&d.dev_eui).unwrap().fcnt_up, 11);
    }

    #[test]
    fn test_duplicate_key_flags_every_match() {
        let a = device(1);
        let mut b = device(2);
        b.nwk_s_key = a.nwk_s_key;
        b.app_s_key = a.app_s_key;
        let (shared, store) = setup(&[a.clone(), b.clone()]);

        let out = verify(&shared, uplink(&a, MType::UnconfirmedDataUp, 1, false, b"z"));
        assert_eq!(out.len(), 2);
        assert!(store.get_device(&a.dev_eui).unwrap().duplicate_key_warning);
        assert!(store.get_device(&b.dev_eui).unwrap().duplicate_key_warning);
    }

    #[test]
    fn test_confirmed_uplink_owes_ack() {
        let d = device(1);
        let (shared, _) = setup(&[d.clone()]);
        verify(&shared, uplink(&d, MType::ConfirmedDataUp, 1, false, b"c"));
        assert!(shared.output.pending(&d.dev_eui));
    }

    #[test]
    fn test_ack_completes_sent_downstream() {
        let d = device(1);
        let (shared, store) = setup(&[d.clone()]);
        let mut msg = DownstreamMessage::new(d.dev_eui, 20, true, vec![9]);
        msg.mark_sent(Utc::now());
        store.create_downstream(msg).unwrap();

        verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 1, true, b""));
        let stored = store.get_downstream(&d.dev_eui).unwrap();
        assert!(stored.ack_at.is_some());
        assert!(!shared.output.pending(&d.dev_eui));
    }

    #[test]
    fn test_incomplete_downstream_is_attached() {
        let d = device(1);
        let (shared, store) = setup(&[d.clone()]);
        store
            .create_downstream(DownstreamMessage::new(d.dev_eui, 20, false, vec![9]))
            .unwrap();

        verify(&shared, uplink(&d, MType::UnconfirmedDataUp, 1, false, b""));
        assert!(shared.output.pending(&d.dev_eui));
    }

    #[test]
    fn test_downlink_frame_ignored() {
        let d = device(1);
        let (shared, _) = setup(&[d.clone()]);
        let out = verify(&shared, uplink(&d, MType::UnconfirmedDataDown, 1, false, b""));
        assert!(out.is_empty());
    }
}
