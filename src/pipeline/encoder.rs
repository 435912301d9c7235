//! Encoder stage
//!
//! Signs and encrypts the scheduled response and hands it to the gateway
//! transport with its transmission parameters and deadline. Device state
//! is always re-read from storage here.

use super::Shared;
use crate::context::{FrameContext, TxPacket};
use crate::error::{EncodeError, LoraError, Result};
use crate::metrics::PipelineEvent;
use crate::protocol::{Eui64, MType};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut input: mpsc::Receiver<FrameContext>,
    output: mpsc::Sender<TxPacket>,
) {
    while let Some(ctx) = input.recv().await {
        let shared = shared.clone();
        let output = output.clone();
        tokio::spawn(async move {
            if let Some(packet) = encode(&shared, ctx) {
                shared.metrics.record(PipelineEvent::DownlinkEmitted);
                let _ = output.send(packet).await;
            }
        });
    }
    debug!("Encoder input closed");
}

/// Encode one scheduled frame; failures are logged and produce nothing
pub(crate) fn encode(shared: &Shared, ctx: FrameContext) -> Option<TxPacket> {
    let mtype = ctx.frame.mhdr.mtype;
    let Some(dev_eui) = ctx.dev_eui() else {
        warn!(mtype = %mtype, "Frame without resolved device reached the encoder");
        return None;
    };

    let result = match mtype {
        MType::JoinAccept => encode_join_accept(shared, ctx, dev_eui),
        MType::UnconfirmedDataDown | MType::ConfirmedDataDown => {
            encode_data_down(shared, ctx, dev_eui)
        }
        other => Err(EncodeError::UnsupportedMType(other).into()),
    };

    match result {
        Ok(packet) => Some(packet),
        Err(LoraError::Storage(e)) => {
            shared.storage_failed("encoding downlink", &e);
            None
        }
        Err(e) => {
            warn!(dev_eui = %dev_eui, mtype = %mtype, "Frame not encoded: {}", e);
            shared.metrics.record(PipelineEvent::EncodeFailed);
            None
        }
    }
}

fn encode_join_accept(shared: &Shared, ctx: FrameContext, dev_eui: Eui64) -> Result<TxPacket> {
    shared.storage.reset_frame_counters(&dev_eui)?;
    let device = shared.storage.get_device(&dev_eui)?;

    let mut frame = ctx.frame.clone();
    frame.set_join_mic(&device.app_key)?;
    let phy_payload = frame.encrypt_join_accept(&device.app_key)?;

    let delay = shared.config.join_accept_delay();
    info!(dev_eui = %dev_eui, "Join accept encoded");
    Ok(TxPacket {
        phy_payload,
        tx_info: ctx.tx_info(delay, shared.config.tx_power),
        deadline: ctx.deadline(delay),
    })
}

fn encode_data_down(shared: &Shared, ctx: FrameContext, dev_eui: Eui64) -> Result<TxPacket> {
    let device = shared.storage.get_device(&dev_eui)?;
    let fcnt = device.fcnt_down;

    let mut frame = ctx.frame.clone();
    if let Some(data) = frame.data_mut() {
        data.fhdr.f_cnt = fcnt as u16;
    }
    frame.crypt_frm_payload(&device.session_keys(), fcnt)?;
    frame.set_data_mic(&device.nwk_s_key, fcnt)?;
    let phy_payload = frame.to_bytes()?;

    if let Some(created_at) = ctx.downstream {
        record_sent(shared, dev_eui, created_at);
    }
    shared.storage.increment_fcnt_down(&dev_eui)?;

    let delay = shared.config.rx1_delay();
    info!(dev_eui = %dev_eui, fcnt, mtype = %frame.mhdr.mtype, "Downlink encoded");
    Ok(TxPacket {
        phy_payload,
        tx_info: ctx.tx_info(delay, shared.config.tx_power),
        deadline: ctx.deadline(delay),
    })
}

/// Stamp the send time on the downstream message the frame carries.
/// A message replaced in the meantime is left alone.
fn record_sent(shared: &Shared, dev_eui: Eui64, created_at: chrono::DateTime<Utc>) {
    match shared.storage.get_downstream(&dev_eui) {
        Ok(mut message) if message.created_at == created_at => {
            message.mark_sent(Utc::now());
            if let Err(e) = shared.storage.update_downstream(&message) {
                shared.storage_failed("recording send time", &e);
            }
        }
        Ok(_) => debug!(dev_eui = %dev_eui, "Downstream message replaced before sending"),
        Err(e) if e.is_not_found() => {
            debug!(dev_eui = %dev_eui, "Downstream message gone before sending")
        }
        Err(e) => shared.storage_failed("reading downstream message", &e),
    }
}
