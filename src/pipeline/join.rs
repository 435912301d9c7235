//! OTAA join handling
//!
//! A join request is checked (known device, matching application, valid
//! MIC, unused DevNonce) before anything is written. Session keys and the
//! assigned address are then stored in a single device update, so a failed
//! join never leaves partial key material behind.

use super::Shared;
use crate::context::FrameContext;
use crate::error::{CryptoError, JoinError, LoraError};
use crate::metrics::PipelineEvent;
use crate::protocol::{
    DevAddr, DlSettings, JoinAcceptPayload, JoinRequestPayload, MType, MacPayload, PhyPayload,
};
use crate::security::derive_session_keys;
use tracing::{info, warn};

/// Process a join request, returning the join-accept context on success
pub(crate) fn handle(shared: &Shared, ctx: FrameContext) -> Option<FrameContext> {
    match process(shared, ctx) {
        Ok(ctx) => {
            shared.metrics.record(PipelineEvent::JoinAccepted);
            Some(ctx)
        }
        Err(LoraError::Storage(e)) => {
            shared.storage_failed("processing join request", &e);
            shared.metrics.record(PipelineEvent::JoinRejected);
            None
        }
        Err(e) => {
            warn!("Join request rejected: {}", e);
            shared.metrics.record(PipelineEvent::JoinRejected);
            None
        }
    }
}

fn process(shared: &Shared, mut ctx: FrameContext) -> Result<FrameContext, LoraError> {
    let request: JoinRequestPayload = match &ctx.frame.mac_payload {
        MacPayload::JoinRequest(request) => *request,
        _ => return Err(CryptoError::WrongFrameType(ctx.frame.mhdr.mtype).into()),
    };
    let config = &shared.config;

    let mut device = match shared.storage.get_device(&request.dev_eui) {
        Ok(device) => device,
        Err(e) if e.is_not_found() => return Err(JoinError::UnknownDevice(request.dev_eui).into()),
        Err(e) => return Err(e.into()),
    };

    if device.app_eui != request.app_eui {
        return Err(JoinError::ApplicationMismatch {
            expected: device.app_eui,
            actual: request.app_eui,
        }
        .into());
    }

    if !ctx.frame.validate_join_mic(&device.app_key)? {
        return Err(CryptoError::MicMismatch.into());
    }

    let nonce_reused = JoinError::DevNonceReused {
        dev_eui: device.dev_eui,
        nonce: request.dev_nonce,
    };
    if !config.skip_dev_nonce_check && device.has_used_nonce(request.dev_nonce) {
        return Err(nonce_reused.into());
    }

    let application = shared.storage.get_application(&device.app_eui)?;
    let app_nonce = application.next_app_nonce();
    let keys = derive_session_keys(&device.app_key, app_nonce, config.net_id, request.dev_nonce);

    let dev_addr = *device
        .dev_addr
        .get_or_insert_with(|| DevAddr::random(config.net_id));

    // Concurrent requests with the same nonce race here; storage picks one
    match shared
        .storage
        .add_dev_nonce(&device.dev_eui, request.dev_nonce, config.dev_nonce_history)
    {
        Ok(()) => {}
        Err(e) if e.is_already_exists() && config.skip_dev_nonce_check => {}
        Err(e) if e.is_already_exists() => return Err(nonce_reused.into()),
        Err(e) => return Err(e.into()),
    }
    device.record_nonce(request.dev_nonce, config.dev_nonce_history);
    device.set_session_keys(keys);
    device.reset_frame_counters();
    shared.storage.update_device(&device)?;

    info!(
        dev_eui = %device.dev_eui,
        dev_addr = %dev_addr,
        dev_nonce = %request.dev_nonce,
        "Join accepted"
    );

    ctx.frame = PhyPayload::new(
        MType::JoinAccept,
        MacPayload::JoinAccept(JoinAcceptPayload {
            app_nonce,
            net_id: config.net_id,
            dev_addr,
            dl_settings: DlSettings {
                rx1_dr_offset: config.join.rx1_dr_offset,
                rx2_data_rate: config.join.rx2_data_rate,
            },
            rx_delay: config.join.rx_delay,
            cf_list: config.join.cf_list.clone(),
        }),
    );
    ctx.device = Some(device);
    ctx.application = Some(application);
    Ok(ctx)
}
