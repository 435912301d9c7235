//! Frame decoder stage

use super::Shared;
use crate::context::{FrameContext, RxPacket};
use crate::metrics::PipelineEvent;
use crate::protocol::PhyPayload;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut input: mpsc::Receiver<RxPacket>,
    output: mpsc::Sender<FrameContext>,
) {
    while let Some(packet) = input.recv().await {
        shared.metrics.record(PipelineEvent::Received);
        let shared = shared.clone();
        let output = output.clone();
        tokio::spawn(async move {
            if let Some(ctx) = decode(&shared, packet) {
                let _ = output.send(ctx).await;
            }
        });
    }
    debug!("Decoder input closed");
}

/// Decode one packet; malformed frames are logged and dropped
pub(crate) fn decode(shared: &Shared, packet: RxPacket) -> Option<FrameContext> {
    match PhyPayload::from_bytes(&packet.phy_payload) {
        Ok(frame) => {
            debug!(
                gateway = %packet.rx_info.gateway_eui,
                mtype = %frame.mhdr.mtype,
                "Frame decoded"
            );
            Some(FrameContext::new(packet, frame))
        }
        Err(e) => {
            warn!(
                gateway = %packet.rx_info.gateway_eui,
                len = packet.phy_payload.len(),
                "Dropping undecodable frame: {}",
                e
            );
            shared.metrics.record(PipelineEvent::DecodeFailed);
            None
        }
    }
}
