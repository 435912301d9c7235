//! MAC command stage
//!
//! Commands are read from FOpts and from the payload of port-0 frames and
//! dispatched by CID. No command is executed yet; every handler logs and
//! returns. The frame is always forwarded unchanged.

use super::Shared;
use crate::context::FrameContext;
use crate::mac::{parse_uplink_commands, Cid, MacCommand};
use crate::metrics::PipelineEvent;
use crate::protocol::Eui64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Handler = fn(Option<Eui64>, &MacCommand);

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut input: mpsc::Receiver<FrameContext>,
    output: mpsc::Sender<FrameContext>,
) {
    while let Some(ctx) = input.recv().await {
        let shared = shared.clone();
        let output = output.clone();
        tokio::spawn(async move {
            let dispatched = process(&ctx);
            if dispatched > 0 {
                shared
                    .metrics
                    .add(PipelineEvent::MacCommandDispatched, dispatched as u64);
            }
            let _ = output.send(ctx).await;
        });
    }
    debug!("MAC stage input closed");
}

/// Dispatch every MAC command carried by the frame; returns how many were found
pub(crate) fn process(ctx: &FrameContext) -> usize {
    let Some(data) = ctx.frame.data() else {
        return 0;
    };
    let dev_eui = ctx.dev_eui();
    let mut dispatched = 0;

    let mut sources: Vec<(&str, &[u8])> = vec![("FOpts", data.fhdr.f_opts.as_slice())];
    if data.f_port == Some(0) {
        sources.push(("FRMPayload", data.frm_payload.as_slice()));
    }

    for (source, bytes) in sources {
        if bytes.is_empty() {
            continue;
        }
        let (commands, err) = parse_uplink_commands(bytes);
        for command in &commands {
            handler(command.cid)(dev_eui, command);
        }
        dispatched += commands.len();
        if let Some(e) = err {
            warn!(dev_eui = ?dev_eui, "Stopped parsing MAC commands in {}: {}", source, e);
        }
    }
    dispatched
}

fn handler(cid: Cid) -> Handler {
    match cid {
        Cid::LinkCheck => not_implemented,
        Cid::LinkAdr => not_implemented,
        Cid::DutyCycle => not_implemented,
        Cid::RxParamSetup => not_implemented,
        Cid::DevStatus => not_implemented,
        Cid::NewChannel => not_implemented,
        Cid::RxTimingSetup => not_implemented,
        Cid::TxParamSetup => not_implemented,
        Cid::DlChannel => not_implemented,
    }
}

fn not_implemented(dev_eui: Option<Eui64>, command: &MacCommand) {
    debug!(
        dev_eui = ?dev_eui,
        payload_len = command.payload.len(),
        "{} handling not implemented",
        command.cid
    );
}
