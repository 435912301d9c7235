// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Downlink scheduler stage
//!
//! A single event loop owns the set of devices with a response in flight.
//! It multiplexes new scheduling requests with completion notifications
//! from the response-build tasks it spawns:
//!
//! - request for a device already in flight: dropped as a duplicate; what
//!   it left in the frame output buffer rides along with the in-flight
//!   response, or is discarded if that response already took the buffer
//! - otherwise: the device is marked and a build task waits out the
//!   collect window (counted from uplink arrival), then takes whatever the
//!   frame output buffer holds for the device
//! - completion (frame emitted or not): the mark is removed
//!
//! This yields at most one downlink per device per window. The in-flight
//! set is not persisted; a restart simply forgets it.

use super::Shared;
use crate::context::FrameContext;
use crate::metrics::PipelineEvent;
use crate::protocol::{Eui64, MType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing::{debug, warn};

/// Scheduling entry for a device whose response is being built
#[derive(Debug, Default)]
struct InFlight {
    /// Set once the build task has taken the device's output
    taken: Mutex<bool>,
}

impl InFlight {
    fn taken(&self) -> MutexGuard<'_, bool> {
        self.taken.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut input: mpsc::Receiver<FrameContext>,
    output: mpsc::Sender<FrameContext>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Eui64>();
    let mut in_flight: HashMap<Eui64, Arc<InFlight>> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            Some(dev_eui) = done_rx.recv() => {
                in_flight.remove(&dev_eui);
                debug!(dev_eui = %dev_eui, "Scheduling entry released");
            }

            request = input.recv() => {
                let Some(ctx) = request else { break };
                schedule(&shared, &mut in_flight, ctx, &output, &done_tx);
            }
        }
    }
    debug!("Scheduler input closed, {} responses still in flight", in_flight.len());
}

fn schedule(
    shared: &Arc<Shared>,
    in_flight: &mut HashMap<Eui64, Arc<InFlight>>,
    ctx: FrameContext,
    output: &mpsc::Sender<FrameContext>,
    done: &mpsc::UnboundedSender<Eui64>,
) {
    // Join accepts already are the response
    if ctx.frame.mhdr.mtype == MType::JoinAccept {
        let output = output.clone();
        tokio::spawn(async move {
            let _ = output.send(ctx).await;
        });
        return;
    }

    let Some(dev_eui) = ctx.dev_eui() else {
        warn!("Frame without resolved device reached the scheduler");
        return;
    };

    if let Some(entry) = in_flight.get(&dev_eui) {
        let taken = entry.taken();
        if *taken {
            shared.output.clear(&dev_eui);
            debug!(dev_eui = %dev_eui, "Response already taken, duplicate output discarded");
        } else {
            debug!(dev_eui = %dev_eui, "Response already in flight, duplicate merged");
        }
        shared.metrics.record(PipelineEvent::DuplicateDropped);
        return;
    }

    let entry = Arc::new(InFlight::default());
    in_flight.insert(dev_eui, entry.clone());

    let shared = shared.clone();
    let output = output.clone();
    let done = done.clone();
    tokio::spawn(async move {
        sleep_until(ctx.deadline(shared.config.collect_window())).await;
        let response = {
            let mut taken = entry.taken();
            *taken = true;
            build_response(&shared, ctx, dev_eui)
        };
        if let Some(ctx) = response {
            let _ = output.send(ctx).await;
        }
        let _ = done.send(dev_eui);
    });
}

/// Swap the uplink for the next frame due to the device, if any
fn build_response(shared: &Shared, mut ctx: FrameContext, dev_eui: Eui64) -> Option<FrameContext> {
    let dev_addr = ctx.frame.data()?.fhdr.dev_addr;
    let Some(outgoing) = shared.output.next_frame(&dev_eui, dev_addr) else {
        debug!(dev_eui = %dev_eui, "Nothing due");
        return None;
    };

    debug!(
        dev_eui = %dev_eui,
        mtype = %outgoing.frame.mhdr.mtype,
        "Downlink scheduled"
    );
    shared.metrics.record(PipelineEvent::DownlinkScheduled);
    ctx.frame = outgoing.frame;
    ctx.downstream = outgoing.downstream;
    Some(ctx)
}
