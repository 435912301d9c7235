// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Pipeline coordinator
//!
//! Five long-lived stage tasks are wired leaves first:
//!
//! ```text
//! RxPacket -> decoder -> verifier -> mac -> scheduler -> encoder -> TxPacket
//! ```
//!
//! Every stage except the scheduler spawns one task per frame and gives no
//! ordering guarantee. A stage closes its output once its input is closed
//! and its in-flight tasks are done, so dropping the input sender drains
//! the whole pipeline.
//!
//! # Example
//!
//! ```no_run
//! use loraflow::{MemoryStore, Pipeline, PipelineConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(packet: loraflow::RxPacket) -> loraflow::Result<()> {
//! let storage = Arc::new(MemoryStore::new());
//! let mut handle = Pipeline::new(PipelineConfig::default(), storage).start()?;
//!
//! handle.send(packet).await?;
//! if let Some(tx) = handle.recv_timeout(Duration::from_secs(2)).await {
//!     println!("downlink of {} bytes", tx.phy_payload.len());
//! }
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod decoder;
pub mod encoder;
pub mod join;
pub mod mac;
pub mod scheduler;
pub mod verifier;

use crate::config::PipelineConfig;
use crate::context::{RxPacket, TxPacket};
use crate::error::{ConfigError, LoraError, Result};
use crate::metrics::{MetricsSnapshot, PipelineEvent, PipelineMetrics};
use crate::output::FrameOutputBuffer;
use crate::publish::{NullPublisher, Publisher};
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by all stage tasks
pub(crate) struct Shared {
    pub config: PipelineConfig,
    pub storage: Arc<dyn Storage>,
    pub publisher: Arc<dyn Publisher>,
    pub output: FrameOutputBuffer,
    pub metrics: Arc<PipelineMetrics>,
}

impl Shared {
    /// Log a failed storage call
    pub fn storage_failed(&self, what: &str, err: &dyn std::fmt::Display) {
        warn!("Storage failure while {}: {}", what, err);
        self.metrics.record(PipelineEvent::StorageFailed);
    }

    #[cfg(test)]
    pub fn for_tests(config: PipelineConfig, storage: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            publisher: Arc::new(NullPublisher),
            output: FrameOutputBuffer::new(),
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }
}

/// Pipeline builder
pub struct Pipeline {
    config: PipelineConfig,
    storage: Arc<dyn Storage>,
    publisher: Arc<dyn Publisher>,
}

impl Pipeline {
    /// Pipeline over `storage`, discarding application payloads
    pub fn new(config: PipelineConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            publisher: Arc::new(NullPublisher),
        }
    }

    /// Route decrypted payloads to `publisher`
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Spawn the stage tasks. Must be called from within a tokio runtime.
    pub fn start(self) -> std::result::Result<PipelineHandle, ConfigError> {
        self.config.validate()?;

        let capacity = self.config.channel_capacity;
        let metrics = Arc::new(PipelineMetrics::new());
        let shared = Arc::new(Shared {
            config: self.config,
            storage: self.storage,
            publisher: self.publisher,
            output: FrameOutputBuffer::new(),
            metrics: metrics.clone(),
        });

        let (rx_tx, rx_rx) = mpsc::channel(capacity);
        let (decoded_tx, decoded_rx) = mpsc::channel(capacity);
        let (verified_tx, verified_rx) = mpsc::channel(capacity);
        let (mac_tx, mac_rx) = mpsc::channel(capacity);
        let (scheduled_tx, scheduled_rx) = mpsc::channel(capacity);
        let (tx_tx, tx_rx) = mpsc::channel(capacity);

        let tasks = vec![
            tokio::spawn(decoder::run(shared.clone(), rx_rx, decoded_tx)),
            tokio::spawn(verifier::run(shared.clone(), decoded_rx, verified_tx)),
            tokio::spawn(mac::run(shared.clone(), verified_rx, mac_tx)),
            tokio::spawn(scheduler::run(shared.clone(), mac_rx, scheduled_tx)),
            tokio::spawn(encoder::run(shared, scheduled_rx, tx_tx)),
        ];

        info!("Pipeline started with {} stages", tasks.len());

        Ok(PipelineHandle {
            input: Some(rx_tx),
            output: tx_rx,
            metrics,
            tasks,
        })
    }
}

/// Gateway-transport side of a running pipeline
pub struct PipelineHandle {
    input: Option<mpsc::Sender<RxPacket>>,
    output: mpsc::Receiver<TxPacket>,
    metrics: Arc<PipelineMetrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Feed one received frame
    pub async fn send(&self, packet: RxPacket) -> Result<()> {
        let input = self.input.as_ref().ok_or(LoraError::PipelineClosed)?;
        input
            .send(packet)
            .await
            .map_err(|_| LoraError::PipelineClosed)
    }

    /// Extra input sender. Clones keep the pipeline open until dropped.
    pub fn sender(&self) -> Option<mpsc::Sender<RxPacket>> {
        self.input.clone()
    }

    /// Next downlink; `None` once the pipeline has drained
    pub async fn recv(&mut self) -> Option<TxPacket> {
        self.output.recv().await
    }

    /// Next downlink, waiting at most `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<TxPacket> {
        tokio::time::timeout(timeout, self.output.recv())
            .await
            .ok()
            .flatten()
    }

    /// Current counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Close the input, let in-flight frames finish and return the
    /// downlinks produced meanwhile
    pub async fn shutdown(mut self) -> Vec<TxPacket> {
        self.input = None;

        let mut remaining = Vec::new();
        while let Some(packet) = self.output.recv().await {
            remaining.push(packet);
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Stage task failed: {}", e);
            }
        }
        debug!("Pipeline stopped, {} downlinks drained", remaining.len());
        remaining
    }
}
