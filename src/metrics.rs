//! Pipeline metrics
//!
//! Lock-free counters updated by every stage, plus a point-in-time
//! snapshot with a human-readable report.

use std::sync::atomic::{AtomicU64, Ordering};

/// Something a stage counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEvent {
    /// Raw frame accepted from the gateway transport
    Received,
    /// Frame could not be decoded
    DecodeFailed,
    /// No candidate device matched the MIC
    MicRejected,
    /// Frame counter behind a strict device
    FCntRejected,
    /// Uplink verified and decrypted (per matching device)
    UplinkAccepted,
    /// MAC command dispatched to its handler
    MacCommandDispatched,
    JoinAccepted,
    JoinRejected,
    /// Scheduler dropped a request for a device already in flight
    DuplicateDropped,
    /// Scheduler produced a response frame
    DownlinkScheduled,
    /// Encoder handed a packet to the gateway transport
    DownlinkEmitted,
    EncodeFailed,
    /// A storage call failed for a reason other than "not found"
    StorageFailed,
}

impl PipelineEvent {
    const ALL: [PipelineEvent; 13] = [
        PipelineEvent::Received,
        PipelineEvent::DecodeFailed,
        PipelineEvent::MicRejected,
        PipelineEvent::FCntRejected,
        PipelineEvent::UplinkAccepted,
        PipelineEvent::MacCommandDispatched,
        PipelineEvent::JoinAccepted,
        PipelineEvent::JoinRejected,
        PipelineEvent::DuplicateDropped,
        PipelineEvent::DownlinkScheduled,
        PipelineEvent::DownlinkEmitted,
        PipelineEvent::EncodeFailed,
        PipelineEvent::StorageFailed,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Label used in reports
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineEvent::Received => "received",
            PipelineEvent::DecodeFailed => "decode_failed",
            PipelineEvent::MicRejected => "mic_rejected",
            PipelineEvent::FCntRejected => "fcnt_rejected",
            PipelineEvent::UplinkAccepted => "uplink_accepted",
            PipelineEvent::MacCommandDispatched => "mac_commands",
            PipelineEvent::JoinAccepted => "join_accepted",
            PipelineEvent::JoinRejected => "join_rejected",
            PipelineEvent::DuplicateDropped => "duplicate_dropped",
            PipelineEvent::DownlinkScheduled => "downlink_scheduled",
            PipelineEvent::DownlinkEmitted => "downlink_emitted",
            PipelineEvent::EncodeFailed => "encode_failed",
            PipelineEvent::StorageFailed => "storage_failed",
        }
    }
}

/// Counters shared by the pipeline stages
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    counters: [AtomicU64; 13],
}

impl PipelineMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence
    pub fn record(&self, event: PipelineEvent) {
        self.counters[event.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` occurrences at once
    pub fn add(&self, event: PipelineEvent, count: u64) {
        self.counters[event.index()].fetch_add(count, Ordering::Relaxed);
    }

    /// Current count for an event
    pub fn get(&self, event: PipelineEvent) -> u64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    /// Copy all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counts: PipelineEvent::ALL.map(|e| (e, self.get(e))),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    counts: [(PipelineEvent, u64); 13],
}

impl MetricsSnapshot {
    pub fn get(&self, event: PipelineEvent) -> u64 {
        self.counts[event.index()].1
    }

    /// Share of received frames that produced an accepted uplink or join
    pub fn acceptance_rate(&self) -> f64 {
        let received = self.get(PipelineEvent::Received);
        if received == 0 {
            return 0.0;
        }
        let accepted =
            self.get(PipelineEvent::UplinkAccepted) + self.get(PipelineEvent::JoinAccepted);
        accepted as f64 / received as f64
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Pipeline Metrics ===\n\n");
        for (event, count) in &self.counts {
            report.push_str(&format!("{:<20} {}\n", event.as_str(), count));
        }
        report.push_str(&format!(
            "\nAcceptance rate: {:.1}%\n",
            self.acceptance_rate() * 100.0
        ));

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_indices_match_table() {
        for (i, event) in PipelineEvent::ALL.iter().enumerate() {
            assert_eq!(event.index(), i);
        }
    }

    #[test]
    fn test_record_and_snapshot() {
        let metrics = PipelineMetrics::new();
        metrics.record(PipelineEvent::Received);
        metrics.record(PipelineEvent::Received);
        metrics.record(PipelineEvent::Received);
        metrics.record(PipelineEvent::Received);
        metrics.record(PipelineEvent::UplinkAccepted);
        metrics.record(PipelineEvent::MicRejected);
        metrics.add(PipelineEvent::MacCommandDispatched, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get(PipelineEvent::Received), 4);
        assert_eq!(snapshot.get(PipelineEvent::MicRejected), 1);
        assert_eq!(snapshot.get(PipelineEvent::JoinAccepted), 0);
        assert_eq!(snapshot.get(PipelineEvent::MacCommandDispatched), 3);
        assert!((snapshot.acceptance_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_report() {
        let metrics = PipelineMetrics::new();
        metrics.record(PipelineEvent::DownlinkEmitted);
        let report = metrics.snapshot().report();
        assert!(report.contains("Pipeline Metrics"));
        assert!(report.contains("downlink_emitted"));
        assert!(report.contains("Acceptance rate: 0.0%"));
    }
}
