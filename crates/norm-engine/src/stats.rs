//! # Session statistics
//!
//! Per-session sender/receiver counters for Prometheus export and JSON
//! serialization. GRTT smoothing lives in `sender.rs`'s `GrttEstimator`
//! and segment-size smoothing in its `NominalSizeEstimator`; receive-rate
//! estimation for CC feedback lives in `receiver.rs`'s `ReceiveRateTracker`
//! — this module stays pure counters, not a second copy of that machinery.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side statistics for one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// DATA/INFO segments sent (excludes retransmitted repair of the same
    /// segment id, which bumps `repairs_sent` instead).
    pub segments_sent: u64,
    /// Original payload bytes sent (source symbols only, not parity).
    pub bytes_sent: u64,
    /// Parity segments sent.
    pub parity_segments_sent: u64,
    /// Segments re-sent in response to a NACK (§4.5.4 repair activation).
    pub repairs_sent: u64,
    /// Objects fully flushed and positively acknowledged (watermark success).
    pub objects_completed: u64,
    /// Objects abandoned after `txRobustFactor` watermark failures.
    pub objects_failed: u64,
    /// NACKs received and processed.
    pub nacks_received: u64,
    /// CMD(CC) probes sent.
    pub cc_probes_sent: u64,
    /// Last measured receiver round-trip time, in µs.
    pub last_rtt_us: u32,
    /// Current advertised GRTT, in µs.
    pub grtt_advertised_us: u32,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repair overhead ratio: repairs sent per original segment sent.
    pub fn repair_ratio(&self) -> f64 {
        if self.segments_sent == 0 {
            0.0
        } else {
            self.repairs_sent as f64 / self.segments_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side statistics for one remote sender.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Total DATA segments received (including duplicates).
    pub segments_received: u64,
    /// Original payload bytes received (source symbols only).
    pub bytes_received: u64,
    /// Duplicate segments received.
    pub duplicates: u64,
    /// Segments received too late (block already released).
    pub late_segments: u64,
    /// Blocks recovered via FEC decode (at least one erasure corrected).
    pub fec_recoveries: u64,
    /// Objects completed and delivered to the application.
    pub objects_completed: u64,
    /// NACKs sent by this receiver.
    pub nacks_sent: u64,
    /// Positive ACKs sent (watermark response).
    pub acks_sent: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective goodput ratio: unique bytes vs total segments received.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.segments_received == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.segments_received as f64
        }
    }
}

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Snapshot of one session's sender and/or receiver statistics, serialized
/// for the embedder's telemetry/export path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub sender: SenderStats,
    pub receivers: Vec<(u32, ReceiverStats)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_repair_ratio_zero_when_clean() {
        let mut stats = SenderStats::new();
        stats.segments_sent = 100;
        assert_eq!(stats.repair_ratio(), 0.0);
    }

    #[test]
    fn sender_repair_ratio_correct() {
        let mut stats = SenderStats::new();
        stats.segments_sent = 100;
        stats.repairs_sent = 10;
        assert!((stats.repair_ratio() - 0.10).abs() < 0.001);
    }

    #[test]
    fn sender_repair_ratio_zero_div() {
        let stats = SenderStats::new();
        assert_eq!(stats.repair_ratio(), 0.0);
    }

    #[test]
    fn receiver_duplicate_ratio() {
        let mut stats = ReceiverStats::new();
        stats.segments_received = 110;
        stats.duplicates = 10;
        assert!((stats.duplicate_ratio() - 10.0 / 110.0).abs() < 0.001);
    }

    #[test]
    fn receiver_duplicate_ratio_zero_div() {
        let stats = ReceiverStats::new();
        assert_eq!(stats.duplicate_ratio(), 0.0);
    }

    #[test]
    fn stats_snapshot_serializes() {
        let stats = Stats::default();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"sender\""));
    }
}
