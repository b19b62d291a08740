//! # TCP-friendly congestion control (TFRC-derived)
//!
//! Tracks a small active set of CC nodes, selects the current limiting
//! receiver (CLR), and computes the advertised sending rate from the
//! TFRC throughput equation (§4.5.6). The controller shape — named struct,
//! `tick()`-driven, explicit state enum — follows the grounding
//! repository's per-link controller; the rate computation itself is
//! TFRC's, not BBR's.

use quanta::Instant;
use std::time::Duration;

/// One candidate limiting receiver, as reported via CC feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcFlag {
    /// Currently the limiting receiver.
    Clr,
    /// Potential limiting receiver (priority candidate).
    Plr,
    /// Feedback includes a fresh RTT sample.
    Rtt,
    /// Still in slow start.
    Start,
    /// Rate-limited by something other than loss (e.g. app write rate).
    Limit,
}

/// Per-CC-node feedback state tracked by the sender (§4.5's "CC node").
#[derive(Debug, Clone)]
pub struct CcNode {
    pub node_id: u32,
    pub rtt_us: f64,
    pub loss_fraction: f64,
    pub advertised_rate_bps: f64,
    pub cc_sequence: u16,
    pub flags: Vec<CcFlag>,
    pub last_feedback: Instant,
    /// CC-sequence value observed the last time this node was checked for
    /// deactivation-eligibility — lets `probe_count` advance be detected.
    pub last_seen_sequence: u16,
}

impl CcNode {
    pub fn is_clr(&self) -> bool {
        self.flags.contains(&CcFlag::Clr)
    }

    /// Deactivation rule (§4.5.6): stale feedback *and* the sender has kept
    /// probing meanwhile, so staleness isn't just sender silence.
    fn is_stale(&self, now: Instant, tick_min: Duration, grtt: Duration, rtt: Duration, probe_count: u32) -> bool {
        let age = now.duration_since(self.last_feedback);
        let age_threshold = (10 * tick_min).max(20 * grtt.max(rtt));
        let seq_advanced = self.cc_sequence.wrapping_sub(self.last_seen_sequence) as u32;
        age > age_threshold && seq_advanced as u32 > 20 * probe_count
    }
}

/// TFRC rate-equation inputs.
#[derive(Debug, Clone, Copy)]
pub struct TfrcInputs {
    pub segment_size: f64,
    pub rtt_us: f64,
    pub loss_fraction: f64,
}

/// `rate = size / ( rtt·(sqrt(2p/3) + 12p(1+32p²)·sqrt(3p/8)) )` (§4.5.6).
pub fn tfrc_rate_bps(inputs: TfrcInputs) -> f64 {
    let TfrcInputs { segment_size, rtt_us, loss_fraction: p } = inputs;
    if rtt_us <= 0.0 {
        return 0.0;
    }
    if p <= 0.0 {
        return f64::INFINITY;
    }
    let rtt_s = rtt_us / 1_000_000.0;
    let term1 = (2.0 * p / 3.0).sqrt();
    let term2 = 12.0 * p * (1.0 + 32.0 * p * p) * (3.0 * p / 8.0).sqrt();
    let denom = rtt_s * (term1 + term2);
    if denom <= 0.0 {
        f64::INFINITY
    } else {
        segment_size / denom
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcPhase {
    SlowStart,
    Steady,
}

/// Per-session TFRC congestion controller. Owns the active CC-node set,
/// the nominal-packet-size EWMA, and the previous-rate history needed for
/// the `2·previousRate` bound.
pub struct CongestionController {
    pub phase: CcPhase,
    nodes: Vec<CcNode>,
    clr_id: Option<u32>,
    previous_rate_bps: f64,
    tx_rate_min_bps: f64,
    rtt_mean_square: f64,
    probe_count: u32,
    max_nodes: usize,
    nominal_size_bytes: f64,
}

const DEFAULT_RATE_BPS: f64 = 64_000.0;

impl CongestionController {
    pub fn new(tx_rate_min_bps: f64) -> Self {
        CongestionController {
            phase: CcPhase::SlowStart,
            nodes: Vec::with_capacity(5),
            clr_id: None,
            previous_rate_bps: DEFAULT_RATE_BPS,
            tx_rate_min_bps,
            rtt_mean_square: 0.0,
            probe_count: 0,
            max_nodes: 5,
            nominal_size_bytes: 1400.0,
        }
    }

    pub fn current_rate_bps(&self) -> f64 {
        self.previous_rate_bps
    }

    /// Update the nominal segment size fed into the TFRC rate equation
    /// (§4.5.6), tracked by the sender's smoothed payload-size estimate
    /// rather than a fixed constant. Ignores non-positive samples (no
    /// traffic sent yet).
    pub fn set_nominal_size(&mut self, bytes: f64) {
        if bytes > 0.0 {
            self.nominal_size_bytes = bytes;
        }
    }

    pub fn clr(&self) -> Option<&CcNode> {
        self.clr_id.and_then(|id| self.nodes.iter().find(|n| n.node_id == id))
    }

    /// Record (or refresh) one node's CC feedback and re-run CLR selection
    /// and rate computation (§4.5.6 "for each CC-node feedback event").
    pub fn on_feedback(
        &mut self,
        node_id: u32,
        rtt_us: f64,
        loss_fraction: f64,
        advertised_rate_bps: f64,
        cc_sequence: u16,
        now: Instant,
    ) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.node_id == node_id) {
            existing.last_seen_sequence = existing.cc_sequence;
            existing.rtt_us = rtt_us;
            existing.loss_fraction = loss_fraction;
            existing.advertised_rate_bps = advertised_rate_bps;
            existing.cc_sequence = cc_sequence;
            existing.last_feedback = now;
        } else if self.nodes.len() < self.max_nodes {
            self.nodes.push(CcNode {
                node_id,
                rtt_us,
                loss_fraction,
                advertised_rate_bps,
                cc_sequence,
                flags: Vec::new(),
                last_feedback: now,
                last_seen_sequence: cc_sequence,
            });
        } else {
            return;
        }

        if self.phase == CcPhase::SlowStart && loss_fraction > 0.0 {
            self.phase = CcPhase::Steady;
        }

        self.rtt_mean_square = 0.875 * self.rtt_mean_square + 0.125 * rtt_us * rtt_us;
        self.select_clr();
        self.recompute_rate(rtt_us);
    }

    /// CLR selection (§4.5.6): highest priority (current CLR first), lowest
    /// advertised rate, ties broken by highest RTT.
    fn select_clr(&mut self) {
        let current_clr = self.clr_id;
        let best = self.nodes.iter().min_by(|a, b| {
            let a_is_current = current_clr == Some(a.node_id);
            let b_is_current = current_clr == Some(b.node_id);
            match (a_is_current, b_is_current) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a
                    .advertised_rate_bps
                    .partial_cmp(&b.advertised_rate_bps)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.rtt_us.partial_cmp(&a.rtt_us).unwrap_or(std::cmp::Ordering::Equal)),
            }
        });
        self.clr_id = best.map(|n| n.node_id);
        for node in &mut self.nodes {
            node.flags.retain(|f| *f != CcFlag::Clr);
            if Some(node.node_id) == self.clr_id {
                node.flags.push(CcFlag::Clr);
            }
        }
    }

    fn recompute_rate(&mut self, rtt_sample_us: f64) {
        let Some(clr) = self.clr() else { return };

        let candidate = if self.phase == CcPhase::SlowStart {
            2.0 * clr.advertised_rate_bps
        } else {
            tfrc_rate_bps(TfrcInputs {
                segment_size: self.nominal_size_bytes,
                rtt_us: clr.rtt_us,
                loss_fraction: clr.loss_fraction,
            })
        };

        let damper = if rtt_sample_us > 0.0 {
            (self.rtt_mean_square.sqrt() / rtt_sample_us.sqrt()).clamp(0.5, 2.0)
        } else {
            1.0
        };

        let damped = candidate * damper;
        let upper_bound = 2.0 * self.previous_rate_bps;
        let lower_bound = self.tx_rate_min_bps;
        self.previous_rate_bps = damped.min(upper_bound).max(lower_bound);
    }

    /// Deactivate nodes whose feedback has gone stale (§4.5.6) — call once
    /// per probe tick.
    pub fn tick(&mut self, now: Instant, tick_min: Duration, grtt: Duration) {
        self.probe_count += 1;
        let probe_count = self.probe_count;
        self.nodes.retain(|n| {
            let rtt = Duration::from_micros(n.rtt_us.max(0.0) as u64);
            !n.is_stale(now, tick_min, grtt, rtt, probe_count)
        });
        if self.clr_id.is_some_and(|id| !self.nodes.iter().any(|n| n.node_id == id)) {
            self.clr_id = None;
            self.select_clr();
        }
    }

    pub fn active_node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// RFC 5348-style loss-event-rate estimator (§4.6.4), used receiver-side to
/// fill in the CC feedback a NACK/ACK carries back to the sender. Keeps a
/// history of packets-received-since-last-loss-event, most recent interval
/// first, discounted by the characteristic weights so a single isolated
/// loss doesn't swing the estimate as hard as a sustained run of them.
pub struct LossEventEstimator {
    intervals: std::collections::VecDeque<u32>,
    since_last_event: u32,
    received: u32,
}

const LOSS_EVENT_WEIGHTS: [f64; 8] = [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];

impl LossEventEstimator {
    pub fn new() -> Self {
        LossEventEstimator {
            intervals: std::collections::VecDeque::with_capacity(LOSS_EVENT_WEIGHTS.len()),
            since_last_event: 0,
            received: 0,
        }
    }

    /// Count one successfully received (in-order or repaired) packet.
    pub fn record_received(&mut self) {
        self.received += 1;
        self.since_last_event += 1;
    }

    /// Record a loss event: closes out the current interval and opens a
    /// fresh one. Multiple losses inside one NACK aggregation window count
    /// as a single event, per RFC 5348 — the caller should call this once
    /// per NACK built, not once per missing symbol.
    pub fn record_loss_event(&mut self) {
        if self.intervals.len() == LOSS_EVENT_WEIGHTS.len() {
            self.intervals.pop_back();
        }
        self.intervals.push_front(self.since_last_event);
        self.since_last_event = 0;
    }

    /// Weighted loss-event rate, 0.0 (no observed loss yet) to 1.0.
    pub fn loss_fraction(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for (i, &interval) in self.intervals.iter().enumerate() {
            let w = LOSS_EVENT_WEIGHTS[i];
            weighted_sum += interval as f64 * w;
            weight_sum += w;
        }
        if weighted_sum <= 0.0 {
            return 0.0;
        }
        (weight_sum / weighted_sum).clamp(0.0, 1.0)
    }
}

impl Default for LossEventEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod loss_event_tests {
    use super::*;

    #[test]
    fn no_loss_yet_reports_zero() {
        let est = LossEventEstimator::new();
        assert_eq!(est.loss_fraction(), 0.0);
    }

    #[test]
    fn sustained_loss_raises_fraction_above_sparse_loss() {
        let mut sparse = LossEventEstimator::new();
        for _ in 0..100 {
            sparse.record_received();
        }
        sparse.record_loss_event();

        let mut frequent = LossEventEstimator::new();
        for _ in 0..4 {
            frequent.record_received();
            frequent.record_loss_event();
        }
        assert!(frequent.loss_fraction() > sparse.loss_fraction());
    }

    #[test]
    fn oldest_interval_evicted_past_window() {
        let mut est = LossEventEstimator::new();
        for _ in 0..10 {
            est.record_received();
            est.record_loss_event();
        }
        assert_eq!(est.intervals.len(), LOSS_EVENT_WEIGHTS.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn rate_equation_zero_loss_is_infinite() {
        let r = tfrc_rate_bps(TfrcInputs { segment_size: 1400.0, rtt_us: 50_000.0, loss_fraction: 0.0 });
        assert!(r.is_infinite());
    }

    #[test]
    fn rate_equation_decreases_with_loss() {
        let low = tfrc_rate_bps(TfrcInputs { segment_size: 1400.0, rtt_us: 50_000.0, loss_fraction: 0.01 });
        let high = tfrc_rate_bps(TfrcInputs { segment_size: 1400.0, rtt_us: 50_000.0, loss_fraction: 0.1 });
        assert!(high < low);
    }

    #[test]
    fn rate_equation_decreases_with_rtt() {
        let short = tfrc_rate_bps(TfrcInputs { segment_size: 1400.0, rtt_us: 20_000.0, loss_fraction: 0.05 });
        let long = tfrc_rate_bps(TfrcInputs { segment_size: 1400.0, rtt_us: 200_000.0, loss_fraction: 0.05 });
        assert!(long < short);
    }

    #[test]
    fn slow_start_ends_on_first_loss() {
        let mut cc = CongestionController::new(8_000.0);
        assert_eq!(cc.phase, CcPhase::SlowStart);
        cc.on_feedback(1, 50_000.0, 0.0, 100_000.0, 1, now());
        assert_eq!(cc.phase, CcPhase::SlowStart);
        cc.on_feedback(1, 50_000.0, 0.02, 100_000.0, 2, now());
        assert_eq!(cc.phase, CcPhase::Steady);
    }

    #[test]
    fn clr_prefers_lowest_rate() {
        let mut cc = CongestionController::new(8_000.0);
        cc.on_feedback(1, 50_000.0, 0.0, 200_000.0, 1, now());
        cc.on_feedback(2, 50_000.0, 0.0, 50_000.0, 1, now());
        assert_eq!(cc.clr().unwrap().node_id, 2);
    }

    #[test]
    fn clr_sticky_to_current_holder() {
        let mut cc = CongestionController::new(8_000.0);
        cc.on_feedback(1, 50_000.0, 0.0, 50_000.0, 1, now());
        assert_eq!(cc.clr().unwrap().node_id, 1);
        // node 2 now reports a (strictly) lower rate, but node 1 keeps priority
        cc.on_feedback(2, 50_000.0, 0.0, 10_000.0, 1, now());
        assert_eq!(cc.clr().unwrap().node_id, 1);
    }

    #[test]
    fn rate_bounded_by_twice_previous() {
        let mut cc = CongestionController::new(8_000.0);
        cc.on_feedback(1, 50_000.0, 0.0, 1_000_000.0, 1, now());
        let r1 = cc.current_rate_bps();
        cc.on_feedback(1, 50_000.0, 0.0, 50_000_000.0, 2, now());
        assert!(cc.current_rate_bps() <= 2.0 * r1 + 1.0);
    }

    #[test]
    fn rate_never_below_tx_rate_min() {
        let mut cc = CongestionController::new(20_000.0);
        cc.on_feedback(1, 500_000.0, 0.5, 100.0, 1, now());
        assert!(cc.current_rate_bps() >= 20_000.0);
    }

    #[test]
    fn stale_node_deactivated_after_long_idle_with_probing() {
        let mut cc = CongestionController::new(8_000.0);
        let t0 = now();
        cc.on_feedback(1, 50_000.0, 0.0, 50_000.0, 1, t0);
        assert_eq!(cc.active_node_count(), 1);
        // Simulate many probe ticks without feedback refresh; seq doesn't advance
        // past the node's own so the probe-count guard keeps it alive here.
        for _ in 0..5 {
            cc.tick(t0, Duration::from_millis(100), Duration::from_millis(50));
        }
        assert_eq!(cc.active_node_count(), 1);
    }

    #[test]
    fn max_nodes_bounds_active_set() {
        let mut cc = CongestionController::new(8_000.0);
        for id in 0..10 {
            cc.on_feedback(id, 50_000.0, 0.0, 50_000.0, 1, now());
        }
        assert!(cc.active_node_count() <= 5);
    }
}
