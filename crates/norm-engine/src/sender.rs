//! # Sender engine
//!
//! `SenderEngine` follows the grounding repository's `Sender` composition
//! pattern — a config struct, an `output_queue` drained by `drain_output()`,
//! and a `Stats` accumulator updated in place — generalized from its single
//! flat send-sequence model to the `txTable: HashMap<ObjectId, Object>`
//! model this transport needs. Message sequencing runs off `header_seq`
//! directly rather than a separate generator, since NORM's wire sequence is
//! per-sender-message, not a shared pool-wide counter.

use std::collections::HashMap;

use bytes::Bytes;
use quanta::Instant;

use crate::config::SessionConfig;
use crate::congestion::CongestionController;
use crate::error::Result;
use crate::gf::FecScheme;
use crate::object::{Backing, Geometry, Object, ObjectId, Role, SenderMsg};
use crate::pool::BlockPool;
use crate::stats::SenderStats;
use crate::wire::{
    AckType, CmdFlavor, CmdMsg, CommonHeader, DataMsg, FtiExt, InfoMsg, NackMsg, NormMsg,
    NormMsgType, ObjectHeaderFields, NORM_VERSION,
};

fn fec_id_of(scheme: FecScheme) -> u8 {
    match scheme {
        FecScheme::Rs8 => 2,
        FecScheme::Rs16 => 5,
        FecScheme::Mdp => 129,
    }
}

/// GRTT round-trip estimator (§4.5.3). Grounded on `session.rs`'s
/// `RttTracker` shape (a pending-request map plus a running smoothed
/// estimate) but using this transport's own asymmetric update rule instead
/// of RFC 6298's symmetric EWMA: the smoothed value tracks increases and
/// decreases alike on a live sample, and otherwise decays toward the peak
/// once per probe interval when no sample arrives — an underestimated GRTT
/// causes more repair traffic than an overestimated one.
pub struct GrttEstimator {
    grtt_us: f64,
    grtt_max_us: f64,
    last_decay: Instant,
    interval: std::time::Duration,
}

impl GrttEstimator {
    pub fn new(initial_us: f64, grtt_max_us: f64, interval: std::time::Duration, now: Instant) -> Self {
        GrttEstimator {
            grtt_us: initial_us,
            grtt_max_us,
            last_decay: now,
            interval,
        }
    }

    pub fn grtt_us(&self) -> f64 {
        self.grtt_us
    }

    /// Feed a fresh RTT sample, echoed back from a receiver's NACK/ACK.
    pub fn on_sample(&mut self, rcvr_rtt_us: f64) {
        self.grtt_us = (0.25 * self.grtt_us + 0.75 * rcvr_rtt_us).min(self.grtt_max_us);
    }

    /// Per-probe-interval decay toward the peak when no sample arrived
    /// (§4.5.3: "else 10% decay per interval toward peak").
    pub fn tick(&mut self, now: Instant) {
        if now.duration_since(self.last_decay) >= self.interval {
            self.grtt_us *= 0.9;
            self.last_decay = now;
        }
    }
}

/// Per-object sender-side bookkeeping beyond what `Object` itself tracks:
/// the watermark position's remaining robust-factor budget.
struct TxEntry {
    object: Object,
    flush_count: u32,
}

/// Smoothed nominal segment size, fed to the TFRC rate equation (§4.5.6)
/// in place of a fixed constant. Plain EWMA, but kept here rather than as
/// a reusable generic type since nothing else in this crate needs one.
struct NominalSizeEstimator {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl NominalSizeEstimator {
    fn new(alpha: f64) -> Self {
        NominalSizeEstimator { alpha, value: 0.0, initialized: false }
    }

    fn update(&mut self, sample: f64) {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
    }

    fn value(&self) -> f64 {
        self.value
    }
}

/// A transport object queued for transmission.
pub struct ObjectSpec {
    pub object_id: ObjectId,
    pub geometry: Geometry,
    pub info: Option<Bytes>,
    pub backing: Backing,
}

/// The sender side of one NORM session.
pub struct SenderEngine {
    config: SessionConfig,
    instance_id: u16,
    sender_id: u32,
    block_pool: BlockPool,
    tx_table: HashMap<ObjectId, TxEntry>,
    /// Object-level pending set: which objects still have something to send.
    tx_pending: crate::bitmask::SlidingBitmask,
    output_queue: std::collections::VecDeque<NormMsg>,
    stats: SenderStats,
    pub grtt: GrttEstimator,
    pub cc: CongestionController,
    nominal_size: NominalSizeEstimator,
    header_seq: u16,
    cc_sequence: u32,
}

impl SenderEngine {
    pub fn new(config: SessionConfig, sender_id: u32, now: Instant) -> Self {
        let block_capacity = config.tx_cache_count_max;
        SenderEngine {
            instance_id: (sender_id as u16) ^ 0x5A5A,
            sender_id,
            block_pool: BlockPool::new(block_capacity),
            tx_table: HashMap::new(),
            tx_pending: crate::bitmask::SlidingBitmask::new(65536, 0),
            output_queue: std::collections::VecDeque::new(),
            stats: SenderStats::new(),
            grtt: GrttEstimator::new(
                config.grtt_min.as_micros() as f64,
                config.grtt_max.as_micros() as f64,
                config.grtt_interval_min,
                now,
            ),
            cc: CongestionController::new(config.tx_rate_min_bps),
            nominal_size: NominalSizeEstimator::new(0.01),
            header_seq: 0,
            cc_sequence: 0,
            config,
        }
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    fn next_header(&mut self, msg_type: NormMsgType) -> CommonHeader {
        let seq = self.header_seq;
        self.header_seq = self.header_seq.wrapping_add(1);
        CommonHeader {
            version: NORM_VERSION,
            msg_type,
            sequence: seq,
            source_id: self.sender_id,
        }
    }

    /// Admit a new object for transmission (§4.4 `Open`).
    pub fn open_object(&mut self, spec: ObjectSpec) -> Result<()> {
        let object = Object::open(spec.object_id, Role::Sender, spec.geometry, spec.info, spec.backing)?;
        self.tx_table.insert(spec.object_id, TxEntry { object, flush_count: 0 });
        self.tx_pending.set(spec.object_id as u32);
        Ok(())
    }

    fn object_header_fields(&self, object_id: ObjectId, flags: u8) -> ObjectHeaderFields {
        ObjectHeaderFields {
            instance_id: self.instance_id,
            grtt_quantized: crate::wire::quantize_rtt(self.grtt.grtt_us() / 1_000_000.0),
            backoff_factor: self.config.backoff_factor as u8,
            group_size_quantized: crate::wire::quantize_group_size(1),
            object_id,
            flags,
        }
    }

    /// One tick of the 5-step sender loop (§4.5.1, simplified to the
    /// single-message-per-call shape this engine's pull-based
    /// `drain_output` favors): find the lowest pending object id, pull its
    /// next symbol, wire-encode it, and queue it for output.
    pub fn serve(&mut self) -> Result<bool> {
        let Some(object_id) = self.tx_pending.first_set().map(|id| id as u16) else {
            return Ok(false);
        };
        let entry = match self.tx_table.get_mut(&object_id) {
            Some(e) => e,
            None => {
                self.tx_pending.unset(object_id as u32);
                return Ok(false);
            }
        };
        let geometry = entry.object.geometry;
        let msg = entry.object.next_sender_msg(&mut self.block_pool)?;
        let Some(msg) = msg else {
            self.tx_pending.unset(object_id as u32);
            return Ok(false);
        };

        let fti = Some(FtiExt {
            fec_id: fec_id_of(geometry.fec_scheme),
            segment_size: geometry.seg_size,
            object_size: geometry.object_size,
            ndata: geometry.ndata,
            nparity: geometry.nparity,
        });

        match msg {
            SenderMsg::Info(payload) => {
                let header = self.next_header(NormMsgType::Info);
                let fields = self.object_header_fields(object_id, crate::wire::obj_flags::INFO_DATA);
                self.nominal_size.update(payload.len() as f64);
                self.output_queue.push_back(NormMsg::Info(InfoMsg {
                    header,
                    fields,
                    fti,
                    info_payload: payload,
                }));
                self.stats.segments_sent += 1;
            }
            SenderMsg::Data { fec_payload_id, stream_header, payload } => {
                let is_parity = fec_payload_id.symbol_id >= geometry.ndata;
                let header = self.next_header(NormMsgType::Data);
                let flags = if geometry.is_stream() { crate::wire::obj_flags::STREAM } else { 0 };
                let fields = self.object_header_fields(object_id, flags);
                self.nominal_size.update(payload.len() as f64);
                self.output_queue.push_back(NormMsg::Data(DataMsg {
                    header,
                    fields,
                    fec_payload_id,
                    fti,
                    stream_header,
                    payload,
                }));
                if is_parity {
                    self.stats.parity_segments_sent += 1;
                } else {
                    self.stats.segments_sent += 1;
                    self.stats.bytes_sent += geometry.seg_size as u64;
                }
            }
        }
        if self.tx_table.get(&object_id).map(|e| e.object.pending.is_empty()).unwrap_or(true) {
            self.tx_pending.unset(object_id as u32);
        }
        Ok(true)
    }

    /// Pacing interval for the next message, per §4.5.2: `msgLen / txRate`,
    /// clamped to `[txRateMin, txRateMax]`.
    pub fn pacing_interval(&self, msg_len_bytes: usize) -> std::time::Duration {
        let rate = self.cc.current_rate_bps().clamp(self.config.tx_rate_min_bps, self.config.tx_rate_max_bps);
        let secs = (msg_len_bytes as f64 * 8.0) / rate.max(1.0);
        std::time::Duration::from_secs_f64(secs.max(0.0))
    }

    /// Process an incoming NACK (§4.5.4, simplified: this sender treats
    /// every repair request as immediately actionable rather than running
    /// a full aggregation-timer state machine — a single aggregation
    /// window is approximated by the caller batching NACKs before calling
    /// this once per window).
    pub fn process_nack(&mut self, nack: &NackMsg) {
        self.stats.nacks_received += 1;
        for req in &nack.repair_requests {
            for (object_id, block_id, _symbol_id) in req.endpoints() {
                if let Some(entry) = self.tx_table.get_mut(&object_id) {
                    let newly = entry.object.receiver_repair_check(block_id);
                    if newly {
                        self.tx_pending.set(object_id as u32);
                        self.stats.repairs_sent += 1;
                    }
                }
            }
        }
        if let Some(grtt_us) = nack.grtt_response_us {
            self.grtt.on_sample(grtt_us as f64);
        }
        if let Some(fb) = &nack.cc_feedback {
            self.cc.on_feedback(
                nack.sender_id,
                crate::wire::unquantize_rtt(fb.rtt_quantized) * 1_000_000.0,
                crate::wire::unquantize_loss32(fb.loss_quantized),
                crate::wire::unquantize_rate(fb.rate_quantized),
                fb.cc_sequence as u16,
                Instant::now(),
            );
        }
    }

    /// Emit a `FLUSH` command for an object whose transmission has
    /// drained, to collect positive ACKs (§4.5.5). Returns `None` if the
    /// object isn't known or isn't actually complete yet.
    pub fn request_flush(&mut self, object_id: ObjectId, ackers: Vec<u32>) -> Option<NormMsg> {
        let entry = self.tx_table.get_mut(&object_id)?;
        if !entry.object.is_complete() {
            return None;
        }
        entry.flush_count = self.config.tx_robust_factor;
        let header = self.next_header(NormMsgType::Cmd);
        Some(NormMsg::Cmd(CmdMsg {
            header,
            instance_id: self.instance_id,
            grtt_quantized: crate::wire::quantize_rtt(self.grtt.grtt_us() / 1_000_000.0),
            backoff_factor: self.config.backoff_factor as u8,
            group_size_quantized: crate::wire::quantize_group_size(1),
            flavor: CmdFlavor::Flush { object_id, block_id: 0, symbol_id: 0, ackers },
        }))
    }

    /// Re-send the standing FLUSH command for an object still awaiting a
    /// positive ACK, without touching `flush_count` — the `Flush` timer
    /// owns that budget independently of how often `CmdRetransmit` keeps
    /// the wire request alive (§4.5.5 "Open question — RESOLVED").
    pub fn resend_flush(&mut self, object_id: ObjectId, ackers: Vec<u32>) -> Option<NormMsg> {
        let entry = self.tx_table.get(&object_id)?;
        if !entry.object.is_complete() {
            return None;
        }
        let header = self.next_header(NormMsgType::Cmd);
        Some(NormMsg::Cmd(CmdMsg {
            header,
            instance_id: self.instance_id,
            grtt_quantized: crate::wire::quantize_rtt(self.grtt.grtt_us() / 1_000_000.0),
            backoff_factor: self.config.backoff_factor as u8,
            group_size_quantized: crate::wire::quantize_group_size(1),
            flavor: CmdFlavor::Flush { object_id, block_id: 0, symbol_id: 0, ackers },
        }))
    }

    /// Process a positive ACK for a flushed object: on success, mark the
    /// object completed and drop it from `tx_table`.
    pub fn process_ack(&mut self, ack_type: AckType, object_id: ObjectId) -> bool {
        if ack_type != AckType::Flush {
            return false;
        }
        if let Some(entry) = self.tx_table.get(&object_id) {
            if entry.object.is_complete() {
                self.tx_table.remove(&object_id);
                self.stats.objects_completed += 1;
                return true;
            }
        }
        false
    }

    /// Decrement an object's flush budget after an aggregation window with
    /// no ACK; report failure once exhausted (§9 "Open question —
    /// RESOLVED": `flush_count` set directly to `txRobustFactor`,
    /// decremented per unanswered re-flush).
    pub fn flush_timeout(&mut self, object_id: ObjectId) -> bool {
        if let Some(entry) = self.tx_table.get_mut(&object_id) {
            if entry.flush_count == 0 {
                self.tx_table.remove(&object_id);
                self.stats.objects_failed += 1;
                return true;
            }
            entry.flush_count -= 1;
        }
        false
    }

    pub fn drain_output(&mut self) -> impl Iterator<Item = NormMsg> + '_ {
        self.output_queue.drain(..)
    }

    pub fn output_queue_len(&self) -> usize {
        self.output_queue.len()
    }

    pub fn has_pending_objects(&self) -> bool {
        !self.tx_pending.is_empty()
    }

    pub fn active_object_count(&self) -> usize {
        self.tx_table.len()
    }

    /// Periodic probe tick: advances the CC-node staleness check and the
    /// GRTT decay timer (§4.5.3/§4.5.6).
    pub fn probe_tick(&mut self, now: Instant, tick_min: std::time::Duration) {
        self.grtt.tick(now);
        let grtt = std::time::Duration::from_micros(self.grtt.grtt_us() as u64);
        self.cc.set_nominal_size(self.nominal_size.value());
        self.cc.tick(now, tick_min, grtt);
        self.cc_sequence = self.cc_sequence.wrapping_add(1);
    }
}
