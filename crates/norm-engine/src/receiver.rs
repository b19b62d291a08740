//! # Receiver engine
//!
//! `RemoteSenderNode` tracks one remote sender's object set and loss state,
//! the way the grounding repository's `Receiver` tracks one flat
//! `reorder_buf` — generalized here to `rx_table: HashMap<ObjectId, Object>`
//! plus the NACK/ACK construction and back-off machinery `SPEC_FULL.md`
//! §4.6 adds on top. `ReceiverEvent` keeps the teacher's drain-queue shape
//! (`SendNack`/`SendAck`/`Deliver`) with NORM's message types substituted in.

use std::collections::HashMap;

use bytes::Bytes;
use quanta::Instant;
use rand::RngExt;

use crate::config::{NackingMode, SessionConfig, SyncPolicy};
use crate::congestion::LossEventEstimator;
use crate::error::Result;
use crate::object::{Backing, DataStore, Geometry, Object, ObjectId, ReceiveOutcome, Role};
use crate::pool::{BlockPool, SegmentPool};
use crate::stats::ReceiverStats;
use crate::wire::{
    repair_flags, quantize_loss32, quantize_rate, AckMsg, AckType, CcFeedback, CmdFlavor, CmdMsg,
    CommonHeader, DataMsg, InfoMsg, NackMsg, NormMsgType, RepairForm, RepairItem, RepairRequest,
    NORM_VERSION,
};

/// Outbound work a remote-sender node produces for the session to dispatch.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    SendNack(NackMsg),
    SendAck(AckMsg),
    Deliver { object_id: ObjectId, info: Option<Bytes>, data: Bytes },
    ObjectCompleted(ObjectId),
    /// CMD(ACK_REQ) solicited an application acknowledgment (§4.6.4's
    /// `NORM_CMD(ACK_REQ)` handling) — forwarded as `RX_ACK_REQUEST`.
    AckRequested(ObjectId),
    /// A stream object's ring buffer evicted unread bytes on this write —
    /// forwarded as `RX_OBJECT_UPDATED`.
    ObjectUpdated(ObjectId),
    /// SQUELCH invalidated an admitted object before it completed —
    /// forwarded as `RX_OBJECT_ABORTED`.
    ObjectAborted(ObjectId),
}

/// Smoothed receive-rate estimate (bits/sec), fed back to the sender as CC
/// feedback (§4.6.4). EWMA over each message's instantaneous inter-arrival
/// rate — the same shape as the sender's `NominalSizeEstimator`, just
/// measuring incoming bytes instead of outgoing payload size.
struct ReceiveRateTracker {
    last_sample: Option<Instant>,
    rate_bps: f64,
}

impl ReceiveRateTracker {
    fn new() -> Self {
        ReceiveRateTracker { last_sample: None, rate_bps: 0.0 }
    }

    fn record(&mut self, bytes: usize, now: Instant) {
        if let Some(prev) = self.last_sample {
            let elapsed = now.duration_since(prev).as_secs_f64();
            if elapsed > 0.0 {
                let instantaneous = (bytes as f64 * 8.0) / elapsed;
                self.rate_bps = 0.2 * instantaneous + 0.8 * self.rate_bps;
            }
        }
        self.last_sample = Some(now);
    }

    fn rate_bps(&self) -> f64 {
        self.rate_bps
    }
}

/// Exponential random back-off over `[0, 2*grtt*backoffFactor]`-ish, per
/// §4.6.3's `ExponentialRand(grttAdvertised*backoffFactor, groupSize)`,
/// simplified to a uniform-over-the-exponential-mean draw — this receiver
/// tracks group size 1 (no group-size-scaled fan-in to bias against).
pub fn nack_backoff(grtt_advertised: std::time::Duration, backoff_factor: f64) -> std::time::Duration {
    let mean = grtt_advertised.as_secs_f64() * backoff_factor.max(0.0);
    if mean <= 0.0 {
        return std::time::Duration::ZERO;
    }
    let u: f64 = rand::rng().random_range(0.0..1.0_f64);
    let draw = -mean * (1.0 - u).ln();
    std::time::Duration::from_secs_f64(draw.min(mean * 8.0))
}

/// One remote sender this receiver is synchronized with: its admitted
/// objects, the sync policy governing new-object admission, and activity
/// bookkeeping for the rxRobustFactor-repeated liveness timer (§4.6.6).
pub struct RemoteSenderNode {
    pub sender_id: u32,
    instance_id: u16,
    sync_policy: SyncPolicy,
    nacking_mode: NackingMode,
    rx_robust_factor: u32,
    synced: bool,
    rx_table: HashMap<ObjectId, Object>,
    block_pool: BlockPool,
    segment_pool: SegmentPool,
    pending_info: HashMap<ObjectId, Bytes>,
    stats: ReceiverStats,
    events: Vec<ReceiverEvent>,
    activity_remaining: u32,
    loss_estimator: LossEventEstimator,
    rate_tracker: ReceiveRateTracker,
    /// Sender's last-advertised GRTT, echoed directly into `CcFeedback` as
    /// `rtt_quantized` — this node has no independent RTT measurement of
    /// its own, so it reports the sender's own estimate back to it.
    last_grtt_quantized: u8,
    last_cc_sequence: u32,
}

impl RemoteSenderNode {
    pub fn new(sender_id: u32, instance_id: u16, config: &SessionConfig) -> Self {
        RemoteSenderNode {
            sender_id,
            instance_id,
            sync_policy: config.default_sync_policy,
            nacking_mode: config.default_nacking_mode,
            rx_robust_factor: config.rx_robust_factor,
            synced: matches!(config.default_sync_policy, SyncPolicy::All),
            rx_table: HashMap::new(),
            block_pool: BlockPool::new(config.tx_cache_count_max),
            segment_pool: SegmentPool::new(
                config.tx_cache_count_max * (config.ndata as usize + config.nparity as usize),
                config.segment_size as usize,
            ),
            pending_info: HashMap::new(),
            stats: ReceiverStats::new(),
            events: Vec::new(),
            activity_remaining: config.rx_robust_factor,
            loss_estimator: LossEventEstimator::new(),
            rate_tracker: ReceiveRateTracker::new(),
            last_grtt_quantized: 0,
            last_cc_sequence: 0,
        }
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ReceiverEvent> + '_ {
        self.events.drain(..)
    }

    /// Pull out only the events the session needs to translate into
    /// embedder-visible `NormEvent`s right away (`Deliver`, `AckRequested`,
    /// `ObjectUpdated`). `SendNack`/`SendAck`/`ObjectCompleted` stay queued
    /// for `drain_events` — removing them here before `drain_outbound` gets
    /// a chance to forward them would silently drop outbound repair/ack
    /// traffic.
    pub fn drain_notifications(&mut self) -> Vec<ReceiverEvent> {
        let mut out = Vec::new();
        self.events.retain(|ev| match ev {
            ReceiverEvent::Deliver { .. }
            | ReceiverEvent::AckRequested(_)
            | ReceiverEvent::ObjectUpdated(_)
            | ReceiverEvent::ObjectAborted(_) => {
                out.push(ev.clone());
                false
            }
            _ => true,
        });
        out
    }

    pub fn object_count(&self) -> usize {
        self.rx_table.len()
    }

    /// Admission gate (§4.6.1): `SYNC_CURRENT` only admits objects that
    /// arrive from this point forward (the first message seen establishes
    /// the baseline), `SYNC_STREAM` admits any open stream object,
    /// `SYNC_ALL` admits everything unconditionally.
    fn should_admit(&mut self, is_stream: bool) -> bool {
        match self.sync_policy {
            SyncPolicy::All => true,
            SyncPolicy::Stream => is_stream || self.synced,
            SyncPolicy::Current => {
                self.synced = true;
                true
            }
        }
    }

    fn admit_object(&mut self, object_id: ObjectId, geometry: Geometry, is_stream: bool) -> Result<()> {
        if self.rx_table.contains_key(&object_id) {
            return Ok(());
        }
        if !self.should_admit(is_stream) {
            return Ok(());
        }
        let backing = if is_stream {
            Backing::Stream(crate::object::StreamStore::new(
                geometry.block_payload_bytes() as usize * 8,
            ))
        } else {
            Backing::Data(DataStore::new(bytes::BytesMut::zeroed(geometry.object_size as usize)))
        };
        let object = Object::open(object_id, Role::Receiver, geometry, None, backing)?;
        self.rx_table.insert(object_id, object);
        Ok(())
    }

    /// Handle an INFO message: admit the object if not yet known, and
    /// buffer the info payload for delivery alongside the object's data.
    pub fn on_info(&mut self, msg: InfoMsg) -> Result<()> {
        self.last_grtt_quantized = msg.fields.grtt_quantized;
        let is_stream = msg.fields.flags & crate::wire::obj_flags::STREAM != 0;
        if let Some(fti) = msg.fti {
            let geometry = Geometry {
                fec_scheme: fec_scheme_of(fti.fec_id),
                seg_size: fti.segment_size,
                ndata: fti.ndata,
                nparity: fti.nparity,
                object_size: fti.object_size,
            };
            self.admit_object(msg.fields.object_id, geometry, is_stream)?;
        }
        self.pending_info.insert(msg.fields.object_id, msg.info_payload);
        Ok(())
    }

    /// Handle a DATA message: admit the object from its FTI if this is the
    /// first symbol seen for it, then feed the symbol through to the
    /// object's FEC/reassembly state.
    pub fn on_data(&mut self, msg: DataMsg, now: Instant) -> Result<()> {
        let object_id = msg.fields.object_id;
        self.last_grtt_quantized = msg.fields.grtt_quantized;
        self.rate_tracker.record(msg.payload.len(), now);
        let is_stream = msg.fields.flags & crate::wire::obj_flags::STREAM != 0;
        if !self.rx_table.contains_key(&object_id) {
            let Some(fti) = msg.fti else {
                // No FTI and object unseen: nothing to size storage with.
                return Ok(());
            };
            let geometry = Geometry {
                fec_scheme: fec_scheme_of(fti.fec_id),
                seg_size: fti.segment_size,
                ndata: fti.ndata,
                nparity: fti.nparity,
                object_size: fti.object_size,
            };
            self.admit_object(object_id, geometry, is_stream)?;
        }
        let Some(object) = self.rx_table.get_mut(&object_id) else {
            return Ok(());
        };
        let is_parity = msg.fec_payload_id.symbol_id >= object.geometry.ndata;
        self.stats.segments_received += 1;
        let outcome = object.handle_object_message(
            msg.fec_payload_id.block_id,
            msg.fec_payload_id.symbol_id,
            is_parity,
            msg.payload,
            &mut self.block_pool,
            &mut self.segment_pool,
        )?;
        match outcome {
            ReceiveOutcome::Duplicate => self.stats.duplicates += 1,
            ReceiveOutcome::TooOld => self.stats.late_segments += 1,
            ReceiveOutcome::BlockCompleted(_) => {
                self.loss_estimator.record_received();
                self.stats.fec_recoveries += 1;
                if object.is_complete() {
                    let info = self.pending_info.remove(&object_id);
                    let data = match &object.backing {
                        Backing::Data(d) => Bytes::copy_from_slice(d.as_slice()),
                        _ => Bytes::new(),
                    };
                    self.stats.objects_completed += 1;
                    self.events.push(ReceiverEvent::Deliver { object_id, info, data });
                    self.events.push(ReceiverEvent::ObjectCompleted(object_id));
                }
            }
            ReceiveOutcome::Accepted => {
                self.loss_estimator.record_received();
            }
        }
        if object.take_stream_evicted() {
            self.events.push(ReceiverEvent::ObjectUpdated(object_id));
        }
        Ok(())
    }

    /// Handle a CMD message: `FLUSH` triggers a positive ACK if this node
    /// is named as an acker, `SQUELCH` drops objects the sender has
    /// invalidated, `CC` feeds congestion feedback (handled by the caller,
    /// which owns the session-wide CC state).
    pub fn on_cmd(&mut self, msg: &CmdMsg, self_node_id: u32) {
        self.last_grtt_quantized = msg.grtt_quantized;
        match &msg.flavor {
            CmdFlavor::Flush { object_id, ackers, .. } => {
                if ackers.is_empty() || ackers.contains(&self_node_id) {
                    if let Some(object) = self.rx_table.get(object_id) {
                        if object.is_complete() {
                            self.emit_ack(AckType::Flush, *object_id);
                        }
                    }
                }
            }
            CmdFlavor::Squelch { invalid_objects, .. } => {
                for obj in invalid_objects {
                    if self.rx_table.remove(obj).is_some() {
                        self.events.push(ReceiverEvent::ObjectAborted(*obj));
                    }
                    self.pending_info.remove(obj);
                }
            }
            CmdFlavor::AckReq { object_id } => {
                self.emit_ack(AckType::Flush, *object_id);
                self.events.push(ReceiverEvent::AckRequested(*object_id));
            }
            CmdFlavor::Cc { cc_sequence, .. } => {
                self.last_cc_sequence = *cc_sequence;
            }
            _ => {}
        }
    }

    /// Current CC feedback snapshot (§4.6.4): this node's smoothed loss and
    /// receive-rate estimates, plus the sender's own last-advertised GRTT
    /// and CC sequence echoed straight back.
    fn current_cc_feedback(&self) -> CcFeedback {
        CcFeedback {
            flags: 0,
            cc_sequence: self.last_cc_sequence,
            rtt_quantized: self.last_grtt_quantized,
            loss_quantized: quantize_loss32(self.loss_estimator.loss_fraction()),
            rate_quantized: quantize_rate(self.rate_tracker.rate_bps()),
        }
    }

    fn emit_ack(&mut self, ack_type: AckType, object_id: ObjectId) {
        self.stats.acks_sent += 1;
        self.events.push(ReceiverEvent::SendAck(AckMsg {
            header: CommonHeader { version: NORM_VERSION, msg_type: NormMsgType::Ack, sequence: 0, source_id: self.sender_id },
            instance_id: self.instance_id,
            sender_id: self.sender_id,
            ack_type,
            object_id,
            block_id: 0,
            symbol_id: 0,
            grtt_response_us: None,
            cc_feedback: Some(self.current_cc_feedback()),
        }));
    }

    /// Build a coalesced NACK covering every object with outstanding gaps
    /// (§4.6.3): one or two missing blocks per object use `ITEMS`, three or
    /// more use `RANGES` (endpoints only). Returns `None` if there is
    /// nothing to repair or NACKing is disabled.
    pub fn build_nack(&mut self, self_node_id: u32) -> Option<NackMsg> {
        if self.nacking_mode == NackingMode::None {
            return None;
        }
        let mut requests = Vec::new();
        for (&object_id, object) in self.rx_table.iter() {
            let missing = object.append_repair_request();
            if missing.is_empty() {
                continue;
            }
            let item = |block_id: u32| RepairItem { object_id, block_id, block_len: object.geometry.ndata, symbol_id: 0 };
            if missing.len() <= 2 {
                requests.push(RepairRequest {
                    form: RepairForm::Items,
                    flags: repair_flags::BLOCK,
                    items: missing.iter().map(|&b| item(b)).collect(),
                });
            } else {
                let first = *missing.first().unwrap();
                let last = *missing.last().unwrap();
                requests.push(RepairRequest {
                    form: RepairForm::Ranges,
                    flags: repair_flags::BLOCK,
                    items: vec![item(first), item(last)],
                });
            }
        }
        if requests.is_empty() {
            return None;
        }
        self.stats.nacks_sent += 1;
        // One loss event per aggregated NACK, not per missing block — a
        // burst of gaps discovered together is one congestion signal.
        self.loss_estimator.record_loss_event();
        let nack = NackMsg {
            header: CommonHeader { version: NORM_VERSION, msg_type: NormMsgType::Nack, sequence: 0, source_id: self_node_id },
            instance_id: self.instance_id,
            sender_id: self.sender_id,
            grtt_response_us: None,
            cc_feedback: Some(self.current_cc_feedback()),
            repair_requests: requests,
        };
        self.events.push(ReceiverEvent::SendNack(nack.clone()));
        Some(nack)
    }

    /// Reset the liveness counter on any message seen from this sender
    /// (§4.6.6). Returns `true` once the activity timer has repeated
    /// `rxRobustFactor` times with nothing heard — the caller should then
    /// drop this node.
    pub fn touch(&mut self) {
        self.activity_remaining = self.rx_robust_factor;
    }

    pub fn activity_timeout(&mut self) -> bool {
        if self.activity_remaining == 0 {
            return true;
        }
        self.activity_remaining -= 1;
        false
    }
}

fn fec_scheme_of(fec_id: u8) -> crate::gf::FecScheme {
    match fec_id {
        5 => crate::gf::FecScheme::Rs16,
        129 => crate::gf::FecScheme::Mdp,
        _ => crate::gf::FecScheme::Rs8,
    }
}
