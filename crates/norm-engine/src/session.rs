//! # Session composition
//!
//! `Session` is the composition root of §4.7: it owns the `SenderEngine`
//! and the per-remote-sender table, drives the seven named timers from an
//! externally-ticked `TimerWheel`, and dispatches decoded `NormMsg`s to
//! §4.5/§4.6. Grounded on the grounding repository's `Session`/`RttTracker`
//! pair — a pure, non-blocking state machine with no socket ownership —
//! generalized from a two-party handshake session to NORM's dispatch-by-
//! message-type composition. Actual socket I/O is modeled as the
//! `SessionIo` boundary trait (§1); no `UdpSocket` lives in this module.

use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::config::SessionConfig;
use crate::object::ObjectId;
use crate::receiver::{nack_backoff, RemoteSenderNode, ReceiverEvent};
use crate::sender::{ObjectSpec, SenderEngine};
use crate::wire::{AckType, NormMsg};

/// The seven named timers of §4.7, plus the optional embedder-scheduled
/// user timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    Pacing,
    Probe,
    RepairAggregation,
    Flush,
    FlowControl,
    CmdRetransmit,
    Report,
    User,
}

/// A min-heap of `(deadline, timer)` pairs. `BinaryHeap` is a max-heap by
/// default, so entries are wrapped in `Reverse` at insertion (`arm`) and
/// unwrapped in `pop_due` — the Design Notes call out a priority queue by
/// name as the preferred structure for a reentrant-tolerant timer set.
pub struct TimerWheel {
    heap: BinaryHeap<std::cmp::Reverse<(Instant, TimerId)>>,
    intervals: HashMap<TimerId, Duration>,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel { heap: BinaryHeap::new(), intervals: HashMap::new() }
    }

    /// Arm (or re-arm) a timer to fire `delay` from `now`. Armed from the
    /// timer's own callback to reschedule itself, per §5's reentrant
    /// requirement.
    pub fn arm(&mut self, timer: TimerId, now: Instant, delay: Duration) {
        self.intervals.insert(timer, delay);
        self.heap.push(std::cmp::Reverse((now + delay, timer)));
    }

    /// Drain every timer whose deadline has passed, in deadline order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(std::cmp::Reverse((deadline, timer))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            due.push(timer);
        }
        due
    }

    pub fn is_armed(&self, timer: TimerId) -> bool {
        self.heap.iter().any(|std::cmp::Reverse((_, t))| *t == timer)
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

/// The boundary trait between this deterministic, unit-testable core and
/// real non-blocking UDP I/O (§1, §4.7.1: platform socket/timer wrappers
/// are out of scope for this crate). An embedder's impl binds a socket,
/// joins the multicast group, and maps `sendto`'s would-block into
/// `Ok(false)` so the pacer can suspend per §5.
pub trait SessionIo {
    /// Best-effort, non-blocking send. `Ok(false)` means would-block: the
    /// caller suspends the pacer and waits for a writable notification.
    fn send_to(&mut self, bytes: &Bytes) -> anyhow::Result<bool>;
}

/// Single enum of embedder-visible occurrences (§6), generalized from the
/// grounding repository's `SessionEvent` to NORM's notification set.
#[derive(Debug, Clone)]
pub enum NormEvent {
    TxQueueEmpty,
    TxQueueVacancy,
    TxCmdSent { object_id: ObjectId },
    TxFlushCompleted { object_id: ObjectId },
    TxWatermarkCompleted { object_id: ObjectId, failed_ackers: Vec<u32> },
    TxObjectSent { object_id: ObjectId },
    TxObjectPurged { object_id: ObjectId },
    TxRateChanged { bps: f64 },
    RxObjectNew { sender_id: u32, object_id: ObjectId },
    RxObjectInfo { sender_id: u32, object_id: ObjectId },
    RxObjectUpdated { sender_id: u32, object_id: ObjectId },
    RxObjectCompleted { sender_id: u32, object_id: ObjectId, info: Option<Bytes>, data: Bytes },
    RxObjectAborted { sender_id: u32, object_id: ObjectId },
    RxCmdNew { sender_id: u32 },
    RxAckRequest { sender_id: u32, object_id: ObjectId },
    RemoteSenderNew { sender_id: u32 },
    RemoteSenderReset { sender_id: u32 },
    /// Reserved for a remote sender transitioning back from near-timeout
    /// to actively heard-from again — this crate's liveness timer
    /// currently only tracks the countdown-to-zero direction (§4.6.6);
    /// no emission site exists yet without a "was it close to zero"
    /// history on `RemoteSenderNode`.
    RemoteSenderActive { sender_id: u32 },
    RemoteSenderInactive { sender_id: u32 },
    /// Reserved: this crate's `SessionIo` boundary carries no socket
    /// address, so there is nothing to report here (§1 — no `UdpSocket`
    /// lives in this crate).
    RemoteSenderAddress { sender_id: u32 },
    /// Reserved: acking-node management (an explicit receiver allow-list
    /// for watermark ACKs, distinct from `CmdFlavor::Flush`'s `ackers`
    /// field) isn't modeled by this engine.
    AckingNodeNew { node_id: u32 },
    CcActive,
    CcInactive,
    GrttUpdated { grtt_us: f64 },
    UserTimeout,
    SendError,
    SendOk,
}

/// One NORM session: the local sender engine (if this node transmits) and
/// the table of remote senders this node is receiving from, bound together
/// by the timer wheel and message dispatch. Mirrors the ownership rule of
/// §9: the session exclusively owns both tables; objects and remote-sender
/// nodes hold no owning back-reference to it.
pub struct Session {
    pub config: SessionConfig,
    pub local_id: u32,
    pub sender: SenderEngine,
    remote_senders: HashMap<u32, RemoteSenderNode>,
    instance_epoch: HashMap<u32, u16>,
    timers: TimerWheel,
    events: Vec<NormEvent>,
    /// CMD(FLUSH) messages queued by `request_flush`/`resend_flush`, sent
    /// alongside the sender engine's own paced output.
    extra_outbound: Vec<NormMsg>,
    /// Objects with an outstanding watermark ACK request, and the ackers
    /// being waited on — driven to completion by the `Flush`/
    /// `CmdRetransmit` timers (§4.5.5).
    flush_pending: HashMap<ObjectId, Vec<u32>>,
    last_send_failed: bool,
    resync_count: u64,
}

impl Session {
    pub fn new(config: SessionConfig, local_id: u32, now: Instant) -> Self {
        let sender = SenderEngine::new(config.clone(), local_id, now);
        let mut timers = TimerWheel::new();
        timers.arm(TimerId::Probe, now, config.grtt_interval_min);
        timers.arm(TimerId::Report, now, Duration::from_secs(10));
        timers.arm(TimerId::RepairAggregation, now, config.grtt_max);
        timers.arm(TimerId::FlowControl, now, config.activity_min);
        timers.arm(TimerId::CmdRetransmit, now, config.grtt_max);
        Session {
            config,
            local_id,
            sender,
            remote_senders: HashMap::new(),
            instance_epoch: HashMap::new(),
            timers,
            events: Vec::new(),
            extra_outbound: Vec::new(),
            flush_pending: HashMap::new(),
            last_send_failed: false,
            resync_count: 0,
        }
    }

    /// Request a positive watermark ACK for a completed object (§4.5.5):
    /// sends the initial `CMD(FLUSH)` and arms the `Flush`/`CmdRetransmit`
    /// timers' bookkeeping so the request is retried and eventually
    /// resolved into a `TX_WATERMARK_COMPLETED` notification. Returns
    /// `false` if the object isn't known or isn't actually complete yet.
    pub fn request_flush(&mut self, object_id: ObjectId, ackers: Vec<u32>) -> bool {
        match self.sender.request_flush(object_id, ackers.clone()) {
            Some(msg) => {
                self.extra_outbound.push(msg);
                self.flush_pending.insert(object_id, ackers);
                self.events.push(NormEvent::TxCmdSent { object_id });
                true
            }
            None => false,
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NormEvent> + '_ {
        self.events.drain(..)
    }

    pub fn open_object(&mut self, spec: ObjectSpec) -> crate::error::Result<()> {
        let object_id = spec.object_id;
        self.sender.open_object(spec)?;
        tracing::debug!(object_id, "object queued for transmission");
        Ok(())
    }

    fn admit_remote_sender(&mut self, sender_id: u32, instance_id: u16) -> &mut RemoteSenderNode {
        let changed_instance = self
            .instance_epoch
            .get(&sender_id)
            .is_some_and(|&prev| prev != instance_id);
        if changed_instance || !self.remote_senders.contains_key(&sender_id) {
            if changed_instance {
                tracing::warn!(sender_id, "instance id changed, resetting remote sender state");
                self.resync_count += 1;
                self.events.push(NormEvent::RemoteSenderReset { sender_id });
            } else {
                self.events.push(NormEvent::RemoteSenderNew { sender_id });
            }
            self.remote_senders
                .insert(sender_id, RemoteSenderNode::new(sender_id, instance_id, &self.config));
            self.instance_epoch.insert(sender_id, instance_id);
        }
        self.remote_senders.get_mut(&sender_id).expect("just inserted")
    }

    /// Route one decoded wire message, per §4.7's dispatch step: resolve to
    /// a remote sender (creating it if admission allows), then hand off to
    /// §4.5 (messages destined at `self.local_id`) or §4.6 (messages from a
    /// sender this node is receiving).
    pub fn on_message(&mut self, msg: NormMsg, now: Instant) -> crate::error::Result<()> {
        match msg {
            NormMsg::Info(m) => {
                let sender_id = m.header.source_id;
                let object_id = m.fields.object_id;
                let node = self.admit_remote_sender(sender_id, m.fields.instance_id);
                node.touch();
                node.on_info(m)?;
                self.events.push(NormEvent::RxObjectInfo { sender_id, object_id });
                self.drain_receiver_events(now);
            }
            NormMsg::Data(m) => {
                let node = self.admit_remote_sender(m.header.source_id, m.fields.instance_id);
                node.touch();
                node.on_data(m, now)?;
                self.drain_receiver_events(now);
            }
            NormMsg::Cmd(m) => {
                let local_id = self.local_id;
                let sender_id = m.header.source_id;
                let node = self.admit_remote_sender(sender_id, m.instance_id);
                node.touch();
                node.on_cmd(&m, local_id);
                self.events.push(NormEvent::RxCmdNew { sender_id });
                self.drain_receiver_events(now);
            }
            NormMsg::Nack(m) => {
                if m.sender_id == self.local_id {
                    self.sender.process_nack(&m);
                }
            }
            NormMsg::Ack(m) => {
                if m.sender_id == self.local_id {
                    let completed = self.sender.process_ack(m.ack_type, m.object_id);
                    if completed && m.ack_type == AckType::Flush {
                        self.flush_pending.remove(&m.object_id);
                        self.events.push(NormEvent::TxWatermarkCompleted {
                            object_id: m.object_id,
                            failed_ackers: Vec::new(),
                        });
                    }
                }
            }
            NormMsg::Report(_) => {}
        }
        Ok(())
    }

    fn drain_receiver_events(&mut self, _now: Instant) {
        for (&sender_id, node) in self.remote_senders.iter_mut() {
            for ev in node.drain_notifications() {
                match ev {
                    ReceiverEvent::Deliver { object_id, info, data } => {
                        self.events.push(NormEvent::RxObjectNew { sender_id, object_id });
                        self.events.push(NormEvent::RxObjectCompleted { sender_id, object_id, info, data });
                    }
                    ReceiverEvent::AckRequested(object_id) => {
                        self.events.push(NormEvent::RxAckRequest { sender_id, object_id });
                    }
                    ReceiverEvent::ObjectUpdated(object_id) => {
                        self.events.push(NormEvent::RxObjectUpdated { sender_id, object_id });
                    }
                    ReceiverEvent::ObjectAborted(object_id) => {
                        self.events.push(NormEvent::RxObjectAborted { sender_id, object_id });
                    }
                    ReceiverEvent::ObjectCompleted(_) | ReceiverEvent::SendNack(_) | ReceiverEvent::SendAck(_) => {}
                }
            }
        }
    }

    /// Messages this session has queued for transmission right now: the
    /// sender engine's paced DATA/INFO output, standing FLUSH commands,
    /// plus any NACK/ACK queued by a remote-sender node. Wire-encoded and
    /// handed to `SessionIo`.
    pub fn drain_outbound(&mut self) -> Vec<Bytes> {
        let mut out: Vec<Bytes> = self.sender.drain_output().map(|m| m.encode()).collect();
        out.extend(self.extra_outbound.drain(..).map(|m| m.encode()));
        for node in self.remote_senders.values_mut() {
            for ev in node.drain_events() {
                match ev {
                    ReceiverEvent::SendNack(n) => out.push(NormMsg::Nack(n).encode()),
                    ReceiverEvent::SendAck(a) => out.push(NormMsg::Ack(a).encode()),
                    _ => {}
                }
            }
        }
        out
    }

    /// One engine step: service the sender's tick, then run every timer
    /// that's come due, re-arming each from its own callback per §5.
    pub fn tick(&mut self, now: Instant) -> crate::error::Result<()> {
        self.sender.serve()?;
        for timer in self.timers.pop_due(now) {
            self.fire_timer(timer, now);
        }
        Ok(())
    }

    fn fire_timer(&mut self, timer: TimerId, now: Instant) {
        match timer {
            TimerId::Pacing => {
                // Re-armed per message by the caller via `pacing_interval`;
                // nothing to do on a bare tick.
            }
            TimerId::Probe => {
                let nodes_before = self.sender.cc.active_node_count();
                self.sender.probe_tick(now, self.config.grtt_min);
                let nodes_after = self.sender.cc.active_node_count();
                if nodes_before == 0 && nodes_after > 0 {
                    self.events.push(NormEvent::CcActive);
                } else if nodes_before > 0 && nodes_after == 0 {
                    self.events.push(NormEvent::CcInactive);
                }
                self.events.push(NormEvent::GrttUpdated { grtt_us: self.sender.grtt.grtt_us() });
                let interval = next_grtt_interval(self.config.grtt_interval_min, self.config.grtt_interval_max);
                self.timers.arm(TimerId::Probe, now, interval);
            }
            TimerId::RepairAggregation => {
                // One NACK-construction pass per aggregation window, not
                // one per missing symbol (§4.5.4): every remote-sender
                // node folds its accumulated gaps into a single coalesced
                // NACK here, queued via `build_nack`'s own `SendNack` push.
                let local_id = self.local_id;
                for node in self.remote_senders.values_mut() {
                    node.build_nack(local_id);
                }
                let backoff = nack_backoff(self.config.grtt_max, self.config.backoff_factor)
                    .max(self.config.grtt_min);
                self.timers.arm(TimerId::RepairAggregation, now, backoff);
            }
            TimerId::Flush => {
                let object_ids: Vec<ObjectId> = self.flush_pending.keys().copied().collect();
                for object_id in object_ids {
                    if self.sender.flush_timeout(object_id) {
                        let failed_ackers = self.flush_pending.remove(&object_id).unwrap_or_default();
                        self.events.push(NormEvent::TxWatermarkCompleted { object_id, failed_ackers });
                    }
                }
                self.timers.arm(TimerId::Flush, now, self.config.grtt_max);
            }
            TimerId::FlowControl => {
                let mut dead = Vec::new();
                for (&sender_id, node) in self.remote_senders.iter_mut() {
                    if node.activity_timeout() {
                        dead.push(sender_id);
                    }
                }
                for sender_id in dead {
                    self.remote_senders.remove(&sender_id);
                    tracing::info!(sender_id, "remote sender inactive, removed");
                    self.events.push(NormEvent::RemoteSenderInactive { sender_id });
                }
                self.timers.arm(TimerId::FlowControl, now, self.config.activity_min);
            }
            TimerId::CmdRetransmit => {
                // Re-send the standing FLUSH for every object still awaiting
                // a positive ACK (§4.5.5) — distinct from `Flush`'s budget
                // countdown, this timer just keeps the wire request alive.
                let pending: Vec<(ObjectId, Vec<u32>)> =
                    self.flush_pending.iter().map(|(&id, ackers)| (id, ackers.clone())).collect();
                for (object_id, ackers) in pending {
                    if let Some(msg) = self.sender.resend_flush(object_id, ackers) {
                        self.extra_outbound.push(msg);
                        self.events.push(NormEvent::TxCmdSent { object_id });
                    }
                }
                self.timers.arm(TimerId::CmdRetransmit, now, self.config.grtt_max);
            }
            TimerId::Report => {
                self.timers.arm(TimerId::Report, now, Duration::from_secs(10));
            }
            TimerId::User => {
                self.events.push(NormEvent::UserTimeout);
            }
        }
    }

    /// Re-arm the embedder-scheduled user timer (§5: "the user timer may
    /// be rescheduled at will").
    pub fn schedule_user_timer(&mut self, now: Instant, delay: Duration) {
        self.timers.arm(TimerId::User, now, delay);
    }

    /// Send a raw UDP-receive through the full decode-then-dispatch path
    /// (§4.7's "Dispatch" bullet). Wire-format errors drop the packet and
    /// log at `ERROR` rather than propagating to the embedder (§7).
    pub fn handle_incoming(&mut self, raw: &[u8], now: Instant) {
        match NormMsg::decode(raw) {
            Ok(msg) => {
                if let Err(e) = self.on_message(msg, now) {
                    tracing::error!(error = %e, "failed to dispatch decoded message");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "dropping malformed message");
            }
        }
    }

    /// Push a message through a `SessionIo` impl, translating transient
    /// would-block into pacer suspension and persistent failure into a
    /// `SEND_ERROR`/`SEND_OK` edge-triggered notification pair (§7).
    pub fn send_via<IO: SessionIo>(&mut self, io: &mut IO, bytes: &Bytes) {
        match io.send_to(bytes) {
            Ok(true) => {
                if self.last_send_failed {
                    self.events.push(NormEvent::SendOk);
                    self.last_send_failed = false;
                }
            }
            Ok(false) => {
                // Would-block: pacer suspension is the caller's job (it
                // owns the pacing timer's arm/disarm); nothing to notify.
            }
            Err(e) => {
                tracing::warn!(error = %e, "persistent send failure");
                if !self.last_send_failed {
                    self.events.push(NormEvent::SendError);
                    self.last_send_failed = true;
                }
            }
        }
    }

    pub fn remote_sender_count(&self) -> usize {
        self.remote_senders.len()
    }

    pub fn resync_count(&self) -> u64 {
        self.resync_count
    }
}

/// §4.5.3's `grttInterval`, 1.5x'd each probe and clamped to
/// `[grttIntervalMin, grttIntervalMax]`.
fn next_grtt_interval(min: Duration, max: Duration) -> Duration {
    let scaled = min.mul_f64(1.5);
    scaled.clamp(min, max)
}
