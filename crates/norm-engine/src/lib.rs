//! # norm-engine
//!
//! A pure-Rust implementation of the per-session protocol engine of the
//! NACK-Oriented Reliable Multicast family (RFC 5740): reliable,
//! rate-controlled bulk-data transport over UDP for one-to-many and
//! one-to-one delivery. Senders transmit named transport objects
//! partitioned into FEC-coded blocks; receivers reconstruct objects,
//! negatively acknowledge missing symbols, and optionally positively
//! acknowledge watermarks.
//!
//! ## Crate structure
//!
//! - [`wire`] — Message codec: INFO/DATA/CMD/NACK/ACK/REPORT, header
//!   extensions, `RepairRequest` forms, and RTT/rate/loss quantization
//! - [`gf`] — Systematic Reed–Solomon FEC over GF(2^8)/GF(2^16), plus the
//!   legacy MDP variant
//! - [`bitmask`] — Sliding circular pending/repair bit arrays
//! - [`pool`] — Fixed-capacity block/segment pools with stealing policy
//! - [`object`] — Transport object: FEC geometry, masks, storage backings
//! - [`sender`] — Sender engine: tx queue, pacing, GRTT probing, NACK
//!   handling, watermark positive-ACK collection
//! - [`receiver`] — Receiver-side remote-sender tracking: sync policy,
//!   NACK construction/back-off, loss-event estimation
//! - [`congestion`] — TFRC-derived rate equation and CC-node bookkeeping
//! - [`session`] — Composition root: timer wheel, dispatch, `SessionIo`
//!   boundary
//! - [`config`] — `SessionConfig`, the full set of externally tunable knobs
//! - [`stats`] — Per-session sender/receiver statistics
//! - [`error`] — `NormError`, the crate's narrow matchable error enum

pub mod bitmask;
pub mod config;
pub mod congestion;
pub mod error;
pub mod gf;
pub mod object;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod wire;
