//! # Session configuration
//!
//! `SessionConfig` collects every externally tunable knob (§6) behind one
//! validated struct, the way the grounding repository's `SenderConfig`/
//! `ReceiverConfig` do: a `Default` impl matching the documented
//! order-of-magnitude defaults, plus builder-style `with_*` setters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{NormError, Result};
use crate::gf::FecScheme;

/// Repair scheduling granularity a NACK may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairBoundary {
    Block,
    Object,
}

/// Per-object NACK verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackingMode {
    None,
    InfoOnly,
    Normal,
}

/// Receiver synchronization policy (§4.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolicy {
    Current,
    Stream,
    All,
}

/// Probing mode for GRTT/CC feedback solicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbingMode {
    None,
    Passive,
    Active,
}

/// Every externally tunable knob of one NORM session (§6). `Default`
/// matches the reference implementation's compiled-in defaults and §5's
/// order-of-magnitude timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub ttl: u8,
    pub tos: u8,
    pub loopback: bool,
    pub mcast_loopback: bool,
    pub ecn_enabled: bool,

    pub tx_rate_bps: f64,
    pub tx_rate_min_bps: f64,
    pub tx_rate_max_bps: f64,
    pub backoff_factor: f64,
    pub tx_robust_factor: u32,
    pub rx_robust_factor: u32,

    pub fec_scheme: FecScheme,
    pub ndata: u16,
    pub nparity: u16,
    pub segment_size: u16,

    pub grtt_interval_min: Duration,
    pub grtt_interval_max: Duration,
    pub grtt_max: Duration,
    pub probing_mode: ProbingMode,
    pub cc_enable: bool,
    pub cc_adjust: bool,

    pub tx_cache_count_min: usize,
    pub tx_cache_count_max: usize,
    pub tx_cache_size_max: u64,
    pub rx_cache_max: u64,

    pub silent: bool,
    pub low_delay: bool,
    pub real_time: bool,
    pub ignore_info: bool,
    pub max_delay: u32,

    pub default_repair_boundary: RepairBoundary,
    pub default_nacking_mode: NackingMode,
    pub default_sync_policy: SyncPolicy,
    pub unicast_nacks: bool,

    pub activity_min: Duration,
    pub grtt_min: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ttl: 64,
            tos: 0,
            loopback: false,
            mcast_loopback: false,
            ecn_enabled: false,

            tx_rate_bps: 64_000.0,
            tx_rate_min_bps: 8_000.0,
            tx_rate_max_bps: 100_000_000.0,
            backoff_factor: 4.0,
            tx_robust_factor: 20,
            rx_robust_factor: 20,

            fec_scheme: FecScheme::Rs8,
            ndata: 64,
            nparity: 16,
            segment_size: 1400,

            grtt_interval_min: Duration::from_secs(1),
            grtt_interval_max: Duration::from_secs(30),
            grtt_max: Duration::from_secs(10),
            probing_mode: ProbingMode::Passive,
            cc_enable: false,
            cc_adjust: false,

            tx_cache_count_min: 2,
            tx_cache_count_max: 256,
            tx_cache_size_max: 64 * 1024 * 1024,
            rx_cache_max: 64 * 1024 * 1024,

            silent: false,
            low_delay: false,
            real_time: false,
            ignore_info: false,
            max_delay: 0,

            default_repair_boundary: RepairBoundary::Block,
            default_nacking_mode: NackingMode::Normal,
            default_sync_policy: SyncPolicy::Current,
            unicast_nacks: false,

            activity_min: Duration::from_secs(1),
            grtt_min: Duration::from_millis(10),
        }
    }
}

impl SessionConfig {
    pub fn with_tx_rate(mut self, bps: f64) -> Self {
        self.tx_rate_bps = bps;
        self
    }

    pub fn with_fec(mut self, scheme: FecScheme, ndata: u16, nparity: u16) -> Self {
        self.fec_scheme = scheme;
        self.ndata = ndata;
        self.nparity = nparity;
        self
    }

    pub fn with_segment_size(mut self, size: u16) -> Self {
        self.segment_size = size;
        self
    }

    /// Reject configurations the engine cannot run: zero-sized FEC blocks,
    /// a rate window that doesn't contain the nominal rate, block sizes
    /// outside the chosen field's range, or a segment size of zero.
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(NormError::Config("segment_size must be nonzero".into()));
        }
        if self.ndata == 0 {
            return Err(NormError::Config("ndata must be nonzero".into()));
        }
        if self.nparity == 0 {
            return Err(NormError::Config("nparity must be nonzero".into()));
        }
        let block_size = self.ndata as usize + self.nparity as usize;
        if block_size > self.fec_scheme.max_block_size() {
            return Err(NormError::Config(format!(
                "ndata+nparity={block_size} exceeds {:?}'s max block size {}",
                self.fec_scheme,
                self.fec_scheme.max_block_size()
            )));
        }
        if self.tx_rate_min_bps > self.tx_rate_max_bps {
            return Err(NormError::Config("tx_rate_min_bps exceeds tx_rate_max_bps".into()));
        }
        if self.tx_rate_bps < self.tx_rate_min_bps || self.tx_rate_bps > self.tx_rate_max_bps {
            return Err(NormError::Config("tx_rate_bps outside [tx_rate_min_bps, tx_rate_max_bps]".into()));
        }
        if self.tx_cache_count_min > self.tx_cache_count_max {
            return Err(NormError::Config("tx_cache_count_min exceeds tx_cache_count_max".into()));
        }
        if self.backoff_factor < 0.0 {
            return Err(NormError::Config("backoff_factor must be non-negative".into()));
        }
        Ok(())
    }
}
