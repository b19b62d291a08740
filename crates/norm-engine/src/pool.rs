//! # Block / segment pools
//!
//! Fixed-capacity, pre-allocated pools for per-block state and segment
//! payload buffers, per `SPEC_FULL.md` §4.3. Built the same way the
//! grounding repository's `PacketPool` is: `slab::Slab`-backed for O(1)
//! insert/remove with zero heap churn once pre-sized. Unlike that single
//! flat pool, `take()` here returns `None` on exhaustion rather than
//! failing silently, so object/engine code can run the stealing policy
//! (§4.4) before giving up.

use bytes::BytesMut;
use slab::Slab;
use std::collections::VecDeque;
use std::time::Instant;

use crate::bitmask::SlidingBitmask;

// ─── Block pool ─────────────────────────────────────────────────────────────

/// Handle to a materialized block's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub usize);

/// Per-block materialized state: the block's own `pending`/`repair`
/// sub-masks over its symbols, its parity readiness/erasure counts, the
/// segment buffers attached to it (leased from the `SegmentPool`), and the
/// in-progress parity accumulator used by incremental encoding.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub block_id: u32,
    pub ndata: u16,
    pub nparity: u16,
    pub pending: SlidingBitmask,
    pub repair: SlidingBitmask,
    pub segments: Vec<Option<SegmentHandle>>,
    /// Count of source symbols that have contributed to `parity_buf` so
    /// far. Parity symbols are only safe to emit once this reaches `ndata`.
    pub parity_readiness: u16,
    /// One accumulator per parity symbol, resized lazily by
    /// `RsCodec::encode_symbol` on first contribution.
    pub parity_buf: Vec<Vec<u8>>,
    /// Count of source symbols known missing (receive side).
    pub erasure_count: u16,
}

impl BlockEntry {
    fn new(block_id: u32, ndata: u16, nparity: u16) -> Self {
        let nsegments = ndata + nparity;
        BlockEntry {
            block_id,
            ndata,
            nparity,
            pending: SlidingBitmask::new(nsegments as u32, 0),
            repair: SlidingBitmask::new(nsegments as u32, 0),
            segments: vec![None; nsegments as usize],
            parity_readiness: 0,
            parity_buf: vec![Vec::new(); nparity as usize],
            erasure_count: 0,
        }
    }
}

/// Fixed count of preallocated per-block state structures; LIFO reuse via
/// the slab's own free list.
pub struct BlockPool {
    entries: Slab<BlockEntry>,
    capacity: usize,
}

impl BlockPool {
    pub fn new(capacity: usize) -> Self {
        BlockPool {
            entries: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Materialize a new block. Returns `None` if the pool is exhausted —
    /// the caller should attempt stealing before treating this as fatal.
    pub fn take(&mut self, block_id: u32, ndata: u16, nparity: u16) -> Option<BlockHandle> {
        if self.entries.len() >= self.capacity {
            return None;
        }
        let key = self.entries.insert(BlockEntry::new(block_id, ndata, nparity));
        Some(BlockHandle(key))
    }

    pub fn get(&self, handle: BlockHandle) -> Option<&BlockEntry> {
        self.entries.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: BlockHandle) -> Option<&mut BlockEntry> {
        self.entries.get_mut(handle.0)
    }

    pub fn release(&mut self, handle: BlockHandle) -> Option<BlockEntry> {
        if self.entries.contains(handle.0) {
            Some(self.entries.remove(handle.0))
        } else {
            None
        }
    }

    pub fn contains(&self, handle: BlockHandle) -> bool {
        self.entries.contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockHandle, &BlockEntry)> {
        self.entries.iter().map(|(k, v)| (BlockHandle(k), v))
    }

    /// Arbitrary victim for the stealing policy: the block with the
    /// fewest pending symbols is judged least likely to need further
    /// service soon. Ties broken by lowest handle (oldest-inserted in
    /// practice, since slab keys are reused LIFO).
    pub fn steal_candidate(&self) -> Option<BlockHandle> {
        fn pending_count(mask: &SlidingBitmask) -> u32 {
            let mut count = 0;
            let mut cursor = mask.first_set();
            while let Some(id) = cursor {
                count += 1;
                cursor = mask.next_set(id);
            }
            count
        }
        self.entries
            .iter()
            .min_by_key(|(_, b)| pending_count(&b.pending))
            .map(|(k, _)| BlockHandle(k))
    }
}

// ─── Segment pool ───────────────────────────────────────────────────────────

/// Handle to a leased segment buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(pub usize);

#[derive(Debug, Clone)]
pub struct SegmentEntry {
    pub block_id: u32,
    pub symbol_id: u16,
    pub is_parity: bool,
    pub buf: BytesMut,
    pub leased_at: Instant,
}

/// Fixed count of preallocated fixed-size byte buffers (`segSz +
/// streamHeader`). Lent to blocks as source-symbol cache on receive and as
/// parity scratch on transmit.
pub struct SegmentPool {
    entries: Slab<SegmentEntry>,
    /// Insertion order, oldest first, for the source-symbol reclamation
    /// policy. May contain stale handles for entries already released —
    /// `reclaim_oldest` skips those.
    order: VecDeque<SegmentHandle>,
    capacity: usize,
    seg_len: usize,
}

impl SegmentPool {
    pub fn new(capacity: usize, seg_len: usize) -> Self {
        SegmentPool {
            entries: Slab::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            seg_len,
        }
    }

    pub fn seg_len(&self) -> usize {
        self.seg_len
    }

    pub fn take(&mut self, block_id: u32, symbol_id: u16, is_parity: bool) -> Option<SegmentHandle> {
        if self.entries.len() >= self.capacity {
            return None;
        }
        let key = self.entries.insert(SegmentEntry {
            block_id,
            symbol_id,
            is_parity,
            buf: BytesMut::zeroed(self.seg_len),
            leased_at: Instant::now(),
        });
        let handle = SegmentHandle(key);
        self.order.push_back(handle);
        Some(handle)
    }

    pub fn get(&self, handle: SegmentHandle) -> Option<&SegmentEntry> {
        self.entries.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: SegmentHandle) -> Option<&mut SegmentEntry> {
        self.entries.get_mut(handle.0)
    }

    pub fn release(&mut self, handle: SegmentHandle) -> Option<SegmentEntry> {
        if self.entries.contains(handle.0) {
            Some(self.entries.remove(handle.0))
        } else {
            None
        }
    }

    pub fn contains(&self, handle: SegmentHandle) -> bool {
        self.entries.contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest still-live segment, for source-symbol reclamation (dropping
    /// cached source symbols that can be re-read from the object's
    /// storage backing). Does not release it — the caller re-reads the
    /// source data first, then calls `release`.
    pub fn reclaim_oldest(&mut self) -> Option<SegmentHandle> {
        while let Some(candidate) = self.order.pop_front() {
            if self.entries.contains(candidate.0) {
                return Some(candidate);
            }
        }
        None
    }
}
