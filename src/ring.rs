// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Request/response ring pairs.
//!
//! The request ring lives in accelerator memory and holds descriptor
//! addresses. The response ring lives in host memory and holds
//! `{descriptor address, result}` entries written by the accelerator.
//!
//! Each ring keeps three counter pairs:
//!
//! - **local** (host memory): the driver's own `jobs_added` /
//!   `jobs_processed`
//! - **request-side** (accelerator memory): the same two values pushed to
//!   the accelerator so it sees new requests and freed response slots
//! - **shadow** (host memory): written by the accelerator; responses added
//!   and requests consumed
//!
//! Submission and draining take separate locks; they meet only through
//! `jobs_processed`, which is published with release ordering.

use crate::endian;
use crate::error::{PkcError, PkcResult};
use crate::pool::BufferPool;
use crate::region::DmaRegion;
use crate::sync;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Bytes per request-ring entry: one descriptor address.
pub const REQ_ENTRY_BYTES: usize = 8;

/// Bytes per response-ring entry: descriptor address and result, packed.
pub const RESP_ENTRY_BYTES: usize = 12;

/// Bytes of one counter pair `{jobs_added, jobs_processed}`.
pub const COUNTER_PAIR_BYTES: usize = 8;

/// Bytes of one index pair `{w_index, r_index}`.
pub const INDEX_PAIR_BYTES: usize = 8;

const ADDED: usize = 0;
const PROCESSED: usize = 4;

/// Where one ring's state lives.
///
/// `req_ring`, `req_counters` and `intr_ctrl_flag` are inbound-window
/// offsets; the rest are outbound-window offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub id: u32,
    pub depth: u32,
    pub req_ring: usize,
    pub req_counters: usize,
    /// Non-zero while the accelerator may interrupt for this ring.
    pub intr_ctrl_flag: usize,
    pub resp_ring: usize,
    pub indexes: usize,
    pub counters: usize,
    pub shadow_counters: usize,
}

/// One response-ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseEntry {
    pub desc_addr: u64,
    pub result: i32,
}

impl ResponseEntry {
    pub fn from_bytes(raw: &[u8; RESP_ENTRY_BYTES]) -> Self {
        Self {
            desc_addr: endian::get_u64(&raw[..8]),
            result: endian::get_i32(&raw[8..]),
        }
    }

    pub fn to_bytes(self) -> [u8; RESP_ENTRY_BYTES] {
        let mut raw = [0u8; RESP_ENTRY_BYTES];
        endian::put_u64(&mut raw[..8], self.desc_addr);
        endian::put_i32(&mut raw[8..], self.result);
        raw
    }
}

#[derive(Debug, Default)]
struct SubmitState {
    write_index: u32,
    jobs_added: u32,
}

#[derive(Debug, Default)]
struct DrainState {
    read_index: u32,
}

/// A request/response ring pair.
pub struct RingPair {
    geometry: RingGeometry,
    mask: u32,
    ib: Arc<DmaRegion>,
    ob: Arc<DmaRegion>,
    pool: BufferPool,
    submit: Mutex<SubmitState>,
    drain: Mutex<DrainState>,
    /// Responses consumed; written only under the drain lock.
    jobs_processed: AtomicU32,
    blocked: AtomicBool,
}

impl RingPair {
    pub fn new(
        geometry: RingGeometry,
        ib: Arc<DmaRegion>,
        ob: Arc<DmaRegion>,
        pool: BufferPool,
    ) -> PkcResult<Self> {
        if geometry.depth == 0 || !geometry.depth.is_power_of_two() {
            return Err(PkcError::InvalidConfig(format!(
                "ring {} depth {} is not a power of two",
                geometry.id, geometry.depth
            )));
        }
        let depth = geometry.depth as usize;
        check_span(&ib, geometry.req_ring, depth * REQ_ENTRY_BYTES)?;
        check_span(&ib, geometry.req_counters, COUNTER_PAIR_BYTES)?;
        check_span(&ib, geometry.intr_ctrl_flag, 4)?;
        check_span(&ob, geometry.resp_ring, depth * RESP_ENTRY_BYTES)?;
        check_span(&ob, geometry.indexes, INDEX_PAIR_BYTES)?;
        check_span(&ob, geometry.counters, COUNTER_PAIR_BYTES)?;
        check_span(&ob, geometry.shadow_counters, COUNTER_PAIR_BYTES)?;

        Ok(Self {
            mask: geometry.depth - 1,
            geometry,
            ib,
            ob,
            pool,
            submit: Mutex::new(SubmitState::default()),
            drain: Mutex::new(DrainState::default()),
            jobs_processed: AtomicU32::new(0),
            blocked: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.geometry.id
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.geometry.depth
    }

    pub fn geometry(&self) -> &RingGeometry {
        &self.geometry
    }

    /// Operand buffers for jobs on this ring.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Requests added and not yet answered.
    pub fn occupancy(&self) -> u32 {
        let added = sync::lock(&self.submit).jobs_added;
        added.wrapping_sub(self.jobs_processed.load(Ordering::Acquire))
    }

    /// Post a descriptor address.
    ///
    /// Fails fast with [`PkcError::QueueFull`] when `depth` requests are
    /// outstanding, so a response slot is always free for every request.
    pub fn enqueue(&self, desc_addr: u64) -> PkcResult<()> {
        let mut state = sync::lock(&self.submit);

        if self.blocked.load(Ordering::Acquire) {
            return Err(PkcError::RingBlocked(self.id()));
        }
        let processed = self.jobs_processed.load(Ordering::Acquire);
        if state.jobs_added.wrapping_sub(processed) >= self.geometry.depth {
            return Err(PkcError::QueueFull(self.id()));
        }

        let slot = self.geometry.req_ring + (state.write_index & self.mask) as usize * REQ_ENTRY_BYTES;
        self.ib.write_u64(slot, desc_addr)?;

        state.write_index = (state.write_index + 1) & self.mask;
        state.jobs_added = state.jobs_added.wrapping_add(1);

        self.ob.store_u32(self.geometry.indexes, state.write_index)?;
        self.ob.store_u32(self.geometry.counters + ADDED, state.jobs_added)?;
        // Publishes the slot write to the accelerator.
        self.ib.store_u32(self.geometry.req_counters + ADDED, state.jobs_added)?;

        log::trace!(
            "ring {}: enqueued {:#x} (added={}, processed={})",
            self.id(),
            desc_addr,
            state.jobs_added,
            processed
        );
        Ok(())
    }

    /// Take the next response, if the accelerator has posted one.
    ///
    /// A blocked ring yields nothing.
    pub fn dequeue_response(&self) -> PkcResult<Option<ResponseEntry>> {
        let mut state = sync::lock(&self.drain);

        if self.blocked.load(Ordering::Acquire) {
            return Ok(None);
        }
        let processed = self.jobs_processed.load(Ordering::Relaxed);
        let added = self.ob.load_u32(self.geometry.shadow_counters + ADDED)?;
        if added == processed {
            return Ok(None);
        }
        if added.wrapping_sub(processed) > self.geometry.depth {
            log::warn!(
                "ring {}: accelerator reports {} responses ahead of {} consumed",
                self.id(),
                added,
                processed
            );
        }

        let slot = self.geometry.resp_ring + state.read_index as usize * RESP_ENTRY_BYTES;
        let entry = ResponseEntry::from_bytes(&self.ob.read_volatile::<RESP_ENTRY_BYTES>(slot)?);

        state.read_index = (state.read_index + 1) & self.mask;
        let processed = processed.wrapping_add(1);

        self.ob.store_u32(self.geometry.indexes + 4, state.read_index)?;
        self.ob.store_u32(self.geometry.counters + PROCESSED, processed)?;
        self.ib.store_u32(self.geometry.req_counters + PROCESSED, processed)?;
        self.jobs_processed.store(processed, Ordering::Release);

        log::trace!(
            "ring {}: dequeued {:#x} result={}",
            self.id(),
            entry.desc_addr,
            entry.result
        );
        Ok(Some(entry))
    }

    /// Halt submission and draining.
    pub fn block(&self) {
        let _submit = sync::lock(&self.submit);
        self.blocked.store(true, Ordering::Release);
        log::debug!("ring {} blocked", self.id());
    }

    pub fn unblock(&self) {
        let _submit = sync::lock(&self.submit);
        self.blocked.store(false, Ordering::Release);
        log::debug!("ring {} unblocked", self.id());
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Enable or mask the ring's completion interrupt.
    pub fn set_interrupts(&self, enabled: bool) -> PkcResult<()> {
        self.ib
            .store_u32(self.geometry.intr_ctrl_flag, u32::from(enabled))
    }

    pub fn interrupts_enabled(&self) -> PkcResult<bool> {
        Ok(self.ib.load_u32(self.geometry.intr_ctrl_flag)? != 0)
    }

    /// Clear indexes and counters on both sides and enable the interrupt.
    /// The ring must be idle.
    pub fn reset(&self) -> PkcResult<()> {
        let mut submit = sync::lock(&self.submit);
        let mut drain = sync::lock(&self.drain);
        *submit = SubmitState::default();
        *drain = DrainState::default();
        self.jobs_processed.store(0, Ordering::Release);

        let depth = self.geometry.depth as usize;
        self.ib.zero(self.geometry.req_ring, depth * REQ_ENTRY_BYTES)?;
        self.ob.zero(self.geometry.resp_ring, depth * RESP_ENTRY_BYTES)?;
        for (region, offset) in [
            (&self.ob, self.geometry.indexes),
            (&self.ob, self.geometry.counters),
            (&self.ob, self.geometry.shadow_counters),
            (&self.ib, self.geometry.req_counters),
        ] {
            region.store_u32(offset + ADDED, 0)?;
            region.store_u32(offset + PROCESSED, 0)?;
        }
        self.set_interrupts(true)
    }
}

fn check_span(region: &DmaRegion, offset: usize, len: usize) -> PkcResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= region.len() && offset % 4 == 0 => Ok(()),
        _ => Err(PkcError::AddressOutOfRange {
            window: region.name().to_string(),
            addr: offset as u64,
        }),
    }
}

impl std::fmt::Debug for RingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPair")
            .field("id", &self.id())
            .field("depth", &self.depth())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    const DEPTH: u32 = 8;

    struct Fixture {
        ib: Arc<DmaRegion>,
        ob: Arc<DmaRegion>,
        ring: Arc<RingPair>,
    }

    fn fixture(depth: u32) -> Fixture {
        let ib = Arc::new(DmaRegion::allocate("ib", 4096, 0x4000_0000).unwrap());
        let ob = Arc::new(DmaRegion::allocate("ob", 8192, 0x1_0000_0000).unwrap());
        let geometry = RingGeometry {
            id: 1,
            depth,
            req_ring: 1024,
            req_counters: 64,
            intr_ctrl_flag: 96,
            resp_ring: 1024,
            indexes: 64,
            counters: 72,
            shadow_counters: 80,
        };
        let pool = BufferPool::new(ob.clone(), 4096, 4096).unwrap();
        let ring = Arc::new(RingPair::new(geometry, ib.clone(), ob.clone(), pool).unwrap());
        Fixture { ib, ob, ring }
    }

    /// Play the accelerator: answer the next `n` requests in order.
    fn respond(fx: &Fixture, n: u32, result: i32) {
        let g = *fx.ring.geometry();
        let mut added = fx.ob.load_u32(g.shadow_counters).unwrap();
        for _ in 0..n {
            let slot = (added & (g.depth - 1)) as usize;
            let desc_addr = fx.ib.read_u64(g.req_ring + slot * REQ_ENTRY_BYTES).unwrap();
            let entry = ResponseEntry { desc_addr, result };
            fx.ob.write(g.resp_ring + slot * RESP_ENTRY_BYTES, &entry.to_bytes()).unwrap();
            added = added.wrapping_add(1);
            fx.ob.store_u32(g.shadow_counters, added).unwrap();
        }
    }

    #[test]
    fn test_depth_must_be_power_of_two() {
        let ib = Arc::new(DmaRegion::allocate("ib", 4096, 0).unwrap());
        let ob = Arc::new(DmaRegion::allocate("ob", 8192, 0).unwrap());
        let geometry = RingGeometry {
            id: 0,
            depth: 6,
            req_ring: 0,
            req_counters: 512,
            intr_ctrl_flag: 600,
            resp_ring: 0,
            indexes: 512,
            counters: 520,
            shadow_counters: 528,
        };
        let pool = BufferPool::new(ob.clone(), 4096, 4096).unwrap();
        assert!(matches!(
            RingPair::new(geometry, ib, ob, pool),
            Err(PkcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_enqueue_publishes_counters() {
        let fx = fixture(DEPTH);
        fx.ring.enqueue(0x1_0000_1000).unwrap();
        fx.ring.enqueue(0x1_0000_2000).unwrap();

        let g = fx.ring.geometry();
        assert_eq!(fx.ib.read_u64(g.req_ring).unwrap(), 0x1_0000_1000);
        assert_eq!(fx.ib.read_u64(g.req_ring + 8).unwrap(), 0x1_0000_2000);
        assert_eq!(fx.ib.load_u32(g.req_counters).unwrap(), 2);
        assert_eq!(fx.ob.load_u32(g.counters).unwrap(), 2);
        assert_eq!(fx.ob.load_u32(g.indexes).unwrap(), 2);
        assert_eq!(fx.ring.occupancy(), 2);
    }

    #[test]
    fn test_queue_full_until_drained() {
        let fx = fixture(DEPTH);
        for i in 0..DEPTH {
            fx.ring.enqueue(0x1000 + i as u64).unwrap();
        }
        assert!(matches!(fx.ring.enqueue(0x9999), Err(PkcError::QueueFull(1))));

        // Answered but not yet consumed still counts as occupied.
        respond(&fx, 1, 0);
        assert!(matches!(fx.ring.enqueue(0x9999), Err(PkcError::QueueFull(1))));

        let entry = fx.ring.dequeue_response().unwrap().unwrap();
        assert_eq!(entry, ResponseEntry { desc_addr: 0x1000, result: 0 });
        fx.ring.enqueue(0x9999).unwrap();
        assert_eq!(fx.ring.occupancy(), DEPTH);
    }

    #[test]
    fn test_concurrent_submitters_respect_depth() {
        let fx = fixture(DEPTH);
        let threads = 32;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let ring = fx.ring.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    ring.enqueue(0x10_0000 + i as u64)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(PkcError::QueueFull(_))))
            .count();
        assert_eq!(accepted, DEPTH as usize);
        assert_eq!(full, threads - DEPTH as usize);
    }

    #[test]
    fn test_wraparound() {
        let fx = fixture(4);
        for round in 0..10u64 {
            for i in 0..3 {
                fx.ring.enqueue(round * 16 + i).unwrap();
            }
            respond(&fx, 3, round as i32);
            for i in 0..3 {
                let entry = fx.ring.dequeue_response().unwrap().unwrap();
                assert_eq!(entry.desc_addr, round * 16 + i);
                assert_eq!(entry.result, round as i32);
            }
            assert!(fx.ring.dequeue_response().unwrap().is_none());
        }
        assert_eq!(fx.ring.occupancy(), 0);
        assert_eq!(fx.ib.load_u32(fx.ring.geometry().req_counters + 4).unwrap(), 30);
    }

    #[test]
    fn test_blocked_ring() {
        let fx = fixture(DEPTH);
        fx.ring.enqueue(0x1000).unwrap();
        respond(&fx, 1, -1);

        fx.ring.block();
        assert!(matches!(fx.ring.enqueue(0x2000), Err(PkcError::RingBlocked(1))));
        assert!(fx.ring.dequeue_response().unwrap().is_none());

        fx.ring.unblock();
        let entry = fx.ring.dequeue_response().unwrap().unwrap();
        assert_eq!(entry.result, -1);
        fx.ring.enqueue(0x2000).unwrap();
    }

    #[test]
    fn test_reset_clears_state() {
        let fx = fixture(DEPTH);
        fx.ring.enqueue(0x1000).unwrap();
        respond(&fx, 1, 0);
        fx.ring.dequeue_response().unwrap();

        fx.ring.reset().unwrap();
        let g = fx.ring.geometry();
        assert_eq!(fx.ring.occupancy(), 0);
        assert_eq!(fx.ob.load_u32(g.shadow_counters).unwrap(), 0);
        assert_eq!(fx.ib.load_u32(g.req_counters).unwrap(), 0);
        fx.ring.enqueue(0x3000).unwrap();
        assert_eq!(fx.ib.read_u64(g.req_ring).unwrap(), 0x3000);
    }

    #[test]
    fn test_interrupt_flag() {
        let fx = fixture(DEPTH);
        let g = *fx.ring.geometry();
        assert!(!fx.ring.interrupts_enabled().unwrap());

        fx.ring.set_interrupts(true).unwrap();
        assert_eq!(fx.ib.read_vec(g.intr_ctrl_flag, 4).unwrap(), vec![0, 0, 0, 1]);
        fx.ring.set_interrupts(false).unwrap();
        assert!(!fx.ring.interrupts_enabled().unwrap());

        // Reset leaves the ring ready to interrupt.
        fx.ring.reset().unwrap();
        assert!(fx.ring.interrupts_enabled().unwrap());
    }
}
