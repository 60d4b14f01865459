// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Outbound window layout.
//!
//! ```text
//! 0x0000  handshake state (64 bytes)
//!         ring indexes        {w_index, r_index}      x rings
//!         local counters      {added, processed}      x rings
//!         shadow counters     {added, processed}      x rings
//!         per ring: response ring, then operand pool
//! ```
//!
//! Everything the accelerator writes sits on its own cache line apart from
//! the counter arrays, which are read-mostly on the host side.

use crate::config::DeviceConfig;
use crate::error::PkcResult;
use crate::handshake::HOST_HS_BYTES;
use crate::pool::align_up;
use crate::ring::{COUNTER_PAIR_BYTES, INDEX_PAIR_BYTES, RESP_ENTRY_BYTES};

const LINE: usize = 64;
const PAGE: usize = 4096;

/// Outbound placement of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingMemory {
    pub resp_ring: usize,
    pub pool_base: usize,
    pub pool_size: usize,
}

/// Offsets of everything the driver places in the outbound window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMemoryMap {
    pub handshake: usize,
    pub indexes: usize,
    pub counters: usize,
    pub shadow_counters: usize,
    pub rings: Vec<RingMemory>,
    /// Window size, page aligned.
    pub total: usize,
}

impl HostMemoryMap {
    pub fn plan(config: &DeviceConfig) -> PkcResult<Self> {
        config.validate()?;
        let n = config.rings().len();

        let handshake = 0;
        let indexes = align_up(handshake + HOST_HS_BYTES, LINE);
        let counters = indexes + n * INDEX_PAIR_BYTES;
        let shadow_counters = align_up(counters + n * COUNTER_PAIR_BYTES, LINE);
        let mut cursor = align_up(shadow_counters + n * COUNTER_PAIR_BYTES, LINE);

        let rings = config
            .rings()
            .iter()
            .map(|ring| {
                let resp_ring = cursor;
                cursor = align_up(cursor + ring.depth() as usize * RESP_ENTRY_BYTES, LINE);
                let pool_base = cursor;
                cursor = align_up(cursor + config.pool_size(), LINE);
                RingMemory {
                    resp_ring,
                    pool_base,
                    pool_size: config.pool_size(),
                }
            })
            .collect();

        Ok(Self {
            handshake,
            indexes,
            counters,
            shadow_counters,
            rings,
            total: align_up(cursor, PAGE),
        })
    }

    pub fn ring_indexes(&self, id: usize) -> usize {
        self.indexes + id * INDEX_PAIR_BYTES
    }

    pub fn ring_counters(&self, id: usize) -> usize {
        self.counters + id * COUNTER_PAIR_BYTES
    }

    pub fn ring_shadow_counters(&self, id: usize) -> usize {
        self.shadow_counters + id * COUNTER_PAIR_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_does_not_overlap() {
        let mut config = DeviceConfig::new(0);
        config.set_rings(3, 64).set_pool_size(8192);
        let map = HostMemoryMap::plan(&config).unwrap();

        assert_eq!(map.handshake, 0);
        assert_eq!(map.indexes, 64);
        assert_eq!(map.counters, 64 + 3 * 8);
        assert!(map.shadow_counters >= map.counters + 24);
        assert_eq!(map.shadow_counters % 64, 0);

        let mut prev_end = map.shadow_counters + 24;
        for ring in &map.rings {
            assert!(ring.resp_ring >= prev_end);
            assert_eq!(ring.resp_ring % 64, 0);
            assert!(ring.pool_base >= ring.resp_ring + 64 * 12);
            prev_end = ring.pool_base + ring.pool_size;
        }
        assert!(map.total >= prev_end);
        assert_eq!(map.total % 4096, 0);
        assert_eq!(map.ring_shadow_counters(2), map.shadow_counters + 16);
    }

    #[test]
    fn test_plan_validates_config() {
        let mut config = DeviceConfig::new(0);
        config.set_rings(7, 64);
        assert!(HostMemoryMap::plan(&config).is_err());
    }
}
