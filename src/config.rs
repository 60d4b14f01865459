// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device and ring configuration.

use crate::error::{PkcError, PkcResult};
use bitflags::bitflags;
use std::time::Duration;

/// Most ring pairs one device supports, command ring included.
pub const MAX_RING_PAIRS: usize = 6;

/// Default depth of each ring.
pub const DEFAULT_RING_DEPTH: u32 = 128;

/// Default number of job contexts per device.
pub const DEFAULT_CONTEXT_CAPACITY: usize = 512;

/// Default operand pool size per ring.
pub const DEFAULT_POOL_SIZE: usize = 256 * 1024;

/// Default budget for one handshake step.
pub const DEFAULT_HS_TIMEOUT: Duration = Duration::from_millis(500);

/// Default number of polls the budget is split over.
pub const DEFAULT_HS_POLLS: u32 = 5;

const MAX_PRIORITY: u8 = 0x1f;
const MAX_AFFINITY: u8 = 0x07;

bitflags! {
    /// Ring properties beyond priority and affinity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RingFlags: u32 {
        /// Responses are posted in submission order.
        const ORDERED = 1 << 8;
    }
}

/// Configuration of one ring pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    depth: u32,
    priority: u8,
    affinity: u8,
    flags: RingFlags,
    msi_addr: u64,
    msi_data: u16,
}

impl RingConfig {
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            priority: 0,
            affinity: 0,
            flags: RingFlags::empty(),
            msi_addr: 0,
            msi_data: 0,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn msi_addr(&self) -> u64 {
        self.msi_addr
    }

    pub fn msi_data(&self) -> u16 {
        self.msi_data
    }

    pub fn flags(&self) -> RingFlags {
        self.flags
    }

    /// Set the priority level (0-31).
    pub fn set_priority(&mut self, priority: u8) -> &mut Self {
        self.priority = priority;
        self
    }

    /// Set the engine affinity (0-7).
    pub fn set_affinity(&mut self, affinity: u8) -> &mut Self {
        self.affinity = affinity;
        self
    }

    pub fn set_flags(&mut self, flags: RingFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Set the message-signalled interrupt the accelerator raises for this ring.
    pub fn set_msi(&mut self, addr: u64, data: u16) -> &mut Self {
        self.msi_addr = addr;
        self.msi_data = data;
        self
    }

    /// Packed properties word: priority [4:0], affinity [7:5], flags above.
    pub fn props(&self) -> u32 {
        (self.priority & MAX_PRIORITY) as u32
            | (((self.affinity & MAX_AFFINITY) as u32) << 5)
            | self.flags.bits()
    }

    fn validate(&self, id: usize) -> PkcResult<()> {
        if self.depth < 2 || !self.depth.is_power_of_two() || self.depth > 1 << 16 {
            return Err(PkcError::InvalidConfig(format!(
                "ring {} depth {} must be a power of two in 2..=65536",
                id, self.depth
            )));
        }
        if self.priority > MAX_PRIORITY || self.affinity > MAX_AFFINITY {
            return Err(PkcError::InvalidConfig(format!(
                "ring {} priority {} / affinity {} out of range",
                id, self.priority, self.affinity
            )));
        }
        Ok(())
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RING_DEPTH)
    }
}

/// Timing of the bring-up handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    timeout: Duration,
    polls: u32,
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Sleep between two polls.
    pub fn poll_interval(&self) -> Duration {
        self.timeout / self.polls.max(1)
    }

    /// Set the budget for each handshake step.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Set how many times the state byte is checked within the budget.
    pub fn set_polls(&mut self, polls: u32) -> &mut Self {
        self.polls = polls;
        self
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HS_TIMEOUT,
            polls: DEFAULT_HS_POLLS,
        }
    }
}

/// Configuration of one accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    id: u32,
    rings: Vec<RingConfig>,
    context_capacity: usize,
    pool_size: usize,
    ob_dma_base: u64,
    handshake: HandshakeConfig,
}

impl DeviceConfig {
    /// Defaults: two rings (command ring plus one application ring).
    pub fn new(id: u32) -> Self {
        Self {
            id,
            rings: vec![RingConfig::default(), RingConfig::default()],
            context_capacity: DEFAULT_CONTEXT_CAPACITY,
            pool_size: DEFAULT_POOL_SIZE,
            ob_dma_base: 0,
            handshake: HandshakeConfig::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn rings(&self) -> &[RingConfig] {
        &self.rings
    }

    pub fn context_capacity(&self) -> usize {
        self.context_capacity
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn ob_dma_base(&self) -> u64 {
        self.ob_dma_base
    }

    pub fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    pub fn handshake_mut(&mut self) -> &mut HandshakeConfig {
        &mut self.handshake
    }

    /// Replace the ring list with `count` rings of `depth`.
    pub fn set_rings(&mut self, count: usize, depth: u32) -> &mut Self {
        self.rings = (0..count).map(|_| RingConfig::new(depth)).collect();
        self
    }

    pub fn ring_mut(&mut self, id: usize) -> Option<&mut RingConfig> {
        self.rings.get_mut(id)
    }

    pub fn add_ring(&mut self, ring: RingConfig) -> &mut Self {
        self.rings.push(ring);
        self
    }

    /// Set the number of jobs that can be in flight at once.
    pub fn set_context_capacity(&mut self, capacity: usize) -> &mut Self {
        self.context_capacity = capacity;
        self
    }

    /// Set the operand pool size of each ring in bytes.
    pub fn set_pool_size(&mut self, size: usize) -> &mut Self {
        self.pool_size = size;
        self
    }

    /// Set the host DMA address of the outbound window.
    pub fn set_ob_dma_base(&mut self, base: u64) -> &mut Self {
        self.ob_dma_base = base;
        self
    }

    pub fn set_handshake(&mut self, handshake: HandshakeConfig) -> &mut Self {
        self.handshake = handshake;
        self
    }

    /// Reject configurations the accelerator cannot run.
    pub fn validate(&self) -> PkcResult<()> {
        if self.rings.is_empty() || self.rings.len() > MAX_RING_PAIRS {
            return Err(PkcError::InvalidConfig(format!(
                "device {}: {} rings, expected 1..={}",
                self.id,
                self.rings.len(),
                MAX_RING_PAIRS
            )));
        }
        for (id, ring) in self.rings.iter().enumerate() {
            ring.validate(id)?;
        }
        if self.context_capacity == 0 {
            return Err(PkcError::InvalidConfig(format!(
                "device {}: context capacity is zero",
                self.id
            )));
        }
        if self.pool_size < 4096 {
            return Err(PkcError::InvalidConfig(format!(
                "device {}: pool size {} below 4096",
                self.id, self.pool_size
            )));
        }
        if self.handshake.polls == 0 || self.handshake.timeout.is_zero() {
            return Err(PkcError::InvalidConfig(format!(
                "device {}: handshake needs a non-zero timeout and poll count",
                self.id
            )));
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
