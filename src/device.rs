// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Attached accelerator devices.
//!
//! A [`Device`] owns the two shared windows of one accelerator, its ring
//! pairs, its job context pool and its statistics. The lifecycle is:
//!
//! ```text
//! attach ──▶ ATTACHED ──initialize──▶ INITIALIZING ──▶ READY
//!                ▲                          │            │
//!                └──── reinitialize ◀─── DEAD ◀──────────┘
//! ```
//!
//! A failed handshake, or anyone calling [`Device::mark_dead`], takes the
//! device out of selection until [`Device::reinitialize`] succeeds.
//!
//! # Windows
//!
//! - **inbound**: accelerator memory; mailbox, request rings, request-side
//!   counters
//! - **outbound**: host memory the accelerator reaches by DMA; handshake
//!   area, indexes, counters, response rings, operand pools
//!
//! Both are [`DmaRegion`]s. On Linux they can be mapped from the files the
//! bus driver exposes with [`Device::open`]; elsewhere (and in tests) they
//! are heap-backed and the accelerator half is supplied by whoever rings the
//! [`Doorbell`].

use crate::config::DeviceConfig;
use crate::context::{CompletionCallback, ContextPool};
use crate::dispatch::Dispatcher;
use crate::error::{PkcError, PkcResult};
use crate::handshake::{DeviceInfo, Handshake, MAILBOX_BYTES};
use crate::memmap::HostMemoryMap;
use crate::pool::BufferPool;
use crate::region::DmaRegion;
use crate::request::PkcRequest;
use crate::ring::{RingGeometry, RingPair, COUNTER_PAIR_BYTES};
use crate::stats::{DeviceStats, StatsSink, StatsSnapshot};
use crate::submit::{self, Doorbell, Submitted};
use crate::sync;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    /// Windows attached, handshake not run.
    Attached = 0,
    Initializing = 1,
    /// Accepting jobs.
    Ready = 2,
    /// Excluded from selection until re-initialised.
    Dead = 3,
}

impl DeviceState {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Attached),
            1 => Some(Self::Initializing),
            2 => Some(Self::Ready),
            3 => Some(Self::Dead),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Attached => "ATTACHED",
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One accelerator.
pub struct Device {
    config: DeviceConfig,
    map: HostMemoryMap,
    ib: Arc<DmaRegion>,
    ob: Arc<DmaRegion>,
    doorbell: Arc<dyn Doorbell>,
    rings: RwLock<Arc<Vec<RingPair>>>,
    info: RwLock<Option<DeviceInfo>>,
    contexts: ContextPool,
    stats: DeviceStats,
    sink: RwLock<Option<Arc<dyn StatsSink>>>,
    state: AtomicU8,
    next_ring: AtomicUsize,
    /// Serialises bring-up.
    bringup: Mutex<()>,
}

impl Device {
    /// Attach to an accelerator whose windows are already mapped.
    ///
    /// The outbound window must hold at least [`HostMemoryMap::total`]
    /// bytes. Nothing is sent to the accelerator until
    /// [`Device::initialize`].
    pub fn attach(
        config: DeviceConfig,
        ib: Arc<DmaRegion>,
        ob: Arc<DmaRegion>,
        doorbell: Arc<dyn Doorbell>,
    ) -> PkcResult<Self> {
        let map = HostMemoryMap::plan(&config)?;
        if ob.len() < map.total {
            return Err(PkcError::InvalidConfig(format!(
                "device {}: outbound window holds {} bytes, layout needs {}",
                config.id(),
                ob.len(),
                map.total
            )));
        }
        if ib.len() < MAILBOX_BYTES {
            return Err(PkcError::InvalidConfig(format!(
                "device {}: inbound window smaller than the mailbox",
                config.id()
            )));
        }
        ob.set_dev_base(config.ob_dma_base());
        let contexts = ContextPool::new(config.context_capacity())?;

        log::info!(
            "device {}: attached, {} rings, {} contexts, outbound {} bytes",
            config.id(),
            config.rings().len(),
            config.context_capacity(),
            map.total
        );
        Ok(Self {
            config,
            map,
            ib,
            ob,
            doorbell,
            rings: RwLock::new(Arc::new(Vec::new())),
            info: RwLock::new(None),
            contexts,
            stats: DeviceStats::new(),
            sink: RwLock::new(None),
            state: AtomicU8::new(DeviceState::Attached.as_u8()),
            next_ring: AtomicUsize::new(0),
            bringup: Mutex::new(()),
        })
    }

    /// Map both windows from files and attach.
    ///
    /// # Platform Support
    ///
    /// Linux only; other platforms return [`PkcError::PlatformNotSupported`].
    pub fn open(
        config: DeviceConfig,
        ib_path: &Path,
        ib_len: usize,
        ob_path: &Path,
        doorbell: Arc<dyn Doorbell>,
    ) -> PkcResult<Self> {
        let map = HostMemoryMap::plan(&config)?;
        let ib = DmaRegion::map(&format!("ib{}", config.id()), ib_path, 0, ib_len, 0)?;
        let ob = DmaRegion::map(
            &format!("ob{}", config.id()),
            ob_path,
            0,
            map.total,
            config.ob_dma_base(),
        )?;
        Self::attach(config, Arc::new(ib), Arc::new(ob), doorbell)
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.config.id()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn memory_map(&self) -> &HostMemoryMap {
        &self.map
    }

    pub fn ib(&self) -> &Arc<DmaRegion> {
        &self.ib
    }

    pub fn ob(&self) -> &Arc<DmaRegion> {
        &self.ob
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(DeviceState::Dead)
    }

    /// Whether the device takes jobs. Relaxed: one stale answer is harmless.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state.load(Ordering::Relaxed) == DeviceState::Ready.as_u8()
    }

    /// What the accelerator reported during the last successful bring-up.
    pub fn info(&self) -> Option<DeviceInfo> {
        sync::read(&self.info).clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn set_stats_sink(&self, sink: Arc<dyn StatsSink>) {
        *sync::write(&self.sink) = Some(sink);
    }

    /// Jobs submitted and not yet dispatched.
    pub fn active_jobs(&self) -> usize {
        self.contexts.outstanding()
    }

    pub fn ring_count(&self) -> usize {
        self.config.rings().len()
    }

    fn rings(&self) -> Arc<Vec<RingPair>> {
        sync::read(&self.rings).clone()
    }

    fn sink(&self) -> Option<Arc<dyn StatsSink>> {
        sync::read(&self.sink).clone()
    }

    // ========================================================================
    // Bring-up
    // ========================================================================

    /// Run the handshake and build the ring pairs.
    ///
    /// A no-op on a ready device. On a dead device it is the same as
    /// [`Device::reinitialize`], so it is refused with
    /// [`PkcError::DeviceBusy`] while jobs are in flight. On failure the
    /// device is marked dead.
    pub fn initialize(&self) -> PkcResult<()> {
        let _bringup = sync::lock(&self.bringup);
        if self.is_alive() {
            return Ok(());
        }
        self.restart()
    }

    /// Tear the rings down and run the handshake again.
    ///
    /// Refused with [`PkcError::DeviceBusy`] while jobs are in flight.
    pub fn reinitialize(&self) -> PkcResult<()> {
        let _bringup = sync::lock(&self.bringup);
        log::info!("device {}: re-initialising", self.id());
        self.restart()
    }

    /// Caller holds `bringup`.
    fn restart(&self) -> PkcResult<()> {
        // In-flight jobs own buffers in the pools about to be rebuilt.
        self.block_rings();
        let outstanding = self.contexts.outstanding();
        if outstanding > 0 {
            self.unblock_rings();
            log::warn!(
                "device {}: {} jobs in flight, not re-initialising",
                self.id(),
                outstanding
            );
            return Err(PkcError::DeviceBusy {
                device: self.id(),
                outstanding,
            });
        }

        self.state.store(DeviceState::Attached.as_u8(), Ordering::Release);
        *sync::write(&self.rings) = Arc::new(Vec::new());
        *sync::write(&self.info) = None;
        self.ob.set_dev_base(self.config.ob_dma_base());

        self.state
            .store(DeviceState::Initializing.as_u8(), Ordering::Release);
        match self.bring_up() {
            Ok((info, rings)) => {
                *sync::write(&self.rings) = Arc::new(rings);
                *sync::write(&self.info) = Some(info);
                self.state.store(DeviceState::Ready.as_u8(), Ordering::Release);
                log::info!("device {}: ready", self.id());
                Ok(())
            }
            Err(e) => {
                log::error!("device {}: bring-up failed: {}", self.id(), e);
                self.mark_dead();
                Err(e)
            }
        }
    }

    fn bring_up(&self) -> PkcResult<(DeviceInfo, Vec<RingPair>)> {
        let info = Handshake::new(
            &self.ib,
            &self.ob,
            self.doorbell.as_ref(),
            self.config.handshake(),
        )
        .run(&self.map, self.config.rings())?;

        let rings = self
            .config
            .rings()
            .iter()
            .zip(&self.map.rings)
            .enumerate()
            .map(|(id, (ring, mem))| {
                let req_ring = info
                    .req_rings
                    .get(id)
                    .copied()
                    .ok_or(PkcError::InvalidRing(id as u32))?;
                let intr_ctrl_flag = info
                    .intr_ctrl_flags
                    .get(id)
                    .copied()
                    .ok_or(PkcError::InvalidRing(id as u32))?;
                let geometry = RingGeometry {
                    id: id as u32,
                    depth: ring.depth(),
                    req_ring,
                    req_counters: info.req_counters + id * COUNTER_PAIR_BYTES,
                    intr_ctrl_flag,
                    resp_ring: mem.resp_ring,
                    indexes: self.map.ring_indexes(id),
                    counters: self.map.ring_counters(id),
                    shadow_counters: self.map.ring_shadow_counters(id),
                };
                let pool = BufferPool::new(self.ob.clone(), mem.pool_base, mem.pool_size)?;
                let pair = RingPair::new(geometry, self.ib.clone(), self.ob.clone(), pool)?;
                pair.reset()?;
                Ok(pair)
            })
            .collect::<PkcResult<Vec<_>>>()?;

        Ok((info, rings))
    }

    /// Take the device out of selection.
    pub fn mark_dead(&self) {
        let prev = self.state.swap(DeviceState::Dead.as_u8(), Ordering::AcqRel);
        if prev != DeviceState::Dead.as_u8() {
            log::error!("device {}: marked dead", self.id());
            if let Some(sink) = self.sink() {
                sink.on_device_dead(self.id());
            }
        }
    }

    /// Halt submission and draining on every ring.
    pub fn block_rings(&self) {
        for ring in self.rings().iter() {
            ring.block();
        }
    }

    pub fn unblock_rings(&self) {
        for ring in self.rings().iter() {
            ring.unblock();
        }
    }

    /// Enable or mask completion interrupts on every ring.
    pub fn set_interrupts(&self, enabled: bool) -> PkcResult<()> {
        for ring in self.rings().iter() {
            ring.set_interrupts(enabled)?;
        }
        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Next application ring, round-robin. Ring 0 carries commands, so it is
    /// only used when it is the only ring.
    pub fn pick_ring(&self) -> u32 {
        let count = self.ring_count();
        if count <= 1 {
            return 0;
        }
        let n = self.next_ring.fetch_add(1, Ordering::Relaxed);
        1 + (n % (count - 1)) as u32
    }

    /// Submit on the next application ring.
    pub fn submit(&self, req: &PkcRequest, callback: CompletionCallback) -> PkcResult<Submitted> {
        if !self.is_alive() {
            return Err(PkcError::DeviceNotReady(self.id()));
        }
        self.submit_on(self.pick_ring(), req, callback)
    }

    /// Submit on a specific ring.
    pub fn submit_on(
        &self,
        ring_id: u32,
        req: &PkcRequest,
        callback: CompletionCallback,
    ) -> PkcResult<Submitted> {
        if !self.is_alive() {
            return Err(PkcError::DeviceNotReady(self.id()));
        }
        let rings = self.rings();
        let ring = rings
            .get(ring_id as usize)
            .ok_or(PkcError::InvalidRing(ring_id))?;

        let submitted = submit::submit_job(self.id(), ring, &self.contexts, req, callback)?;
        self.stats.record_request();
        if let Some(sink) = self.sink() {
            sink.on_request(self.id(), ring_id);
        }
        self.doorbell.ring(ring_id);
        Ok(submitted)
    }

    /// Dispatch up to `budget` responses of one ring.
    pub fn process_responses(&self, ring_id: u32, budget: usize) -> PkcResult<usize> {
        let rings = self.rings();
        let ring = rings
            .get(ring_id as usize)
            .ok_or(PkcError::InvalidRing(ring_id))?;

        // Masked while draining, unless the caller already masked it.
        let enabled = ring.interrupts_enabled()?;
        if enabled {
            ring.set_interrupts(false)?;
        }
        let _unmask = scopeguard::guard(enabled, |enabled| {
            if !enabled {
                return;
            }
            if let Err(e) = ring.set_interrupts(true) {
                log::warn!("device {} ring {}: unmask failed: {}", self.id(), ring_id, e);
            }
        });

        let sink = self.sink();
        Dispatcher::new(self.id(), ring, &self.contexts, &self.stats, sink.as_deref()).drain(budget)
    }

    /// Drain every ring once, at most one ring's depth each.
    pub fn poll(&self) -> PkcResult<usize> {
        let mut total = 0;
        for ring in self.rings().iter() {
            total += self.process_responses(ring.id(), ring.depth() as usize)?;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("rings", &self.ring_count())
            .field("active_jobs", &self.active_jobs())
            .finish()
    }
}
