// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software accelerator.
//!
//! The emulator plays the accelerator's half of the shared-memory contract
//! against the same [`DmaRegion`]s the driver uses: it answers handshake
//! commands, consumes request rings, runs descriptors and posts responses.
//! It does no cryptography. Each output operand is filled with
//! [`output_pattern`], so a caller can check that results reached the right
//! buffer.
//!
//! Faults can be injected: a handshake state that is never posted, a
//! handshake result code, a result code for every job, and reversed
//! completion order.
//!
//! # Inbound window layout
//!
//! | Offset | Contents |
//! |--------|----------|
//! | 0x000 | mailbox |
//! | 0x040 | request-side counters, one pair per ring |
//! | 0x070 | interrupt control flags, one word per ring |
//! | 0x0c0 | request rings, 64-byte aligned, in setup order |

use crate::config::DeviceConfig;
use crate::descriptor::{self, DescHeader, ParsedDescriptor};
use crate::device::Device;
use crate::endian;
use crate::error::{PkcError, PkcResult};
use crate::handshake::{DeviceMailbox, HandshakeCommand, HandshakeState, HostHandshake};
use crate::layout::{Operand, OperationKind};
use crate::memmap::HostMemoryMap;
use crate::opcode::{self, CMD_FIFO_LOAD, CMD_FIFO_STORE, CMD_LENGTH_MASK};
use crate::pool::align_up;
use crate::region::DmaRegion;
use crate::ring::{ResponseEntry, COUNTER_PAIR_BYTES, REQ_ENTRY_BYTES, RESP_ENTRY_BYTES};
use crate::submit::Doorbell;
use crate::sync;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const REQ_COUNTERS: usize = 0x40;
const INTR_FLAGS: usize = 0x70;
const REQ_RINGS: usize = 0xc0;

/// Accelerator-side address of the emulated inbound window.
pub const EMULATOR_IB_BASE: u64 = 0x4000_0000;

/// Result code for a descriptor the emulator cannot run.
pub const ERR_MALFORMED: i32 = 0x40;

/// Deterministic bytes the emulator writes into output operand `op`.
pub fn output_pattern(op: Operand, len: usize) -> Vec<u8> {
    let seed = op
        .name()
        .bytes()
        .fold(0x5au8, |acc, b| acc.rotate_left(3) ^ b);
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Something the emulator saw or did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// Handshake command byte and payload.
    Command { cmd: u8, data: Vec<u32> },
    /// A job taken off a request ring.
    Job {
        ring: u32,
        desc_addr: u64,
        descriptor: Option<ParsedDescriptor>,
        result: i32,
    },
}

#[derive(Debug)]
struct EmuRing {
    depth: u32,
    req_ring: usize,
    resp_ring: usize,
    consumed: u32,
    posted: u32,
    intr_flag: usize,
    interrupts: u32,
}

#[derive(Debug)]
struct EmuState {
    hs_offset: usize,
    shadow_counters: usize,
    next_req_ring: usize,
    rings: Vec<EmuRing>,
    ready: bool,
    trace: Vec<TraceEvent>,

    drop_state: Option<HandshakeState>,
    fail_state: Option<(HandshakeState, u8)>,
    result_code: i32,
    reverse: bool,
    auto_process: bool,
    engines: u32,
    ob_base: Option<u64>,
}

impl Default for EmuState {
    fn default() -> Self {
        Self {
            hs_offset: 0,
            shadow_counters: 0,
            next_req_ring: REQ_RINGS,
            rings: Vec::new(),
            ready: false,
            trace: Vec::new(),
            drop_state: None,
            fail_state: None,
            result_code: 0,
            reverse: false,
            auto_process: false,
            engines: 1,
            ob_base: None,
        }
    }
}

/// The accelerator, in software.
pub struct Emulator {
    ib: Arc<DmaRegion>,
    ob: Arc<DmaRegion>,
    state: Mutex<EmuState>,
}

impl Emulator {
    pub fn new(ib: Arc<DmaRegion>, ob: Arc<DmaRegion>) -> Self {
        Self {
            ib,
            ob,
            state: Mutex::new(EmuState::default()),
        }
    }

    /// Allocate both windows sized for `config`.
    pub fn for_config(config: &DeviceConfig) -> PkcResult<Arc<Self>> {
        let map = HostMemoryMap::plan(config)?;
        let ib_len = config
            .rings()
            .iter()
            .fold(REQ_RINGS, |len, ring| {
                len + align_up(ring.depth() as usize * REQ_ENTRY_BYTES, 64)
            });
        let ib = DmaRegion::allocate(&format!("ib{}", config.id()), ib_len, EMULATOR_IB_BASE)?;
        let ob = DmaRegion::allocate(&format!("ob{}", config.id()), map.total, config.ob_dma_base())?;
        Ok(Arc::new(Self::new(Arc::new(ib), Arc::new(ob))))
    }

    /// Attach a driver-side device to this emulator's windows.
    pub fn attach_device(self: &Arc<Self>, config: DeviceConfig) -> PkcResult<Arc<Device>> {
        let doorbell: Arc<dyn Doorbell> = self.clone();
        Ok(Arc::new(Device::attach(
            config,
            self.ib.clone(),
            self.ob.clone(),
            doorbell,
        )?))
    }

    pub fn ib(&self) -> &Arc<DmaRegion> {
        &self.ib
    }

    pub fn ob(&self) -> &Arc<DmaRegion> {
        &self.ob
    }

    // ========================================================================
    // Knobs
    // ========================================================================

    /// Never post `state`; the driver times out waiting for it.
    pub fn set_drop_state(&self, state: Option<HandshakeState>) -> &Self {
        sync::lock(&self.state).drop_state = state;
        self
    }

    /// Post `state` with a non-zero result code.
    pub fn set_fail_state(&self, fail: Option<(HandshakeState, u8)>) -> &Self {
        sync::lock(&self.state).fail_state = fail;
        self
    }

    /// Result code for every job from now on; 0 runs the job.
    pub fn set_result_code(&self, code: i32) -> &Self {
        sync::lock(&self.state).result_code = code;
        self
    }

    /// Answer each batch of requests last-to-first.
    pub fn set_reverse(&self, reverse: bool) -> &Self {
        sync::lock(&self.state).reverse = reverse;
        self
    }

    /// Process a ring as soon as its doorbell rings.
    pub fn set_auto_process(&self, auto: bool) -> &Self {
        sync::lock(&self.state).auto_process = auto;
        self
    }

    /// Engine count reported at `FIRMWARE_UP`.
    pub fn set_engines(&self, engines: u32) -> &Self {
        sync::lock(&self.state).engines = engines;
        self
    }

    /// Report a different outbound base than the driver configured.
    pub fn set_ob_base(&self, base: Option<u64>) -> &Self {
        sync::lock(&self.state).ob_base = base;
        self
    }

    /// Whether `RNG_DONE` has been received.
    pub fn is_ready(&self) -> bool {
        sync::lock(&self.state).ready
    }

    pub fn trace(&self) -> Vec<TraceEvent> {
        sync::lock(&self.state).trace.clone()
    }

    /// Every job descriptor the emulator decoded, in processing order.
    pub fn descriptors(&self) -> Vec<ParsedDescriptor> {
        sync::lock(&self.state)
            .trace
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Job {
                    descriptor: Some(d),
                    ..
                } => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// Completion interrupts raised on `ring` so far.
    pub fn interrupts_raised(&self, ring: u32) -> u32 {
        sync::lock(&self.state)
            .rings
            .get(ring as usize)
            .map_or(0, |r| r.interrupts)
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    fn respond_handshake(&self) -> PkcResult<()> {
        let mailbox = DeviceMailbox::new(&self.ib, 0);
        let cmd = mailbox.command()?;
        let data = mailbox.data()?;
        let mut st = sync::lock(&self.state);
        st.trace.push(TraceEvent::Command {
            cmd,
            data: data.clone(),
        });

        let (state, reply) = match HandshakeCommand::from_u8(cmd) {
            None => {
                st.hs_offset = self.ob.offset_of(mailbox.host_address()?)?;
                st.rings.clear();
                st.next_req_ring = REQ_RINGS;
                st.ready = false;
                let (ib_h, ib_l) = endian::split_addr(self.ib.dev_base());
                let (ob_h, ob_l) = endian::split_addr(st.ob_base.unwrap_or(self.ob.dev_base()));
                (
                    HandshakeState::FirmwareUp,
                    vec![ib_l, ib_h, ob_l, ob_h, st.engines],
                )
            }
            Some(HandshakeCommand::InitConfig) => {
                st.shadow_counters = word(&data, 1)? as usize;
                (HandshakeState::ConfigComplete, vec![REQ_COUNTERS as u32])
            }
            Some(HandshakeCommand::GetSecInfo) => (HandshakeState::SecInfoComplete, vec![]),
            Some(HandshakeCommand::InitRingPair) => {
                let id = word(&data, 0)? as usize;
                let depth = word(&data, 2)?;
                let resp_ring = word(&data, 3)? as usize;
                if id != st.rings.len() || depth == 0 || !depth.is_power_of_two() {
                    return Err(PkcError::InvalidConfig(format!(
                        "ring {} (depth {}) set up out of order",
                        id, depth
                    )));
                }
                let req_ring = st.next_req_ring;
                let intr_flag = INTR_FLAGS + id * 4;
                st.next_req_ring += align_up(depth as usize * REQ_ENTRY_BYTES, 64);
                st.rings.push(EmuRing {
                    depth,
                    req_ring,
                    resp_ring,
                    consumed: 0,
                    posted: 0,
                    intr_flag,
                    interrupts: 0,
                });
                (
                    HandshakeState::RingPairComplete,
                    vec![req_ring as u32, intr_flag as u32],
                )
            }
            Some(HandshakeCommand::InitMsiInfo) => (HandshakeState::MsiInfoComplete, vec![]),
            Some(HandshakeCommand::InitIdxMem) => (HandshakeState::IdxMemComplete, vec![]),
            Some(HandshakeCommand::InitCountersMem) => {
                st.shadow_counters = word(&data, 1)? as usize;
                (HandshakeState::CountersMemComplete, vec![])
            }
            Some(HandshakeCommand::HsComplete) => (HandshakeState::RngInit, vec![]),
            Some(HandshakeCommand::WaitForRng) => (HandshakeState::RngComplete, vec![]),
            Some(HandshakeCommand::RngDone) => {
                st.ready = true;
                return Ok(());
            }
        };

        if st.drop_state == Some(state) {
            log::debug!("emulator: dropping {}", state);
            return Ok(());
        }
        let result = match st.fail_state {
            Some((fail, code)) if fail == state => code,
            _ => 0,
        };
        HostHandshake::new(&self.ob, st.hs_offset).post(state, result, &reply)
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Run every request waiting on `ring`; returns how many were answered.
    pub fn process(&self, ring: u32) -> PkcResult<usize> {
        let mut st = sync::lock(&self.state);
        let shadow = st.shadow_counters + ring as usize * COUNTER_PAIR_BYTES;
        let reverse = st.reverse;
        let code = st.result_code;
        let r = st
            .rings
            .get_mut(ring as usize)
            .ok_or(PkcError::InvalidRing(ring))?;
        let mask = r.depth - 1;

        let added = self
            .ib
            .load_u32(REQ_COUNTERS + ring as usize * COUNTER_PAIR_BYTES)?;
        let mut batch = Vec::new();
        while r.consumed != added {
            let slot = r.req_ring + (r.consumed & mask) as usize * REQ_ENTRY_BYTES;
            batch.push(self.ib.read_u64(slot)?);
            r.consumed = r.consumed.wrapping_add(1);
        }
        self.ob.store_u32(shadow + 4, r.consumed)?;
        if reverse {
            batch.reverse();
        }

        let mut events = Vec::with_capacity(batch.len());
        for desc_addr in batch {
            let (descriptor, result) = self.execute(desc_addr, code);
            let slot = r.resp_ring + (r.posted & mask) as usize * RESP_ENTRY_BYTES;
            self.ob
                .write(slot, &ResponseEntry { desc_addr, result }.to_bytes())?;
            r.posted = r.posted.wrapping_add(1);
            self.ob.store_u32(shadow, r.posted)?;
            events.push(TraceEvent::Job {
                ring,
                desc_addr,
                descriptor,
                result,
            });
        }

        // One interrupt per batch, unless the host masked the ring.
        if !events.is_empty() && self.ib.load_u32(r.intr_flag)? != 0 {
            r.interrupts += 1;
        }

        let answered = events.len();
        st.trace.extend(events);
        Ok(answered)
    }

    /// Process every ring once.
    pub fn process_all(&self) -> PkcResult<usize> {
        let rings = sync::lock(&self.state).rings.len();
        let mut answered = 0;
        for ring in 0..rings {
            answered += self.process(ring as u32)?;
        }
        Ok(answered)
    }

    fn execute(&self, desc_addr: u64, code: i32) -> (Option<ParsedDescriptor>, i32) {
        let parsed = match self.fetch(desc_addr) {
            Ok(Some(parsed)) => parsed,
            _ => return (None, ERR_MALFORMED),
        };
        if code != 0 {
            return (Some(parsed), code);
        }
        match self.run(&parsed) {
            Ok(()) => (Some(parsed), 0),
            Err(e) => {
                log::warn!("emulator: {} at {:#x} failed: {}", parsed.kind, desc_addr, e);
                (Some(parsed), ERR_MALFORMED)
            }
        }
    }

    fn fetch(&self, desc_addr: u64) -> PkcResult<Option<ParsedDescriptor>> {
        let offset = self.ob.offset_of(desc_addr)?;
        let Some(header) = DescHeader::decode(self.ob.read_u32(offset)?) else {
            return Ok(None);
        };
        let words = self.ob.read_words(offset, header.len)?;
        Ok(descriptor::parse(&words))
    }

    fn write_output(&self, parsed: &ParsedDescriptor, op: Operand, len: usize) -> PkcResult<()> {
        let addr = parsed
            .pointer(op)
            .ok_or_else(|| PkcError::InvalidRequest(format!("{} has no {}", parsed.kind, op)))?;
        self.ob.write(self.ob.offset_of(addr)?, &output_pattern(op, len))
    }

    fn run(&self, parsed: &ParsedDescriptor) -> PkcResult<()> {
        let lw = parsed.length_word;
        let q_len = (lw >> 7) as usize;
        let r_len = (lw & 0x7f) as usize;
        let n_len = (lw & 0xfff) as usize;

        match parsed.kind {
            OperationKind::RsaPublic | OperationKind::RsaPrivate(_) => {
                self.write_output(parsed, Operand::RsaOut, n_len)
            }
            OperationKind::DsaKeygen(group) => {
                self.write_output(parsed, Operand::PrivKey, r_len)?;
                self.write_output(parsed, Operand::PubKey, group.element_len(q_len))
            }
            OperationKind::DsaSign(_) => self.run_sign(parsed, r_len),
            OperationKind::DsaVerify(_) => Ok(()),
            OperationKind::Dh(_) => self.write_output(parsed, Operand::Secret, q_len),
        }
    }

    /// The signature lands at the c/d pointers; the FIFO program then moves
    /// it to wherever its stores point.
    fn run_sign(&self, parsed: &ParsedDescriptor, r_len: usize) -> PkcResult<()> {
        self.write_output(parsed, Operand::SigC, r_len)?;
        self.write_output(parsed, Operand::SigD, r_len)?;

        let ops = &parsed.ops;
        let mut fifo = VecDeque::new();
        let mut i = 1;
        while i < ops.len() {
            let word = ops[i];
            let len = (word & CMD_LENGTH_MASK) as usize;
            match opcode::command_type(word) {
                CMD_FIFO_LOAD => {
                    let offset = self.ob.offset_of(fifo_addr(ops, i)?)?;
                    fifo.extend(self.ob.read_vec(offset, len)?);
                    i += 3;
                }
                CMD_FIFO_STORE => {
                    if fifo.len() < len {
                        return Err(PkcError::InvalidRequest(format!(
                            "store of {} bytes from a FIFO holding {}",
                            len,
                            fifo.len()
                        )));
                    }
                    let offset = self.ob.offset_of(fifo_addr(ops, i)?)?;
                    let bytes: Vec<u8> = fifo.drain(..len).collect();
                    self.ob.write(offset, &bytes)?;
                    i += 3;
                }
                // MOVE and JUMP only steer the FIFOs.
                _ => i += 1,
            }
        }
        Ok(())
    }
}

fn word(data: &[u32], index: usize) -> PkcResult<u32> {
    data.get(index).copied().ok_or_else(|| {
        PkcError::InvalidConfig(format!("handshake payload too short: {} words", data.len()))
    })
}

fn fifo_addr(ops: &[u32], at: usize) -> PkcResult<u64> {
    match ops.get(at + 1..at + 3) {
        Some(&[high, low]) => Ok(endian::join_addr(high, low)),
        _ => Err(PkcError::InvalidRequest("truncated FIFO command".to_string())),
    }
}

impl Doorbell for Emulator {
    fn handshake(&self) {
        if let Err(e) = self.respond_handshake() {
            log::warn!("emulator: handshake command rejected: {}", e);
        }
    }

    fn ring(&self, ring: u32) {
        if !sync::lock(&self.state).auto_process {
            return;
        }
        if let Err(e) = self.process(ring) {
            log::warn!("emulator: ring {} processing failed: {}", ring, e);
        }
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = sync::lock(&self.state);
        f.debug_struct("Emulator")
            .field("ib", &self.ib.name())
            .field("ob", &self.ob.name())
            .field("rings", &st.rings.len())
            .field("ready", &st.ready)
            .finish()
    }
}
