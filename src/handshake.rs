// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device bring-up handshake.
//!
//! The driver and the accelerator share two small mailboxes:
//!
//! | Window | Offset | Field |
//! |--------|--------|-------|
//! | outbound (host) | 0 | state `u8` |
//! | | 1 | result `u8` |
//! | | 4.. | reply payload words |
//! | inbound (device) | 0 | host handshake address, low |
//! | | 4 | host handshake address, high |
//! | | 8 | command `u8` |
//! | | 9 | payload length in words `u8` |
//! | | 12.. | command payload words |
//!
//! The driver clears the host state, posts a command, rings the doorbell
//! and polls for the state that acknowledges it. Steps run strictly in
//! order:
//!
//! | Command | Payload | Acknowledged by | Reply |
//! |---------|---------|-----------------|-------|
//! | (boot) | - | `FIRMWARE_UP` | ib_l, ib_h, ob_l, ob_h, no_secs |
//! | `INIT_CONFIG` | rings, shadow counters | `CONFIG_COMPLETE` | request-side counters |
//! | `GET_SEC_INFO` | - | `SEC_INFO_COMPLETE` | - |
//! | `INIT_RING_PAIR` (each ring) | id, msi data, depth, resp ring, msi_l, msi_h, props | `RING_PAIR_COMPLETE` | request ring, interrupt flag |
//! | `INIT_MSI_INFO` | - | `MSI_INFO_COMPLETE` | - |
//! | `INIT_IDX_MEM` | indexes | `IDX_MEM_COMPLETE` | - |
//! | `INIT_COUNTERS_MEM` | counters, shadow counters | `COUNTERS_MEM_COMPLETE` | - |
//! | `HS_COMPLETE` | - | `RNG_INIT` | - |
//! | `WAIT_FOR_RNG` | - | `RNG_COMPLETE` | - |
//! | `RNG_DONE` | - | (none) | - |

use crate::config::{HandshakeConfig, RingConfig};
use crate::endian;
use crate::error::{PkcError, PkcResult};
use crate::memmap::HostMemoryMap;
use crate::region::DmaRegion;
use crate::submit::Doorbell;
use std::sync::atomic::{fence, Ordering};
use std::thread;

/// Bytes of the host-side handshake area.
pub const HOST_HS_BYTES: usize = 64;
/// Bytes of the device-side mailbox.
pub const MAILBOX_BYTES: usize = 64;

const HOST_STATE: usize = 0;
const HOST_RESULT: usize = 1;
const HOST_DATA: usize = 4;

const MBOX_OB_L: usize = 0;
const MBOX_OB_H: usize = 4;
const MBOX_CMD: usize = 8;
const MBOX_LEN: usize = 9;
const MBOX_DATA: usize = 12;

/// Most payload words either side can carry.
pub const MAX_PAYLOAD_WORDS: usize = (MAILBOX_BYTES - MBOX_DATA) / 4;

/// Command byte while no command is pending.
pub const MAILBOX_IDLE: u8 = 0xFF;

/// States the accelerator reports in the host handshake area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HandshakeState {
    Default = 0,
    FirmwareUp = 10,
    ConfigComplete = 11,
    SecInfoComplete = 12,
    RingPairComplete = 13,
    MsiInfoComplete = 14,
    IdxMemComplete = 15,
    CountersMemComplete = 16,
    RngInit = 17,
    RngComplete = 18,
}

impl HandshakeState {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Default,
            10 => Self::FirmwareUp,
            11 => Self::ConfigComplete,
            12 => Self::SecInfoComplete,
            13 => Self::RingPairComplete,
            14 => Self::MsiInfoComplete,
            15 => Self::IdxMemComplete,
            16 => Self::CountersMemComplete,
            17 => Self::RngInit,
            18 => Self::RngComplete,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::FirmwareUp => "FIRMWARE_UP",
            Self::ConfigComplete => "CONFIG_COMPLETE",
            Self::SecInfoComplete => "SEC_INFO_COMPLETE",
            Self::RingPairComplete => "RING_PAIR_COMPLETE",
            Self::MsiInfoComplete => "MSI_INFO_COMPLETE",
            Self::IdxMemComplete => "IDX_MEM_COMPLETE",
            Self::CountersMemComplete => "COUNTERS_MEM_COMPLETE",
            Self::RngInit => "RNG_INIT",
            Self::RngComplete => "RNG_COMPLETE",
        }
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// Commands the driver posts in the device mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeCommand {
    GetSecInfo = 0,
    InitConfig = 1,
    InitRingPair = 2,
    InitMsiInfo = 3,
    InitIdxMem = 4,
    InitCountersMem = 5,
    HsComplete = 6,
    WaitForRng = 7,
    RngDone = 8,
}

impl HandshakeCommand {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::GetSecInfo,
            1 => Self::InitConfig,
            2 => Self::InitRingPair,
            3 => Self::InitMsiInfo,
            4 => Self::InitIdxMem,
            5 => Self::InitCountersMem,
            6 => Self::HsComplete,
            7 => Self::WaitForRng,
            8 => Self::RngDone,
            _ => return None,
        })
    }

    /// State acknowledging this command, if one is expected.
    pub const fn reply(self) -> Option<HandshakeState> {
        match self {
            Self::GetSecInfo => Some(HandshakeState::SecInfoComplete),
            Self::InitConfig => Some(HandshakeState::ConfigComplete),
            Self::InitRingPair => Some(HandshakeState::RingPairComplete),
            Self::InitMsiInfo => Some(HandshakeState::MsiInfoComplete),
            Self::InitIdxMem => Some(HandshakeState::IdxMemComplete),
            Self::InitCountersMem => Some(HandshakeState::CountersMemComplete),
            Self::HsComplete => Some(HandshakeState::RngInit),
            Self::WaitForRng => Some(HandshakeState::RngComplete),
            Self::RngDone => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::GetSecInfo => "GET_SEC_INFO",
            Self::InitConfig => "INIT_CONFIG",
            Self::InitRingPair => "INIT_RING_PAIR",
            Self::InitMsiInfo => "INIT_MSI_INFO",
            Self::InitIdxMem => "INIT_IDX_MEM",
            Self::InitCountersMem => "INIT_COUNTERS_MEM",
            Self::HsComplete => "HS_COMPLETE",
            Self::WaitForRng => "WAIT_FOR_RNG",
            Self::RngDone => "RNG_DONE",
        }
    }
}

impl std::fmt::Display for HandshakeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

fn payload_fits(data: &[u32]) -> PkcResult<()> {
    if data.len() > MAX_PAYLOAD_WORDS {
        return Err(PkcError::InvalidConfig(format!(
            "handshake payload of {} words exceeds {}",
            data.len(),
            MAX_PAYLOAD_WORDS
        )));
    }
    Ok(())
}

/// Host-side handshake area in the outbound window.
#[derive(Debug, Clone, Copy)]
pub struct HostHandshake<'a> {
    ob: &'a DmaRegion,
    base: usize,
}

impl<'a> HostHandshake<'a> {
    pub fn new(ob: &'a DmaRegion, base: usize) -> Self {
        Self { ob, base }
    }

    pub fn state(&self) -> PkcResult<u8> {
        self.ob.read_u8_volatile(self.base + HOST_STATE)
    }

    pub fn result(&self) -> PkcResult<u8> {
        self.ob.read_u8_volatile(self.base + HOST_RESULT)
    }

    pub fn data(&self, words: usize) -> PkcResult<Vec<u32>> {
        self.ob.read_words(self.base + HOST_DATA, words.min(MAX_PAYLOAD_WORDS))
    }

    /// Reset to `DEFAULT` before posting a command.
    pub fn clear(&self) -> PkcResult<()> {
        self.ob.zero(self.base, HOST_HS_BYTES)
    }

    /// Accelerator side: publish a state with its reply payload.
    ///
    /// The state byte is written last.
    pub fn post(&self, state: HandshakeState, result: u8, data: &[u32]) -> PkcResult<()> {
        payload_fits(data)?;
        self.ob.write_words(self.base + HOST_DATA, data)?;
        self.ob.write_u8_volatile(self.base + HOST_RESULT, result)?;
        fence(Ordering::Release);
        self.ob.write_u8_volatile(self.base + HOST_STATE, state.as_u8())
    }
}

/// Device-side mailbox in the inbound window.
#[derive(Debug, Clone, Copy)]
pub struct DeviceMailbox<'a> {
    ib: &'a DmaRegion,
    base: usize,
}

impl<'a> DeviceMailbox<'a> {
    pub fn new(ib: &'a DmaRegion, base: usize) -> Self {
        Self { ib, base }
    }

    /// Tell the accelerator where the host handshake area lives.
    pub fn set_host_address(&self, addr: u64) -> PkcResult<()> {
        let (high, low) = endian::split_addr(addr);
        self.ib.write_u32(self.base + MBOX_OB_L, low)?;
        self.ib.write_u32(self.base + MBOX_OB_H, high)
    }

    pub fn host_address(&self) -> PkcResult<u64> {
        let low = self.ib.read_u32(self.base + MBOX_OB_L)?;
        let high = self.ib.read_u32(self.base + MBOX_OB_H)?;
        Ok(endian::join_addr(high, low))
    }

    /// Post a command; the command byte is written last.
    pub fn send(&self, cmd: u8, data: &[u32]) -> PkcResult<()> {
        payload_fits(data)?;
        self.ib.write_words(self.base + MBOX_DATA, data)?;
        self.ib.write_u8_volatile(self.base + MBOX_LEN, data.len() as u8)?;
        fence(Ordering::Release);
        self.ib.write_u8_volatile(self.base + MBOX_CMD, cmd)
    }

    pub fn command(&self) -> PkcResult<u8> {
        self.ib.read_u8_volatile(self.base + MBOX_CMD)
    }

    /// Payload of the pending command.
    pub fn data(&self) -> PkcResult<Vec<u32>> {
        let len = self.ib.read_u8_volatile(self.base + MBOX_LEN)? as usize;
        self.ib.read_words(self.base + MBOX_DATA, len.min(MAX_PAYLOAD_WORDS))
    }
}

/// What the accelerator reported during bring-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Accelerator view of the inbound window.
    pub ib_base: u64,
    /// Accelerator view of the outbound window.
    pub ob_base: u64,
    /// Number of crypto engines.
    pub no_secs: u32,
    /// Inbound offset of the request-side counter pairs.
    pub req_counters: usize,
    /// Inbound offset of each ring's request ring.
    pub req_rings: Vec<usize>,
    /// Inbound offset of each ring's interrupt control flag.
    pub intr_ctrl_flags: Vec<usize>,
}

/// One run of the bring-up sequence.
pub struct Handshake<'a> {
    ib: &'a DmaRegion,
    ob: &'a DmaRegion,
    doorbell: &'a dyn Doorbell,
    config: &'a HandshakeConfig,
}

impl<'a> Handshake<'a> {
    pub fn new(
        ib: &'a DmaRegion,
        ob: &'a DmaRegion,
        doorbell: &'a dyn Doorbell,
        config: &'a HandshakeConfig,
    ) -> Self {
        Self {
            ib,
            ob,
            doorbell,
            config,
        }
    }

    fn host(&self, map: &HostMemoryMap) -> HostHandshake<'a> {
        HostHandshake::new(self.ob, map.handshake)
    }

    fn mailbox(&self) -> DeviceMailbox<'a> {
        DeviceMailbox::new(self.ib, 0)
    }

    /// Drive the accelerator from power-up to ready.
    ///
    /// On success the outbound window has been rebased to the accelerator's
    /// view of it.
    pub fn run(&self, map: &HostMemoryMap, rings: &[RingConfig]) -> PkcResult<DeviceInfo> {
        let host = self.host(map);
        let mailbox = self.mailbox();

        // Boot: publish where the host area is and wait for the firmware.
        host.clear()?;
        mailbox.set_host_address(self.ob.dev_addr(map.handshake))?;
        mailbox.send(MAILBOX_IDLE, &[])?;
        self.doorbell.handshake();
        let up = self.wait(&host, HandshakeState::FirmwareUp, 5)?;
        let ib_base = endian::join_addr(up[1], up[0]);
        let ob_base = endian::join_addr(up[3], up[2]);
        let no_secs = up[4];
        self.ib.set_dev_base(ib_base);
        self.ob.set_dev_base(ob_base);
        log::info!(
            "firmware up: ib={:#x} ob={:#x} engines={}",
            ib_base,
            ob_base,
            no_secs
        );

        let reply = self.step(
            &host,
            HandshakeCommand::InitConfig,
            &[rings.len() as u32, map.shadow_counters as u32],
            1,
        )?;
        let req_counters = reply[0] as usize;

        self.step(&host, HandshakeCommand::GetSecInfo, &[], 0)?;

        let mut req_rings = Vec::with_capacity(rings.len());
        let mut intr_ctrl_flags = Vec::with_capacity(rings.len());
        for (id, (ring, mem)) in rings.iter().zip(&map.rings).enumerate() {
            let (msi_h, msi_l) = endian::split_addr(ring.msi_addr());
            let reply = self.step(
                &host,
                HandshakeCommand::InitRingPair,
                &[
                    id as u32,
                    ring.msi_data() as u32,
                    ring.depth(),
                    mem.resp_ring as u32,
                    msi_l,
                    msi_h,
                    ring.props(),
                ],
                2,
            )?;
            log::debug!("ring {}: request ring at ib+{:#x}", id, reply[0]);
            req_rings.push(reply[0] as usize);
            intr_ctrl_flags.push(reply[1] as usize);
        }

        self.step(&host, HandshakeCommand::InitMsiInfo, &[], 0)?;
        self.step(&host, HandshakeCommand::InitIdxMem, &[map.indexes as u32], 0)?;
        self.step(
            &host,
            HandshakeCommand::InitCountersMem,
            &[map.counters as u32, map.shadow_counters as u32],
            0,
        )?;
        self.step(&host, HandshakeCommand::HsComplete, &[], 0)?;
        self.step(&host, HandshakeCommand::WaitForRng, &[], 0)?;

        // Final acknowledgement; the firmware does not reply.
        host.clear()?;
        mailbox.send(HandshakeCommand::RngDone.as_u8(), &[])?;
        self.doorbell.handshake();
        log::info!("handshake complete, {} rings", rings.len());

        Ok(DeviceInfo {
            ib_base,
            ob_base,
            no_secs,
            req_counters,
            req_rings,
            intr_ctrl_flags,
        })
    }

    /// Post one command and wait for its acknowledgement.
    fn step(
        &self,
        host: &HostHandshake<'_>,
        cmd: HandshakeCommand,
        data: &[u32],
        reply_words: usize,
    ) -> PkcResult<Vec<u32>> {
        host.clear()?;
        self.mailbox().send(cmd.as_u8(), data)?;
        self.doorbell.handshake();
        log::debug!("handshake: sent {}", cmd);
        match cmd.reply() {
            Some(expected) => self.wait(host, expected, reply_words),
            None => Ok(Vec::new()),
        }
    }

    /// Poll for `expected` within the configured budget.
    fn wait(
        &self,
        host: &HostHandshake<'_>,
        expected: HandshakeState,
        reply_words: usize,
    ) -> PkcResult<Vec<u32>> {
        let polls = self.config.polls().max(1);
        let interval = self.config.poll_interval();
        let mut observed = 0;

        for attempt in 0..polls {
            observed = host.state()?;
            if observed == expected.as_u8() {
                let result = host.result()?;
                if result != 0 {
                    return Err(PkcError::HandshakeFailed {
                        state: expected,
                        result,
                    });
                }
                log::info!("handshake: reached {}", expected);
                return host.data(reply_words);
            }
            if attempt + 1 < polls {
                thread::sleep(interval);
            }
        }

        log::error!(
            "handshake: timed out waiting for {} (state {})",
            expected,
            observed
        );
        Err(PkcError::HandshakeTimeout { expected, observed })
    }
}
