// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # Public-Key Crypto Accelerator Driver
//!
//! This crate offloads asymmetric cryptography to an accelerator that shares
//! memory with the host over two windows:
//!
//! - the **inbound** window lives in accelerator memory and holds the
//!   handshake mailbox, request-side counters and the request rings
//! - the **outbound** window lives in host memory and holds the handshake
//!   result area, ring indexes, counters, response rings and the buffer pool
//!   operands and descriptors are allocated from
//!
//! ## Supported Operations
//!
//! - RSA public-key operation (encrypt / raw verify)
//! - RSA private-key operation in all three key forms
//! - DSA and ECDSA key generation, sign and verify
//! - DH and ECDH shared-secret computation
//!
//! Elliptic-curve jobs run over prime or binary fields.
//!
//! ## Flow
//!
//! 1. [`Device::initialize`] runs the mailbox handshake that tells the
//!    accelerator where everything lives and gets back where its request
//!    rings are.
//! 2. [`Engine::submit`] picks a live device and an application ring,
//!    stages operands and a descriptor in the buffer pool and posts the
//!    descriptor address.
//! 3. [`Engine::poll`] drains response rings and runs each job's callback
//!    exactly once, in whatever order the accelerator finished them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pkc_accel::{DeviceConfig, DsaDomain, DsaSignRequest, Emulator, Engine, PkcError};
//!
//! fn main() -> Result<(), PkcError> {
//!     // A software accelerator; real hardware attaches through `Device::open`.
//!     let config = DeviceConfig::new(0);
//!     let emulator = Emulator::for_config(&config)?;
//!     emulator.set_auto_process(true);
//!
//!     let engine = Engine::from_devices(vec![emulator.attach_device(config)?]);
//!     engine.initialize_all()?;
//!
//!     let (c, d) = engine.sign(DsaSignRequest {
//!         domain: DsaDomain::finite(vec![0xf1; 128], vec![0xe2; 20], vec![0xd3; 128]),
//!         priv_key: vec![0x11; 20],
//!         message: vec![0x22; 20],
//!         component_len: 20,
//!     })?;
//!     println!("c={:02x?}\nd={:02x?}", c, d);
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Support
//!
//! Mapping device windows ([`DmaRegion::map`], [`Device::open`]) needs Linux.
//! Heap-backed windows and the [`Emulator`] work everywhere.

#[cfg(not(feature = "std"))]
compile_error!("pkc-accel requires the `std` feature");

// Module declarations
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod emulator;
pub mod endian;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod layout;
pub mod memmap;
pub mod opcode;
pub mod pool;
pub mod region;
pub mod request;
pub mod ring;
pub mod selector;
pub mod stats;
pub mod submit;
mod sync;

// Re-exports for convenient access
pub use config::{DeviceConfig, HandshakeConfig, RingConfig, RingFlags};
pub use context::{CompletionCallback, ContextPool, ContextToken};
pub use descriptor::{DescHeader, Descriptor, ParsedDescriptor};
pub use device::{Device, DeviceState};
pub use dispatch::{Completion, JobStatus};
pub use emulator::Emulator;
pub use engine::Engine;
pub use error::{PkcError, PkcResult};
pub use handshake::{DeviceInfo, HandshakeState};
pub use layout::{BufferPlan, CurveField, Group, Operand, OperationKind, RsaForm};
pub use memmap::HostMemoryMap;
pub use region::DmaRegion;
pub use request::{
    DhRequest, DsaDomain, DsaKeygenRequest, DsaSignRequest, DsaVerifyRequest, EcCurve,
    PkcRequest, RsaPrivateKey, RsaPrivateRequest, RsaPublicRequest,
};
pub use ring::RingPair;
pub use selector::DeviceSet;
pub use stats::{StatsSink, StatsSnapshot};
pub use submit::{Doorbell, PolledDoorbell, RegisterDoorbell, Submitted};
