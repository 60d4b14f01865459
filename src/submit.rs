// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Job submission.
//!
//! Submitting a job stages everything the accelerator will read before the
//! ring lock is taken:
//!
//! 1. plan the buffers (rejects malformed requests, touches nothing)
//! 2. acquire a job context
//! 3. allocate operand buffers and copy the inputs in
//! 4. build the descriptor and store it with the context token behind it
//! 5. attach the job to its context
//! 6. post the descriptor address on the request ring
//!
//! Any failure undoes the steps before it; the callback is dropped without
//! being called and the caller gets the error back. Once step 6 succeeds the
//! callback runs exactly once, from the completion dispatcher.
//!
//! # Doorbells
//!
//! The accelerator learns about new work through the request-side counters
//! in its own memory. A [`Doorbell`] additionally signals it, either for a
//! handshake command or for a ring; accelerators that poll need neither.

use crate::context::{CompletionCallback, ContextPool, ContextToken, JobContext};
use crate::descriptor::Descriptor;
use crate::error::{PkcError, PkcResult};
use crate::layout::{BufferPlan, OperationKind};
use crate::region::DmaRegion;
use crate::request::PkcRequest;
use crate::ring::RingPair;
use scopeguard::ScopeGuard;
use std::sync::Arc;
use std::time::Instant;

/// Signals the accelerator that something was posted.
pub trait Doorbell: Send + Sync {
    /// A handshake command is waiting in the mailbox.
    fn handshake(&self);

    /// New requests are waiting on `ring`.
    fn ring(&self, ring: u32);
}

/// Doorbell for an accelerator that polls its mailbox and counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolledDoorbell;

impl Doorbell for PolledDoorbell {
    fn handshake(&self) {}

    fn ring(&self, _ring: u32) {}
}

/// Value written to the doorbell register for a handshake command.
pub const DOORBELL_HANDSHAKE: u32 = 1 << 31;

/// Doorbell implemented as one register in a mapped window.
///
/// A handshake writes [`DOORBELL_HANDSHAKE`]; a ring writes its id.
#[derive(Debug, Clone)]
pub struct RegisterDoorbell {
    region: Arc<DmaRegion>,
    offset: usize,
}

impl RegisterDoorbell {
    pub fn new(region: Arc<DmaRegion>, offset: usize) -> PkcResult<Self> {
        match offset.checked_add(4) {
            Some(end) if offset % 4 == 0 && end <= region.len() => Ok(Self { region, offset }),
            _ => Err(PkcError::AddressOutOfRange {
                window: region.name().to_string(),
                addr: offset as u64,
            }),
        }
    }

    fn write(&self, value: u32) {
        if let Err(e) = self.region.store_u32(self.offset, value) {
            log::error!("doorbell write to {} failed: {}", self.region.name(), e);
        }
    }
}

impl Doorbell for RegisterDoorbell {
    fn handshake(&self) {
        self.write(DOORBELL_HANDSHAKE);
    }

    fn ring(&self, ring: u32) {
        self.write(ring);
    }
}

/// A job the accelerator now owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub device: u32,
    pub ring: u32,
    pub kind: OperationKind,
    pub token: ContextToken,
    /// Accelerator address of the descriptor.
    pub desc_addr: u64,
}

/// Stage `req` and post it on `ring`.
pub(crate) fn submit_job(
    device: u32,
    ring: &RingPair,
    contexts: &ContextPool,
    req: &PkcRequest,
    callback: CompletionCallback,
) -> PkcResult<Submitted> {
    let plan = BufferPlan::for_request(req)?;
    let pool = ring.pool();

    let token = scopeguard::guard(contexts.acquire()?, |token| {
        contexts.release(token);
    });
    let buffers = scopeguard::guard(pool.allocate(&plan)?, |buffers| pool.free(buffers));
    pool.load_inputs(&buffers, req)?;

    let desc = Descriptor::build(&plan, &buffers);
    desc.write_to(pool.region(), buffers.descriptor.offset, token.to_raw())?;
    if log::log_enabled!(log::Level::Trace) {
        log::trace!("{}: {}", *token, desc.dump());
    }

    let desc_addr = buffers.descriptor.addr;
    let job = JobContext {
        kind: plan.kind,
        ring: ring.id(),
        buffers: ScopeGuard::into_inner(buffers),
        desc_addr,
        callback,
        submitted_at: Instant::now(),
    };
    if let Err(job) = contexts.install(*token, job) {
        pool.free(job.buffers);
        return Err(PkcError::OutOfContexts);
    }

    if let Err(e) = ring.enqueue(desc_addr) {
        if let Some(job) = contexts.take(*token) {
            pool.free(job.buffers);
        }
        return Err(e);
    }

    let token = ScopeGuard::into_inner(token);
    log::debug!(
        "device {} ring {}: submitted {} as {} at {:#x}",
        device,
        ring.id(),
        plan.kind,
        token,
        desc_addr
    );
    Ok(Submitted {
        device,
        ring: ring.id(),
        kind: plan.kind,
        token,
        desc_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{self, DescHeader};
    use crate::layout::{Group, Operand};
    use crate::pool::BufferPool;
    use crate::request::{DsaDomain, DsaSignRequest, RsaPublicRequest};
    use crate::ring::RingGeometry;

    fn ring(depth: u32, pool_size: usize) -> RingPair {
        let ib = Arc::new(DmaRegion::allocate("ib", 4096, 0x4000_0000).unwrap());
        let ob = Arc::new(DmaRegion::allocate("ob", 65536, 0x1_0000_0000).unwrap());
        let geometry = RingGeometry {
            id: 1,
            depth,
            req_ring: 256,
            req_counters: 64,
            intr_ctrl_flag: 96,
            resp_ring: 256,
            indexes: 64,
            counters: 72,
            shadow_counters: 128,
        };
        let pool = BufferPool::new(ob.clone(), 4096, pool_size).unwrap();
        RingPair::new(geometry, ib, ob, pool).unwrap()
    }

    fn sign() -> PkcRequest {
        PkcRequest::DsaSign(DsaSignRequest {
            domain: DsaDomain::finite(vec![0xf1; 20], vec![0xe2; 20], vec![0xd3; 20]),
            priv_key: vec![0x11; 20],
            message: vec![0x22; 20],
            component_len: 20,
        })
    }

    fn never() -> CompletionCallback {
        Box::new(|_: crate::dispatch::Completion| panic!("callback must not run"))
    }

    #[test]
    fn test_submit_stages_descriptor_and_token() {
        let ring = ring(8, 8192);
        let contexts = ContextPool::new(4).unwrap();
        let done = submit_job(3, &ring, &contexts, &sign(), never()).unwrap();

        assert_eq!(done.device, 3);
        assert_eq!(done.kind, OperationKind::DsaSign(Group::Finite));
        assert_eq!(ring.occupancy(), 1);
        assert_eq!(contexts.outstanding(), 1);

        let region = ring.pool().region();
        let offset = region.offset_of(done.desc_addr).unwrap();
        let (header, raw) = descriptor::read_token(region, offset).unwrap().unwrap();
        assert_eq!(header, DescHeader::new(28, 16));
        assert_eq!(ContextToken::from_raw(raw), done.token);

        let words = region.read_words(offset, 28).unwrap();
        let parsed = descriptor::parse(&words).unwrap();
        let c = parsed.pointer(Operand::SigC).unwrap();
        assert_eq!(parsed.pointer(Operand::SigD).unwrap(), c + 20);

        // The message went in verbatim.
        let msg = region.offset_of(parsed.pointer(Operand::Message).unwrap()).unwrap();
        assert_eq!(region.read_vec(msg, 20).unwrap(), vec![0x22; 20]);
    }

    #[test]
    fn test_malformed_request_touches_nothing() {
        let ring = ring(8, 8192);
        let contexts = ContextPool::new(4).unwrap();
        let bad = PkcRequest::RsaPublic(RsaPublicRequest {
            n: vec![0xff; 16],
            e: vec![0x01, 0x00, 0x01],
            f: vec![0x42; 17],
        });
        assert!(matches!(
            submit_job(0, &ring, &contexts, &bad, never()),
            Err(PkcError::InvalidRequest(_))
        ));
        assert_eq!(contexts.outstanding(), 0);
        assert_eq!(ring.pool().in_use(), 0);
        assert_eq!(ring.occupancy(), 0);
    }

    #[test]
    fn test_queue_full_rolls_back() {
        let ring = ring(2, 8192);
        let contexts = ContextPool::new(8).unwrap();
        submit_job(0, &ring, &contexts, &sign(), never()).unwrap();
        submit_job(0, &ring, &contexts, &sign(), never()).unwrap();
        let in_use = ring.pool().in_use();

        let err = submit_job(0, &ring, &contexts, &sign(), never()).unwrap_err();
        assert!(matches!(err, PkcError::QueueFull(1)));
        assert!(err.is_retryable());
        assert_eq!(contexts.outstanding(), 2);
        assert_eq!(ring.pool().in_use(), in_use);
    }

    #[test]
    fn test_out_of_contexts_and_memory() {
        let ring = ring(8, 8192);
        let contexts = ContextPool::new(1).unwrap();
        submit_job(0, &ring, &contexts, &sign(), never()).unwrap();
        assert!(matches!(
            submit_job(0, &ring, &contexts, &sign(), never()),
            Err(PkcError::OutOfContexts)
        ));

        let small = self::ring(8, 256);
        let contexts = ContextPool::new(4).unwrap();
        assert!(matches!(
            submit_job(0, &small, &contexts, &sign(), never()),
            Err(PkcError::OutOfBufferMemory { .. })
        ));
        assert_eq!(contexts.outstanding(), 0);
        assert_eq!(small.pool().in_use(), 0);
    }

    #[test]
    fn test_blocked_ring_rejects() {
        let ring = ring(8, 8192);
        let contexts = ContextPool::new(4).unwrap();
        ring.block();
        assert!(matches!(
            submit_job(0, &ring, &contexts, &sign(), never()),
            Err(PkcError::RingBlocked(1))
        ));
        assert_eq!(contexts.outstanding(), 0);
        assert_eq!(ring.pool().in_use(), 0);
    }

    #[test]
    fn test_register_doorbell() {
        let region = Arc::new(DmaRegion::allocate("regs", 64, 0).unwrap());
        let bell = RegisterDoorbell::new(region.clone(), 16).unwrap();
        bell.ring(3);
        assert_eq!(region.load_u32(16).unwrap(), 3);
        bell.handshake();
        assert_eq!(region.load_u32(16).unwrap(), DOORBELL_HANDSHAKE);
        assert!(RegisterDoorbell::new(region.clone(), 62).is_err());
        assert!(RegisterDoorbell::new(region.clone(), 64).is_err());
        // Aligned, but the end wraps.
        assert!(matches!(
            RegisterDoorbell::new(region, usize::MAX - 3),
            Err(PkcError::AddressOutOfRange { .. })
        ));
    }
}
