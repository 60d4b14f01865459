// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Completion dispatch.
//!
//! A response names the descriptor it completes. The descriptor buffer
//! carries the job's [`ContextToken`] right after its words, so resolving a
//! response is: address to pool offset, offset to token, token to context.
//! The context is only taken if it was submitted at exactly that address,
//! which rejects duplicated and late responses without touching memory the
//! job no longer owns.

use crate::context::{ContextPool, ContextToken};
use crate::descriptor;
use crate::error::PkcResult;
use crate::layout::{Operand, OperationKind};
use crate::ring::{ResponseEntry, RingPair};
use crate::stats::{DeviceStats, StatsSink};
use std::time::Duration;

/// Result code the accelerator posts for a job it dropped unexecuted.
pub const JOB_DISCARDED: i32 = -1;

/// Outcome of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Success,
    /// Accelerator error code.
    Failed(i32),
    Discarded,
}

impl JobStatus {
    pub const fn from_result(code: i32) -> Self {
        match code {
            0 => Self::Success,
            JOB_DISCARDED => Self::Discarded,
            code => Self::Failed(code),
        }
    }

    /// Raw result code as posted by the accelerator.
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed(code) => code,
            Self::Discarded => JOB_DISCARDED,
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed(code) => write!(f, "failed ({:#x})", code),
            Self::Discarded => f.write_str("discarded"),
        }
    }
}

/// What a job's callback receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub token: ContextToken,
    pub kind: OperationKind,
    pub status: JobStatus,
    /// Output operands; empty unless the job succeeded.
    pub outputs: Vec<(Operand, Vec<u8>)>,
    /// Time from submission to dispatch.
    pub latency: Duration,
}

impl Completion {
    pub fn output(&self, op: Operand) -> Option<&[u8]> {
        self.outputs
            .iter()
            .find(|(o, _)| *o == op)
            .map(|(_, bytes)| bytes.as_slice())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Matches responses of one ring to their jobs.
pub struct Dispatcher<'a> {
    device: u32,
    ring: &'a RingPair,
    contexts: &'a ContextPool,
    stats: &'a DeviceStats,
    sink: Option<&'a dyn StatsSink>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        device: u32,
        ring: &'a RingPair,
        contexts: &'a ContextPool,
        stats: &'a DeviceStats,
        sink: Option<&'a dyn StatsSink>,
    ) -> Self {
        Self {
            device,
            ring,
            contexts,
            stats,
            sink,
        }
    }

    /// Dispatch up to `budget` responses; returns how many were consumed.
    pub fn drain(&self, budget: usize) -> PkcResult<usize> {
        let mut consumed = 0;
        while consumed < budget {
            let Some(entry) = self.ring.dequeue_response()? else {
                break;
            };
            self.on_response(entry);
            consumed += 1;
        }
        Ok(consumed)
    }

    fn resolve(&self, desc_addr: u64) -> Option<ContextToken> {
        let pool = self.ring.pool();
        let offset = pool.region().offset_of(desc_addr).ok()?;
        if !pool.contains(offset) {
            return None;
        }
        match descriptor::read_token(pool.region(), offset) {
            Ok(Some((_, raw))) => Some(ContextToken::from_raw(raw)),
            _ => None,
        }
    }

    /// Complete the job `entry` answers.
    ///
    /// Returns false for a response that matches no in-flight job; such a
    /// response is counted and otherwise ignored.
    pub fn on_response(&self, entry: ResponseEntry) -> bool {
        let ring_id = self.ring.id();
        let job = self
            .resolve(entry.desc_addr)
            .and_then(|token| Some((token, self.contexts.take_if(token, entry.desc_addr)?)));
        let Some((token, job)) = job else {
            log::warn!(
                "device {} ring {}: stale response for {:#x} (result {})",
                self.device,
                ring_id,
                entry.desc_addr,
                entry.result
            );
            self.stats.record_stale();
            if let Some(sink) = self.sink {
                sink.on_stale_response(self.device, ring_id);
            }
            return false;
        };

        let pool = self.ring.pool();
        let status = JobStatus::from_result(entry.result);
        match status {
            JobStatus::Success => {}
            JobStatus::Discarded => log::debug!("{} {}: discarded", job.kind, token),
            JobStatus::Failed(code) => log::warn!("{} {}: failed with {:#x}", job.kind, token, code),
        }

        let mut outputs = Vec::new();
        if status.is_success() {
            for buffer in job.buffers.outputs() {
                let Some(op) = buffer.operand else { continue };
                match pool.read(buffer) {
                    Ok(bytes) => outputs.push((op, bytes)),
                    Err(e) => log::warn!("{} {}: reading {} failed: {}", job.kind, token, op, e),
                }
            }
        }

        let completion = Completion {
            token,
            kind: job.kind,
            status,
            outputs,
            latency: job.submitted_at.elapsed(),
        };

        // Buffers and the context go back even if the callback panics.
        let _cleanup = scopeguard::guard(job.buffers, |buffers| {
            pool.free(buffers);
            self.contexts.release(token);
        });
        self.stats.record_response(status);
        if let Some(sink) = self.sink {
            sink.on_response(self.device, ring_id, status);
        }
        (job.callback)(completion);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use crate::layout::BufferPlan;
    use crate::pool::BufferPool;
    use crate::region::DmaRegion;
    use crate::request::{DhRequest, PkcRequest};
    use crate::ring::{RingGeometry, RESP_ENTRY_BYTES};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    struct Fixture {
        ob: Arc<DmaRegion>,
        ring: RingPair,
        contexts: ContextPool,
        stats: DeviceStats,
    }

    fn fixture() -> Fixture {
        let ib = Arc::new(DmaRegion::allocate("ib", 4096, 0x4000_0000).unwrap());
        let ob = Arc::new(DmaRegion::allocate("ob", 16384, 0x1_0000_0000).unwrap());
        let geometry = RingGeometry {
            id: 1,
            depth: 4,
            req_ring: 256,
            req_counters: 64,
            intr_ctrl_flag: 96,
            resp_ring: 256,
            indexes: 64,
            counters: 72,
            shadow_counters: 128,
        };
        let pool = BufferPool::new(ob.clone(), 4096, 8192).unwrap();
        Fixture {
            ring: RingPair::new(geometry, ib, ob.clone(), pool).unwrap(),
            ob,
            contexts: ContextPool::new(4).unwrap(),
            stats: DeviceStats::new(),
        }
    }

    fn dh() -> PkcRequest {
        PkcRequest::Dh(DhRequest {
            q: vec![0x17; 16],
            curve: None,
            pub_key: vec![0x05; 16],
            priv_key: vec![0x03; 8],
            secret_len: 16,
        })
    }

    /// Stage a job the way submission does and return its descriptor address.
    fn stage(fx: &Fixture, tx: mpsc::Sender<Completion>) -> (ContextToken, u64) {
        let req = dh();
        let plan = BufferPlan::for_request(&req).unwrap();
        let token = fx.contexts.acquire().unwrap();
        let pool = fx.ring.pool();
        let set = pool.allocate(&plan).unwrap();
        pool.load_inputs(&set, &req).unwrap();
        let desc = descriptor::Descriptor::build(&plan, &set);
        desc.write_to(pool.region(), set.descriptor.offset, token.to_raw()).unwrap();
        let desc_addr = set.descriptor.addr;
        let job = JobContext {
            kind: plan.kind,
            ring: 1,
            buffers: set,
            desc_addr,
            callback: Box::new(move |c: Completion| tx.send(c).unwrap()),
            submitted_at: Instant::now(),
        };
        fx.contexts.install(token, job).unwrap();
        fx.ring.enqueue(desc_addr).unwrap();
        (token, desc_addr)
    }

    fn respond(fx: &Fixture, index: u32, desc_addr: u64, result: i32) {
        let slot = 256 + index as usize * RESP_ENTRY_BYTES;
        fx.ob.write(slot, &ResponseEntry { desc_addr, result }.to_bytes()).unwrap();
        fx.ob.store_u32(128, index + 1).unwrap();
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(JobStatus::from_result(0), JobStatus::Success);
        assert_eq!(JobStatus::from_result(-1), JobStatus::Discarded);
        assert_eq!(JobStatus::from_result(0x4b), JobStatus::Failed(0x4b));
        assert_eq!(JobStatus::Discarded.code(), JOB_DISCARDED);
        assert_eq!(JobStatus::Failed(7).to_string(), "failed (0x7)");
    }

    #[test]
    fn test_success_copies_outputs_and_releases() {
        let fx = fixture();
        let (tx, rx) = mpsc::channel();
        let (token, desc_addr) = stage(&fx, tx);
        assert_eq!(fx.contexts.outstanding(), 1);

        let dispatcher = Dispatcher::new(0, &fx.ring, &fx.contexts, &fx.stats, None);
        respond(&fx, 0, desc_addr, 0);
        assert_eq!(dispatcher.drain(8).unwrap(), 1);

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.token, token);
        assert!(completion.is_success());
        assert_eq!(completion.output(Operand::Secret).unwrap().len(), 16);
        assert_eq!(fx.contexts.outstanding(), 0);
        assert_eq!(fx.ring.pool().in_use(), 0);
        assert_eq!(fx.stats.snapshot().resp_count, 1);
    }

    #[test]
    fn test_discarded_and_failed_have_no_outputs() {
        let fx = fixture();
        let (tx, rx) = mpsc::channel();
        let (_, first) = stage(&fx, tx.clone());
        let (_, second) = stage(&fx, tx);

        let dispatcher = Dispatcher::new(0, &fx.ring, &fx.contexts, &fx.stats, None);
        respond(&fx, 0, second, JOB_DISCARDED);
        respond(&fx, 1, first, 0x22);
        assert_eq!(dispatcher.drain(8).unwrap(), 2);

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!(a.status, JobStatus::Discarded);
        assert_eq!(b.status, JobStatus::Failed(0x22));
        assert!(a.outputs.is_empty() && b.outputs.is_empty());

        let snap = fx.stats.snapshot();
        assert_eq!((snap.discarded, snap.failed), (1, 1));
        assert_eq!(fx.contexts.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_and_unknown_responses_are_stale() {
        let fx = fixture();
        let (tx, rx) = mpsc::channel();
        let (_, desc_addr) = stage(&fx, tx);

        let dispatcher = Dispatcher::new(0, &fx.ring, &fx.contexts, &fx.stats, None);
        assert!(dispatcher.on_response(ResponseEntry { desc_addr, result: 0 }));
        assert!(!dispatcher.on_response(ResponseEntry { desc_addr, result: 0 }));
        assert!(!dispatcher.on_response(ResponseEntry {
            desc_addr: 0xdead_0000,
            result: 0
        }));
        assert!(!dispatcher.on_response(ResponseEntry {
            desc_addr: fx.ob.dev_addr(0),
            result: 0
        }));

        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(fx.stats.snapshot().stale_responses, 3);
    }

    #[test]
    fn test_cleanup_survives_panicking_callback() {
        let fx = fixture();
        let req = dh();
        let plan = BufferPlan::for_request(&req).unwrap();
        let token = fx.contexts.acquire().unwrap();
        let set = fx.ring.pool().allocate(&plan).unwrap();
        let desc = descriptor::Descriptor::build(&plan, &set);
        desc.write_to(fx.ring.pool().region(), set.descriptor.offset, token.to_raw()).unwrap();
        let desc_addr = set.descriptor.addr;
        let job = JobContext {
            kind: plan.kind,
            ring: 1,
            buffers: set,
            desc_addr,
            callback: Box::new(|_: Completion| panic!("callback failure")),
            submitted_at: Instant::now(),
        };
        fx.contexts.install(token, job).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Dispatcher::new(0, &fx.ring, &fx.contexts, &fx.stats, None)
                .on_response(ResponseEntry { desc_addr, result: 0 })
        }));
        assert!(result.is_err());
        assert_eq!(fx.contexts.outstanding(), 0);
        assert_eq!(fx.ring.pool().in_use(), 0);
    }
}
