// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Job context pool.
//!
//! Every in-flight job owns one [`JobContext`] from submission until its
//! completion has been dispatched. Contexts live in a fixed slot array;
//! a [`ContextToken`] names a slot together with the generation it was
//! acquired in, so a late or duplicated response can never resolve to a
//! slot that has since been reused.

use crate::dispatch::Completion;
use crate::error::{PkcError, PkcResult};
use crate::layout::OperationKind;
use crate::pool::BufferSet;
use crate::sync;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Invoked exactly once when a job completes.
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Handle to an acquired context slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken {
    index: u32,
    generation: u32,
}

impl ContextToken {
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into the 64-bit value stored behind the descriptor.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl std::fmt::Display for ContextToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}.{}", self.index, self.generation)
    }
}

/// Tracking record for one in-flight job.
pub struct JobContext {
    pub kind: OperationKind,
    pub ring: u32,
    pub buffers: BufferSet,
    /// Accelerator address of the descriptor; what the response echoes.
    pub desc_addr: u64,
    pub callback: CompletionCallback,
    pub submitted_at: Instant,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("kind", &self.kind)
            .field("ring", &self.ring)
            .field("desc_addr", &format_args!("{:#x}", self.desc_addr))
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    acquired: bool,
    job: Option<JobContext>,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Fixed-capacity context pool.
pub struct ContextPool {
    state: Mutex<PoolState>,
    capacity: usize,
    outstanding: AtomicUsize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> PkcResult<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(PkcError::InvalidConfig(format!(
                "context pool capacity {} out of range",
                capacity
            )));
        }
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        // Pop from the back, so hand out low indices first.
        let free = (0..capacity as u32).rev().collect();
        Ok(Self {
            state: Mutex::new(PoolState { slots, free }),
            capacity,
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contexts currently acquired.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Claim a free slot.
    pub fn acquire(&self) -> PkcResult<ContextToken> {
        let mut state = sync::lock(&self.state);
        let index = state.free.pop().ok_or(PkcError::OutOfContexts)?;
        let slot = &mut state.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.acquired = true;
        let token = ContextToken {
            index,
            generation: slot.generation,
        };
        drop(state);

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(token)
    }

    /// Attach the job to an acquired slot.
    ///
    /// On failure the job is handed back so the caller can undo it.
    pub fn install(&self, token: ContextToken, job: JobContext) -> Result<(), JobContext> {
        let mut state = sync::lock(&self.state);
        match state.slots.get_mut(token.index as usize) {
            Some(slot) if slot.acquired && slot.generation == token.generation && slot.job.is_none() => {
                slot.job = Some(job);
                Ok(())
            }
            _ => Err(job),
        }
    }

    /// Detach the job from a slot, keeping the slot acquired.
    pub fn take(&self, token: ContextToken) -> Option<JobContext> {
        let mut state = sync::lock(&self.state);
        let slot = state.slots.get_mut(token.index as usize)?;
        if slot.acquired && slot.generation == token.generation {
            slot.job.take()
        } else {
            None
        }
    }

    /// Like [`ContextPool::take`], but only if the job was submitted at `desc_addr`.
    pub fn take_if(&self, token: ContextToken, desc_addr: u64) -> Option<JobContext> {
        let mut state = sync::lock(&self.state);
        let slot = state.slots.get_mut(token.index as usize)?;
        if !slot.acquired || slot.generation != token.generation {
            return None;
        }
        match &slot.job {
            Some(job) if job.desc_addr == desc_addr => slot.job.take(),
            _ => None,
        }
    }

    /// Return a slot to the pool. Stale tokens are ignored.
    pub fn release(&self, token: ContextToken) -> bool {
        let mut state = sync::lock(&self.state);
        let released = match state.slots.get_mut(token.index as usize) {
            Some(slot) if slot.acquired && slot.generation == token.generation => {
                if slot.job.take().is_some() {
                    log::warn!("{} released with a job still attached", token);
                }
                slot.acquired = false;
                true
            }
            _ => false,
        };
        if released {
            state.free.push(token.index);
            drop(state);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        released
    }
}

impl std::fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPool")
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BufferPlan, Group};
    use crate::pool::BufferPool;
    use crate::region::DmaRegion;
    use crate::request::{DsaDomain, DsaKeygenRequest, PkcRequest};
    use std::sync::Arc;

    fn job(pool: &BufferPool, desc_addr: u64) -> JobContext {
        let request = PkcRequest::DsaKeygen(DsaKeygenRequest {
            domain: DsaDomain::finite(vec![1; 16], vec![2; 16], vec![3; 16]),
            priv_len: 16,
            pub_len: 16,
        });
        let plan = BufferPlan::for_request(&request).unwrap();
        JobContext {
            kind: plan.kind,
            ring: 1,
            buffers: pool.allocate(&plan).unwrap(),
            desc_addr,
            callback: Box::new(|_| {}),
            submitted_at: Instant::now(),
        }
    }

    fn buffer_pool() -> BufferPool {
        let region = Arc::new(DmaRegion::allocate("ob", 8192, 0).unwrap());
        BufferPool::new(region, 0, 8192).unwrap()
    }

    #[test]
    fn test_token_raw_round_trip() {
        let token = ContextToken {
            index: 7,
            generation: 0xDEAD_BEEF,
        };
        assert_eq!(token.to_raw(), 0xDEAD_BEEF_0000_0007);
        assert_eq!(ContextToken::from_raw(token.to_raw()), token);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let pool = ContextPool::new(2).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert!(matches!(pool.acquire(), Err(PkcError::OutOfContexts)));
        assert_eq!(pool.outstanding(), 2);

        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.outstanding(), 1);

        let c = pool.acquire().unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
    }

    #[test]
    fn test_stale_token_does_not_resolve() {
        let buffers = buffer_pool();
        let pool = ContextPool::new(1).unwrap();

        let first = pool.acquire().unwrap();
        pool.install(first, job(&buffers, 0x100)).unwrap();
        let taken = pool.take(first).unwrap();
        buffers.free(taken.buffers);
        pool.release(first);

        let second = pool.acquire().unwrap();
        pool.install(second, job(&buffers, 0x200)).unwrap();
        assert!(pool.take(first).is_none());
        assert!(pool.take_if(second, 0x100).is_none());
        let job = pool.take_if(second, 0x200).unwrap();
        assert_eq!(job.desc_addr, 0x200);
        assert!(pool.take(second).is_none());
        buffers.free(job.buffers);
        pool.release(second);
    }

    #[test]
    fn test_install_requires_acquired_slot() {
        let buffers = buffer_pool();
        let pool = ContextPool::new(1).unwrap();
        let token = pool.acquire().unwrap();
        pool.release(token);

        let rejected = pool.install(token, job(&buffers, 0x100)).unwrap_err();
        assert_eq!(rejected.kind, crate::layout::OperationKind::DsaKeygen(Group::Finite));
        buffers.free(rejected.buffers);
    }
}
