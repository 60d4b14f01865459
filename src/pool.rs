// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Operand buffer pool.
//!
//! Each ring owns one pool carved out of the outbound window. Allocation is
//! first-fit over an offset-ordered free list; freed ranges coalesce with
//! their neighbours. A request's buffers are claimed all-or-nothing.

use crate::error::{PkcError, PkcResult};
use crate::layout::{BufferPlan, BufferRole, Operand};
use crate::region::DmaRegion;
use crate::request::PkcRequest;
use crate::sync;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Allocation granularity; keeps every address 64-bit aligned.
pub const BUFFER_ALIGN: usize = 8;

#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// A buffer visible to both sides.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    pub role: BufferRole,
    /// `None` for descriptor scratch.
    pub operand: Option<Operand>,
    /// Host-side offset within the pool's region.
    pub offset: usize,
    /// Accelerator-side address.
    pub addr: u64,
    /// Requested length in bytes.
    pub len: usize,
    reserved: usize,
}

/// The buffers claimed for one job.
#[derive(Debug)]
pub struct BufferSet {
    pub operands: Vec<Buffer>,
    pub descriptor: Buffer,
}

impl BufferSet {
    pub fn get(&self, op: Operand) -> Option<&Buffer> {
        self.operands.iter().find(|b| b.operand == Some(op))
    }

    /// Accelerator address of `op`'s buffer.
    pub fn addr(&self, op: Operand) -> Option<u64> {
        self.get(op).map(|b| b.addr)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Buffer> {
        self.operands.iter().filter(|b| b.role == BufferRole::Output)
    }

    /// Every buffer, descriptor included.
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.operands.iter().chain(std::iter::once(&self.descriptor))
    }

    /// Total bytes reserved from the pool.
    pub fn reserved_bytes(&self) -> usize {
        self.iter().map(|b| b.reserved).sum()
    }
}

/// First-fit pool over a window of a [`DmaRegion`].
pub struct BufferPool {
    region: Arc<DmaRegion>,
    base: usize,
    size: usize,
    /// offset -> length of each free range.
    free: Mutex<BTreeMap<usize, usize>>,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Manage `size` bytes of `region` starting at `base`.
    pub fn new(region: Arc<DmaRegion>, base: usize, size: usize) -> PkcResult<Self> {
        let base_aligned = align_up(base, BUFFER_ALIGN);
        let usable = size.saturating_sub(base_aligned - base) & !(BUFFER_ALIGN - 1);
        if usable == 0 {
            return Err(PkcError::InvalidConfig(format!(
                "buffer pool of {} bytes at {:#x} is empty",
                size, base
            )));
        }
        match base_aligned.checked_add(usable) {
            Some(end) if end <= region.len() => {}
            _ => {
                return Err(PkcError::InvalidConfig(format!(
                    "buffer pool [{:#x}, +{:#x}) exceeds region {}",
                    base,
                    size,
                    region.name()
                )))
            }
        }

        let mut free = BTreeMap::new();
        free.insert(base_aligned, usable);
        Ok(Self {
            region,
            base: base_aligned,
            size: usable,
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.size - self.in_use()
    }

    /// Whether `offset` lies inside this pool.
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.base && offset < self.base + self.size
    }

    /// Claim one buffer.
    pub fn alloc(&self, role: BufferRole, operand: Option<Operand>, len: usize) -> PkcResult<Buffer> {
        let reserved = align_up(len.max(1), BUFFER_ALIGN);
        let mut free = sync::lock(&self.free);

        let (offset, range) = free
            .iter()
            .find(|(_, range)| **range >= reserved)
            .map(|(offset, range)| (*offset, *range))
            .ok_or(PkcError::OutOfBufferMemory { requested: len })?;

        free.remove(&offset);
        if range > reserved {
            free.insert(offset + reserved, range - reserved);
        }
        drop(free);

        self.in_use.fetch_add(reserved, Ordering::Relaxed);
        Ok(Buffer {
            role,
            operand,
            offset,
            addr: self.region.dev_addr(offset),
            len,
            reserved,
        })
    }

    /// Return one buffer.
    pub fn release(&self, buffer: Buffer) {
        let mut offset = buffer.offset;
        let mut len = buffer.reserved;
        let mut free = sync::lock(&self.free);

        if let Some((&prev, &prev_len)) = free.range(..offset).next_back() {
            if prev + prev_len == offset {
                free.remove(&prev);
                offset = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = free.remove(&(offset + len)) {
            len += next_len;
        }
        free.insert(offset, len);
        drop(free);

        self.in_use.fetch_sub(buffer.reserved, Ordering::Relaxed);
    }

    /// Claim every buffer `plan` needs plus descriptor scratch.
    ///
    /// Either every buffer is claimed or none is.
    pub fn allocate(&self, plan: &BufferPlan) -> PkcResult<BufferSet> {
        let mut claimed = scopeguard::guard(Vec::with_capacity(plan.specs.len()), |claimed| {
            for buffer in claimed {
                self.release(buffer);
            }
        });

        for spec in &plan.specs {
            claimed.push(self.alloc(spec.role, Some(spec.operand), spec.len)?);
        }
        let descriptor = self.alloc(BufferRole::Descriptor, None, plan.descriptor_len())?;

        Ok(BufferSet {
            operands: scopeguard::ScopeGuard::into_inner(claimed),
            descriptor,
        })
    }

    /// Return every buffer of a job.
    pub fn free(&self, set: BufferSet) {
        for buffer in set.operands {
            self.release(buffer);
        }
        self.release(set.descriptor);
    }

    /// Copy the request's inputs in and clear everything the accelerator writes.
    pub fn load_inputs(&self, set: &BufferSet, req: &PkcRequest) -> PkcResult<()> {
        for buffer in &set.operands {
            match (buffer.role, buffer.operand) {
                (BufferRole::Input, Some(op)) => {
                    let bytes = req.input(op).ok_or_else(|| {
                        PkcError::InvalidRequest(format!("{} missing from {}", op, req.kind()))
                    })?;
                    self.region.write(buffer.offset, bytes)?;
                }
                _ => self.region.zero(buffer.offset, buffer.len)?,
            }
        }
        Ok(())
    }

    /// Copy a buffer's current contents out.
    pub fn read(&self, buffer: &Buffer) -> PkcResult<Vec<u8>> {
        self.region.read_vec(buffer.offset, buffer.len)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("region", &self.region.name())
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BufferSpec;
    use crate::request::{DsaDomain, DsaSignRequest};

    fn pool(size: usize) -> BufferPool {
        let region = Arc::new(DmaRegion::allocate("ob", 4096, 0x1_0000_0000).unwrap());
        BufferPool::new(region, 256, size).unwrap()
    }

    fn sign_request() -> PkcRequest {
        PkcRequest::DsaSign(DsaSignRequest {
            domain: DsaDomain::finite(vec![0x11; 20], vec![0x22; 20], vec![0x33; 20]),
            priv_key: vec![0x44; 20],
            message: vec![0x55; 20],
            component_len: 20,
        })
    }

    #[test]
    fn test_alloc_alignment_and_addresses() {
        let pool = pool(1024);
        let a = pool.alloc(BufferRole::Input, Some(Operand::Q), 3).unwrap();
        let b = pool.alloc(BufferRole::Input, Some(Operand::R), 20).unwrap();
        assert_eq!(a.offset, 256);
        assert_eq!(b.offset, 264);
        assert_eq!(b.addr, 0x1_0000_0000 + 264);
        assert_eq!(pool.in_use(), 8 + 24);
    }

    #[test]
    fn test_release_coalesces() {
        let pool = pool(96);
        let a = pool.alloc(BufferRole::Input, None, 32).unwrap();
        let b = pool.alloc(BufferRole::Input, None, 32).unwrap();
        let c = pool.alloc(BufferRole::Input, None, 32).unwrap();
        assert!(pool.alloc(BufferRole::Input, None, 1).is_err());

        pool.release(a);
        pool.release(c);
        assert!(pool.alloc(BufferRole::Input, None, 64).is_err());
        pool.release(b);
        assert_eq!(pool.in_use(), 0);

        let whole = pool.alloc(BufferRole::Temporary, None, 96).unwrap();
        assert_eq!(whole.offset, 256);
    }

    #[test]
    fn test_allocate_rolls_back_on_exhaustion() {
        let request = sign_request();
        let plan = BufferPlan::for_request(&request).unwrap();
        let needed: usize = plan.specs.iter().map(|s| align_up(s.len, BUFFER_ALIGN)).sum::<usize>()
            + align_up(plan.descriptor_len(), BUFFER_ALIGN);

        let small = pool(needed - BUFFER_ALIGN);
        assert!(matches!(
            small.allocate(&plan),
            Err(PkcError::OutOfBufferMemory { .. })
        ));
        assert_eq!(small.in_use(), 0);

        let exact = pool(needed);
        let set = exact.allocate(&plan).unwrap();
        assert_eq!(set.reserved_bytes(), needed);
        assert_eq!(exact.available(), 0);
        exact.free(set);
        assert_eq!(exact.available(), needed);
    }

    #[test]
    fn test_load_inputs() {
        let pool = pool(2048);
        let request = sign_request();
        let plan = BufferPlan::for_request(&request).unwrap();
        let set = pool.allocate(&plan).unwrap();

        // Dirty the output buffer to check it gets cleared.
        let c = set.get(Operand::SigC).unwrap();
        pool.region().write(c.offset, &[0xFF; 20]).unwrap();

        pool.load_inputs(&set, &request).unwrap();
        assert_eq!(pool.read(set.get(Operand::PrivKey).unwrap()).unwrap(), vec![0x44; 20]);
        assert_eq!(pool.read(set.get(Operand::Message).unwrap()).unwrap(), vec![0x55; 20]);
        assert_eq!(pool.read(set.get(Operand::SigC).unwrap()).unwrap(), vec![0; 20]);
        assert_eq!(set.outputs().count(), 2);
        assert_eq!(set.descriptor.role, BufferRole::Descriptor);
    }

    #[test]
    fn test_missing_input_is_rejected() {
        let pool = pool(1024);
        let request = sign_request();
        let plan = BufferPlan {
            specs: vec![BufferSpec {
                operand: Operand::Modulus,
                role: BufferRole::Input,
                len: 8,
            }],
            ..BufferPlan::for_request(&request).unwrap()
        };
        let set = pool.allocate(&plan).unwrap();
        assert!(matches!(
            pool.load_inputs(&set, &request),
            Err(PkcError::InvalidRequest(_))
        ));
        pool.free(set);
    }

    #[test]
    fn test_pool_must_fit_region() {
        let region = Arc::new(DmaRegion::allocate("ob", 1024, 0).unwrap());
        assert!(BufferPool::new(region.clone(), 512, 1024).is_err());
        assert!(BufferPool::new(region, 1020, 4).is_err());
    }
}
