// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Shared memory windows.
//!
//! A [`DmaRegion`] is a contiguous range visible to both the driver and the
//! accelerator. The driver addresses it by byte offset; the accelerator by
//! `dev_base + offset`. Two windows exist per device:
//!
//! - **inbound**: accelerator memory reached through a BAR (handshake
//!   mailbox, request rings, request-side counters)
//! - **outbound**: host DMA memory the accelerator writes into (handshake
//!   state, response rings, indexes, counters, operand buffers)
//!
//! # Platform Support
//!
//! Heap-backed regions work everywhere. [`DmaRegion::map`] maps a window
//! from a resource or UIO file and is Linux only.

use crate::endian;
use crate::error::{PkcError, PkcResult};
use std::alloc::{self, Layout};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Alignment of heap-backed regions (one cache line).
pub const REGION_ALIGN: usize = 64;

enum Backing {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    Mapped {
        _file: std::fs::File,
        map_base: *mut libc::c_void,
        map_len: usize,
    },
}

/// A shared memory window.
pub struct DmaRegion {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    /// Accelerator-side address of offset 0.
    dev_base: AtomicU64,
    backing: Backing,
}

// SAFETY: DmaRegion can be sent between threads because:
// - The backing allocation or mapping is owned and lives until drop
// - The pointer is never handed out beyond the bounds-checked accessors
unsafe impl Send for DmaRegion {}

// SAFETY: Concurrent access is sound under the ownership protocol of the
// pools and rings: a byte range is written by exactly one owner at a time,
// and hand-over between owners goes through the release/acquire counters
// in `store_u32` / `load_u32`.
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate a zeroed, heap-backed region.
    pub fn allocate(name: &str, len: usize, dev_base: u64) -> PkcResult<Self> {
        if len == 0 {
            return Err(PkcError::InvalidConfig(format!(
                "region {} has zero length",
                name
            )));
        }
        let layout = Layout::from_size_align(len, REGION_ALIGN)
            .map_err(|e| PkcError::InvalidConfig(format!("region {}: {}", name, e)))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(PkcError::OutOfBufferMemory { requested: len })?;

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            dev_base: AtomicU64::new(dev_base),
            backing: Backing::Heap(layout),
        })
    }

    /// Map a window from a resource or UIO file.
    ///
    /// # Arguments
    ///
    /// * `path` - File exposing the window (e.g. `/sys/bus/pci/devices/.../resource2`)
    /// * `offset` - Byte offset of the window within the file
    /// * `len` - Window length in bytes
    /// * `dev_base` - Accelerator-side address of the first byte
    #[cfg(target_os = "linux")]
    pub fn map(name: &str, path: &Path, offset: u64, len: usize, dev_base: u64) -> PkcResult<Self> {
        use std::os::unix::io::AsRawFd;

        if len == 0 {
            return Err(PkcError::InvalidConfig(format!(
                "region {} has zero length",
                name
            )));
        }

        let file = std::fs::File::options().read(true).write(true).open(path)?;

        // SAFETY: sysconf has no preconditions.
        let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as u64,
            _ => 4096,
        };
        let page_offset = offset & (page - 1);
        let map_len = len + page_offset as usize;

        // SAFETY: fd is valid for the lifetime of `file`, which the region owns.
        let map_base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                (offset - page_offset) as libc::off_t,
            )
        };

        if map_base == libc::MAP_FAILED {
            return Err(PkcError::MmapFailed(format!(
                "{}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: page_offset < map_len, inside the fresh mapping.
        let start = unsafe { (map_base as *mut u8).add(page_offset as usize) };
        let ptr = NonNull::new(start)
            .ok_or_else(|| PkcError::MmapFailed(format!("{}: null mapping", path.display())))?;

        log::info!(
            "Mapped window {} ({} bytes at {:#x}) from {}",
            name,
            len,
            dev_base,
            path.display()
        );

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            dev_base: AtomicU64::new(dev_base),
            backing: Backing::Mapped {
                _file: file,
                map_base,
                map_len,
            },
        })
    }

    /// Mapping device windows is only supported on Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn map(
        _name: &str,
        _path: &Path,
        _offset: u64,
        _len: usize,
        _dev_base: u64,
    ) -> PkcResult<Self> {
        Err(PkcError::PlatformNotSupported)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Accelerator-side address of offset 0.
    pub fn dev_base(&self) -> u64 {
        self.dev_base.load(Ordering::Acquire)
    }

    /// Rebase the window once the accelerator reports its view of it.
    pub fn set_dev_base(&self, base: u64) {
        self.dev_base.store(base, Ordering::Release);
    }

    /// Accelerator-side address of `offset`.
    pub fn dev_addr(&self, offset: usize) -> u64 {
        self.dev_base() + offset as u64
    }

    /// Translate an accelerator-side address back to an offset.
    pub fn offset_of(&self, addr: u64) -> PkcResult<usize> {
        addr.checked_sub(self.dev_base())
            .filter(|offset| *offset < self.len as u64)
            .map(|offset| offset as usize)
            .ok_or_else(|| self.out_of_range(addr))
    }

    fn out_of_range(&self, addr: u64) -> PkcError {
        PkcError::AddressOutOfRange {
            window: self.name.clone(),
            addr,
        }
    }

    fn span(&self, offset: usize, len: usize) -> PkcResult<*mut u8> {
        match offset.checked_add(len) {
            // SAFETY: offset + len <= self.len, inside the allocation.
            Some(end) if end <= self.len => Ok(unsafe { self.ptr.as_ptr().add(offset) }),
            _ => Err(self.out_of_range(offset as u64)),
        }
    }

    /// Copy `data` into the window at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> PkcResult<()> {
        let dst = self.span(offset, data.len())?;
        // SAFETY: dst is valid for data.len() bytes and cannot overlap `data`,
        // which lives outside the window.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Copy bytes out of the window.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> PkcResult<()> {
        let src = self.span(offset, out.len())?;
        // SAFETY: src is valid for out.len() bytes.
        unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    pub fn read_vec(&self, offset: usize, len: usize) -> PkcResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&self, offset: usize, len: usize) -> PkcResult<()> {
        let dst = self.span(offset, len)?;
        // SAFETY: dst is valid for len bytes.
        unsafe { ptr::write_bytes(dst, 0, len) };
        Ok(())
    }

    /// Read a fixed-size record the accelerator may still be writing.
    pub fn read_volatile<const N: usize>(&self, offset: usize) -> PkcResult<[u8; N]> {
        let src = self.span(offset, N)? as *const [u8; N];
        // SAFETY: [u8; N] has alignment 1 and src is valid for N bytes.
        Ok(unsafe { ptr::read_volatile(src) })
    }

    pub fn read_u8_volatile(&self, offset: usize) -> PkcResult<u8> {
        let src = self.span(offset, 1)?;
        // SAFETY: src is valid for one byte.
        Ok(unsafe { ptr::read_volatile(src) })
    }

    pub fn write_u8_volatile(&self, offset: usize, value: u8) -> PkcResult<()> {
        let dst = self.span(offset, 1)?;
        // SAFETY: dst is valid for one byte.
        unsafe { ptr::write_volatile(dst, value) };
        Ok(())
    }

    /// Write a 32-bit field in accelerator byte order.
    pub fn write_u32(&self, offset: usize, value: u32) -> PkcResult<()> {
        let mut raw = [0u8; 4];
        endian::put_u32(&mut raw, value);
        self.write(offset, &raw)
    }

    pub fn read_u32(&self, offset: usize) -> PkcResult<u32> {
        let raw: [u8; 4] = self.read_volatile(offset)?;
        Ok(endian::get_u32(&raw))
    }

    /// Write a 64-bit field in accelerator byte order.
    pub fn write_u64(&self, offset: usize, value: u64) -> PkcResult<()> {
        let mut raw = [0u8; 8];
        endian::put_u64(&mut raw, value);
        self.write(offset, &raw)
    }

    pub fn read_u64(&self, offset: usize) -> PkcResult<u64> {
        let raw: [u8; 8] = self.read_volatile(offset)?;
        Ok(endian::get_u64(&raw))
    }

    /// Write a sequence of words in accelerator byte order.
    pub fn write_words(&self, offset: usize, words: &[u32]) -> PkcResult<()> {
        let mut raw = vec![0u8; words.len() * 4];
        endian::words_to_device(words, &mut raw);
        self.write(offset, &raw)
    }

    pub fn read_words(&self, offset: usize, count: usize) -> PkcResult<Vec<u32>> {
        let raw = self.read_vec(offset, count * 4)?;
        Ok(endian::words_from_device(&raw))
    }

    fn atomic_u32(&self, offset: usize) -> PkcResult<&AtomicU32> {
        if offset % 4 != 0 {
            return Err(self.out_of_range(offset as u64));
        }
        let p = self.span(offset, 4)?;
        // SAFETY: p is 4-byte aligned (base is at least page or cache-line
        // aligned and offset is a multiple of 4) and valid for 4 bytes.
        Ok(unsafe { &*(p as *const AtomicU32) })
    }

    /// Publish a counter or index with release ordering.
    ///
    /// Everything written to the window before this store is visible to an
    /// observer that reads the new value through [`DmaRegion::load_u32`].
    pub fn store_u32(&self, offset: usize, value: u32) -> PkcResult<()> {
        self.atomic_u32(offset)?
            .store(endian::to_device_u32(value), Ordering::Release);
        Ok(())
    }

    /// Read a counter or index with acquire ordering.
    pub fn load_u32(&self, offset: usize) -> PkcResult<u32> {
        Ok(endian::from_device_u32(
            self.atomic_u32(offset)?.load(Ordering::Acquire),
        ))
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Heap(layout) => {
                // SAFETY: ptr came from alloc_zeroed with this layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), *layout) };
            }
            #[cfg(target_os = "linux")]
            Backing::Mapped {
                map_base, map_len, ..
            } => {
                // SAFETY: map_base/map_len describe the mapping created in `map`.
                unsafe {
                    libc::munmap(*map_base, *map_len);
                }
            }
        }
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("dev_base", &format_args!("{:#x}", self.dev_base()))
            .finish()
    }
}
