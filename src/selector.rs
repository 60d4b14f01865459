// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device selection.

use crate::device::Device;
use crate::error::{PkcError, PkcResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The set of devices jobs are spread over.
///
/// Devices are visited round-robin in the order given to [`DeviceSet::new`].
/// Dead devices are skipped; the set itself never changes.
pub struct DeviceSet {
    devices: Vec<Arc<Device>>,
    next: AtomicUsize,
}

impl DeviceSet {
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        Self {
            devices,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Device with number `id`.
    pub fn get(&self, id: u32) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn alive_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_alive()).count()
    }

    /// Next live device.
    ///
    /// Tries each device at most once starting from the rotation point.
    pub fn pick_device(&self) -> PkcResult<Arc<Device>> {
        if self.devices.is_empty() {
            return Err(PkcError::NoDeviceFound);
        }
        let count = self.devices.len();
        for _ in 0..count {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            let device = &self.devices[n % count];
            if device.is_alive() {
                return Ok(device.clone());
            }
        }
        log::warn!("no live device among {}", count);
        Err(PkcError::NoDeviceAlive)
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("devices", &self.devices.len())
            .field("alive", &self.alive_count())
            .finish()
    }
}
