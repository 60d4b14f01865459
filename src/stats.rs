// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-device job statistics.

use crate::dispatch::JobStatus;
use std::sync::atomic::{AtomicU64, Ordering};

/// Passive observer of device activity.
///
/// Nothing in the driver depends on what a sink does; every method has an
/// empty default.
pub trait StatsSink: Send + Sync {
    fn on_request(&self, _device: u32, _ring: u32) {}

    fn on_response(&self, _device: u32, _ring: u32, _status: JobStatus) {}

    /// A response that matched no in-flight job.
    fn on_stale_response(&self, _device: u32, _ring: u32) {}

    fn on_device_dead(&self, _device: u32) {}
}

/// Built-in counters of one device.
#[derive(Debug, Default)]
pub struct DeviceStats {
    req_count: AtomicU64,
    resp_count: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
    stale_responses: AtomicU64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self, status: JobStatus) {
        self.resp_count.fetch_add(1, Ordering::Relaxed);
        match status {
            JobStatus::Success => {}
            JobStatus::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Discarded => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_stale(&self) {
        self.stale_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            req_count: self.req_count.load(Ordering::Relaxed),
            resp_count: self.resp_count.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeviceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Jobs accepted onto a ring.
    pub req_count: u64,
    /// Responses matched to a job, whatever their status.
    pub resp_count: u64,
    pub discarded: u64,
    pub failed: u64,
    pub stale_responses: u64,
}

impl StatsSnapshot {
    /// Accepted jobs not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.req_count.saturating_sub(self.resp_count)
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "req={} resp={} failed={} discarded={} stale={}",
            self.req_count, self.resp_count, self.failed, self.discarded, self.stale_responses
        )
    }
}
