// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for PKC operations.

use crate::handshake::HandshakeState;
use thiserror::Error;

/// Errors that can occur while bringing up a device or submitting jobs.
#[derive(Debug, Error)]
pub enum PkcError {
    /// No accelerator device configured.
    #[error("no accelerator device configured")]
    NoDeviceFound,

    /// Every configured device is marked dead.
    #[error("no accelerator device is alive")]
    NoDeviceAlive,

    /// Device has not completed its handshake, or has been marked dead.
    #[error("device {0} is not ready")]
    DeviceNotReady(u32),

    /// Device still owns in-flight jobs and cannot be re-initialised.
    #[error("device {device} busy: {outstanding} jobs outstanding")]
    DeviceBusy { device: u32, outstanding: usize },

    /// Request ring has no free slot. Retry after the ring drains.
    #[error("ring {0} full")]
    QueueFull(u32),

    /// Ring is blocked for a reset.
    #[error("ring {0} blocked")]
    RingBlocked(u32),

    /// Job context pool exhausted.
    #[error("job context pool exhausted")]
    OutOfContexts,

    /// Buffer pool could not satisfy an allocation.
    #[error("buffer pool exhausted: requested {requested} bytes")]
    OutOfBufferMemory { requested: usize },

    /// Request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operand length inconsistent with the rest of the request.
    #[error("length mismatch for {field}: expected {expected}, got {actual}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Ring id does not exist on the device.
    #[error("invalid ring id {0}")]
    InvalidRing(u32),

    /// Invalid device or ring configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Accelerator did not post the expected handshake state in time.
    #[error("handshake timed out waiting for {expected:?} (last state {observed:#04x})")]
    HandshakeTimeout {
        expected: HandshakeState,
        observed: u8,
    },

    /// Accelerator posted the expected state with a non-zero result.
    #[error("handshake failed in state {state:?}: result={result:#04x}")]
    HandshakeFailed { state: HandshakeState, result: u8 },

    /// Accelerator completed the job with a non-zero result.
    #[error("job failed with result {code:#x}")]
    JobFailed { code: i32 },

    /// Accelerator discarded the job without running it.
    #[error("job discarded by the accelerator")]
    JobDiscarded,

    /// No completion arrived within the wait budget.
    #[error("no completion within {0:?}")]
    WaitTimeout(std::time::Duration),

    /// Address or offset falls outside of a shared memory window.
    #[error("address {addr:#018x} outside of window {window}")]
    AddressOutOfRange { window: String, addr: u64 },

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Platform not supported.
    #[error("platform not supported: mapping device windows requires Linux")]
    PlatformNotSupported,
}

impl PkcError {
    /// Returns true for resource exhaustion the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull(_) | Self::OutOfContexts | Self::OutOfBufferMemory { .. }
        )
    }
}

/// Result type alias for PKC operations.
pub type PkcResult<T> = Result<T, PkcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PkcError::QueueFull(1).is_retryable());
        assert!(PkcError::OutOfContexts.is_retryable());
        assert!(PkcError::OutOfBufferMemory { requested: 64 }.is_retryable());
        assert!(!PkcError::NoDeviceAlive.is_retryable());
        assert!(!PkcError::RingBlocked(1).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = PkcError::LengthMismatch {
            field: "signature component",
            expected: 20,
            actual: 21,
        };
        assert_eq!(
            err.to_string(),
            "length mismatch for signature component: expected 20, got 21"
        );
    }
}
