// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for powqueue.
//!
//! Explicit enum error types only. No `Box<dyn Error>`, no `anyhow::Result`.
//! Initialization failures are fatal for the owning process; per-request
//! failures go back to the one caller that submitted the request.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Top-level error type for powqueue.
#[derive(Debug, Error)]
pub enum PowQueueError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Shared Memory Errors - Fatal at create/attach time
    // =========================================================================
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] SharedMemoryError),

    // =========================================================================
    // Ring Errors - Per-request or protocol failures
    // =========================================================================
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors prevent startup.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Capacity out of bounds: {capacity} (min: {min}, max: {max})")]
    CapacityOutOfBounds { capacity: usize, min: usize, max: usize },
}

/// Shared memory lifecycle errors.
#[derive(Debug, Error)]
pub enum SharedMemoryError {
    /// The object already exists (`O_EXCL`). Recoverable only by attaching.
    #[error("Shared memory region already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Failed to allocate shared memory region: {name} - {reason}")]
    Allocation { name: String, reason: String },

    #[error("Failed to size or map shared memory region: {name} - {reason}")]
    Resource { name: String, reason: String },

    #[error("Shared memory region not found: {name}")]
    NotFound { name: String },

    #[error("Shared memory region {name} is not a compatible ring: {reason}")]
    Incompatible { name: String, reason: String },

    #[error("Visibility barrier {op} failed: {source}")]
    Barrier {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A pthread or clock call inside the shared region failed.
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct SyncError {
    pub op: &'static str,
    #[source]
    pub source: Errno,
}

impl SyncError {
    /// Build from a pthread return code (pthread calls return the errno).
    pub fn from_code(op: &'static str, code: i32) -> Self {
        Self {
            op,
            source: Errno::from_raw(code),
        }
    }

    /// Build from the calling thread's `errno`.
    pub fn last(op: &'static str) -> Self {
        Self {
            op,
            source: Errno::last(),
        }
    }
}

/// Ring protocol errors.
#[derive(Debug, Error)]
pub enum RingError {
    /// Rejected before entering the ring, or answered `Rejected` by the server.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Ring buffer full - {capacity} requests already in flight")]
    CapacityExceeded { capacity: usize },

    #[error("Timed out waiting for response to request #{sequence}")]
    Timeout { sequence: u64 },

    #[error("Ring is shutting down")]
    Closed,

    /// The response slot carries another request's answer.
    #[error("Response for request #{sequence} was lost (slot holds another answer)")]
    ResponseLost { sequence: u64 },

    #[error("Request slot #{sequence} is corrupted: {reason}")]
    Corrupted { sequence: u64, reason: String },

    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] SharedMemoryError),
}

/// Result type alias using PowQueueError.
pub type PowQueueResult<T> = Result<T, PowQueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_error_display() {
        let err = HardValidationError::CapacityOutOfBounds {
            capacity: 0,
            min: 1,
            max: 1024,
        };
        assert!(err.to_string().contains("min: 1"));
        assert!(err.to_string().contains("max: 1024"));
    }

    #[test]
    fn test_error_chain() {
        let ring_err: RingError = SharedMemoryError::NotFound {
            name: "missing".to_string(),
        }
        .into();
        let top: PowQueueError = ring_err.into();
        assert!(matches!(
            top,
            PowQueueError::Ring(RingError::SharedMemory(SharedMemoryError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_sync_error_from_code() {
        let err = SyncError::from_code("pthread_mutex_lock", libc::EINVAL);
        assert_eq!(err.source, Errno::EINVAL);
        assert!(err.to_string().starts_with("pthread_mutex_lock failed"));
    }
}
