//! powqueue Core Library
//!
//! Cross-process offload queue for modular exponentiation. Clients submit
//! `2^x mod p` requests into a fixed-capacity ring in POSIX shared memory;
//! one server drains the ring and answers each client through a companion
//! response ring, waking exactly the waiter that asked.

pub mod compute;
pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod shm;
pub mod types;

// Re-export commonly used types
pub use compute::mod_pow;
pub use config::{ClientConfig, Config, ConfigLoader, QueueConfig};
pub use consumer::QueueServer;
pub use error::{
    HardValidationError, PowQueueError, PowQueueResult, RingError, SharedMemoryError, SyncError,
};
pub use producer::{ClientOptions, PendingRequest, QueueClient};
pub use shm::{RingBuffer, RingStats, SharedRegion};
pub use types::{Capacity, OverflowPolicy, QueueName};
