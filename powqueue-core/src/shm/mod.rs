// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared Memory IPC module.
//!
//! POSIX shared memory holding a fixed-capacity request/response ring,
//! synchronised by process-shared pthread mutexes and condition variables
//! stored inside the region itself.

mod layout;
mod region;
mod ring_buffer;
mod sync;

pub use layout::{RequestRecord, RingLayout, LAYOUT_VERSION, RING_MAGIC};
pub use region::SharedRegion;
pub use ring_buffer::{RingBuffer, RingStats};
pub use sync::{Deadline, SharedCondvar, SharedMutex, SharedMutexGuard, WaitStatus};

pub(crate) use layout::{STATUS_OK, STATUS_REJECTED};
