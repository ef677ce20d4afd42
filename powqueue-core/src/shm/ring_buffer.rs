// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Request/response ring held in a shared memory region.
//!
//! Two halves, each with its own process-shared mutex:
//! - request half: `request_writes`, `request_reads`, request slots, the
//!   "non-empty" and "space available" conditions, the shutdown flag;
//! - response half: `response_writes`, `response_reads`, response slots. The
//!   per-slot completion conditions are waited on under `response_lock`.
//!
//! No operation holds both locks at once. Logical position `n` lives in
//! physical slot `n % capacity`.
//!
//! Every critical section refreshes the region before reading and publishes
//! it after writing. The producer and consumer sides are implemented in
//! [`crate::producer`] and [`crate::consumer`].

use std::fmt;
use std::sync::atomic::Ordering;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};

use super::layout::{
    RequestSlot, ResponseSlot, RingHeader, RingLayout, LAYOUT_VERSION, RING_MAGIC,
};
use super::region::SharedRegion;
use crate::error::{RingError, SharedMemoryError};
use crate::types::{Capacity, QueueName};

fn not_reclaimable(name: impl fmt::Display, reason: String) -> SharedMemoryError {
    SharedMemoryError::Allocation {
        name: name.to_string(),
        reason: format!("region exists and is not reclaimable: {}", reason),
    }
}

/// A pid we may not signal still exists.
fn process_alive(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Point-in-time view of the ring counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub request_writes: u64,
    pub request_reads: u64,
    pub response_writes: u64,
    pub response_reads: u64,
    /// Slots whose response has not been retired yet.
    pub occupied_slots: usize,
    pub shutdown: bool,
    /// Pid recorded by the last server start-up, 0 if none.
    pub server_pid: i32,
}

impl RingStats {
    /// Requests waiting for the consumer.
    pub fn pending(&self) -> u64 {
        self.request_writes - self.request_reads
    }
}

/// Shared request/response ring.
pub struct RingBuffer {
    region: SharedRegion,
    layout: RingLayout,
}

impl RingBuffer {
    /// Create the named region and initialise the ring in it.
    ///
    /// On any initialisation failure the region is unlinked again.
    pub fn create(name: &QueueName, capacity: Capacity) -> Result<Self, RingError> {
        let layout = RingLayout::new(capacity);
        let region = SharedRegion::create(name.as_str(), layout.total_size())?;
        let ring = Self { region, layout };

        // SAFETY: the region was just created and zero-filled; no other
        // process can attach before the magic is published.
        unsafe { ring.init()? };

        tracing::info!(name = %name, capacity = capacity.get(), "Initialised request ring");
        Ok(ring)
    }

    /// Attach to a ring created by another process. Never reinitialises.
    ///
    /// # Errors
    /// `NotFound` if absent, `Incompatible` if the region is not a fully
    /// initialised ring of this layout version.
    pub fn attach(name: &QueueName) -> Result<Self, RingError> {
        let region = SharedRegion::attach(name.as_str())?;
        let incompatible = |reason: String| SharedMemoryError::Incompatible {
            name: name.to_string(),
            reason,
        };

        if region.size() < RingLayout::header_size() {
            return Err(incompatible(format!("region too small: {} bytes", region.size())).into());
        }
        region.invalidate()?;

        // SAFETY: the region is at least one header long.
        let header = unsafe { &*(region.as_ptr() as *const RingHeader) };
        if header.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(incompatible("ring is not initialised".to_string()).into());
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(incompatible(format!(
                "layout version {} (expected {})",
                version, LAYOUT_VERSION
            ))
            .into());
        }
        let layout = RingLayout::from_raw(header.capacity.load(Ordering::Relaxed))
            .map_err(|e| incompatible(e.to_string()))?;
        if region.size() < layout.total_size() {
            return Err(incompatible(format!(
                "region is {} bytes, capacity {} needs {}",
                region.size(),
                layout.capacity(),
                layout.total_size()
            ))
            .into());
        }

        tracing::debug!(name = %name, capacity = layout.capacity(), "Attached to request ring");
        Ok(Self { region, layout })
    }

    /// Server start-up: create the ring, or adopt an existing compatible one
    /// left behind by a previous server. Returns `(ring, created)`.
    ///
    /// Either way the calling process is recorded as the ring's server.
    ///
    /// # Errors
    /// `Allocation` if a region with this name exists but is not a ring of
    /// the requested capacity, or its server is still running.
    pub fn create_or_attach(
        name: &QueueName,
        capacity: Capacity,
    ) -> Result<(Self, bool), RingError> {
        match Self::create(name, capacity) {
            Ok(ring) => {
                ring.claim()?;
                Ok((ring, true))
            }
            Err(RingError::SharedMemory(SharedMemoryError::AlreadyExists { .. })) => {
                let mut ring =
                    Self::attach(name).map_err(|e| not_reclaimable(name, e.to_string()))?;
                if ring.capacity() != capacity.get() {
                    return Err(not_reclaimable(
                        name,
                        format!("capacity is {}, configured {}", ring.capacity(), capacity),
                    )
                    .into());
                }

                // Refused before adopting, so a live server's segment is
                // never unlinked by this handle.
                ring.reclaim()?;
                ring.region.adopt();
                let stats = ring.stats()?;
                tracing::info!(
                    name = %name,
                    pending = stats.pending(),
                    occupied = stats.occupied_slots,
                    "Adopted existing request ring"
                );
                Ok((ring, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Zero the counters and initialise every primitive process-shared, then
    /// publish the magic.
    ///
    /// # Safety
    /// Exactly once, by the creator, before any other process attaches.
    unsafe fn init(&self) -> Result<(), RingError> {
        let header = self.header();
        header.request_writes.store(0, Ordering::Relaxed);
        header.request_reads.store(0, Ordering::Relaxed);
        header.response_writes.store(0, Ordering::Relaxed);
        header.response_reads.store(0, Ordering::Relaxed);
        header.shutdown.store(0, Ordering::Relaxed);
        header.server_pid.store(0, Ordering::Relaxed);

        header.request_lock.init()?;
        header.response_lock.init()?;
        header.nonempty.init()?;
        header.space_available.init()?;
        for index in 0..self.layout.capacity() as u64 {
            self.request_slot(index).completion.init()?;
        }

        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header
            .capacity
            .store(self.layout.capacity() as u32, Ordering::Relaxed);
        self.publish()?;
        header.magic.store(RING_MAGIC, Ordering::Release);
        self.publish()
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    /// Physical slot of a logical position.
    pub fn slot_index(&self, sequence: u64) -> usize {
        (sequence % self.layout.capacity() as u64) as usize
    }

    pub(crate) fn header(&self) -> &RingHeader {
        // SAFETY: the region holds a header at offset 0 (checked at
        // create/attach); all fields are atomics or pthread objects.
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    pub(crate) fn request_slot(&self, sequence: u64) -> &RequestSlot {
        let index = self.slot_index(sequence);
        // SAFETY: index < capacity and the region covers the request array.
        unsafe {
            let base = self.region.as_ptr().add(self.layout.requests_offset()) as *const RequestSlot;
            &*base.add(index)
        }
    }

    pub(crate) fn response_slot(&self, sequence: u64) -> &ResponseSlot {
        let index = self.slot_index(sequence);
        // SAFETY: index < capacity and the region covers the response array.
        unsafe {
            let base =
                self.region.as_ptr().add(self.layout.responses_offset()) as *const ResponseSlot;
            &*base.add(index)
        }
    }

    /// Visibility barrier after a mutation.
    pub(crate) fn publish(&self) -> Result<(), RingError> {
        self.region.flush().map_err(RingError::from)
    }

    /// Visibility barrier before a read.
    pub(crate) fn refresh(&self) -> Result<(), RingError> {
        self.region.invalidate().map_err(RingError::from)
    }

    /// Set once by `request_shutdown`; written under `request_lock`.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.header().shutdown.load(Ordering::Relaxed) != 0
    }

    /// Snapshot of both halves. Takes each lock in turn, never both.
    pub fn stats(&self) -> Result<RingStats, RingError> {
        let header = self.header();

        let (request_writes, request_reads, occupied_slots, shutdown, server_pid) = {
            let _guard = header.request_lock.lock()?;
            self.refresh()?;
            let occupied = (0..self.capacity() as u64)
                .filter(|&index| self.request_slot(index).is_occupied())
                .count();
            (
                header.request_writes.load(Ordering::Relaxed),
                header.request_reads.load(Ordering::Relaxed),
                occupied,
                self.is_shutdown(),
                header.server_pid.load(Ordering::Relaxed),
            )
        };

        let (response_writes, response_reads) = {
            let _guard = header.response_lock.lock()?;
            self.refresh()?;
            (
                header.response_writes.load(Ordering::Relaxed),
                header.response_reads.load(Ordering::Relaxed),
            )
        };

        Ok(RingStats {
            capacity: self.capacity(),
            request_writes,
            request_reads,
            response_writes,
            response_reads,
            occupied_slots,
            shutdown,
            server_pid,
        })
    }

    /// Raise the shutdown flag and wake everybody: the consumer, blocked
    /// submitters, and every waiter on a completion condition.
    pub fn request_shutdown(&self) -> Result<(), RingError> {
        let header = self.header();
        {
            let _guard = header.request_lock.lock()?;
            header.shutdown.store(1, Ordering::Relaxed);
            self.publish()?;
            header.nonempty.broadcast()?;
            header.space_available.broadcast()?;
        }
        {
            let _guard = header.response_lock.lock()?;
            for index in 0..self.capacity() as u64 {
                self.request_slot(index).completion.broadcast()?;
            }
        }
        tracing::info!(name = %self.name(), "Shutdown requested");
        Ok(())
    }

    /// Record the calling process as the server of a freshly created ring.
    fn claim(&self) -> Result<(), RingError> {
        let _guard = self.header().request_lock.lock()?;
        self.refresh()?;
        self.claim_locked()?;
        self.publish()
    }

    /// Caller holds `request_lock`. Refuses while the recorded server lives.
    fn claim_locked(&self) -> Result<(), RingError> {
        let header = self.header();
        let previous = header.server_pid.load(Ordering::Relaxed);
        if previous != 0 && process_alive(previous) {
            return Err(not_reclaimable(
                self.name(),
                format!("server pid {} is still running", previous),
            )
            .into());
        }
        header
            .server_pid
            .store(getpid().as_raw(), Ordering::Relaxed);
        Ok(())
    }

    /// Take over a ring whose previous server is gone: requeue the requests
    /// it took but never answered, clear the shutdown flag and re-initialise
    /// "non-empty".
    ///
    /// Responses are written in request order, so everything in
    /// `response_writes..request_reads` was in flight; those slots are still
    /// occupied and intact and are simply served again.
    ///
    /// The server is the only waiter on "non-empty". A waiter killed inside a
    /// glibc condvar leaves group references behind that can stall later
    /// signallers, so the dead server's registration is wiped. Signallers hold
    /// `request_lock`, which is held here.
    fn reclaim(&self) -> Result<(), RingError> {
        let header = self.header();
        let answered = {
            let _guard = header.response_lock.lock()?;
            self.refresh()?;
            header.response_writes.load(Ordering::Relaxed)
        };

        let _guard = header.request_lock.lock()?;
        self.refresh()?;
        self.claim_locked()?;

        let taken = header.request_reads.load(Ordering::Relaxed);
        if taken > answered {
            tracing::warn!(
                from = answered,
                to = taken,
                "Requeueing requests taken by the previous server"
            );
            header.request_reads.store(answered, Ordering::Relaxed);
        }

        // SAFETY: the previous server is dead, so nobody waits on `nonempty`,
        // and nobody signals it without `request_lock`.
        unsafe { header.nonempty.init()? };
        header.shutdown.store(0, Ordering::Relaxed);
        self.publish()
    }

    /// Tear down: destroy the mutexes, unmap and unlink.
    ///
    /// Only the owning server calls this, after its consumer loop returned.
    /// Clients still attached are left with an orphaned mapping.
    ///
    /// Condition variables are not destroyed: glibc's `pthread_cond_destroy`
    /// blocks until every registered waiter has left, and a process killed
    /// inside a wait never leaves. Unlinking releases them with the segment.
    pub fn destroy(self) -> Result<(), RingError> {
        let header = self.header();
        // SAFETY: the owner guarantees nobody uses the locks any more.
        let destroyed = unsafe {
            header
                .request_lock
                .destroy()
                .and_then(|()| header.response_lock.destroy())
        };
        if let Err(e) = &destroyed {
            tracing::warn!(name = %self.name(), error = %e, "Failed to destroy ring locks");
        }

        let name = self.name().to_string();
        self.region.destroy();
        tracing::info!(name = %name, "Destroyed request ring");
        destroyed.map_err(RingError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> QueueName {
        QueueName::new(format!("powq-ring-{}-{}", tag, std::process::id())).unwrap()
    }

    #[test]
    fn test_create_initialises_counters() {
        let name = unique_name("init");
        let ring = RingBuffer::create(&name, Capacity::new(4).unwrap()).unwrap();
        let stats = ring.stats().unwrap();
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.request_writes, 0);
        assert_eq!(stats.response_writes, 0);
        assert_eq!(stats.occupied_slots, 0);
        assert!(!stats.shutdown);
    }

    #[test]
    fn test_attach_sees_capacity() {
        let name = unique_name("attach");
        let _owner = RingBuffer::create(&name, Capacity::new(8).unwrap()).unwrap();
        let client = RingBuffer::attach(&name).unwrap();
        assert_eq!(client.capacity(), 8);
        assert_eq!(client.slot_index(8), 0);
        assert_eq!(client.slot_index(13), 5);
    }

    #[test]
    fn test_attach_missing_is_not_found() {
        let name = unique_name("missing");
        assert!(matches!(
            RingBuffer::attach(&name),
            Err(RingError::SharedMemory(SharedMemoryError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_attach_rejects_uninitialised_region() {
        let name = unique_name("raw");
        let _raw = SharedRegion::create(name.as_str(), 4096).unwrap();
        assert!(matches!(
            RingBuffer::attach(&name),
            Err(RingError::SharedMemory(SharedMemoryError::Incompatible { .. }))
        ));
    }

    #[test]
    fn test_create_or_attach_adopts_existing() {
        let name = unique_name("adopt");
        let capacity = Capacity::new(4).unwrap();
        let first = RingBuffer::create(&name, capacity).unwrap();
        first.request_shutdown().unwrap();

        let (second, created) = RingBuffer::create_or_attach(&name, capacity).unwrap();
        assert!(!created);
        assert!(!second.stats().unwrap().shutdown);
        drop(first);
    }

    #[test]
    fn test_create_or_attach_refuses_live_server() {
        let name = unique_name("live");
        let capacity = Capacity::new(4).unwrap();
        let (first, created) = RingBuffer::create_or_attach(&name, capacity).unwrap();
        assert!(created);
        assert_eq!(first.stats().unwrap().server_pid, std::process::id() as i32);

        assert!(matches!(
            RingBuffer::create_or_attach(&name, capacity),
            Err(RingError::SharedMemory(SharedMemoryError::Allocation { .. }))
        ));
        // The refused handle left the live segment in place.
        assert!(RingBuffer::attach(&name).is_ok());
    }

    #[test]
    fn test_create_or_attach_replaces_exited_server() {
        let name = unique_name("exited");
        let capacity = Capacity::new(4).unwrap();
        let first = RingBuffer::create(&name, capacity).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let exited_pid = child.id() as i32;
        child.wait().unwrap();
        {
            let _guard = first.header().request_lock.lock().unwrap();
            first.header().server_pid.store(exited_pid, Ordering::Relaxed);
            first.publish().unwrap();
        }

        let (second, created) = RingBuffer::create_or_attach(&name, capacity).unwrap();
        assert!(!created);
        assert_eq!(second.stats().unwrap().server_pid, std::process::id() as i32);
    }

    #[test]
    fn test_create_or_attach_rejects_capacity_mismatch() {
        let name = unique_name("mismatch");
        let _first = RingBuffer::create(&name, Capacity::new(4).unwrap()).unwrap();
        assert!(matches!(
            RingBuffer::create_or_attach(&name, Capacity::new(8).unwrap()),
            Err(RingError::SharedMemory(SharedMemoryError::Allocation { .. }))
        ));
    }

    #[test]
    fn test_destroy_unlinks_region() {
        let name = unique_name("destroy");
        let ring = RingBuffer::create(&name, Capacity::new(2).unwrap()).unwrap();
        ring.destroy().unwrap();
        assert!(RingBuffer::attach(&name).is_err());
    }
}
