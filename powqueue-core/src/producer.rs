// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Client side of the ring: submit a request, then wait for its response.
//!
//! A submission claims the slot `request_writes % capacity` and keeps it
//! until the response is retired, so a response slot is never overwritten
//! before its waiter has read it. Waiters decide readiness by comparing their
//! logical sequence with `response_writes`, never by having been woken: the
//! completion condition of a slot is shared by every request that ever
//! occupies it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::RingError;
use crate::shm::{Deadline, RequestRecord, RingBuffer, WaitStatus, STATUS_REJECTED};
use crate::types::OverflowPolicy;

/// Handle for a submitted request.
///
/// Carries the logical sequence number, which stays unique across slot
/// wraparound, so the response can be correlated even after the physical
/// slot has been recycled.
///
/// Awaiting consumes the handle: a response is collected at most once.
///
/// ```compile_fail
/// # use powqueue_core::{PendingRequest, QueueClient};
/// fn await_twice(client: &QueueClient, pending: PendingRequest) {
///     let _ = client.await_result(pending);
///     let _ = client.await_result(pending);
/// }
/// ```
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a submitted request holds its slot until the result is awaited"]
pub struct PendingRequest {
    sequence: u64,
    slot: usize,
    exponent: u64,
    modulus: u64,
}

impl PendingRequest {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn exponent(&self) -> u64 {
        self.exponent
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }
}

/// Producer behaviour knobs.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub overflow: OverflowPolicy,
    /// Upper bound for a blocked submission under `OverflowPolicy::Block`.
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::Reject,
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            overflow: config.queue.overflow,
            timeout: config.client.timeout,
        }
    }
}

/// Producer API over a shared ring.
pub struct QueueClient {
    ring: Arc<RingBuffer>,
    options: ClientOptions,
}

impl QueueClient {
    pub fn new(ring: Arc<RingBuffer>, options: ClientOptions) -> Self {
        Self { ring, options }
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Enqueue `2^exponent mod modulus`.
    ///
    /// # Errors
    /// - `InvalidArgument` if `modulus` is zero (nothing is enqueued);
    /// - `CapacityExceeded` if every slot is in flight (after waiting up to
    ///   the configured timeout under `OverflowPolicy::Block`);
    /// - `Closed` if the server is shutting down.
    pub fn submit_request(&self, exponent: u64, modulus: u64) -> Result<PendingRequest, RingError> {
        if modulus == 0 {
            return Err(RingError::InvalidArgument {
                reason: "modulus must be greater than 0".to_string(),
            });
        }

        let ring = &*self.ring;
        let header = ring.header();
        let block_deadline = match self.options.overflow {
            OverflowPolicy::Block => Some(Deadline::after(self.options.timeout)?),
            OverflowPolicy::Reject => None,
        };

        let mut guard = header.request_lock.lock()?;
        ring.refresh()?;

        loop {
            if ring.is_shutdown() {
                return Err(RingError::Closed);
            }
            if !self.is_full() {
                break;
            }
            let Some(deadline) = &block_deadline else {
                return Err(RingError::CapacityExceeded {
                    capacity: ring.capacity(),
                });
            };
            if header.space_available.wait_until(&mut guard, deadline)? == WaitStatus::TimedOut {
                ring.refresh()?;
                if !ring.is_shutdown() && !self.is_full() {
                    break;
                }
                return Err(RingError::CapacityExceeded {
                    capacity: ring.capacity(),
                });
            }
            ring.refresh()?;
        }

        let sequence = header.request_writes.load(Ordering::Relaxed);
        ring.request_slot(sequence)
            .store(&RequestRecord::new(sequence, exponent, modulus));
        header.request_writes.store(sequence + 1, Ordering::Relaxed);
        ring.publish()?;
        header.nonempty.signal()?;
        drop(guard);

        tracing::debug!(sequence, exponent, modulus, "Submitted request");

        Ok(PendingRequest {
            sequence,
            slot: ring.slot_index(sequence),
            exponent,
            modulus,
        })
    }

    /// Caller holds `request_lock`.
    fn is_full(&self) -> bool {
        let ring = &*self.ring;
        let header = ring.header();
        let writes = header.request_writes.load(Ordering::Relaxed);
        let reads = header.request_reads.load(Ordering::Relaxed);
        writes - reads >= ring.capacity() as u64 || ring.request_slot(writes).is_occupied()
    }

    /// Block until the response for `pending` is published.
    pub fn await_result(&self, pending: PendingRequest) -> Result<u64, RingError> {
        self.wait_for(pending, None)
    }

    /// As [`await_result`](Self::await_result), giving up after `timeout`.
    ///
    /// On `Timeout` the request stays queued; the server retires its slot
    /// when it eventually answers.
    pub fn await_result_timeout(
        &self,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<u64, RingError> {
        self.wait_for(pending, Some(Deadline::after(timeout)?))
    }

    /// Submit and wait, with the configured timeout.
    pub fn compute(&self, exponent: u64, modulus: u64) -> Result<u64, RingError> {
        let pending = self.submit_request(exponent, modulus)?;
        self.await_result_timeout(pending, self.options.timeout)
    }

    fn wait_for(
        &self,
        pending: PendingRequest,
        deadline: Option<Deadline>,
    ) -> Result<u64, RingError> {
        let ring = &*self.ring;
        let header = ring.header();
        let sequence = pending.sequence;
        let completion = &ring.request_slot(sequence).completion;
        let response = ring.response_slot(sequence);

        let (status, result, answered_sequence) = {
            let mut guard = header.response_lock.lock()?;
            ring.refresh()?;

            while header.response_writes.load(Ordering::Relaxed) <= sequence {
                if ring.is_shutdown() {
                    self.abandon(sequence)?;
                    return Err(RingError::Closed);
                }
                match &deadline {
                    None => completion.wait(&mut guard)?,
                    Some(deadline) => {
                        if completion.wait_until(&mut guard, deadline)? == WaitStatus::TimedOut {
                            ring.refresh()?;
                            if header.response_writes.load(Ordering::Relaxed) > sequence {
                                break;
                            }
                            self.abandon(sequence)?;
                            return Err(RingError::Timeout { sequence });
                        }
                    }
                }
                ring.refresh()?;
            }

            let answered = (
                response.status.load(Ordering::Relaxed),
                response.result.load(Ordering::Relaxed),
                response.sequence.load(Ordering::Relaxed),
            );
            header.response_reads.fetch_add(1, Ordering::Relaxed);
            ring.publish()?;
            answered
        };

        self.release_slot(sequence)?;

        if answered_sequence != sequence {
            return Err(RingError::ResponseLost { sequence });
        }
        if status == STATUS_REJECTED {
            return Err(RingError::InvalidArgument {
                reason: format!("server rejected request #{}", sequence),
            });
        }
        Ok(result)
    }

    /// Caller holds `response_lock`. The server retires the response when it
    /// writes it, which frees the slot.
    fn abandon(&self, sequence: u64) -> Result<(), RingError> {
        self.ring
            .response_slot(sequence)
            .abandoned
            .store(sequence + 1, Ordering::Relaxed);
        self.ring.publish()?;
        tracing::warn!(sequence, "Gave up waiting for response");
        Ok(())
    }

    /// Free the request slot once its response has been retired.
    fn release_slot(&self, sequence: u64) -> Result<(), RingError> {
        let ring = &*self.ring;
        let header = ring.header();
        let _guard = header.request_lock.lock()?;
        ring.request_slot(sequence).occupied.store(0, Ordering::Relaxed);
        ring.publish()?;
        header.space_available.broadcast()?;
        Ok(())
    }
}
