// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Server side of the ring: wait for work, drain it, publish responses.
//!
//! State machine: `WAITING -> DRAINING -> WAITING ...` until shutdown.
//! `request_lock` is dropped before each computation and re-taken for the
//! next predicate check; `response_lock` is only taken while no request lock
//! is held.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::compute::{mod_pow, OFFLOAD_BASE};
use crate::error::RingError;
use crate::shm::{RequestRecord, RingBuffer, SharedMutexGuard, STATUS_OK, STATUS_REJECTED};

/// Consumer loop over a shared ring. One per ring.
pub struct QueueServer {
    ring: Arc<RingBuffer>,
}

impl QueueServer {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self { ring }
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Serve until `request_shutdown` is called on the ring (by any process).
    /// Returns the number of requests served.
    ///
    /// A malformed request is answered `Rejected` and never stops the loop;
    /// only failures of the shared primitives themselves end it early.
    pub fn serve_forever(&self) -> Result<u64, RingError> {
        let header = self.ring.header();
        let mut served = 0u64;

        tracing::info!(name = %self.ring.name(), capacity = self.ring.capacity(), "Serving requests");

        loop {
            // WAITING
            let mut guard = header.request_lock.lock()?;
            self.ring.refresh()?;
            while !self.has_pending() && !self.ring.is_shutdown() {
                header.nonempty.wait(&mut guard)?;
                self.ring.refresh()?;
            }
            if self.ring.is_shutdown() {
                tracing::info!(served, "Consumer loop stopped");
                return Ok(served);
            }

            // DRAINING
            let batch = self.drain_locked(guard, usize::MAX)?;
            served += batch as u64;
            tracing::debug!(batch, served, "Drained pending requests");
        }
    }

    /// Serve everything currently queued without blocking for new work.
    pub fn drain_pending(&self) -> Result<usize, RingError> {
        let guard = self.ring.header().request_lock.lock()?;
        self.drain_locked(guard, usize::MAX)
    }

    /// Serve at most one queued request. Returns its sequence, if any.
    pub fn serve_one(&self) -> Result<Option<u64>, RingError> {
        let guard = self.ring.header().request_lock.lock()?;
        self.ring.refresh()?;
        let before = self.ring.header().request_reads.load(Ordering::Relaxed);
        Ok((self.drain_locked(guard, 1)? == 1).then_some(before))
    }

    /// Caller holds `request_lock`.
    fn has_pending(&self) -> bool {
        let header = self.ring.header();
        header.request_writes.load(Ordering::Relaxed) > header.request_reads.load(Ordering::Relaxed)
    }

    /// Drain up to `limit` requests. Enters and leaves holding nothing: the
    /// guard is consumed, and dropped on every return path.
    fn drain_locked<'a>(
        &'a self,
        mut guard: SharedMutexGuard<'a>,
        limit: usize,
    ) -> Result<usize, RingError> {
        let ring = &*self.ring;
        let header = ring.header();
        let mut served = 0;

        while served < limit {
            ring.refresh()?;
            if !self.has_pending() || ring.is_shutdown() {
                break;
            }

            let sequence = header.request_reads.load(Ordering::Relaxed);
            let record = ring.request_slot(sequence).load();
            header.request_reads.store(sequence + 1, Ordering::Relaxed);
            ring.publish()?;
            drop(guard);

            let outcome = Self::evaluate(sequence, &record);
            let abandoned = self.publish_response(sequence, outcome)?;

            guard = header.request_lock.lock()?;
            if abandoned {
                ring.request_slot(sequence).occupied.store(0, Ordering::Relaxed);
                ring.publish()?;
                header.space_available.broadcast()?;
            }
            served += 1;
        }

        Ok(served)
    }

    /// Validate the copied slot and run the kernel.
    fn evaluate(sequence: u64, record: &RequestRecord) -> Result<u64, RingError> {
        if record.sequence != sequence {
            return Err(RingError::Corrupted {
                sequence,
                reason: format!("slot holds sequence {}", record.sequence),
            });
        }
        if !record.is_intact() {
            return Err(RingError::Corrupted {
                sequence,
                reason: "checksum mismatch".to_string(),
            });
        }
        mod_pow(OFFLOAD_BASE, record.exponent, record.modulus)
    }

    /// Write the response for `sequence` and wake its waiter. Returns whether
    /// the waiter had already given up, in which case the response is
    /// retired here and the caller frees the request slot.
    fn publish_response(
        &self,
        sequence: u64,
        outcome: Result<u64, RingError>,
    ) -> Result<bool, RingError> {
        let ring = &*self.ring;
        let header = ring.header();
        let response = ring.response_slot(sequence);

        let _guard = header.response_lock.lock()?;
        ring.refresh()?;

        match outcome {
            Ok(value) => {
                response.result.store(value, Ordering::Relaxed);
                response.status.store(STATUS_OK, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(sequence, error = %e, "Rejecting malformed request");
                response.result.store(0, Ordering::Relaxed);
                response.status.store(STATUS_REJECTED, Ordering::Relaxed);
            }
        }
        response.sequence.store(sequence, Ordering::Relaxed);

        // Requests are answered in order; an adopting server requeues any
        // the previous one took without answering.
        header.response_writes.store(sequence + 1, Ordering::Relaxed);

        let abandoned = response.abandoned.load(Ordering::Relaxed) == sequence + 1;
        if abandoned {
            response.abandoned.store(0, Ordering::Relaxed);
            header.response_reads.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(sequence, "Retired response of an abandoned request");
        }

        ring.publish()?;
        ring.request_slot(sequence).completion.signal()?;

        Ok(abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{ClientOptions, QueueClient};
    use crate::types::{Capacity, OverflowPolicy, QueueName};
    use std::thread;
    use std::time::Duration;

    fn pair(tag: &str, slots: usize, options: ClientOptions) -> (QueueClient, QueueServer) {
        let name = QueueName::new(format!("powq-consumer-{}-{}", tag, std::process::id())).unwrap();
        let ring = Arc::new(RingBuffer::create(&name, Capacity::new(slots).unwrap()).unwrap());
        (
            QueueClient::new(Arc::clone(&ring), options),
            QueueServer::new(ring),
        )
    }

    #[test]
    fn test_example_scenario() {
        let (client, server) = pair("example", 4, ClientOptions::default());
        let a = client.submit_request(10, 1000).unwrap();
        let b = client.submit_request(0, 7).unwrap();
        let c = client.submit_request(5, 1).unwrap();

        assert_eq!(server.drain_pending().unwrap(), 3);
        assert_eq!(client.await_result(a).unwrap(), 24);
        assert_eq!(client.await_result(b).unwrap(), 1);
        assert_eq!(client.await_result(c).unwrap(), 0);

        let stats = client.ring().stats().unwrap();
        assert_eq!(stats.response_reads, 3);
        assert_eq!(stats.occupied_slots, 0);
    }

    #[test]
    fn test_fifo_service_order() {
        let (client, server) = pair("fifo", 4, ClientOptions::default());
        let requests = [(3, 11), (7, 13), (9, 17)];
        let pending: Vec<_> = requests
            .iter()
            .map(|&(x, p)| client.submit_request(x, p).unwrap())
            .collect();

        for (expected, p) in pending.into_iter().enumerate() {
            assert_eq!(server.serve_one().unwrap(), Some(expected as u64));
            let stats = client.ring().stats().unwrap();
            assert_eq!(stats.request_reads, expected as u64 + 1);
            assert_eq!(stats.response_writes, expected as u64 + 1);
            let (x, m) = requests[expected];
            assert_eq!(
                client.await_result(p).unwrap(),
                mod_pow(2, x, m).unwrap()
            );
        }
        assert_eq!(server.serve_one().unwrap(), None);
    }

    #[test]
    fn test_wraparound_keeps_correlation() {
        let (client, server) = pair("wrap", 2, ClientOptions::default());
        for round in 0..10u64 {
            let p = client.submit_request(round * 31, 1_000_003).unwrap();
            assert_eq!(p.slot(), (round % 2) as usize);
            server.drain_pending().unwrap();
            assert_eq!(
                client.await_result(p).unwrap(),
                mod_pow(2, round * 31, 1_000_003).unwrap()
            );
        }
    }

    #[test]
    fn test_corrupted_slot_is_rejected_and_loop_continues() {
        let (client, server) = pair("corrupt", 4, ClientOptions::default());
        let bad = client.submit_request(4, 9).unwrap();
        let good = client.submit_request(4, 9).unwrap();

        // Simulate a torn write from a foreign process.
        {
            let ring = client.ring();
            let _guard = ring.header().request_lock.lock().unwrap();
            ring.request_slot(bad.sequence())
                .modulus
                .store(0, Ordering::Relaxed);
        }

        assert_eq!(server.drain_pending().unwrap(), 2);
        assert!(matches!(
            client.await_result(bad),
            Err(RingError::InvalidArgument { .. })
        ));
        assert_eq!(client.await_result(good).unwrap(), 7);
    }

    #[test]
    fn test_abandoned_request_is_retired() {
        let (client, server) = pair("abandon", 1, ClientOptions::default());
        let p = client.submit_request(12, 1000).unwrap();
        assert!(matches!(
            client.await_result_timeout(p, Duration::from_millis(20)),
            Err(RingError::Timeout { sequence: 0 })
        ));
        assert!(matches!(
            client.submit_request(1, 3),
            Err(RingError::CapacityExceeded { .. })
        ));

        assert_eq!(server.drain_pending().unwrap(), 1);
        let stats = client.ring().stats().unwrap();
        assert_eq!(stats.response_writes, 1);
        assert_eq!(stats.response_reads, 1);
        assert_eq!(stats.occupied_slots, 0);

        let next = client.submit_request(3, 1000).unwrap();
        server.drain_pending().unwrap();
        assert_eq!(client.await_result(next).unwrap(), 8);
    }

    #[test]
    fn test_serve_forever_with_threads() {
        let (client, server) = pair("threads", 4, ClientOptions::default());
        let client = Arc::new(client);
        let worker = thread::spawn(move || server.serve_forever());

        let producers: Vec<_> = (0..4u64)
            .map(|t| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for i in 0..25u64 {
                        let exponent = t * 1_000 + i * 37;
                        let modulus = 1_000_000_007 - t;
                        let p = loop {
                            match client.submit_request(exponent, modulus) {
                                Ok(p) => break p,
                                Err(RingError::CapacityExceeded { .. }) => thread::yield_now(),
                                Err(e) => panic!("submit failed: {}", e),
                            }
                        };
                        let got = client.await_result_timeout(p, Duration::from_secs(10)).unwrap();
                        assert_eq!(got, mod_pow(2, exponent, modulus).unwrap());
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        client.ring().request_shutdown().unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), 100);
    }

    #[test]
    fn test_block_policy_waits_for_free_slot() {
        let options = ClientOptions {
            overflow: OverflowPolicy::Block,
            timeout: Duration::from_secs(10),
        };
        let (client, server) = pair("block", 1, options);
        let client = Arc::new(client);
        let first = client.submit_request(2, 100).unwrap();

        let helper = {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                server.drain_pending().unwrap();
                let value = client.await_result(first).unwrap();
                (value, server)
            })
        };

        let second = client.submit_request(3, 100).unwrap();
        let (first_value, server) = helper.join().unwrap();
        assert_eq!(first_value, 4);
        server.drain_pending().unwrap();
        assert_eq!(client.await_result(second).unwrap(), 8);
    }

    fn adopt(client: &QueueClient, slots: usize) -> QueueServer {
        let name = QueueName::new(client.ring().name()).unwrap();
        let (ring, created) =
            RingBuffer::create_or_attach(&name, Capacity::new(slots).unwrap()).unwrap();
        assert!(!created);
        QueueServer::new(Arc::new(ring))
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let (client, server) = pair("shutdown", 2, ClientOptions::default());
        let client = Arc::new(client);
        let p = client.submit_request(1, 5).unwrap();

        let waiter = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.await_result(p))
        };
        thread::sleep(Duration::from_millis(20));
        server.ring().request_shutdown().unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(RingError::Closed)));
        assert_eq!(server.serve_forever().unwrap(), 0);

        // The closed waiter gave its slot up; the next server retires it.
        let next = adopt(&client, 2);
        assert_eq!(next.drain_pending().unwrap(), 1);
        let stats = client.ring().stats().unwrap();
        assert_eq!(stats.response_reads, 1);
        assert_eq!(stats.occupied_slots, 0);
    }

    #[test]
    fn test_adopting_server_requeues_unanswered_request() {
        let (client, _dead) = pair("requeue", 4, ClientOptions::default());
        let p = client.submit_request(10, 1000).unwrap();

        // A server took the request and died before answering it.
        {
            let ring = client.ring();
            let _guard = ring.header().request_lock.lock().unwrap();
            ring.header().request_reads.store(1, Ordering::Relaxed);
            ring.publish().unwrap();
        }

        let next = adopt(&client, 4);
        assert_eq!(next.ring().stats().unwrap().pending(), 1);
        assert_eq!(next.drain_pending().unwrap(), 1);
        assert_eq!(client.await_result(p).unwrap(), 24);

        let stats = client.ring().stats().unwrap();
        assert_eq!(stats.response_writes, 1);
        assert_eq!(stats.response_reads, 1);
        assert_eq!(stats.occupied_slots, 0);
    }

    #[test]
    fn test_foreign_response_is_reported_lost() {
        let (client, server) = pair("foreign", 2, ClientOptions::default());
        let p = client.submit_request(3, 1000).unwrap();
        server.drain_pending().unwrap();

        {
            let ring = client.ring();
            let _guard = ring.header().response_lock.lock().unwrap();
            ring.response_slot(p.sequence())
                .sequence
                .store(p.sequence() + 2, Ordering::Relaxed);
        }

        assert!(matches!(
            client.await_result(p),
            Err(RingError::ResponseLost { sequence: 0 })
        ));
        assert_eq!(client.ring().stats().unwrap().occupied_slots, 0);
    }
}
