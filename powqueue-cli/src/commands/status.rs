// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `powq status` command - Show ring counters.

use powqueue_core::{Config, RingBuffer};

pub async fn execute(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let ring = RingBuffer::attach(&config.queue.name)?;
    let stats = ring.stats()?;

    println!("Queue '{}'", config.queue.name);
    println!("  Capacity:        {}", stats.capacity);
    println!("  Requests:        {} written, {} read", stats.request_writes, stats.request_reads);
    println!("  Responses:       {} written, {} retired", stats.response_writes, stats.response_reads);
    println!("  Pending:         {}", stats.pending());
    println!("  Occupied slots:  {}", stats.occupied_slots);
    println!("  Shutting down:   {}", if stats.shutdown { "yes" } else { "no" });
    if stats.server_pid != 0 {
        println!("  Server pid:      {}", stats.server_pid);
    }
    Ok(())
}
