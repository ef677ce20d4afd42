// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `powq submit` command - Offload one computation.

use std::sync::Arc;
use std::time::Duration;

use powqueue_core::{ClientOptions, Config, OverflowPolicy, QueueClient, RingBuffer};

pub async fn execute(
    config: Config,
    exponent: u64,
    modulus: u64,
    timeout_ms: Option<u64>,
    block: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = ClientOptions::from(&config);
    if let Some(ms) = timeout_ms.filter(|&ms| ms > 0) {
        options.timeout = Duration::from_millis(ms);
    }
    if block {
        options.overflow = OverflowPolicy::Block;
    }

    let ring = Arc::new(RingBuffer::attach(&config.queue.name)?);
    let client = QueueClient::new(ring, options);

    tracing::debug!(exponent, modulus, overflow = %options.overflow, "Submitting request");
    let result = tokio::task::spawn_blocking(move || client.compute(exponent, modulus)).await??;

    println!("2^{} mod {} = {}", exponent, modulus, result);
    Ok(())
}
