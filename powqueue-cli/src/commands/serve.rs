// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `powq serve` command - Run the offload server.
//!
//! Creates the ring (or adopts one left by a server that died), drains it on a
//! blocking thread, and tears the segment down on SIGINT/SIGTERM.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use powqueue_core::{Capacity, Config, QueueServer, RingBuffer};

pub async fn execute(
    mut config: Config,
    capacity: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(slots) = capacity {
        config.queue.capacity = Capacity::new(slots)?;
    }

    // Handlers go in before the segment exists so a signal can never leave
    // it behind.
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let (ring, created) = RingBuffer::create_or_attach(&config.queue.name, config.queue.capacity)?;
    let ring = Arc::new(ring);

    tracing::info!(
        name = %config.queue.name,
        capacity = ring.capacity(),
        created,
        "Server started"
    );
    println!(
        "✓ Serving '{}' ({} slots, {})",
        config.queue.name,
        ring.capacity(),
        if created { "created" } else { "adopted" }
    );

    let server = QueueServer::new(Arc::clone(&ring));
    let mut worker = tokio::task::spawn_blocking(move || server.serve_forever());

    let finished = tokio::select! {
        _ = interrupt.recv() => None,
        _ = terminate.recv() => None,
        result = &mut worker => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("Shutting down server");
            ring.request_shutdown()?;
            worker.await
        }
    };

    let served = match result? {
        Ok(served) => served,
        Err(e) => {
            tracing::error!(error = %e, "Consumer loop failed");
            return Err(e.into());
        }
    };

    match Arc::try_unwrap(ring) {
        Ok(ring) => ring.destroy()?,
        Err(_) => tracing::warn!("Ring still referenced, leaving segment in place"),
    }

    tracing::info!(served, "Server stopped");
    println!("✓ Server stopped after {} requests", served);
    Ok(())
}
