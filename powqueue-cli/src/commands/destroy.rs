// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `powq destroy` command - Remove a stale shared memory object.
//!
//! Only unlinks the name. Processes still mapping the old segment keep it
//! until they exit.

use powqueue_core::{Config, SharedRegion};

pub async fn execute(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(name = %config.queue.name, "Unlinking shared memory object");
    SharedRegion::unlink(config.queue.name.as_str())?;
    println!("✓ Removed '{}'", config.queue.name);
    Ok(())
}
