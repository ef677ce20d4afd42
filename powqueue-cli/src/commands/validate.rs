// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `powq validate` command - Validate configuration file.

use powqueue_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Queue Settings:");
            println!("  Name:      {}", config.queue.name);
            println!("  Capacity:  {}", config.queue.capacity);
            println!("  Overflow:  {}", config.queue.overflow);
            println!();
            println!("Client Settings:");
            println!("  Timeout:   {}ms", config.client.timeout.as_millis());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
