// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Every key is optional. Any invalid value results in a HardValidationError
//! that prevents the server or client from starting.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HardValidationError, PowQueueError, PowQueueResult};
use crate::types::{Capacity, OverflowPolicy, QueueName};

/// Raw queue section as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQueueConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_capacity")]
    capacity: usize,
    #[serde(default)]
    overflow: OverflowPolicy,
}

fn default_name() -> String {
    QueueName::DEFAULT.to_string()
}

fn default_capacity() -> usize {
    Capacity::DEFAULT
}

impl Default for RawQueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            capacity: default_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Raw client section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClientConfig {
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for RawClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    queue: RawQueueConfig,
    #[serde(default)]
    client: RawClientConfig,
}

/// Validated queue configuration, shared by server and clients.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: QueueName,
    pub capacity: Capacity,
    pub overflow: OverflowPolicy,
}

/// Validated client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for `await_result` and for blocking submissions.
    pub timeout: Duration,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                name: QueueName::default(),
                capacity: Capacity::default(),
                overflow: OverflowPolicy::default(),
            },
            client: ClientConfig {
                timeout: Duration::from_millis(default_timeout_ms()),
            },
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> PowQueueResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PowQueueError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| PowQueueError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> PowQueueResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| PowQueueError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> PowQueueResult<Config> {
        let queue = QueueConfig {
            name: QueueName::new(raw.queue.name)?,
            capacity: Capacity::new(raw.queue.capacity)?,
            overflow: raw.queue.overflow,
        };

        if raw.client.timeout_ms == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "client.timeout_ms",
                value: "0".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(Config {
            queue,
            client: ClientConfig {
                timeout: Duration::from_millis(raw.client.timeout_ms),
            },
        })
    }
}
