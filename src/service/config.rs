// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::{CodecConfig, MessageCodec, MAX_MESSAGE_SIZE};
use crate::utils::{BufferPool, IoRateLimiter, WorkerPoolConfig};

pub const ENV_PREFIX: &str = "MSGWIRE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` to listen on or dial
    pub address: String,
    /// Keep-alive idle time
    pub heartbeat_interval_secs: u64,
    /// Server accept throttle, 0 disables it
    pub accept_rate_per_sec: u64,
    pub handle_signals: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            address: "127.0.0.1:8080".to_string(),
            heartbeat_interval_secs: 10,
            accept_rate_per_sec: 0,
            handle_signals: true,
        }
    }
}

/// Zero means "derive from the CPU count".
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub num_workers: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    pub max_message_size: usize,
    pub correlation_id: bool,
}

impl Default for FramingConfig {
    fn default() -> Self {
        FramingConfig {
            max_message_size: MAX_MESSAGE_SIZE,
            correlation_id: false,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Applied to send and receive separately, 0 disables throttling
    pub bytes_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    pub max_idle: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig { max_idle: 256 }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub network: NetworkConfig,
    pub worker_pool: PoolConfig,
    pub codec: FramingConfig,
    pub rate_limit: RateLimitConfig,
    pub buffer_pool: BufferPoolConfig,
}

impl TransportConfig {
    /// Loads `path` (TOML), then applies `MSGWIRE_`-prefixed environment
    /// overrides such as `MSGWIRE_NETWORK__ADDRESS`, then validates.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(Self::env_source())
            .build()?;
        let transport_config: TransportConfig = config.try_deserialize()?;
        transport_config.validate()?;
        Ok(transport_config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> AppResult<TransportConfig> {
        let config = config::Config::builder()
            .add_source(Self::env_source())
            .build()?;
        let transport_config: TransportConfig = config.try_deserialize()?;
        transport_config.validate()?;
        Ok(transport_config)
    }

    fn env_source() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn validate(&self) -> AppResult<()> {
        let address = self.network.address.trim();
        if address.is_empty() {
            return Err(AppError::InvalidValue("network.address is empty".into()));
        }
        let has_port = address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !has_port {
            return Err(AppError::InvalidValue(format!(
                "network.address must be host:port, got {}",
                address
            )));
        }
        if self.network.heartbeat_interval_secs == 0 {
            return Err(AppError::InvalidValue(
                "network.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.codec.max_message_size == 0 || self.codec.max_message_size > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "codec.max_message_size out of range: {}",
                self.codec.max_message_size
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.network.heartbeat_interval_secs)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let cpus = num_cpus::get();
        let num_workers = match self.worker_pool.num_workers {
            0 => cpus * 10,
            n => n,
        };
        let queue_capacity = match self.worker_pool.queue_capacity {
            0 => cpus * 20,
            n => n,
        };
        WorkerPoolConfig {
            num_workers,
            queue_capacity,
        }
    }

    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            max_message_size: self.codec.max_message_size,
            correlation_id: self.codec.correlation_id,
        }
    }

    /// Codec owning a fresh buffer pool and rate limiter built from this
    /// configuration.
    pub fn build_codec(&self) -> Arc<MessageCodec> {
        Arc::new(MessageCodec::new(
            self.codec_config(),
            Arc::new(BufferPool::new(self.buffer_pool.max_idle)),
            Arc::new(IoRateLimiter::new(self.rate_limit.bytes_per_sec)),
        ))
    }
}
