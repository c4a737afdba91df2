//! Configuration handling for the gate service.
//!
//! Values come from the shared YAML config file (`services.gate.config`),
//! then `GATE_*` environment variables, then command-line flags.

use anyhow::Result;
use gate_session::SessionConfig;
use gate_wire::{FrameCodec, COMPRESS_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Gate service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Gateway instance id, the upper half of every session address
    pub gateway_id: u16,
    /// Client-facing listen address
    pub listen_addr: SocketAddr,
    /// Per-session outbound queue capacity
    pub send_queue_size: usize,
    /// Shared inbound queue capacity
    pub recv_queue_size: usize,
    /// Shared fault queue capacity
    pub error_queue_size: usize,
    /// Per-frame read deadline
    #[serde(with = "humantime_serde_compat")]
    pub read_timeout: Duration,
    /// Treat peers as trusted intranet nodes
    pub intranet: bool,
    /// Bodies longer than this are compressed
    pub compress_threshold: usize,
    /// Idle messages kept for reuse
    pub pool_capacity: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            gateway_id: 1,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            send_queue_size: session.send_queue_size,
            recv_queue_size: session.recv_queue_size,
            error_queue_size: 64,
            read_timeout: session.read_timeout,
            intranet: session.intranet,
            compress_threshold: COMPRESS_THRESHOLD,
            pool_capacity: 1024,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    gate: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl GateConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(values) = root.services.and_then(|s| s.gate).and_then(|g| g.config) {
                        config.apply_values(values.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", config_path.as_ref(), e);
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides(|name| std::env::var(name).ok());

        info!(
            "Final gate configuration: gateway_id={}, listen={}, read_timeout={}, intranet={}",
            config.gateway_id,
            config.listen_addr,
            humantime::format_duration(config.read_timeout),
            config.intranet
        );
        Ok(config)
    }

    /// Apply `services.gate.*` key/value pairs; unknown keys and bad values are skipped
    fn apply_values<'a>(&mut self, values: impl Iterator<Item = (&'a str, &'a str)>) {
        for (key, value) in values {
            let Some(name) = key.strip_prefix("services.gate.") else {
                continue;
            };
            if !self.set(name, value) {
                warn!("Ignoring config value {}={:?}", key, value);
            }
        }
    }

    /// Apply `GATE_<NAME>` overrides using `lookup` to read variables
    fn apply_environment_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in Self::KEYS {
            let var = format!("GATE_{}", name.to_uppercase());
            if let Some(value) = lookup(&var) {
                if self.set(name, &value) {
                    info!("{} overridden by environment: {}", name, value);
                } else {
                    warn!("Ignoring invalid {}={:?}", var, value);
                }
            }
        }
    }

    const KEYS: [&'static str; 9] = [
        "gateway_id",
        "listen_addr",
        "send_queue_size",
        "recv_queue_size",
        "error_queue_size",
        "read_timeout",
        "intranet",
        "compress_threshold",
        "pool_capacity",
    ];

    /// Set one field from its string form. Returns false if `name` is
    /// unknown or `value` does not parse.
    fn set(&mut self, name: &str, value: &str) -> bool {
        fn parse<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
            match value.trim().parse() {
                Ok(parsed) => {
                    *slot = parsed;
                    true
                }
                Err(_) => false,
            }
        }

        match name {
            "gateway_id" => parse(value, &mut self.gateway_id),
            "listen_addr" => parse(value, &mut self.listen_addr),
            "send_queue_size" => parse(value, &mut self.send_queue_size),
            "recv_queue_size" => parse(value, &mut self.recv_queue_size),
            "error_queue_size" => parse(value, &mut self.error_queue_size),
            "read_timeout" => match humantime::parse_duration(value.trim()) {
                Ok(timeout) => {
                    self.read_timeout = timeout;
                    true
                }
                Err(_) => false,
            },
            "intranet" => {
                self.intranet = value.trim().eq_ignore_ascii_case("true");
                true
            }
            "compress_threshold" => parse(value, &mut self.compress_threshold),
            "pool_capacity" => parse(value, &mut self.pool_capacity),
            _ => false,
        }
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            send_queue_size: self.send_queue_size,
            recv_queue_size: self.recv_queue_size,
            read_timeout: self.read_timeout,
            intranet: self.intranet,
        }
    }

    /// Frame codec derived from this configuration
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new().with_compress_threshold(self.compress_threshold)
    }
}

/// Durations as humantime strings ("60s", "1m 30s")
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
