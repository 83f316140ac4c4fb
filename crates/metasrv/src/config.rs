//! Configuration module for the meta server
//!
//! Settings come from a TOML file overridden by environment variables;
//! env beats file, file beats defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::metadata::TopologyType;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node name advertised to peers, defaults to `<addr>:<http_port>`
    pub node_name: String,
    /// Listen address
    pub addr: String,
    /// HTTP port serving both the admin and the meta service API
    pub http_port: u16,
    /// Reserved port for the binary RPC surface
    pub grpc_port: u16,
    /// Client URLs of the backing KV quorum
    pub client_urls: String,
    /// Peer URLs of the backing KV quorum
    pub peer_urls: String,
    pub advertise_client_urls: String,
    pub advertise_peer_urls: String,

    /// Local data directory
    pub data_dir: String,
    /// Root of every persisted key
    pub storage_root_path: String,

    pub etcd_start_timeout_ms: u64,
    pub etcd_call_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub election_timeout_ms: u64,
    /// Lease TTL for node liveness and leader election, in seconds
    pub lease_sec: u64,
    /// Timeout for handling a single service request
    pub grpc_handle_timeout_ms: u64,

    pub max_request_bytes: usize,
    pub max_scan_limit: usize,
    pub min_scan_limit: usize,
    pub max_ops_per_txn: usize,
    /// Range size reserved by one ID-allocator refill
    pub id_allocator_step: u64,
    /// Maximum number of procedures running concurrently per cluster
    pub procedure_executing_batch_size: u32,

    pub default_cluster_name: String,
    pub default_cluster_node_count: u32,
    pub default_cluster_shard_total: u32,
    pub enable_schedule: bool,
    /// `static` or `dynamic`
    pub topology_type: TopologyType,

    #[serde(rename = "flow-limiter")]
    pub flow_limiter: FlowLimiterConfig,
    pub log: LogConfig,
}

/// Flow limiter settings, runtime-mutable through the HTTP API
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowLimiterConfig {
    pub enable: bool,
    /// Token refill rate per second
    pub limit: u64,
    /// Bucket capacity
    pub burst: u64,
}

impl Default for FlowLimiterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            limit: 10_000,
            burst: 100_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log file path, empty means stderr
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            addr: "127.0.0.1".to_string(),
            http_port: 8080,
            grpc_port: 2379,
            client_urls: "http://0.0.0.0:2379".to_string(),
            peer_urls: "http://0.0.0.0:2380".to_string(),
            advertise_client_urls: String::new(),
            advertise_peer_urls: String::new(),
            data_dir: "/tmp/metasrv".to_string(),
            storage_root_path: "/meta".to_string(),
            etcd_start_timeout_ms: 60_000,
            etcd_call_timeout_ms: 5_000,
            tick_interval_ms: 500,
            election_timeout_ms: 3_000,
            lease_sec: 10,
            grpc_handle_timeout_ms: 60_000,
            max_request_bytes: 2 * 1024 * 1024,
            max_scan_limit: 100,
            min_scan_limit: 20,
            max_ops_per_txn: 32,
            id_allocator_step: 20,
            procedure_executing_batch_size: 4,
            default_cluster_name: "defaultCluster".to_string(),
            default_cluster_node_count: 2,
            default_cluster_shard_total: 8,
            enable_schedule: true,
            topology_type: TopologyType::Static,
            flow_limiter: FlowLimiterConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply env overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    MetaError::invalid_argument(format!("read config file {}", path)).with_cause(e)
                })?;
                toml::from_str(&content).map_err(|e| {
                    MetaError::invalid_argument(format!("parse config file {}", path)).with_cause(e)
                })?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate_and_adjust()?;
        Ok(config)
    }

    /// Environment variables beat the file. Only the settings operators
    /// actually tune per deployment are overridable.
    fn apply_env_overrides(&mut self) {
        override_string("META_NODE_NAME", &mut self.node_name);
        override_string("META_ADDR", &mut self.addr);
        override_parse("META_HTTP_PORT", &mut self.http_port);
        override_parse("META_GRPC_PORT", &mut self.grpc_port);
        override_string("META_DATA_DIR", &mut self.data_dir);
        override_string("META_STORAGE_ROOT_PATH", &mut self.storage_root_path);
        override_parse("META_LEASE_SEC", &mut self.lease_sec);
        override_parse("META_ID_ALLOCATOR_STEP", &mut self.id_allocator_step);
        override_parse(
            "META_PROCEDURE_EXECUTING_BATCH_SIZE",
            &mut self.procedure_executing_batch_size,
        );
        override_string("META_DEFAULT_CLUSTER_NAME", &mut self.default_cluster_name);
        override_parse(
            "META_DEFAULT_CLUSTER_NODE_COUNT",
            &mut self.default_cluster_node_count,
        );
        override_parse(
            "META_DEFAULT_CLUSTER_SHARD_TOTAL",
            &mut self.default_cluster_shard_total,
        );
        override_parse("META_ENABLE_SCHEDULE", &mut self.enable_schedule);
        if let Ok(raw) = std::env::var("META_TOPOLOGY_TYPE") {
            if let Ok(parsed) = raw.parse() {
                self.topology_type = parsed;
            }
        }
        override_parse("FLOW_LIMITER_ENABLE", &mut self.flow_limiter.enable);
        override_parse("FLOW_LIMITER_LIMIT", &mut self.flow_limiter.limit);
        override_parse("FLOW_LIMITER_BURST", &mut self.flow_limiter.burst);
        override_string("META_LOG_LEVEL", &mut self.log.level);
        override_string("META_LOG_FILE", &mut self.log.file);
    }

    /// Validate fields and fill in derived defaults.
    fn validate_and_adjust(&mut self) -> Result<()> {
        if self.node_name.is_empty() {
            self.node_name = format!("{}:{}", self.addr, self.http_port);
        }
        if self.default_cluster_shard_total == 0 {
            return Err(MetaError::invalid_argument(
                "default_cluster_shard_total must be positive",
            ));
        }
        if self.id_allocator_step == 0 {
            return Err(MetaError::invalid_argument(
                "id_allocator_step must be positive",
            ));
        }
        if self.procedure_executing_batch_size == 0 {
            return Err(MetaError::invalid_argument(
                "procedure_executing_batch_size must be positive",
            ));
        }
        if self.min_scan_limit > self.max_scan_limit {
            return Err(MetaError::invalid_argument(
                "min_scan_limit must not exceed max_scan_limit",
            ));
        }
        Ok(())
    }

    /// Advertised HTTP endpoint of this meta server
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.http_port)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_sec)
    }

    pub fn etcd_call_timeout(&self) -> Duration {
        Duration::from_millis(self.etcd_call_timeout_ms)
    }

    pub fn grpc_handle_timeout(&self) -> Duration {
        Duration::from_millis(self.grpc_handle_timeout_ms)
    }
}

fn override_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn override_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.parse() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.lease_sec, 10);
        assert_eq!(config.default_cluster_shard_total, 8);
        assert_eq!(config.topology_type, TopologyType::Static);
        assert!(config.flow_limiter.enable);
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            addr = "10.0.0.1"
            http_port = 9090
            topology_type = "dynamic"
            default_cluster_shard_total = 16

            [flow-limiter]
            enable = false
            limit = 1
            burst = 1

            [log]
            level = "debug"
        "#;
        let mut config: Config = toml::from_str(raw).unwrap();
        config.validate_and_adjust().unwrap();
        assert_eq!(config.addr, "10.0.0.1");
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.topology_type, TopologyType::Dynamic);
        assert_eq!(config.default_cluster_shard_total, 16);
        assert!(!config.flow_limiter.enable);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.node_name, "10.0.0.1:9090");
    }

    #[test]
    fn test_invalid_shard_total_rejected() {
        let mut config = Config {
            default_cluster_shard_total: 0,
            ..Config::default()
        };
        assert!(config.validate_and_adjust().is_err());
    }
}
