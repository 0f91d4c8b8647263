//! Bridge configuration
//!
//! Everything the bridges need that is fixed per deployment: the remote
//! executor endpoint, timeouts, and the device discovery parameters.
//! Values come from defaults, the environment, or a TOML document, and are
//! validated by the builder.

use crate::error::{BridgeError, BridgeResult};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Default remote executor endpoint
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:9999";

/// Default generic-SCSI node prefix
pub const DEFAULT_NODE_PREFIX: &str = "/dev/sg";

/// Number of `/dev/sgN` candidates scanned by default
pub const DEFAULT_NODE_COUNT: u32 = 32;

/// Environment variable names
pub mod env {
    pub const ENDPOINT: &str = "ASPI_BRIDGE_ENDPOINT";
    pub const IO_TIMEOUT_MS: &str = "ASPI_BRIDGE_IO_TIMEOUT_MS";
    pub const VENDORS: &str = "ASPI_BRIDGE_VENDORS";
    pub const PRODUCTS: &str = "ASPI_BRIDGE_PRODUCTS";
    pub const DEVICE_OVERRIDE: &str = "SEM_DEVICE";
}

/// Device discovery parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Node path prefix, the index is appended (`/dev/sg` + `3`)
    pub node_prefix: String,
    /// Candidate indices, scanned in order
    pub node_range: Range<u32>,
    /// Substrings that select a device by vendor (case-sensitive)
    pub vendor_patterns: Vec<String>,
    /// Substrings that select a device by product (case-sensitive)
    pub product_patterns: Vec<String>,
    /// Opened without probing when the scan finds nothing
    pub override_path: Option<PathBuf>,
    /// Timeout for the INQUIRY probe
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            node_prefix: DEFAULT_NODE_PREFIX.to_string(),
            node_range: 0..DEFAULT_NODE_COUNT,
            vendor_patterns: vec!["JEOL".to_string()],
            product_patterns: vec!["SEM".to_string(), "sem".to_string()],
            override_path: None,
            probe_timeout: Duration::from_millis(2000),
        }
    }
}

impl DiscoveryConfig {
    /// Path of the candidate node with the given index
    pub fn node_path(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.node_prefix, index))
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Remote executor address, `host:port`
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Read/write timeout on the executor connection, `None` blocks forever
    pub io_timeout: Option<Duration>,
    /// SG_IO timeout for passthrough commands
    pub command_timeout: Duration,
    pub discovery: DiscoveryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Some(Duration::from_secs(30)),
            command_timeout: Duration::from_millis(10_000),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Create a new builder starting from the defaults
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Defaults overridden by the `ASPI_BRIDGE_*` and `SEM_DEVICE` variables
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(endpoint) = lookup(env::ENDPOINT) {
            builder = builder.endpoint(&endpoint);
        }

        if let Some(ms) = lookup(env::IO_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                BridgeError::Config(format!("{} must be a number of milliseconds, got '{}'", env::IO_TIMEOUT_MS, ms))
            })?;
            builder = builder.io_timeout(if ms == 0 { None } else { Some(Duration::from_millis(ms)) });
        }

        if let Some(vendors) = lookup(env::VENDORS) {
            builder = builder.vendor_patterns(split_list(&vendors));
        }

        if let Some(products) = lookup(env::PRODUCTS) {
            builder = builder.product_patterns(split_list(&products));
        }

        if let Some(path) = lookup(env::DEVICE_OVERRIDE) {
            if !path.trim().is_empty() {
                builder = builder.override_path(path.trim());
            }
        }

        builder.build()
    }

    /// Parse a TOML document
    ///
    /// ```toml
    /// [socket]
    /// endpoint = "127.0.0.1:9999"
    /// connect_timeout_ms = 5000
    /// io_timeout_ms = 30000      # 0 blocks forever
    ///
    /// [passthrough]
    /// command_timeout_ms = 10000
    ///
    /// [discovery]
    /// node_prefix = "/dev/sg"
    /// first_index = 0
    /// node_count = 32
    /// vendor_patterns = ["JEOL"]
    /// product_patterns = ["SEM", "sem"]
    /// override_path = "/dev/sg1"
    /// probe_timeout_ms = 2000
    /// ```
    ///
    /// Every table and key is optional.
    pub fn from_toml_str(contents: &str) -> BridgeResult<Self> {
        let doc = contents
            .parse::<toml::Value>()
            .map_err(|e| BridgeError::Config(format!("Invalid TOML: {}", e)))?;

        let mut builder = Self::builder();

        if let Some(socket) = doc.get("socket") {
            if let Some(endpoint) = get_str(socket, "socket", "endpoint")? {
                builder = builder.endpoint(endpoint);
            }
            if let Some(ms) = get_u64(socket, "socket", "connect_timeout_ms")? {
                builder = builder.connect_timeout(Duration::from_millis(ms));
            }
            if let Some(ms) = get_u64(socket, "socket", "io_timeout_ms")? {
                builder = builder.io_timeout(if ms == 0 { None } else { Some(Duration::from_millis(ms)) });
            }
        }

        if let Some(passthrough) = doc.get("passthrough") {
            if let Some(ms) = get_u64(passthrough, "passthrough", "command_timeout_ms")? {
                builder = builder.command_timeout(Duration::from_millis(ms));
            }
        }

        if let Some(discovery) = doc.get("discovery") {
            if let Some(prefix) = get_str(discovery, "discovery", "node_prefix")? {
                builder = builder.node_prefix(prefix);
            }
            let first = get_u32(discovery, "discovery", "first_index")?.unwrap_or(0);
            let count = get_u32(discovery, "discovery", "node_count")?.unwrap_or(DEFAULT_NODE_COUNT);
            builder = builder.node_range(first..first.saturating_add(count));

            if let Some(list) = get_str_list(discovery, "discovery", "vendor_patterns")? {
                builder = builder.vendor_patterns(list);
            }
            if let Some(list) = get_str_list(discovery, "discovery", "product_patterns")? {
                builder = builder.product_patterns(list);
            }
            if let Some(path) = get_str(discovery, "discovery", "override_path")? {
                builder = builder.override_path(path);
            }
            if let Some(ms) = get_u64(discovery, "discovery", "probe_timeout_ms")? {
                builder = builder.probe_timeout(Duration::from_millis(ms));
            }
        }

        builder.build()
    }

    /// Read and parse a TOML configuration file
    pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> BridgeResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BridgeError::Config(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&contents)
    }
}

/// Builder for `BridgeConfig`
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Set the remote executor endpoint (default: 127.0.0.1:9999)
    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.config.endpoint = endpoint.trim().to_string();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the socket read/write timeout, `None` to block indefinitely
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn node_prefix(mut self, prefix: &str) -> Self {
        self.config.discovery.node_prefix = prefix.to_string();
        self
    }

    pub fn node_range(mut self, range: Range<u32>) -> Self {
        self.config.discovery.node_range = range;
        self
    }

    pub fn vendor_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.discovery.vendor_patterns = patterns;
        self
    }

    pub fn product_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.discovery.product_patterns = patterns;
        self
    }

    pub fn override_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.discovery.override_path = Some(path.into());
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery.probe_timeout = timeout;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> BridgeResult<BridgeConfig> {
        let config = self.config;

        // host:port, the host may be a bracketed IPv6 literal
        match config.endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(BridgeError::Config(format!(
                    "endpoint must be host:port (e.g., 127.0.0.1:9999), got '{}'",
                    config.endpoint
                )))
            }
        }

        if config.connect_timeout.is_zero() || config.io_timeout.map_or(false, |t| t.is_zero()) {
            return Err(BridgeError::Config(
                "socket timeouts must be nonzero".to_string(),
            ));
        }

        if config.command_timeout.is_zero() || config.discovery.probe_timeout.is_zero() {
            return Err(BridgeError::Config(
                "SG_IO timeouts must be nonzero".to_string(),
            ));
        }

        if config.discovery.node_prefix.is_empty() {
            return Err(BridgeError::Config("node_prefix must not be empty".to_string()));
        }

        if config.discovery.node_range.is_empty() && config.discovery.override_path.is_none() {
            return Err(BridgeError::Config(
                "discovery needs a nonempty node range or an override path".to_string(),
            ));
        }

        let mut patterns = config
            .discovery
            .vendor_patterns
            .iter()
            .chain(&config.discovery.product_patterns);
        if patterns.any(|p| p.is_empty()) {
            return Err(BridgeError::Config(
                "identity patterns must not be empty strings (they would match every device)"
                    .to_string(),
            ));
        }

        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn get_str<'a>(table: &'a toml::Value, section: &str, key: &str) -> BridgeResult<Option<&'a str>> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or_else(|| {
            BridgeError::Config(format!("[{}] {} must be a string", section, key))
        }),
    }
}

fn get_u32(table: &toml::Value, section: &str, key: &str) -> BridgeResult<Option<u32>> {
    get_u64(table, section, key)?
        .map(|v| {
            u32::try_from(v).map_err(|_| {
                BridgeError::Config(format!("[{}] {} = {} is out of range", section, key, v))
            })
        })
        .transpose()
}

fn get_u64(table: &toml::Value, section: &str, key: &str) -> BridgeResult<Option<u64>> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| {
                BridgeError::Config(format!("[{}] {} must be a non-negative integer", section, key))
            }),
    }
}

fn get_str_list(table: &toml::Value, section: &str, key: &str) -> BridgeResult<Option<Vec<String>>> {
    let Some(value) = table.get(key) else {
        return Ok(None);
    };
    let invalid = || BridgeError::Config(format!("[{}] {} must be an array of strings", section, key));
    let array = value.as_array().ok_or_else(invalid)?;
    array
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
        .collect::<BridgeResult<Vec<_>>>()
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::builder().build().unwrap();
        assert_eq!(config.endpoint, "127.0.0.1:9999");
        assert_eq!(config.discovery.node_range, 0..32);
        assert_eq!(config.discovery.node_path(3), PathBuf::from("/dev/sg3"));
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert!(config.discovery.override_path.is_none());
    }

    #[test]
    fn test_invalid_endpoint() {
        let result = BridgeConfig::builder().endpoint("localhost").build();
        assert!(matches!(result, Err(BridgeError::Config(_))));

        let result = BridgeConfig::builder().endpoint("localhost:notaport").build();
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        let result = BridgeConfig::builder()
            .vendor_patterns(vec![String::new()])
            .build();
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (env::ENDPOINT, "10.0.0.5:7000"),
            (env::IO_TIMEOUT_MS, "0"),
            (env::PRODUCTS, "SEM, Scope ,"),
            (env::DEVICE_OVERRIDE, "/dev/sg4"),
        ]
        .into_iter()
        .collect();

        let config = BridgeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.endpoint, "10.0.0.5:7000");
        assert_eq!(config.io_timeout, None);
        assert_eq!(config.discovery.product_patterns, vec!["SEM", "Scope"]);
        assert_eq!(config.discovery.vendor_patterns, vec!["JEOL"]);
        assert_eq!(config.discovery.override_path, Some(PathBuf::from("/dev/sg4")));
    }

    #[test]
    fn test_from_lookup_bad_timeout() {
        let result = BridgeConfig::from_lookup(|k| {
            (k == env::IO_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_from_toml() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [socket]
            endpoint = "192.168.1.20:9999"
            io_timeout_ms = 1500

            [passthrough]
            command_timeout_ms = 20000

            [discovery]
            first_index = 2
            node_count = 4
            vendor_patterns = ["ACME"]
            override_path = "/dev/sg9"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "192.168.1.20:9999");
        assert_eq!(config.io_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.command_timeout, Duration::from_secs(20));
        assert_eq!(config.discovery.node_range, 2..6);
        assert_eq!(config.discovery.vendor_patterns, vec!["ACME"]);
        assert_eq!(config.discovery.product_patterns, vec!["SEM", "sem"]);
        assert_eq!(config.discovery.override_path, Some(PathBuf::from("/dev/sg9")));
    }

    #[test]
    fn test_from_toml_type_error() {
        let result = BridgeConfig::from_toml_str("[socket]\nendpoint = 9999\n");
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_from_toml_node_range_overflow() {
        let result = BridgeConfig::from_toml_str("[discovery]\nfirst_index = 4294967296\n");
        assert!(matches!(result, Err(BridgeError::Config(_))));

        let result = BridgeConfig::from_toml_str("[discovery]\nnode_count = 4294967297\n");
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_from_toml_empty_document() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
    }
}
