use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Port cannot be 0")]
    ZeroPort,
    #[error("Metrics port must differ from the sync port ({0})")]
    PortClash(u16),
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
    #[error("max_frame_bytes must be between 1 KiB and 16 MiB, got {0}")]
    FrameSize(usize),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port the sync protocol listens on
    pub port: u16,
    /// Port for the metrics/health endpoint
    pub metrics_port: u16,
    /// Largest accepted frame payload
    pub max_frame_bytes: usize,
    /// Capacity of the hub's submission queue
    pub submit_queue: usize,
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4433,
            metrics_port: 9090,
            max_frame_bytes: 64 * 1024,
            submit_queue: 1024,
            max_connections: 1000,
        }
    }
}

fn env_limit(name: &str, min: usize, max: usize) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<usize>() {
        Ok(parsed) if (min..=max).contains(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} must be {}-{}, using default", name, min, max);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn env_port(name: &str) -> Option<u16> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u16>() {
        Ok(0) => {
            tracing::warn!("{} must be > 0, using default", name);
            None
        }
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Some(port) = env_port("PORT") {
            config.port = port;
        }
        if let Some(port) = env_port("METRICS_PORT") {
            config.metrics_port = port;
        }
        if let Some(bytes) = env_limit("MAX_FRAME_BYTES", 1024, 16 * 1024 * 1024) {
            config.max_frame_bytes = bytes;
        }
        if let Some(queue) = env_limit("SUBMIT_QUEUE", 1, 1 << 20) {
            config.submit_queue = queue;
        }
        if let Some(max) = env_limit("MAX_CONNECTIONS", 1, 100_000) {
            config.max_connections = max;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.metrics_port == self.port {
            return Err(ConfigError::PortClash(self.port));
        }
        if !(1024..=16 * 1024 * 1024).contains(&self.max_frame_bytes) {
            return Err(ConfigError::FrameSize(self.max_frame_bytes));
        }
        if self.submit_queue == 0 {
            return Err(ConfigError::ZeroLimit("submit_queue"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroLimit("max_connections"));
        }
        Ok(())
    }
}

/// Client-side cache and lifecycle configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Unsubscribed entities idle this long are detached
    pub idle_timeout: Duration,
    /// Resident entity cap (LRU)
    pub max_entities: usize,
    /// Memoized derived-state cap (LRU)
    pub max_derived_states: usize,
    /// Outstanding subscriptions per path before a leak is reported
    pub leak_tolerance: usize,
    pub leak_tracking: bool,
    /// Default `wait_for_ready` timeout
    pub ready_timeout: Duration,
    /// Idle sweeper period
    pub sweep_interval: Duration,
    /// Deadline for a join or submit round trip
    pub request_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            max_entities: 256,
            max_derived_states: 64,
            leak_tolerance: 16,
            leak_tracking: cfg!(debug_assertions),
            ready_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entities == 0 {
            return Err(ConfigError::ZeroLimit("max_entities"));
        }
        if self.max_derived_states == 0 {
            return Err(ConfigError::ZeroLimit("max_derived_states"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroLimit("request_timeout"));
        }
        Ok(())
    }
}

/// Client side of the TCP sync channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Largest frame sent or accepted; match the server's `max_frame_bytes`
    pub max_frame_bytes: usize,
    /// Deadline for a join, submit or battle round trip
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1024..=16 * 1024 * 1024).contains(&self.max_frame_bytes) {
            return Err(ConfigError::FrameSize(self.max_frame_bytes));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroLimit("request_timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4433);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.max_frame_bytes, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.metrics_port = config.port;
        assert_eq!(config.validate(), Err(ConfigError::PortClash(4433)));

        let mut config = ServerConfig::default();
        config.max_frame_bytes = 10;
        assert_eq!(config.validate(), Err(ConfigError::FrameSize(10)));

        let mut config = ServerConfig::default();
        config.submit_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_entities, 256);
        assert!(config.validate().is_ok());

        let config = CacheConfig {
            max_entities: 0,
            ..CacheConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroLimit("max_entities"))
        );

        let config = CacheConfig {
            request_timeout: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroLimit("request_timeout"))
        );
    }

    #[test]
    fn test_channel_config_validate() {
        let config = ChannelConfig::default();
        assert_eq!(config.max_frame_bytes, ServerConfig::default().max_frame_bytes);
        assert!(config.validate().is_ok());

        let config = ChannelConfig {
            max_frame_bytes: 100,
            ..ChannelConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::FrameSize(100)));
    }
}
