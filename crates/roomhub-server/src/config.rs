//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the roomhub server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Static secret required by the member-listing endpoint.
    pub secret: String,
    /// Keepalive ping interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Idle timeout in milliseconds — a member silent for this long is evicted.
    pub idle_timeout_ms: u64,
    /// Capacity of each member's outbound message queue.
    pub outbound_capacity: usize,
}

impl HubConfig {
    /// Keepalive ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            secret: "change-me".into(),
            ping_interval_ms: 15_000,
            idle_timeout_ms: 240_000,
            outbound_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_host() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn default_port_is_zero() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.port, 0);
    }

    #[test]
    fn default_ping_interval() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.ping_interval(), Duration::from_secs(15));
    }

    #[test]
    fn default_idle_timeout() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(240));
    }

    #[test]
    fn default_outbound_capacity() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.outbound_capacity, 256);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = HubConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: HubConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, cfg.host);
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.secret, cfg.secret);
        assert_eq!(back.ping_interval_ms, cfg.ping_interval_ms);
        assert_eq!(back.idle_timeout_ms, cfg.idle_timeout_ms);
        assert_eq!(back.outbound_capacity, cfg.outbound_capacity);
    }

    #[test]
    fn custom_values() {
        let cfg = HubConfig {
            host: "0.0.0.0".into(),
            port: 8080,
            secret: "s3cret".into(),
            ping_interval_ms: 500,
            idle_timeout_ms: 2_000,
            outbound_capacity: 8,
        };
        assert_eq!(cfg.ping_interval(), Duration::from_millis(500));
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.outbound_capacity, 8);
    }

    #[test]
    fn deserialize_from_json_string() {
        let json = r#"{"host":"10.0.0.1","port":3000,"secret":"x","ping_interval_ms":1000,"idle_timeout_ms":5000,"outbound_capacity":16}"#;
        let cfg: HubConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.host, "10.0.0.1");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.secret, "x");
    }
}
