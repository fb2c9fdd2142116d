use crate::application::{HandleSettings, SupervisorSettings};
use crate::domain::services::ScalingPolicy;
use crate::infrastructure::BackoffConfig;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    // Edge transport
    pub edge_addr: String,
    pub edge_server_name: String,
    pub max_streams_per_connection: usize,
    pub connect_timeout_ms: u64,

    // Origins
    pub ingress: String,
    pub origin_connect_timeout_ms: u64,

    // Scaling
    pub min_connections: usize,
    pub max_connections: usize,
    pub scale_up_threshold: u64,
    pub scale_down_threshold: u64,
    pub scale_down_ticks: u32,
    pub tick_interval_ms: u64,

    // Reconnect backoff
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    // Handle lifecycle
    pub drain_timeout_ms: u64,
    pub handle_error_threshold: u32,

    pub metrics_addr: String,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            edge_addr: "127.0.0.1:7844".to_string(),
            edge_server_name: "localhost".to_string(),
            max_streams_per_connection: 100,
            connect_timeout_ms: 15_000,
            ingress: "*=http_status:503".to_string(),
            origin_connect_timeout_ms: 30_000,
            min_connections: 1,
            max_connections: 4,
            scale_up_threshold: 100,
            scale_down_threshold: 20,
            scale_down_ticks: 3,
            tick_interval_ms: 1_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            drain_timeout_ms: 30_000,
            handle_error_threshold: 5,
            metrics_addr: "127.0.0.1:20241".to_string(),
            debug: false,
        }
    }
}

impl Config {
    /// Reject settings the supervisor cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_connections == 0 {
            bail!("min_connections must be at least 1");
        }
        if self.min_connections > self.max_connections {
            bail!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections,
                self.max_connections
            );
        }
        if self.max_connections > usize::from(u8::MAX) + 1 {
            bail!("max_connections cannot exceed {}", usize::from(u8::MAX) + 1);
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            bail!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold,
                self.scale_up_threshold
            );
        }
        if self.scale_down_ticks == 0 {
            bail!("scale_down_ticks must be at least 1");
        }
        if self.handle_error_threshold == 0 {
            bail!("handle_error_threshold must be at least 1");
        }
        if self.max_streams_per_connection == 0 {
            bail!("max_streams_per_connection must be at least 1");
        }
        for (name, value) in [
            ("tick_interval_ms", self.tick_interval_ms),
            ("backoff_base_ms", self.backoff_base_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("origin_connect_timeout_ms", self.origin_connect_timeout_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            bail!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms,
                self.backoff_max_ms
            );
        }
        Ok(())
    }

    pub fn scaling_policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            scale_up_threshold: self.scale_up_threshold,
            scale_down_threshold: self.scale_down_threshold,
            scale_down_ticks: self.scale_down_ticks,
        }
    }

    pub fn handle_settings(&self) -> HandleSettings {
        HandleSettings {
            error_threshold: self.handle_error_threshold,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            max_streams: Some(self.max_streams_per_connection),
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            policy: self.scaling_policy(),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            backoff: self.backoff(),
            handle: self.handle_settings(),
        }
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_connect_timeout_ms)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value {:?} for {}", raw, key)),
        None => Ok(default),
    }
}

/// Build a config from an arbitrary variable lookup.
pub fn config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let d = Config::default();

    let cfg = Config {
        edge_addr: lookup("EDGETUNNEL_EDGE_ADDR").unwrap_or(d.edge_addr),
        edge_server_name: lookup("EDGETUNNEL_EDGE_SERVER_NAME").unwrap_or(d.edge_server_name),
        max_streams_per_connection: parse_or(
            &lookup,
            "EDGETUNNEL_MAX_STREAMS_PER_CONNECTION",
            d.max_streams_per_connection,
        )?,
        connect_timeout_ms: parse_or(&lookup, "EDGETUNNEL_CONNECT_TIMEOUT_MS", d.connect_timeout_ms)?,
        ingress: lookup("EDGETUNNEL_INGRESS").unwrap_or(d.ingress),
        origin_connect_timeout_ms: parse_or(
            &lookup,
            "EDGETUNNEL_ORIGIN_CONNECT_TIMEOUT_MS",
            d.origin_connect_timeout_ms,
        )?,
        min_connections: parse_or(&lookup, "EDGETUNNEL_MIN_CONNECTIONS", d.min_connections)?,
        max_connections: parse_or(&lookup, "EDGETUNNEL_MAX_CONNECTIONS", d.max_connections)?,
        scale_up_threshold: parse_or(&lookup, "EDGETUNNEL_SCALE_UP_THRESHOLD", d.scale_up_threshold)?,
        scale_down_threshold: parse_or(
            &lookup,
            "EDGETUNNEL_SCALE_DOWN_THRESHOLD",
            d.scale_down_threshold,
        )?,
        scale_down_ticks: parse_or(&lookup, "EDGETUNNEL_SCALE_DOWN_TICKS", d.scale_down_ticks)?,
        tick_interval_ms: parse_or(&lookup, "EDGETUNNEL_TICK_INTERVAL_MS", d.tick_interval_ms)?,
        backoff_base_ms: parse_or(&lookup, "EDGETUNNEL_BACKOFF_BASE_MS", d.backoff_base_ms)?,
        backoff_max_ms: parse_or(&lookup, "EDGETUNNEL_BACKOFF_MAX_MS", d.backoff_max_ms)?,
        drain_timeout_ms: parse_or(&lookup, "EDGETUNNEL_DRAIN_TIMEOUT_MS", d.drain_timeout_ms)?,
        handle_error_threshold: parse_or(
            &lookup,
            "EDGETUNNEL_HANDLE_ERROR_THRESHOLD",
            d.handle_error_threshold,
        )?,
        metrics_addr: lookup("EDGETUNNEL_METRICS_ADDR").unwrap_or(d.metrics_addr),
        debug: lookup("DEBUG").is_some(),
    };

    cfg.validate()?;
    Ok(cfg)
}

/// Load configuration from the process environment.
pub fn load_config() -> anyhow::Result<Config> {
    config_from_lookup(|key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config_from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.min_connections, 1);
        assert_eq!(cfg.max_connections, 4);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_lookup_defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_lookup_overrides() {
        let cfg = from_pairs(&[
            ("EDGETUNNEL_EDGE_ADDR", "10.0.0.1:7844"),
            ("EDGETUNNEL_MIN_CONNECTIONS", "2"),
            ("EDGETUNNEL_MAX_CONNECTIONS", "8"),
            ("EDGETUNNEL_TICK_INTERVAL_MS", " 250 "),
            ("EDGETUNNEL_INGRESS", "*=tcp://127.0.0.1:22"),
            ("DEBUG", "1"),
        ])
        .unwrap();

        assert_eq!(cfg.edge_addr, "10.0.0.1:7844");
        assert_eq!(cfg.min_connections, 2);
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.tick_interval_ms, 250);
        assert_eq!(cfg.ingress, "*=tcp://127.0.0.1:22");
        assert!(cfg.debug);
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let err = from_pairs(&[("EDGETUNNEL_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("EDGETUNNEL_MAX_CONNECTIONS"));
    }

    #[test]
    fn test_validate_rejects_zero_min() {
        let cfg = Config {
            min_connections: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let err = from_pairs(&[
            ("EDGETUNNEL_MIN_CONNECTIONS", "5"),
            ("EDGETUNNEL_MAX_CONNECTIONS", "4"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("exceeds max_connections"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let cfg = Config {
            scale_up_threshold: 10,
            scale_down_threshold: 10,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        for cfg in [
            Config {
                tick_interval_ms: 0,
                ..Config::default()
            },
            Config {
                drain_timeout_ms: 0,
                ..Config::default()
            },
            Config {
                backoff_base_ms: 0,
                ..Config::default()
            },
        ] {
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn test_validate_rejects_base_above_max_backoff() {
        let cfg = Config {
            backoff_base_ms: 10_000,
            backoff_max_ms: 1_000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_supervisor_settings_conversion() {
        let cfg = Config {
            tick_interval_ms: 500,
            drain_timeout_ms: 2_000,
            handle_error_threshold: 7,
            max_streams_per_connection: 64,
            ..Config::default()
        };

        let settings = cfg.supervisor_settings();
        assert_eq!(settings.tick_interval, Duration::from_millis(500));
        assert_eq!(settings.policy, cfg.scaling_policy());
        assert_eq!(settings.handle.drain_timeout, Duration::from_secs(2));
        assert_eq!(settings.handle.error_threshold, 7);
        assert_eq!(settings.handle.max_streams, Some(64));
        assert_eq!(settings.backoff.max, Duration::from_secs(60));
    }
}
