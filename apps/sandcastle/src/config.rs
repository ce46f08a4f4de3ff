use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::model::ResourceLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub redis_url: Option<String>,
    pub docker_host: Option<String>,
    pub container_memory_bytes: u64,
    pub container_cpus: f64,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub build_timeout: Duration,
    pub clone_timeout: Duration,
    pub build_workers: usize,
    pub task_retention: Duration,
    pub orphan_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_raw = get("SANDCASTLE_ADDR").unwrap_or_else(|| "0.0.0.0:8000".into());
        let bind_addr: SocketAddr = bind_raw.parse().map_err(|err: std::net::AddrParseError| {
            ConfigError::Invalid {
                var: "SANDCASTLE_ADDR",
                value: bind_raw.clone(),
                reason: err.to_string(),
            }
        })?;
        let log_filter = get("RUST_LOG").unwrap_or_else(|| "info,sandcastle=debug".into());
        let redis_url = get("REDIS_URL").filter(|v| !v.is_empty());
        let docker_host = get("DOCKER_HOST").filter(|v| !v.is_empty());

        let memory_raw = get("SANDCASTLE_CONTAINER_MEMORY").unwrap_or_else(|| "2g".into());
        let container_memory_bytes =
            parse_memory(&memory_raw).ok_or_else(|| ConfigError::Invalid {
                var: "SANDCASTLE_CONTAINER_MEMORY",
                value: memory_raw.clone(),
                reason: "expected bytes or a k/m/g suffixed size".into(),
            })?;

        let container_cpus = get("SANDCASTLE_CONTAINER_CPUS")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|cpus| cpus.is_finite() && *cpus > 0.0)
            .unwrap_or(2.0);
        let session_ttl_minutes = parse_or(&get, "SANDCASTLE_SESSION_TTL_MINUTES", 60u64).max(1);
        let sweep_interval_secs = parse_or(&get, "SANDCASTLE_SWEEP_INTERVAL_SECS", 300u64).max(1);
        let build_timeout_secs = parse_or(&get, "SANDCASTLE_BUILD_TIMEOUT_SECS", 300u64).max(1);
        let clone_timeout_secs = parse_or(&get, "SANDCASTLE_CLONE_TIMEOUT_SECS", 60u64).max(1);
        let build_workers = parse_or(&get, "SANDCASTLE_BUILD_WORKERS", 4usize).max(1);
        let task_retention_secs = parse_or(&get, "SANDCASTLE_TASK_RETENTION_SECS", 86_400u64).max(1);
        let orphan_grace_secs = parse_or(&get, "SANDCASTLE_ORPHAN_GRACE_SECS", 120u64);

        Ok(Self {
            bind_addr,
            log_filter,
            redis_url,
            docker_host,
            container_memory_bytes,
            container_cpus,
            session_ttl: Duration::from_secs(session_ttl_minutes * 60),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            build_timeout: Duration::from_secs(build_timeout_secs),
            clone_timeout: Duration::from_secs(clone_timeout_secs),
            build_workers,
            task_retention: Duration::from_secs(task_retention_secs),
            orphan_grace: Duration::from_secs(orphan_grace_secs),
        })
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_count: self.container_cpus,
            memory_bytes: self.container_memory_bytes,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            log_filter: "info,sandcastle=debug".into(),
            redis_url: None,
            docker_host: None,
            container_memory_bytes: 2 * 1024 * 1024 * 1024,
            container_cpus: 2.0,
            session_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(300),
            build_timeout: Duration::from_secs(300),
            clone_timeout: Duration::from_secs(60),
            build_workers: 4,
            task_retention: Duration::from_secs(86_400),
            orphan_grace: Duration::from_secs(120),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `512m`, `2g`, `1024k`, or plain bytes. Case-insensitive, optional trailing `b`.
pub fn parse_memory(raw: &str) -> Option<u64> {
    let lower = raw.trim().to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);
    let (digits, multiplier) = match trimmed.chars().last()? {
        'k' => (&trimmed[..trimmed.len() - 1], 1024u64),
        'm' => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        'g' => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let value: u64 = digits.trim().parse().ok()?;
    if value == 0 {
        return None;
    }
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_source(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8000);
        assert_eq!(cfg.container_memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.container_cpus, 2.0);
        assert_eq!(cfg.session_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.build_timeout, Duration::from_secs(300));
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("SANDCASTLE_ADDR", "127.0.0.1:9000"),
            ("SANDCASTLE_CONTAINER_MEMORY", "512m"),
            ("SANDCASTLE_CONTAINER_CPUS", "0.5"),
            ("SANDCASTLE_SESSION_TTL_MINUTES", "5"),
            ("REDIS_URL", "redis://localhost:6379"),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.container_memory_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.resource_limits().nano_cpus(), 500_000_000);
        assert_eq!(cfg.session_ttl, Duration::from_secs(300));
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn garbage_numbers_fall_back_but_bad_addr_fails() {
        let cfg = config(&[("SANDCASTLE_BUILD_WORKERS", "many"), ("SANDCASTLE_CONTAINER_CPUS", "-1")])
            .unwrap();
        assert_eq!(cfg.build_workers, 4);
        assert_eq!(cfg.container_cpus, 2.0);

        let err = config(&[("SANDCASTLE_ADDR", "nowhere")]).unwrap_err();
        assert!(err.to_string().contains("SANDCASTLE_ADDR"));
    }

    #[test]
    fn memory_sizes() {
        assert_eq!(parse_memory("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("256MB"), Some(256 * 1024 * 1024));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("0"), None);
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory(""), None);
    }
}
