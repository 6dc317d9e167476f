//! Hub configuration.
//!
//! Environment variables are the sole config source. Buffer sizes, timers,
//! and batching windows are compile-time constants next to the code they
//! tune; only deployment-varying knobs live here.

use banter_protocol::snowflake::MAX_NODE_ID;

/// Error produced while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address for the websocket + health + metrics surface.
    pub bind_addr: String,
    /// Per-user inbound frame budget, per minute.
    pub rate_limit_per_minute: u32,
    /// Comma-separated durable-log brokers.
    pub kafka_brokers: String,
    /// Snowflake node id (0–1023); unique per process in a deployment.
    pub machine_id: u16,
    /// Cache + rate limiter backend.
    pub redis_url: String,
    /// Subscribe pool size.
    pub subscribe_workers: usize,
    /// Bypass the server-membership check. For test/demo deployments only;
    /// joins are still validated for shape and room kind.
    pub allow_all_server_members: bool,
}

impl HubConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(HubConfig {
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8080"),
            rate_limit_per_minute: parse_var("RATE_LIMIT_PER_MINUTE", 60)?,
            kafka_brokers: var_or("KAFKA_BROKERS", "localhost:9092"),
            machine_id: parse_machine_id()?,
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            subscribe_workers: parse_var("SUBSCRIBE_WORKERS", 10)?,
            allow_all_server_members: parse_var("ALLOW_ALL_SERVER_MEMBERS", false)?,
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

fn parse_machine_id() -> Result<u16, ConfigError> {
    let id: u16 = parse_var("MACHINE_ID", 0)?;
    if id > MAX_NODE_ID {
        return Err(ConfigError::Invalid {
            var: "MACHINE_ID",
            value: id.to_string(),
        });
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other under the parallel test runner.
    #[test]
    fn config_reads_defaults_overrides_and_rejects_bad_values() {
        let config = HubConfig::from_env().expect("defaults parse");
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.machine_id, 0);
        assert_eq!(config.subscribe_workers, 10);
        assert!(!config.allow_all_server_members);

        unsafe {
            std::env::set_var("RATE_LIMIT_PER_MINUTE", "120");
            std::env::set_var("MACHINE_ID", "7");
            std::env::set_var("ALLOW_ALL_SERVER_MEMBERS", "true");
        }
        let config = HubConfig::from_env().expect("overrides parse");
        assert_eq!(config.rate_limit_per_minute, 120);
        assert_eq!(config.machine_id, 7);
        assert!(config.allow_all_server_members);

        unsafe { std::env::set_var("MACHINE_ID", "1024") };
        assert!(HubConfig::from_env().is_err(), "node id above 1023 must be rejected");

        unsafe {
            std::env::remove_var("RATE_LIMIT_PER_MINUTE");
            std::env::remove_var("MACHINE_ID");
            std::env::remove_var("ALLOW_ALL_SERVER_MEMBERS");
        }
    }
}
