//! Environment variable names used by this crate for convenient
//! configuration from services.
//!
//! These are purely helpers; the core types remain decoupled from
//! environment access.

use crate::backend::{registry_from_dsns_for_service, BackendBuildError};
use crate::config::DispatchConfig;
use crate::error::ConfigError;
use crate::level::Level;
use crate::queue::OverloadPolicy;
use crate::registry::AdapterRegistry;
use std::str::FromStr;

/// Queue capacity, e.g. `4096`.
pub const LOG_DISPATCH_QUEUE_CAPACITY_ENV: &str = "LOG_DISPATCH_QUEUE_CAPACITY";

/// `DROP_NEWEST`, `DROP_OLDEST` or `BLOCK`.
pub const LOG_DISPATCH_OVERLOAD_POLICY_ENV: &str = "LOG_DISPATCH_OVERLOAD_POLICY";

pub const LOG_DISPATCH_BLOCK_TIMEOUT_MILLIS_ENV: &str = "LOG_DISPATCH_BLOCK_TIMEOUT_MILLIS";

/// Minimum level of loggers without a more specific entry.
pub const LOG_DISPATCH_ROOT_LEVEL_ENV: &str = "LOG_DISPATCH_ROOT_LEVEL";

/// Per-namespace minimum levels, e.g. `app::db=warn,io.acme=error`.
pub const LOG_DISPATCH_LEVELS_ENV: &str = "LOG_DISPATCH_LEVELS";

pub const LOG_DISPATCH_FLUSH_DEADLINE_MILLIS_ENV: &str = "LOG_DISPATCH_FLUSH_DEADLINE_MILLIS";

pub const LOG_DISPATCH_FORWARD_TIMEOUT_MILLIS_ENV: &str = "LOG_DISPATCH_FORWARD_TIMEOUT_MILLIS";

/// Comma-separated backend DSNs, see [`crate::backend::parse_dsn`].
pub const LOG_DISPATCH_BACKENDS_ENV: &str = "LOG_DISPATCH_BACKENDS";

/// Optional logical service name attached by backends that support it.
pub const LOG_DISPATCH_SERVICE_NAME_ENV: &str = "LOG_DISPATCH_SERVICE_NAME";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// [`DispatchConfig`] from `LOG_DISPATCH_*` variables; unset variables
/// keep their default.
pub fn config_from_env() -> Result<DispatchConfig, ConfigError> {
    config_from_lookup(|key| std::env::var(key).ok())
}

/// Adapters named by `LOG_DISPATCH_BACKENDS` (default `stdout://`), with
/// `LOG_DISPATCH_SERVICE_NAME` applied to backends that record it.
pub fn registry_from_env() -> Result<AdapterRegistry, BackendBuildError> {
    let backends = env_or(LOG_DISPATCH_BACKENDS_ENV, "stdout://");
    let service_name = std::env::var(LOG_DISPATCH_SERVICE_NAME_ENV).ok();
    registry_from_dsns_for_service(backends.split(','), service_name.as_deref())
}

/// Same as [`config_from_env`] with a custom variable source.
pub fn config_from_lookup<F>(lookup: F) -> Result<DispatchConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DispatchConfig::default();

    if let Some(v) = lookup(LOG_DISPATCH_QUEUE_CAPACITY_ENV) {
        config.queue_capacity = parse("queue_capacity", &v)?;
    }
    if let Some(v) = lookup(LOG_DISPATCH_OVERLOAD_POLICY_ENV) {
        config.overload_policy = parse::<OverloadPolicy>("overload_policy", &v)?;
    }
    if let Some(v) = lookup(LOG_DISPATCH_BLOCK_TIMEOUT_MILLIS_ENV) {
        config.block_timeout_millis = parse("block_timeout_millis", &v)?;
    }
    if let Some(v) = lookup(LOG_DISPATCH_ROOT_LEVEL_ENV) {
        config.root_level = parse::<Level>("root_level", &v)?;
    }
    if let Some(v) = lookup(LOG_DISPATCH_LEVELS_ENV) {
        for directive in v.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let (prefix, level) = directive.split_once('=').ok_or_else(|| ConfigError::Invalid {
                field: "minimum_level_by_logger",
                reason: format!("expected prefix=level, got {:?}", directive),
            })?;
            let level = parse::<Level>("minimum_level_by_logger", level)?;
            config.minimum_level_by_logger.insert(prefix.trim().to_string(), level);
        }
    }
    if let Some(v) = lookup(LOG_DISPATCH_FLUSH_DEADLINE_MILLIS_ENV) {
        config.flush_deadline_millis = parse("flush_deadline_millis", &v)?;
    }
    if let Some(v) = lookup(LOG_DISPATCH_FORWARD_TIMEOUT_MILLIS_ENV) {
        config.forward_timeout_millis = parse("forward_timeout_millis", &v)?;
    }

    config.validate()?;
    Ok(config)
}

fn parse<T>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        assert_eq!(config_from_lookup(lookup(&[])).unwrap(), DispatchConfig::default());
    }

    #[test]
    fn reads_all_variables() {
        let config = config_from_lookup(lookup(&[
            (LOG_DISPATCH_QUEUE_CAPACITY_ENV, "64"),
            (LOG_DISPATCH_OVERLOAD_POLICY_ENV, "drop-newest"),
            (LOG_DISPATCH_ROOT_LEVEL_ENV, "info"),
            (LOG_DISPATCH_LEVELS_ENV, "app::db=warn, io.acme = error"),
            (LOG_DISPATCH_FLUSH_DEADLINE_MILLIS_ENV, "250"),
        ]))
        .unwrap();

        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.overload_policy, OverloadPolicy::DropNewest);
        assert_eq!(config.root_level, Level::Info);
        assert_eq!(config.minimum_level_by_logger["app::db"], Level::Warn);
        assert_eq!(config.minimum_level_by_logger["io.acme"], Level::Error);
        assert_eq!(config.flush_deadline_millis, 250);
    }

    #[test]
    fn reports_the_offending_field() {
        let err = config_from_lookup(lookup(&[(LOG_DISPATCH_QUEUE_CAPACITY_ENV, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "queue_capacity", .. }));

        let err = config_from_lookup(lookup(&[(LOG_DISPATCH_LEVELS_ENV, "app")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "minimum_level_by_logger", .. }));
    }
}
