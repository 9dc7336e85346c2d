//! Controller configuration.
//!
//! All settings come from environment variables so the controller can be
//! configured from its Deployment manifest.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Accepted range for retry and resync intervals (up to one day).
const INTERVAL_SECS: RangeInclusive<u64> = 1..=86_400;
/// Accepted range for the per-call runtime deadline (up to one hour).
const DRIVER_TIMEOUT_SECS: RangeInclusive<u64> = 1..=3_600;

/// Runtime configuration of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Base URL of the VM runtime agent
    pub runtime_url: String,
    /// Bearer token for the runtime agent
    pub runtime_token: Option<String>,
    /// Namespace to watch (all namespaces when unset)
    pub namespace: Option<String>,
    /// Number of reconciliation workers
    pub workers: usize,
    /// Deadline for each runtime call
    pub driver_timeout: Duration,
    /// First retry delay after a failure
    pub backoff_base: Duration,
    /// Retry delay cap
    pub backoff_max: Duration,
    /// How often converged resources are re-checked
    pub resync_interval: Duration,
    /// Listen address of the health/metrics server
    pub http_addr: SocketAddr,
}

impl ControllerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let runtime_url = lookup("RUNTIME_URL")
            .unwrap_or_else(|| "http://vm-runtime.vm-system:8080".to_string());
        let runtime_token = lookup("RUNTIME_TOKEN").filter(|t| !t.is_empty());
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let workers = parse_number(&lookup, "WORKERS", 4)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKERS must be at least 1".to_string(),
            ));
        }

        let driver_timeout = parse_secs(&lookup, "DRIVER_TIMEOUT_SECS", 120, DRIVER_TIMEOUT_SECS)?;
        let backoff_base = parse_secs(&lookup, "BACKOFF_BASE_SECS", 1, INTERVAL_SECS)?;
        let backoff_max = parse_secs(&lookup, "BACKOFF_MAX_SECS", 300, INTERVAL_SECS)?;
        if backoff_max < backoff_base {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MAX_SECS ({}) must not be below BACKOFF_BASE_SECS ({})",
                backoff_max.as_secs(),
                backoff_base.as_secs()
            )));
        }
        let resync_interval = parse_secs(&lookup, "RESYNC_INTERVAL_SECS", 300, INTERVAL_SECS)?;

        let http_addr = lookup("HTTP_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ControllerError::InvalidConfig(format!("HTTP_ADDR: {}", e)))?;

        Ok(Self {
            runtime_url,
            runtime_token,
            namespace,
            workers,
            driver_timeout,
            backoff_base,
            backoff_max,
            resync_interval,
            http_addr,
        })
    }
}

/// Parse a duration in whole seconds that must fall within `range`.
fn parse_secs<F>(lookup: &F, key: &str, default: u64, range: RangeInclusive<u64>) -> Result<Duration, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_number(lookup, key, default)?;
    if !range.contains(&secs) {
        return Err(ControllerError::InvalidConfig(format!(
            "{} must be between {} and {} seconds, got {}",
            key,
            range.start(),
            range.end(),
            secs
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ControllerError::InvalidConfig(format!("{} ({:?}): {}", key, raw, e))),
        None => Ok(default),
    }
}
