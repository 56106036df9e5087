//! Controller configuration from environment variables.

use crate::error::ControllerError;
use crate::placement::PlacementStrategy;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_CONCURRENCY: u16 = 10;
const DEFAULT_RESYNC_PERIOD_SECS: u64 = 600;
const DEFAULT_METRICS_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Runtime settings of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Concurrent MicrovmMachine reconciliations
    pub machine_concurrency: u16,
    /// Concurrent MicrovmCluster and ExternalLoadBalancer reconciliations
    pub cluster_concurrency: u16,
    /// Requeue period for resources that reconciled cleanly
    pub resync_period: Duration,
    /// Proxy used for every microvm host unless the cluster sets its own
    pub microvm_proxy: Option<String>,
    /// How machines without a failure domain are spread over hosts
    pub placement_strategy: PlacementStrategy,
    /// Address of the metrics and health endpoint
    pub metrics_bind_address: SocketAddr,
}

impl ControllerSettings {
    /// Reads settings from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads settings through `lookup`, which returns the value of a variable if set
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let machine_concurrency = parse_or(
            non_empty("MACHINE_CONCURRENCY"),
            "MACHINE_CONCURRENCY",
            DEFAULT_CONCURRENCY,
        )?;
        let cluster_concurrency = parse_or(
            non_empty("CLUSTER_CONCURRENCY"),
            "CLUSTER_CONCURRENCY",
            DEFAULT_CONCURRENCY,
        )?;
        if machine_concurrency == 0 || cluster_concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "MACHINE_CONCURRENCY and CLUSTER_CONCURRENCY must be greater than zero".to_string(),
            ));
        }

        let resync_secs = parse_or(
            non_empty("RESYNC_PERIOD_SECS"),
            "RESYNC_PERIOD_SECS",
            DEFAULT_RESYNC_PERIOD_SECS,
        )?;

        let microvm_proxy = non_empty("MICROVM_PROXY");
        if let Some(proxy) = &microvm_proxy {
            reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
                ControllerError::InvalidConfig(format!("MICROVM_PROXY {} is invalid: {}", proxy, e))
            })?;
        }

        let placement_strategy = match non_empty("PLACEMENT_STRATEGY") {
            Some(value) => value.parse()?,
            None => PlacementStrategy::default(),
        };

        let bind = non_empty("METRICS_BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_METRICS_BIND_ADDRESS.to_string());
        let metrics_bind_address = bind.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("METRICS_BIND_ADDRESS {} is invalid: {}", bind, e))
        })?;

        Ok(Self {
            namespace: non_empty("WATCH_NAMESPACE"),
            machine_concurrency,
            cluster_concurrency,
            resync_period: Duration::from_secs(resync_secs),
            microvm_proxy,
            placement_strategy,
            metrics_bind_address,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{} must be a number, got {}: {}", key, raw, e))
        }),
        None => Ok(default),
    }
}
