//! Liveness probes of API server endpoints
//!
//! `GET <endpoint>/livez` with a short timeout. Any answer below 500 means the
//! endpoint is reachable; 5xx answers and timeouts mean it is not available.

use crate::error::ControllerError;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Timeout of a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a probe that got an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered below 500
    Available,
    /// The endpoint answered with a server error
    Unavailable {
        /// HTTP status code of the answer
        status: u16,
    },
}

impl ProbeOutcome {
    /// Classifies an HTTP status code
    pub fn from_status(status: u16) -> Self {
        if status >= 500 {
            ProbeOutcome::Unavailable { status }
        } else {
            ProbeOutcome::Available
        }
    }
}

/// Probes endpoints for liveness
///
/// Errors are [`ControllerError::ProbeTimeout`] when no answer arrived in time and
/// [`ControllerError::Probe`] for every other transport failure.
#[async_trait::async_trait]
pub trait EndpointProber: Send + Sync {
    /// Probes `url`
    async fn probe(&self, url: &str) -> Result<ProbeOutcome, ControllerError>;
}

/// [`EndpointProber`] over HTTP(S)
///
/// API servers present certificates signed by the workload cluster's own CA, which
/// the management cluster does not hold; the probe only checks reachability and
/// sends no credentials, so certificates are not verified.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    /// Creates a prober with the default timeout
    pub fn new() -> Result<Self, ControllerError> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    /// Creates a prober with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, ControllerError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ControllerError::InvalidConfig(format!("liveness probe client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl EndpointProber for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeOutcome, ControllerError> {
        debug!("Probing {}", url);
        match self.client.get(url).send().await {
            Ok(response) => Ok(ProbeOutcome::from_status(response.status().as_u16())),
            Err(e) if e.is_timeout() => Err(ControllerError::ProbeTimeout(url.to_string())),
            Err(e) => Err(ControllerError::Probe {
                endpoint: url.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
