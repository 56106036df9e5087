//! Per-host client options

use std::time::Duration;

/// Default timeout of a single service call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection options for one microvm service host
#[derive(Clone)]
pub struct ClientOptions {
    /// Proxy URL used for all requests
    pub proxy: Option<String>,

    /// Basic auth token, sent as `Authorization: Basic <base64(token)>`
    pub basic_auth_token: Option<String>,

    /// Mutual TLS material; enables `https`
    pub tls: Option<TlsConfig>,

    /// Timeout of a single request
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            basic_auth_token: None,
            tls: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

// Tokens and keys stay out of logs.
impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("proxy", &self.proxy)
            .field("basic_auth_token", &self.basic_auth_token.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// PEM-encoded client certificate, key and CA certificate
#[derive(Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Client certificate
    pub cert: String,
    /// Client private key
    pub key: String,
    /// CA certificate used to verify the host
    pub ca_cert: String,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("cert", &format!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .field("ca_cert", &format!("{} bytes", self.ca_cert.len()))
            .finish()
    }
}
