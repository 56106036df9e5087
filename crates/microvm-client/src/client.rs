//! MicroVM service HTTP client
//!
//! Talks to the service's HTTP/JSON gateway:
//! - `POST   /v1alpha1/microvm`
//! - `GET    /v1alpha1/microvm/{namespace}/{id}`
//! - `DELETE /v1alpha1/microvm/{namespace}/{id}`

use crate::error::MicrovmError;
use crate::microvm_trait::{MicrovmClientFactory, MicrovmClientTrait};
use crate::models::{CreateMicroVmRequest, MicroVm, MicroVmResponse, MicroVmSpec};
use crate::options::ClientOptions;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

/// Client for the microvm service on one host
#[derive(Debug)]
pub struct MicrovmClient {
    client: Client,
    endpoint: String,
    base_url: String,
    auth_header: Option<String>,
}

impl MicrovmClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `endpoint` - host endpoint including port (e.g., "10.0.0.1:9090"); a scheme
    ///   is added unless one is present
    /// * `options` - proxy, basic auth and TLS settings for this host
    pub fn new(endpoint: &str, options: &ClientOptions) -> Result<Self, MicrovmError> {
        let mut builder = Client::builder().timeout(options.timeout);

        if let Some(proxy) = &options.proxy {
            debug!("Using proxy {} for microvm host {}", proxy, endpoint);
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }

        let scheme = match &options.tls {
            Some(tls) => {
                let identity_pem = format!("{}\n{}", tls.cert.trim_end(), tls.key);
                let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
                    .map_err(|e| MicrovmError::Tls(format!("client certificate: {}", e)))?;
                let ca = reqwest::Certificate::from_pem(tls.ca_cert.as_bytes())
                    .map_err(|e| MicrovmError::Tls(format!("CA certificate: {}", e)))?;
                builder = builder
                    .use_rustls_tls()
                    .identity(identity)
                    .add_root_certificate(ca);
                "https"
            }
            None => "http",
        };

        let client = builder.build()?;

        let trimmed = endpoint.trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("{}://{}", scheme, trimmed)
        };

        let auth_header = options
            .basic_auth_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(|token| format!("Basic {}", STANDARD.encode(token)));

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            base_url,
            auth_header,
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn microvm_url(&self, namespace: &str, id: &str) -> String {
        format!("{}/v1alpha1/microvm/{}/{}", self.base_url, namespace, id)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        match &self.auth_header {
            Some(header) => request.header("Authorization", header),
            None => request,
        }
    }

    /// Maps non-success responses to typed errors
    async fn check_status(response: Response, what: &str) -> Result<Response, MicrovmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(MicrovmError::NotFound(format!("{}: {}", what, body))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                MicrovmError::Authentication(format!("{}: {} - {}", what, status, body)),
            ),
            StatusCode::BAD_REQUEST => Err(MicrovmError::InvalidRequest(format!(
                "{}: {}",
                what, body
            ))),
            _ => Err(MicrovmError::Api(format!("{}: {} - {}", what, status, body))),
        }
    }

    async fn decode(response: Response) -> Result<MicroVm, MicrovmError> {
        let text = response.text().await?;
        let decoded: MicroVmResponse = serde_json::from_str(&text).map_err(|e| {
            MicrovmError::Api(format!(
                "error decoding response body: {} - Response (first 500 chars): {}",
                e,
                text.chars().take(500).collect::<String>()
            ))
        })?;
        Ok(decoded.microvm)
    }
}

#[async_trait::async_trait]
impl MicrovmClientTrait for MicrovmClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_microvm(&self, spec: MicroVmSpec) -> Result<MicroVm, MicrovmError> {
        let url = format!("{}/v1alpha1/microvm", self.base_url);
        let what = format!("creating microvm {}/{}", spec.namespace, spec.id);
        debug!("POST {}", url);

        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&CreateMicroVmRequest { microvm: spec })
            .send()
            .await?;

        let response = Self::check_status(response, &what).await?;
        Self::decode(response).await
    }

    async fn get_microvm(&self, namespace: &str, id: &str) -> Result<MicroVm, MicrovmError> {
        let url = self.microvm_url(namespace, id);
        debug!("GET {}", url);

        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let what = format!("microvm {}/{}", namespace, id);
        let response = Self::check_status(response, &what).await?;
        Self::decode(response).await
    }

    async fn delete_microvm(&self, namespace: &str, id: &str) -> Result<(), MicrovmError> {
        let url = self.microvm_url(namespace, id);
        debug!("DELETE {}", url);

        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        let what = format!("deleting microvm {}/{}", namespace, id);
        Self::check_status(response, &what).await?;
        Ok(())
    }
}

/// Factory building a [`MicrovmClient`] per host
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpClientFactory;

impl MicrovmClientFactory for HttpClientFactory {
    fn client_for(
        &self,
        endpoint: &str,
        options: ClientOptions,
    ) -> Result<Box<dyn MicrovmClientTrait>, MicrovmError> {
        Ok(Box::new(MicrovmClient::new(endpoint, &options)?))
    }
}
