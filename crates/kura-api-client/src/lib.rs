//! HTTP client for the kura metadata service.
//!
//! Provides a minimal client with optional bearer auth, generic GET/POST helpers, and the
//! domain calls the upload pipeline needs (upload slots, file registration, collection diff).
//! The uploader talks to it through the [`RemoteApi`] trait.

pub mod api;
pub mod error;

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

pub use api::RemoteApi;
pub use error::{ApiError, ApiResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for the metadata service.
#[derive(Clone, Debug)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> ApiResult<Self> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Build from `api_endpoint` and `auth_token` of the uploader configuration.
    pub fn from_config(config: &kura_core::UploaderConfig) -> ApiResult<Self> {
        Self::new(config.api_endpoint.clone(), config.auth_token.clone())
    }

    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn apply_auth(&self, request: RequestBuilder) -> ApiResult<RequestBuilder> {
        match &self.token {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Err(ApiError::NoToken),
        }
    }

    /// Authenticated GET with query parameters. Deserializes the JSON response.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ApiResult<T> {
        let mut request = self.apply_auth(self.client.get(self.build_url(path)))?;
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await?;
        parse_json(check_status(response).await?).await
    }

    /// Authenticated POST with a JSON body. Deserializes the JSON response.
    pub async fn post_json<T: DeserializeOwned, B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let request = self.apply_auth(self.client.post(self.build_url(path)).json(body))?;

        let response = request.send().await?;
        parse_json(check_status(response).await?).await
    }
}

async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}
