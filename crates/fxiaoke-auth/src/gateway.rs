//! Open-API gateway exchange
//!
//! Every gateway call is a JSON POST (or a bare GET) that answers with the
//! same envelope: `{"errorCode": int, "errorMessage": string, ...payload}`.
//! This module owns the transport concerns (base URL, timeout, TLS mode) and
//! the envelope decoding; it never interprets `errorCode`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::{CODE_OK, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_SECS};
use crate::credentials::AppCredential;
use crate::error::{Error, Result};

/// Response envelope shared by every gateway endpoint.
///
/// Fields other than the error pair are kept in `payload` and decoded on
/// demand with [`UpstreamResponse::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamResponse {
    pub error_code: i64,
    #[serde(default)]
    pub error_message: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl UpstreamResponse {
    /// Envelope with only an error pair and no payload.
    pub fn with_code(error_code: i64, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == CODE_OK
    }

    /// Decode the payload into a typed structure.
    ///
    /// A payload that does not match `T` is a malformed response and is
    /// reported as a transport error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            Error::Transport(format!(
                "malformed {} payload: {e}",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// Body of the token issuance call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest<'a> {
    pub app_id: &'a str,
    pub app_secret: &'a str,
    pub permanent_code: &'a str,
}

impl<'a> TokenRequest<'a> {
    pub fn from_credential(credential: &'a AppCredential) -> Self {
        Self {
            app_id: &credential.app_id,
            app_secret: credential.app_secret.expose(),
            permanent_code: credential.permanent_code.expose(),
        }
    }
}

/// Payload of a successful token issuance response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    #[serde(default)]
    pub app_id: Option<String>,
    pub corp_access_token: String,
    pub corp_id: String,
    pub expires_in: u64,
}

/// Body of the probe call used to check a token against the live gateway.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest<'a> {
    pub corp_access_token: &'a str,
    pub corp_id: &'a str,
    pub current_open_user_id: &'a str,
    pub data: &'a Value,
}

/// Serialize a request body into the JSON value handed to `exchange`.
pub fn to_body<T: Serialize>(request: &T) -> Result<Value> {
    serde_json::to_value(request)
        .map_err(|e| Error::Transport(format!("serializing request body: {e}")))
}

/// Abstraction over the gateway so the token manager can be driven by fakes.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn ApiGateway>`).
pub trait ApiGateway: Send + Sync {
    /// POST `body` as JSON to `base_url + path` and decode the envelope.
    fn exchange<'a>(
        &'a self,
        path: &'a str,
        body: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + 'a>>;
}

/// Transport settings for [`HttpGateway`].
///
/// Certificate verification is on unless `danger_accept_invalid_certs` is
/// explicitly set.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub danger_accept_invalid_certs: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            danger_accept_invalid_certs: false,
        }
    }
}

/// reqwest-backed gateway client.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        if config.danger_accept_invalid_certs {
            warn!(
                base_url = %config.base_url,
                "TLS certificate verification disabled for gateway"
            );
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
            .build()
            .map_err(|e| Error::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self::with_client(client, &config.base_url))
    }

    /// Wrap an existing client (shared connection pool, custom middleware).
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// POST a JSON body and decode the response envelope.
    pub async fn post(&self, path: &str, body: &Value) -> Result<UpstreamResponse> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST {path} failed: {e}")))?;
        let envelope = read_envelope(response).await?;
        debug!(path, error_code = envelope.error_code, "gateway exchange completed");
        Ok(envelope)
    }
}

impl ApiGateway for HttpGateway {
    fn exchange<'a>(
        &'a self,
        path: &'a str,
        body: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + 'a>> {
        Box::pin(self.post(path, body))
    }
}

async fn read_envelope(response: reqwest::Response) -> Result<UpstreamResponse> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Transport(format!("reading response body: {e}")))?;
    decode_envelope(status, &body)
}

/// Decode a raw body into the envelope.
///
/// A non-2xx status is tolerated as long as the body is a proper envelope;
/// the gateway reports some business errors that way.
fn decode_envelope(status: reqwest::StatusCode, body: &str) -> Result<UpstreamResponse> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if !status.is_success() => {
            return Err(Error::Transport(format!("gateway returned {status}: {body}")));
        }
        Err(e) => return Err(Error::Transport(format!("malformed response JSON: {e}"))),
    };

    if !value.is_object() {
        if !status.is_success() {
            return Err(Error::Transport(format!("gateway returned {status}: {body}")));
        }
        return Err(Error::InvalidDestination(format!(
            "response envelope must be a JSON object, got {}",
            json_kind(&value)
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| Error::Transport(format!("malformed response envelope: {e}")))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
