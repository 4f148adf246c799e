// Platform REST client
//
// Wraps `reqwest::Client` with URL construction, envelope unwrapping, a
// single retry for transient failures and cooperative cancellation. The
// endpoint methods live in `device.rs` and `service.rs` as inherent impls.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, warn};
use url::Url;

use crate::error::ApiError;
use crate::platform::models::Envelope;
use crate::transport::TransportConfig;

/// Number of extra attempts for a transient failure.
const TRANSIENT_RETRIES: usize = 1;

/// HTTP client for the ThingsPanel platform API.
///
/// Cheap to clone; clones share the connection pool and cancellation token.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    cancel: CancellationToken,
    span: Span,
}

impl PlatformClient {
    /// Create a client for `base_url` (e.g. `http://platform:9999`).
    ///
    /// Trailing slashes are dropped so endpoint paths join cleanly.
    pub fn new(base_url: &str, transport: &TransportConfig) -> Result<Self, ApiError> {
        let http = transport.build_client()?;
        let mut client = Self::from_reqwest(base_url, http)?;
        client.timeout = transport.timeout;
        Ok(client)
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn from_reqwest(base_url: &str, http: reqwest::Client) -> Result<Self, ApiError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        Url::parse(trimmed)?;
        Ok(Self {
            http,
            base_url: trimmed.to_owned(),
            timeout: crate::transport::DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
            span: Span::none(),
        })
    }

    /// Replace the cancellation token. Cancelling it abandons every
    /// in-flight and future request made through this client.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach a tracing span that request futures run inside.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// POST `body` as JSON and return the raw response text of a 2xx answer.
    ///
    /// Connection failures and timeouts are retried once; anything the
    /// platform actually answered is returned as-is.
    pub(crate) async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, ApiError> {
        let url = self.url(path);
        let mut attempt = 0;
        loop {
            let result = self.post_once(&url, body).instrument(self.span.clone()).await;
            match result {
                Err(e) if e.is_transient() && attempt < TRANSIENT_RETRIES => {
                    if self.cancel.is_cancelled() {
                        return Err(ApiError::Cancelled);
                    }
                    attempt += 1;
                    warn!(parent: &self.span, url = %url, error = %e, "transient failure, retrying");
                }
                other => return other,
            }
        }
    }

    async fn post_once<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<String, ApiError> {
        if self.cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        debug!("POST {}", url);

        let request = async {
            let resp = self
                .http
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| self.map_transport(e))?;

            let status = resp.status();
            let text = resp.text().await.map_err(|e| self.map_transport(e))?;

            if status.is_success() {
                Ok(text)
            } else {
                debug!(status = status.as_u16(), "platform returned error status");
                Err(ApiError::HttpStatus {
                    status: status.as_u16(),
                    body: text,
                })
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ApiError::Cancelled),
            result = request => result,
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            ApiError::Network(err)
        }
    }

    /// Decode a response body that may or may not be wrapped in the
    /// platform envelope.
    pub(crate) fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
        let decode_err = |e: serde_json::Error| ApiError::DecodeFailure {
            message: e.to_string(),
            body: body.to_owned(),
        };

        let value: Value = serde_json::from_str(body).map_err(decode_err)?;
        if !Envelope::detect(&value) {
            return serde_json::from_value(value).map_err(decode_err);
        }

        let envelope: Envelope = serde_json::from_value(value).map_err(decode_err)?;
        if envelope.code != Envelope::OK {
            return Err(ApiError::Rejected {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        let data = envelope.data.ok_or_else(|| ApiError::DecodeFailure {
            message: "envelope has no data".into(),
            body: body.to_owned(),
        })?;
        serde_json::from_value(data).map_err(decode_err)
    }

    /// POST and decode, keeping the raw body for the success message.
    pub(crate) async fn call<B, T>(&self, path: &str, body: &B) -> Result<(String, T), ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let raw = self.post_json(path, body).await?;
        let data = Self::decode(&raw)?;
        Ok((raw, data))
    }
}
