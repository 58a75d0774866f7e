//! Client for the operator's Availability Gateway.
//!
//! This crate provides a typed façade over the gateway's HTTPS API: batch
//! data retrieval, head queries and signature submission, with mutual-TLS
//! transport and capped exponential backoff on transient failures. The
//! client is stateless between calls.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use state::{BatchDataJson, Profile, StateError, StateUpdate};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by gateway calls.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Network fault, timeout or 5xx; retried by the client's policy and
    /// safe to retry again at a higher level.
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// A structural (4xx) rejection; never retried.
    #[error("gateway rejected request with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
    #[error("tls configuration: {0}")]
    Tls(String),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Outcome of polling for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPoll {
    Available(StateUpdate),
    /// The gateway has not published this batch yet; poll again later.
    NotYetAvailable,
}

/// The gateway operations the committee loop depends on. Production uses
/// [`AvailabilityGatewayClient`]; tests substitute scripted fakes.
#[allow(async_fn_in_trait)]
pub trait AvailabilityGateway {
    async fn get_batch_data(&self, batch_id: i64) -> Result<BatchPoll, GatewayError>;

    /// The operator's current head batch id; may decrease after a reorg.
    async fn get_last_batch_id(&self) -> Result<i64, GatewayError>;

    async fn send_signature(
        &self,
        batch_id: i64,
        signature: &str,
        member_key: &str,
        claim_hash: &str,
    ) -> Result<(), GatewayError>;
}

/// Backoff parameters for transient gateway failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay)
    }
}

#[derive(Serialize)]
struct CommitteeSignature<'a> {
    batch_id: i64,
    signature: &'a str,
    member_key: &'a str,
    claim_hash: &'a str,
}

/// HTTPS client for the availability gateway.
pub struct AvailabilityGatewayClient {
    client: reqwest::Client,
    base_url: String,
    profile: Profile,
    retry: RetryPolicy,
}

impl AvailabilityGatewayClient {
    /// Creates a client. When `certificates_path` is given it must contain
    /// `user.crt`, `user.key` and `server.crt`; the server certificate is
    /// pinned as the only trusted root.
    pub fn new(
        endpoint: impl Into<String>,
        profile: Profile,
        request_timeout: Duration,
        certificates_path: Option<&Path>,
        retry: RetryPolicy,
    ) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder()
            .timeout(request_timeout)
            .use_rustls_tls();

        if let Some(dir) = certificates_path {
            let read = |name: &str| {
                std::fs::read(dir.join(name))
                    .map_err(|e| GatewayError::Tls(format!("reading {name}: {e}")))
            };
            let mut identity_pem = read("user.crt")?;
            identity_pem.extend_from_slice(&read("user.key")?);
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| GatewayError::Tls(e.to_string()))?;
            let server_cert = reqwest::Certificate::from_pem(&read("server.crt")?)
                .map_err(|e| GatewayError::Tls(e.to_string()))?;
            builder = builder
                .identity(identity)
                .add_root_certificate(server_cert)
                .tls_built_in_root_certs(false);
        }

        let client = builder
            .build()
            .map_err(|e| GatewayError::Tls(e.to_string()))?;
        let base_url = endpoint.into().trim_end_matches('/').to_string();
        info!("Using {base_url} as availability gateway");

        Ok(Self {
            client,
            base_url,
            profile,
            retry,
        })
    }

    /// Sends one request, classifying the response: 2xx yields the body,
    /// 5xx and transport faults are transient, anything else is structural.
    async fn send_once(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<String, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if status.is_success() {
            Ok(body)
        } else if status.is_server_error() {
            Err(GatewayError::Transient(format!("{status}: {body}")))
        } else {
            Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Runs a request through the retry policy.
    async fn send_with_retries(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
        uri: &str,
    ) -> Result<String, GatewayError> {
        let mut attempt = 0;
        loop {
            match self.send_once(build(&self.client)).await {
                Err(GatewayError::Transient(reason))
                    if attempt + 1 < self.retry.max_attempts =>
                {
                    let delay = self.retry.delay(attempt);
                    warn!(uri, attempt, ?delay, "gateway request failed: {reason}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn get(&self, uri: &str) -> Result<String, GatewayError> {
        let url = format!("{}{uri}", self.base_url);
        debug!("GET {url}");
        self.send_with_retries(|client| client.get(&url), uri).await
    }

    /// Liveness probe.
    pub async fn is_alive(&self) -> Result<(), GatewayError> {
        self.get("/availability_gateway/is_alive").await?;
        Ok(())
    }
}

/// Decodes a `get_batch_data` body: a JSON `null` payload means the batch
/// is not yet available.
pub fn parse_batch_poll(body: &str, profile: Profile) -> Result<BatchPoll, GatewayError> {
    let raw: Option<BatchDataJson> = serde_json::from_str(body)
        .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
    match raw {
        Some(raw) => Ok(BatchPoll::Available(profile.parse_batch_data(&raw)?)),
        None => Ok(BatchPoll::NotYetAvailable),
    }
}

impl AvailabilityGateway for AvailabilityGatewayClient {
    async fn get_batch_data(&self, batch_id: i64) -> Result<BatchPoll, GatewayError> {
        let body = self
            .get(&format!(
                "/availability_gateway/get_batch_data?batch_id={batch_id}"
            ))
            .await?;
        parse_batch_poll(&body, self.profile)
    }

    async fn get_last_batch_id(&self) -> Result<i64, GatewayError> {
        let body = self.get("/availability_gateway/get_last_batch_id").await?;
        body.trim()
            .parse()
            .map_err(|_| GatewayError::InvalidResponse(format!("not a batch id: {body}")))
    }

    async fn send_signature(
        &self,
        batch_id: i64,
        signature: &str,
        member_key: &str,
        claim_hash: &str,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/availability_gateway/approve_new_roots", self.base_url);
        let payload = CommitteeSignature {
            batch_id,
            signature,
            member_key,
            claim_hash,
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        self.send_with_retries(
            |client| {
                client
                    .post(&url)
                    .header("content-type", "application/json")
                    .body(body.clone())
            },
            "/availability_gateway/approve_new_roots",
        )
        .await?;
        debug!("Signature for batch {batch_id} accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_batch_poll_null_means_not_yet_available() {
        let poll = parse_batch_poll("null", Profile::StarkEx).unwrap();
        assert_eq!(poll, BatchPoll::NotYetAvailable);
    }

    #[test]
    fn test_parse_batch_poll_available() {
        let body = json!({
            "batch_id": 0,
            "reference_batch_id": -1,
            "prev_batch_root": "00".repeat(32),
            "next_batch_root": "11".repeat(32),
            "order_root": "22".repeat(32),
            "update_entries": [[1, "0x5", "0x6", 42]],
            "order_entries": [],
        })
        .to_string();

        match parse_batch_poll(&body, Profile::StarkEx).unwrap() {
            BatchPoll::Available(update) => {
                assert_eq!(update.batch_id, 0);
                assert_eq!(update.reference_batch_id, -1);
                assert_eq!(update.state_delta.len(), 1);
            }
            BatchPoll::NotYetAvailable => panic!("expected available batch"),
        }
    }

    #[test]
    fn test_parse_batch_poll_rejects_garbage() {
        let err = parse_batch_poll("not json", Profile::StarkEx).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(retry.delay(0), Duration::from_secs(1));
        assert_eq!(retry.delay(3), Duration::from_secs(8));
        assert_eq!(retry.delay(9), Duration::from_secs(30));
    }

    #[test]
    fn test_signature_payload_shape() {
        let payload = CommitteeSignature {
            batch_id: 3,
            signature: "0xsig",
            member_key: "0xkey",
            claim_hash: "0xclaim",
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({
                "batch_id": 3,
                "signature": "0xsig",
                "member_key": "0xkey",
                "claim_hash": "0xclaim",
            })
        );
    }
}
