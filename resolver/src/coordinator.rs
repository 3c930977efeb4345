//! HTTP client for the coordinator's relayer API.
//!
//! The orchestrator talks to the coordinator through the
//! [`CoordinatorApi`] trait so swap flows can run against a scripted
//! coordinator in tests.

use async_trait::async_trait;
use hashlock::Bytes32;
use swap_protocols::{ErrorBody, Order, ProgressRequest, RequestSecretRequest, RequestSecretResponse};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("coordinator request failed: {0}")]
    Http(String),
    #[error("coordinator rejected the request: {code}: {message}")]
    Api { code: String, message: String },
}

/// Outcome of a secret request: released, or still awaiting
/// verification (retryable).
#[derive(Debug, Clone)]
pub enum SecretOutcome {
    Released {
        secret: Bytes32,
        merkle_proof: Option<Vec<Bytes32>>,
    },
    Pending(String),
}

#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn get_order(&self, order_id: &str) -> Result<Order, ClientError>;
    async fn request_secret(
        &self,
        order_id: &str,
        request: &RequestSecretRequest,
    ) -> Result<SecretOutcome, ClientError>;
    async fn notify_progress(
        &self,
        order_id: &str,
        request: &ProgressRequest,
    ) -> Result<(), ClientError>;
}

/// Production client over the coordinator HTTP API.
pub struct CoordinatorClient {
    base_url: String,
    client: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: &str) -> Self {
        CoordinatorClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn error_body(response: reqwest::Response) -> ClientError {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => ClientError::Api {
                code: body.code,
                message: body.message,
            },
            Err(_) => ClientError::Http(format!("coordinator returned {}", status)),
        }
    }
}

#[async_trait]
impl CoordinatorApi for CoordinatorClient {
    async fn get_order(&self, order_id: &str) -> Result<Order, ClientError> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::error_body(response).await);
        }
        response
            .json::<Order>()
            .await
            .map_err(|e| ClientError::Http(format!("malformed order response: {}", e)))
    }

    async fn request_secret(
        &self,
        order_id: &str,
        request: &RequestSecretRequest,
    ) -> Result<SecretOutcome, ClientError> {
        let url = format!("{}/orders/{}/request-secret", self.base_url, order_id);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if response.status().is_success() {
            let body: RequestSecretResponse = response
                .json()
                .await
                .map_err(|e| ClientError::Http(format!("malformed secret response: {}", e)))?;
            return Ok(SecretOutcome::Released {
                secret: body.secret.0,
                merkle_proof: body
                    .merkle_proof
                    .map(|proof| proof.into_iter().map(|p| p.0).collect()),
            });
        }

        let error = Self::error_body(response).await;
        if let ClientError::Api { code, message } = &error {
            if code == "verification_pending" {
                debug!("secret request pending: {}", message);
                return Ok(SecretOutcome::Pending(message.clone()));
            }
        }
        Err(error)
    }

    async fn notify_progress(
        &self,
        order_id: &str,
        request: &ProgressRequest,
    ) -> Result<(), ClientError> {
        let url = format!("{}/orders/{}/progress", self.base_url, order_id);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::error_body(response).await);
        }
        Ok(())
    }
}
