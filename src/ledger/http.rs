//! HTTP adapter for the ledger submit/query surface
//!
//! - `POST {base}/submit` with `{"payload": "<hex>"}`
//! - `GET {base}/account/{hex}` returning `{"sequence": N, "balance": M}` or 404
//!
//! Account reads are idempotent and retried with jittered exponential backoff.
//! Submissions are never retried here; that decision belongs to the coordinator.

use super::{classify_rejection, Ledger, LedgerAccount, LedgerError, SubmitOutcome};
use crate::metrics::{metrics, Timer};
use crate::types::AccountId;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

#[derive(Debug, Serialize)]
struct SubmitRequest {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    accepted: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "message")]
    error: Option<String>,
}

impl SubmitResponse {
    fn into_outcome(self) -> SubmitOutcome {
        if self.accepted {
            return SubmitOutcome::Accepted;
        }
        let message = self.error.unwrap_or_else(|| "rejected".to_string());
        SubmitOutcome::Rejected(classify_rejection(self.code.as_deref(), &message))
    }
}

/// Ledger client over HTTP
#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_fetch_retries: usize,
}

impl HttpLedger {
    pub fn new(base_url: &str, timeout: Duration, max_fetch_retries: usize) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport {
                endpoint: base_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            max_fetch_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_reqwest(&self, endpoint: &str, err: reqwest::Error) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout {
                endpoint: endpoint.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            LedgerError::Transport {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }

    async fn fetch_account_once(&self, url: &str) -> Result<Option<LedgerAccount>, LedgerError> {
        let timer = Timer::new();
        let response = self.client.get(url).send().await;
        timer.observe_duration(&metrics().ledger_latency);
        let response = response.map_err(|e| self.map_reqwest(url, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::UnexpectedResponse {
                endpoint: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let account = response
            .json::<LedgerAccount>()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;
        Ok(Some(account))
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    async fn submit(&self, payload: Bytes) -> Result<SubmitOutcome, LedgerError> {
        let url = format!("{}/submit", self.base_url);
        let request = SubmitRequest {
            payload: hex::encode(&payload),
        };

        let timer = Timer::new();
        let response = self.client.post(&url).json(&request).send().await;
        timer.observe_duration(&metrics().ledger_latency);
        let response = response.map_err(|e| self.map_reqwest(&url, e))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::UnexpectedResponse {
                endpoint: url,
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.map_reqwest(&url, e))?;

        let outcome = match serde_json::from_str::<SubmitResponse>(&body) {
            Ok(parsed) if status.is_success() || !parsed.accepted => parsed.into_outcome(),
            Ok(_) => SubmitOutcome::Rejected(classify_rejection(None, &body)),
            Err(_) if status.is_success() => SubmitOutcome::Accepted,
            Err(_) => SubmitOutcome::Rejected(classify_rejection(None, &body)),
        };

        debug!(status = status.as_u16(), outcome = ?outcome, "Ledger submit completed");
        Ok(outcome)
    }

    #[instrument(skip(self), fields(account = %account.short()))]
    async fn get_account(&self, account: &AccountId) -> Result<Option<LedgerAccount>, LedgerError> {
        let url = format!("{}/account/{}", self.base_url, account.to_hex());

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(25)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.max_fetch_retries);

        RetryIf::spawn(
            strategy,
            || self.fetch_account_once(&url),
            |err: &LedgerError| {
                let retry = err.is_retryable();
                if retry {
                    warn!(error = %err, "Account fetch failed, retrying");
                }
                retry
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RejectReason;

    fn account() -> AccountId {
        AccountId::new([7; 32])
    }

    async fn ledger(server: &mockito::ServerGuard) -> HttpLedger {
        HttpLedger::new(&server.url(), Duration::from_secs(2), 2).unwrap()
    }

    #[tokio::test]
    async fn test_get_account_found_and_missing() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", format!("/account/{}", account().to_hex()).as_str())
            .with_status(200)
            .with_body(r#"{"sequence": 12, "balance": 500}"#)
            .create_async()
            .await;
        let missing_id = AccountId::new([8; 32]);
        let missing = server
            .mock("GET", format!("/account/{}", missing_id.to_hex()).as_str())
            .with_status(404)
            .create_async()
            .await;

        let ledger = ledger(&server).await;
        let fetched = ledger.get_account(&account()).await.unwrap();
        assert_eq!(
            fetched,
            Some(LedgerAccount {
                sequence: 12,
                balance: 500
            })
        );
        assert_eq!(ledger.get_account(&missing_id).await.unwrap(), None);

        found.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_account_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", format!("/account/{}", account().to_hex()).as_str())
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let ledger = ledger(&server).await;
        let err = ledger.get_account(&account()).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::UnexpectedResponse { status: 503, .. }
        ));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_calls_are_timed_per_attempt() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", format!("/account/{}", account().to_hex()).as_str())
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let submit = server
            .mock("POST", "/submit")
            .with_status(200)
            .with_body(r#"{"accepted": true}"#)
            .create_async()
            .await;

        let ledger = ledger(&server).await;
        let before = metrics().ledger_latency.get_sample_count();
        ledger.get_account(&account()).await.unwrap_err();
        ledger.submit(Bytes::from_static(b"tx")).await.unwrap();

        // Other tests share the global histogram, so only a lower bound holds
        assert!(metrics().ledger_latency.get_sample_count() >= before + 4);
        failing.assert_async().await;
        submit.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_outcomes() {
        let mut server = mockito::Server::new_async().await;
        let ledger = ledger(&server).await;

        let accepted = server
            .mock("POST", "/submit")
            .with_status(200)
            .with_body(r#"{"accepted": true}"#)
            .create_async()
            .await;
        assert_eq!(
            ledger.submit(Bytes::from_static(b"tx")).await.unwrap(),
            SubmitOutcome::Accepted
        );
        accepted.remove_async().await;

        let mismatch = server
            .mock("POST", "/submit")
            .with_status(400)
            .with_body(r#"{"accepted": false, "error": "invalid nonce"}"#)
            .create_async()
            .await;
        assert_eq!(
            ledger.submit(Bytes::from_static(b"tx")).await.unwrap(),
            SubmitOutcome::Rejected(RejectReason::SequenceMismatch("invalid nonce".to_string()))
        );
        mismatch.remove_async().await;

        let other = server
            .mock("POST", "/submit")
            .with_status(200)
            .with_body(r#"{"accepted": false, "code": "insufficient_funds", "error": "balance too low"}"#)
            .create_async()
            .await;
        assert_eq!(
            ledger.submit(Bytes::from_static(b"tx")).await.unwrap(),
            SubmitOutcome::Rejected(RejectReason::Other("balance too low".to_string()))
        );
        other.remove_async().await;
    }

    #[tokio::test]
    async fn test_submit_server_error_is_transport_failure() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/submit")
            .with_status(502)
            .create_async()
            .await;

        let ledger = ledger(&server).await;
        let err = ledger.submit(Bytes::from_static(b"tx")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
