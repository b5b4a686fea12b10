//! External service clients: captcha solving and email verification.
//!
//! Both services sit behind traits so the job engine can run against
//! scripted fakes in tests, and the daemon degrades per-action (not at
//! startup) when a service is not configured. The HTTP clients follow the
//! same submit-then-poll shape: enqueue work, then poll a result endpoint
//! at a bounded interval until it resolves or the attempt budget runs out.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const MAX_POLL_ATTEMPTS: u32 = 24;

/// Solves captchas found on broker pages.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Submit a captcha and wait for the solved token.
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<String>;
}

/// Provides disposable addresses and retrieves confirmation links.
#[async_trait]
pub trait EmailVerifier: Send + Sync {
    /// Generate a fresh address dedicated to one opt-out.
    async fn generate_address(&self) -> Result<String>;
    /// Wait for the confirmation link sent to `email`.
    async fn poll_confirmation_link(&self, email: &str, polling_seconds: u64) -> Result<String>;
}

fn service_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

// ── Captcha ───────────────────────────────

#[derive(Deserialize)]
struct CaptchaSubmitResponse {
    transaction_id: String,
}

#[derive(Deserialize)]
struct CaptchaResultResponse {
    status: String,
    #[serde(default)]
    token: Option<String>,
}

/// HTTP captcha-solving client.
pub struct HttpCaptchaSolver {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpCaptchaSolver {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: service_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl CaptchaSolver for HttpCaptchaSolver {
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<String> {
        let submit: CaptchaSubmitResponse = self
            .client
            .post(format!("{}/submit", self.base_url))
            .json(&serde_json::json!({ "siteKey": site_key, "pageUrl": page_url }))
            .send()
            .await
            .context("captcha submit request failed")?
            .error_for_status()
            .context("captcha submit rejected")?
            .json()
            .await
            .context("captcha submit response malformed")?;

        for _ in 0..MAX_POLL_ATTEMPTS {
            tokio::time::sleep(self.poll_interval).await;
            let result: CaptchaResultResponse = self
                .client
                .get(format!("{}/result/{}", self.base_url, submit.transaction_id))
                .send()
                .await
                .context("captcha poll request failed")?
                .error_for_status()
                .context("captcha poll rejected")?
                .json()
                .await
                .context("captcha poll response malformed")?;

            match result.status.as_str() {
                "solved" => {
                    return result
                        .token
                        .ok_or_else(|| anyhow::anyhow!("captcha solved without token"))
                }
                "failed" => bail!("captcha service could not solve the challenge"),
                _ => continue,
            }
        }
        bail!("captcha not solved within the polling budget")
    }
}

// ── Email verification ────────────────────

#[derive(Deserialize)]
struct AddressResponse {
    email: String,
}

#[derive(Deserialize)]
struct LinkResponse {
    #[serde(default)]
    link: Option<String>,
}

/// HTTP email-verification client.
pub struct HttpEmailVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmailVerifier {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: service_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EmailVerifier for HttpEmailVerifier {
    async fn generate_address(&self) -> Result<String> {
        let response: AddressResponse = self
            .client
            .post(format!("{}/addresses", self.base_url))
            .send()
            .await
            .context("address generation request failed")?
            .error_for_status()
            .context("address generation rejected")?
            .json()
            .await
            .context("address response malformed")?;
        Ok(response.email)
    }

    async fn poll_confirmation_link(&self, email: &str, polling_seconds: u64) -> Result<String> {
        let interval = Duration::from_secs(polling_seconds.max(1));
        for _ in 0..MAX_POLL_ATTEMPTS {
            tokio::time::sleep(interval).await;
            let response = self
                .client
                .get(format!("{}/links", self.base_url))
                .query(&[("email", email)])
                .send()
                .await
                .context("confirmation-link poll failed")?;

            // 404 means no email yet, keep polling.
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            let body: LinkResponse = response
                .error_for_status()
                .context("confirmation-link poll rejected")?
                .json()
                .await
                .context("confirmation-link response malformed")?;
            if let Some(link) = body.link {
                return Ok(link);
            }
        }
        bail!("confirmation email did not arrive within the polling budget")
    }
}

// ── Noop fallbacks ────────────────────────

/// Used when no captcha service is configured. Jobs whose scripts need a
/// captcha fail with a retryable error; everything else is unaffected.
pub struct NoopCaptchaSolver;

#[async_trait]
impl CaptchaSolver for NoopCaptchaSolver {
    async fn solve(&self, _site_key: &str, _page_url: &str) -> Result<String> {
        bail!("no captcha service configured")
    }
}

/// Used when no email service is configured.
pub struct NoopEmailVerifier;

#[async_trait]
impl EmailVerifier for NoopEmailVerifier {
    async fn generate_address(&self) -> Result<String> {
        bail!("no email service configured")
    }
    async fn poll_confirmation_link(&self, _email: &str, _polling_seconds: u64) -> Result<String> {
        bail!("no email service configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_captcha_submit_then_poll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "transaction_id": "tx-1" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/result/tx-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "status": "solved", "token": "tok-abc" }),
            ))
            .mount(&server)
            .await;

        let solver = HttpCaptchaSolver::new(&server.uri())
            .with_poll_interval(Duration::from_millis(10));
        let token = solver.solve("sitekey-1", "https://example.com/optout").await.unwrap();
        assert_eq!(token, "tok-abc");
    }

    #[tokio::test]
    async fn test_captcha_failed_status_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "transaction_id": "tx-2" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/result/tx-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "failed" })),
            )
            .mount(&server)
            .await;

        let solver = HttpCaptchaSolver::new(&server.uri())
            .with_poll_interval(Duration::from_millis(10));
        let err = solver.solve("sitekey-1", "https://example.com").await.unwrap_err();
        assert!(err.to_string().contains("could not solve"));
    }

    #[tokio::test]
    async fn test_email_generate_and_poll_link() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/addresses"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "email": "x1@drop.example" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/links"))
            .and(query_param("email", "x1@drop.example"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "link": "https://example.com/confirm?t=1" }),
            ))
            .mount(&server)
            .await;

        let verifier = HttpEmailVerifier::new(&server.uri());
        let email = verifier.generate_address().await.unwrap();
        assert_eq!(email, "x1@drop.example");
        let link = verifier.poll_confirmation_link(&email, 1).await.unwrap();
        assert_eq!(link, "https://example.com/confirm?t=1");
    }

    #[tokio::test]
    async fn test_noop_services_error() {
        assert!(NoopCaptchaSolver.solve("k", "u").await.is_err());
        assert!(NoopEmailVerifier.generate_address().await.is_err());
    }
}
