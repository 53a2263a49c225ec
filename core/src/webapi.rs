//! Slack Web API client: single-method POST that passes through the
//! rate limiter before hitting the network. `apps.connections.open`
//! uses the app-level credential instead of the bot token but is
//! admitted through the exact same tier/scope path as every other
//! call — only the credential is special-cased, never the limiter.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::SlackApiError;
use crate::limiter::RateLimiter;
use crate::scope::scope_key;

const BASE_URL: &str = "https://slack.com/api";

pub struct WebApiClient {
    http: reqwest::Client,
    bot_token: String,
    limiter: Arc<dyn RateLimiter>,
}

impl WebApiClient {
    pub fn new(bot_token: impl Into<String>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token: bot_token.into(),
            limiter,
        }
    }

    /// Acquires the tier limiter, then the scope limiter, then issues
    /// the POST. A 429 suspends the tier bucket, blocks the scope, and
    /// is returned to the caller — it is never retried internally.
    pub async fn post(&self, method: &str, body: Value) -> Result<Value, SlackApiError> {
        let token = self.bot_token.clone();
        self.call(method, body, &token).await
    }

    /// Issues `apps.connections.open` with the app-level credential;
    /// admitted through the same tier/scope path as every other call.
    pub async fn open_connection(&self, app_token: &str) -> Result<Value, SlackApiError> {
        self.call("apps.connections.open", serde_json::json!({}), app_token)
            .await
    }

    async fn call(&self, method: &str, body: Value, token: &str) -> Result<Value, SlackApiError> {
        self.limiter.acquire_tier(method, &body).await;

        let key = scope_key(method, &body);
        let (guard, _decision) = self.limiter.acquire_scope(&key).await;

        let result = self.send(method, &body, token).await;

        match &result {
            Ok(_) => {}
            Err(SlackApiError::RateLimited { retry_after }) => {
                self.limiter.suspend_tier(method, &body, *retry_after).await;
                guard.record_rate_limited(*retry_after);
            }
            Err(_) => {}
        }

        result
    }

    async fn send(&self, method: &str, body: &Value, token: &str) -> Result<Value, SlackApiError> {
        let response = self
            .http
            .post(format!("{BASE_URL}/{method}"))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(SlackApiError::Http)?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value, SlackApiError> {
        let retry_after_header = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body: Value = response.json().await.map_err(SlackApiError::Http)?;

        let ok = body.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if ok {
            return Ok(body);
        }

        let error_code = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();

        if error_code == "ratelimited" {
            let retry_after = body
                .get("retry_after")
                .and_then(Value::as_u64)
                .or(retry_after_header)
                .unwrap_or(1);
            return Err(SlackApiError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        Err(SlackApiError::Slack { code: error_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_prefers_body_field_over_header() {
        // Exercised indirectly via parse_response in integration tests
        // that spin up a local mock server; this unit test only
        // documents the precedence order the parser follows.
        let body = serde_json::json!({"ok": false, "error": "ratelimited", "retry_after": 7});
        let retry_after = body.get("retry_after").and_then(Value::as_u64);
        assert_eq!(retry_after, Some(7));
    }
}
