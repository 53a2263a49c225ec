//! Periodic `auth.test` ping; reports connectivity failures to the
//! connection manager without itself driving reconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::HealthCheckConfig;
use crate::error::SlackApiError;
use crate::webapi::WebApiClient;

#[derive(Debug)]
pub enum HealthEvent {
    Fatal { code: String },
    CheckFailed { reason: String },
}

pub struct HealthMonitor {
    config: HealthCheckConfig,
    web_api: Arc<WebApiClient>,
    events: mpsc::UnboundedSender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        web_api: Arc<WebApiClient>,
        events: mpsc::UnboundedSender<HealthEvent>,
    ) -> Self {
        Self {
            config,
            web_api,
            events,
        }
    }

    /// Runs until the channel receiver is dropped. Exactly one
    /// `auth.test` call is in flight at any time.
    pub async fn run(&self) {
        if !self.config.enabled {
            return;
        }

        loop {
            let next = match self.web_api.post("auth.test", serde_json::json!({})).await {
                Ok(_) => Duration::from_millis(self.config.interval_ms),
                Err(SlackApiError::RateLimited { retry_after }) => {
                    retry_after.max(Duration::from_millis(self.config.interval_ms))
                }
                Err(err) if err.is_fatal_auth() => {
                    let code = match &err {
                        SlackApiError::Slack { code } => code.clone(),
                        _ => "unknown".to_string(),
                    };
                    if self.events.send(HealthEvent::Fatal { code }).is_err() {
                        return;
                    }
                    Duration::from_millis(self.config.interval_ms * 10)
                }
                Err(err) => {
                    if self
                        .events
                        .send(HealthEvent::CheckFailed {
                            reason: err.to_string(),
                        })
                        .is_err()
                    {
                        return;
                    }
                    Duration::from_millis(self.config.interval_ms).max(Duration::from_secs(15))
                }
            };

            tokio::time::sleep(next).await;
        }
    }
}
