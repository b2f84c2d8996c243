//! Run lifecycle alerting
//!
//! Notifications are fire-and-forget: the orchestrator spawns them and a
//! notifier failure is logged, never propagated into the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{AlertRule, RunSummary};
use idp_common::Result;

/// Run lifecycle event that can trigger alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEvent {
    Start,
    Success,
    Failure,
}

impl AlertEvent {
    pub fn as_str(&self) -> &str {
        match self {
            AlertEvent::Start => "start",
            AlertEvent::Success => "success",
            AlertEvent::Failure => "failure",
        }
    }
}

/// Recipients whose rules subscribe to the given event
pub fn recipients_for(rules: &[AlertRule], event: AlertEvent) -> Vec<String> {
    rules
        .iter()
        .filter(|rule| match event {
            AlertEvent::Start => rule.on_start,
            AlertEvent::Success => rule.on_success,
            AlertEvent::Failure => rule.on_failure,
        })
        .map(|rule| rule.recipient.clone())
        .collect()
}

/// Delivery channel for run lifecycle notifications
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(
        &self,
        event: AlertEvent,
        recipients: &[String],
        summary: &RunSummary,
    ) -> Result<()>;
}

/// Notifier that only writes structured log lines
///
/// The default in development and tests; operational alerting goes
/// through the webhook notifier.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(
        &self,
        event: AlertEvent,
        recipients: &[String],
        summary: &RunSummary,
    ) -> Result<()> {
        info!(
            event = event.as_str(),
            run_id = %summary.run_id,
            importer = %summary.importer_name,
            status = %summary.status,
            total = summary.total_count,
            success = summary.success_count,
            recipients = recipients.join(","),
            "Run alert"
        );
        Ok(())
    }
}

/// Notifier that posts alert payloads to an external channel endpoint
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Serialize)]
struct AlertPayload<'a> {
    event: &'a str,
    recipients: &'a [String],
    summary: &'a RunSummary,
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(
        &self,
        event: AlertEvent,
        recipients: &[String],
        summary: &RunSummary,
    ) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&AlertPayload {
                event: event.as_str(),
                recipients,
                summary,
            })
            .send()
            .await
            .map_err(crate::staging::map_reqwest_error)?
            .error_for_status()
            .map_err(crate::staging::map_reqwest_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rules() -> Vec<AlertRule> {
        vec![
            AlertRule {
                recipient: "ops@example.org".into(),
                on_start: false,
                on_success: true,
                on_failure: true,
            },
            AlertRule {
                recipient: "owner@example.org".into(),
                on_start: true,
                on_success: false,
                on_failure: true,
            },
        ]
    }

    fn summary() -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            importer_id: Uuid::new_v4(),
            importer_name: "population".into(),
            status: RunStatus::Success,
            total_count: 10,
            success_count: 10,
            error: None,
        }
    }

    #[test]
    fn test_recipients_for_event() {
        let rules = rules();
        assert_eq!(recipients_for(&rules, AlertEvent::Start), vec!["owner@example.org"]);
        assert_eq!(recipients_for(&rules, AlertEvent::Success), vec!["ops@example.org"]);
        assert_eq!(recipients_for(&rules, AlertEvent::Failure).len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_notifier_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(body_partial_json(serde_json::json!({ "event": "failure" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/alerts", server.uri()));
        notifier
            .notify(
                AlertEvent::Failure,
                &["ops@example.org".to_string()],
                &summary(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_notifier_surfaces_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/alerts", server.uri()));
        let result = notifier
            .notify(AlertEvent::Start, &[], &summary())
            .await;
        assert!(result.is_err());
    }
}
