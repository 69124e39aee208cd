use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, warn};

const RED: &str = "#ad1720";
const YELLOW: &str = "#ffce00";
const RULE: &str = "-------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something broke and needs a human.
    Alert,
    /// Something looks wrong but the run carried on.
    Warning,
}

/// What an alert is about. Fields that do not apply are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertContext {
    pub workflow_id: Option<String>,
    pub variant: Option<String>,
    pub plate: Option<String>,
    pub message: String,
}

impl AlertContext {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>, variant: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self.variant = Some(variant.into());
        self
    }

    pub fn with_plate(mut self, plate: impl Into<String>) -> Self {
        self.plate = Some(plate.into());
        self
    }

    fn body(&self, severity: Severity) -> String {
        let mut lines = match severity {
            Severity::Alert => vec![
                ":fire: OH NO! :fire:".to_string(),
                "*plate launcher*".to_string(),
            ],
            Severity::Warning => vec![
                ":warning: WARNING :warning:".to_string(),
                "*plate launcher*".to_string(),
            ],
        };
        lines.push(RULE.to_string());
        if let Some(workflow_id) = &self.workflow_id {
            lines.push(format!("workflow_id: {}", workflow_id));
        }
        if let Some(variant) = &self.variant {
            lines.push(format!("variant: {}", variant));
        }
        if let Some(plate) = &self.plate {
            lines.push(format!("plate: {}", plate));
        }
        lines.push(format!("info:\n{}", self.message));
        lines.push(RULE.to_string());
        lines.join("\n")
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message. Delivery problems are logged, never returned.
    async fn notify(&self, severity: Severity, context: &AlertContext);
}

/// Incoming-webhook sender.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    username: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            username: username.into(),
        }
    }

    fn payload(&self, severity: Severity, context: &AlertContext) -> serde_json::Value {
        let (text, color) = match severity {
            Severity::Alert => ("Something broke", RED),
            Severity::Warning => ("Something might be wrong", YELLOW),
        };
        json!({
            "text": text,
            "username": self.username,
            "attachments": [{
                "text": context.body(severity),
                "color": color,
                "attachment_type": "default",
            }],
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, severity: Severity, context: &AlertContext) {
        let res = self
            .client
            .post(&self.webhook_url)
            .json(&self.payload(severity, context))
            .send()
            .await;
        match res {
            Ok(r) if r.status().is_success() => info!("message sent to slack"),
            Ok(r) => error!("failed to send slack message, code {}", r.status()),
            Err(e) => error!("failed to send slack message: {}", e),
        }
    }
}

/// Used when alerts are disabled: the message only goes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, severity: Severity, context: &AlertContext) {
        match severity {
            Severity::Alert => error!("[alert] {}", context.body(severity)),
            Severity::Warning => warn!("[warning] {}", context.body(severity)),
        }
    }
}
