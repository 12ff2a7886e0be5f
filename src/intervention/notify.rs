//! 人工介入通知渠道
//!
//! 每个渠道独立投递：一个渠道失败只记日志，不影响其它渠道，也不影响工单本身。
//! - webhook / slack：reqwest JSON POST
//! - email / sms：交给外部投递服务，这里只记录交接

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::core::{PortalError, PortalResult};
use crate::otp::hash_prefix;
use crate::store::{InterventionTicket, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Slack,
    Sms,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Sms => "sms",
            Self::Webhook => "webhook",
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// 一个通知渠道：target 为邮箱 / Slack webhook / 手机号 / webhook URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub target: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 仅 webhook 使用
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ChannelConfig {
    pub fn new(kind: ChannelKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            enabled: true,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    Requested,
    Escalated,
    Resolved,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "human_intervention_requested",
            Self::Escalated => "human_intervention_escalated",
            Self::Resolved => "human_intervention_resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub event: NotificationEvent,
    pub subject: String,
    pub body: String,
    pub link: Option<String>,
}

/// 渲染通知正文
pub fn render(
    ticket: &InterventionTicket,
    event: NotificationEvent,
    now_ms: i64,
    dashboard_url: Option<&str>,
) -> RenderedMessage {
    let headline = match event {
        NotificationEvent::Requested => "Human Intervention Required",
        NotificationEvent::Escalated => "Human Intervention Escalated",
        NotificationEvent::Resolved => "Human Intervention Resolved",
    };
    let mut lines = vec![
        headline.to_string(),
        String::new(),
        format!("Title: {}", ticket.title),
        format!("Priority: {}", ticket.priority.as_str().to_uppercase()),
        format!("Type: {}", ticket.kind),
        String::new(),
        format!("Description: {}", ticket.description),
    ];
    if !ticket.instructions.is_empty() {
        lines.push(String::new());
        lines.push("Instructions:".to_string());
        for (i, step) in ticket.instructions.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, step));
        }
    }
    if let Some(run) = &ticket.workflow_run_id {
        lines.push(String::new());
        lines.push(format!("Workflow run: {}", run));
    }
    if let Some(reason) = &ticket.escalation_reason {
        lines.push(format!("Escalation reason: {}", reason));
    }
    if event != NotificationEvent::Resolved && ticket.status.is_open() {
        let minutes = ((ticket.timeout_at - now_ms).max(0) as f64 / 60_000.0).round() as i64;
        lines.push(format!("Please respond within {} minutes.", minutes));
    }
    let link = dashboard_url
        .map(|base| format!("{}/interventions/{}", base.trim_end_matches('/'), ticket.id));
    if let Some(link) = &link {
        lines.push(format!("Details: {}", link));
    }

    RenderedMessage {
        event,
        subject: format!("[{}] {}", ticket.priority.as_str().to_uppercase(), ticket.title),
        body: lines.join("\n"),
        link,
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        channel: &ChannelConfig,
        message: &RenderedMessage,
        ticket: &InterventionTicket,
    ) -> PortalResult<()>;
}

fn log_handoff(channel: &ChannelConfig, message: &RenderedMessage, ticket: &InterventionTicket) {
    let recipient = match channel.kind {
        ChannelKind::Sms => hash_prefix(&channel.target),
        _ => channel.target.clone(),
    };
    tracing::info!(
        channel = channel.kind.as_str(),
        recipient = %recipient,
        ticket_id = %ticket.id,
        event = message.event.as_str(),
        subject = %message.subject,
        "notification handed off"
    );
}

/// 只记录日志的渠道实现（开发环境与 email / sms 交接）
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        channel: &ChannelConfig,
        message: &RenderedMessage,
        ticket: &InterventionTicket,
    ) -> PortalResult<()> {
        log_handoff(channel, message, ticket);
        Ok(())
    }
}

fn slack_color(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "danger",
        Priority::High => "warning",
        Priority::Medium => "good",
        Priority::Low => "#cccccc",
    }
}

/// webhook / slack 走 HTTP，其余渠道交接给日志
#[derive(Debug, Clone, Default)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn slack_payload(message: &RenderedMessage, ticket: &InterventionTicket) -> serde_json::Value {
        let mut attachment = serde_json::json!({
            "color": slack_color(ticket.priority),
            "title": ticket.title,
            "text": message.body,
            "fields": [
                { "title": "Priority", "value": ticket.priority.as_str().to_uppercase(), "short": true },
                { "title": "Type", "value": ticket.kind.as_str(), "short": true },
                { "title": "Workflow Run", "value": ticket.workflow_run_id.clone().unwrap_or_default(), "short": true },
            ],
        });
        if let Some(link) = &message.link {
            attachment["actions"] = serde_json::json!([
                { "type": "button", "text": "View Details", "url": link },
                { "type": "button", "text": "Assign to Me", "url": format!("{}/assign", link) },
            ]);
        }
        serde_json::json!({
            "text": message.subject,
            "attachments": [attachment],
        })
    }

    fn webhook_payload(message: &RenderedMessage, ticket: &InterventionTicket) -> serde_json::Value {
        serde_json::json!({
            "event": message.event.as_str(),
            "intervention": {
                "id": ticket.id,
                "type": ticket.kind.as_str(),
                "priority": ticket.priority.as_str(),
                "status": ticket.status.as_str(),
                "title": ticket.title,
                "description": ticket.description,
                "workflowRunId": ticket.workflow_run_id,
                "organizationId": ticket.organization_id,
                "requestedAt": ticket.created_at,
                "timeoutAt": ticket.timeout_at,
                "escalationReason": ticket.escalation_reason,
            },
        })
    }

    async fn post(&self, channel: &ChannelConfig, payload: &serde_json::Value) -> PortalResult<()> {
        let mut request = self.client.post(&channel.target).json(payload);
        for (name, value) in &channel.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request.send().await.map_err(|e| {
            PortalError::Notification(format!("{} delivery failed: {}", channel.kind.as_str(), e))
        })?;
        if !resp.status().is_success() {
            return Err(PortalError::Notification(format!(
                "{} notification failed: {}",
                channel.kind.as_str(),
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(
        &self,
        channel: &ChannelConfig,
        message: &RenderedMessage,
        ticket: &InterventionTicket,
    ) -> PortalResult<()> {
        match channel.kind {
            ChannelKind::Slack => self.post(channel, &Self::slack_payload(message, ticket)).await,
            ChannelKind::Webhook => self.post(channel, &Self::webhook_payload(message, ticket)).await,
            ChannelKind::Email | ChannelKind::Sms => {
                log_handoff(channel, message, ticket);
                Ok(())
            }
        }
    }
}

/// 并发投递到所有启用的渠道，返回成功的渠道名
pub async fn fan_out(
    notifier: &dyn Notifier,
    channels: &[ChannelConfig],
    message: &RenderedMessage,
    ticket: &InterventionTicket,
) -> Vec<String> {
    let enabled: Vec<&ChannelConfig> = channels.iter().filter(|c| c.enabled).collect();
    let results = join_all(
        enabled
            .iter()
            .map(|channel| notifier.send(channel, message, ticket)),
    )
    .await;

    let mut delivered = Vec::new();
    for (channel, result) in enabled.iter().zip(results) {
        match result {
            Ok(()) => delivered.push(channel.kind.as_str().to_string()),
            Err(e) => tracing::warn!(
                ticket_id = %ticket.id,
                channel = channel.kind.as_str(),
                "notification failed: {}",
                e
            ),
        }
    }
    delivered
}
