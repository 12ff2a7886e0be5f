//! 人工介入工单服务
//!
//! 状态：pending → assigned → in_progress → {resolved | escalated | cancelled}。
//! 创建时计算超时截止并向所有渠道扇出通知；超时扫描把仍未处理的工单强制升级为 escalated，
//! 优先级提到 urgent 并重新通知。解决方式决定关联 WorkflowRun 的最终状态。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::assign::Assigner;
use super::notify::{fan_out, render, ChannelConfig, NotificationEvent, Notifier};
use crate::config::InterventionSection;
use crate::core::{Clock, ErrorCategory, PortalError, PortalResult};
use crate::store::{
    InterventionKind, InterventionTicket, Priority, RecordStore, Resolution, ResolutionType,
    TicketFilter, TicketStatus,
};

pub const TIMEOUT_ESCALATION_REASON: &str = "Intervention timeout - no response within allocated time";

const ACTIVE_LIMIT: usize = 50;

/// 创建工单的请求
#[derive(Debug, Clone)]
pub struct InterventionRequest {
    pub kind: InterventionKind,
    pub category: Option<ErrorCategory>,
    pub priority: Priority,
    pub organization_id: String,
    pub workflow_run_id: Option<String>,
    pub session_id: Option<String>,
    pub title: String,
    pub description: String,
    pub instructions: Vec<String>,
    pub context: serde_json::Value,
    /// 不设置时按类型取配置
    pub timeout: Option<Duration>,
}

impl InterventionRequest {
    pub fn new(
        kind: InterventionKind,
        organization_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            category: None,
            priority: Priority::default(),
            organization_id: organization_id.into(),
            workflow_run_id: None,
            session_id: None,
            title: title.into(),
            description: description.into(),
            instructions: Vec::new(),
            context: serde_json::Value::Null,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_run(mut self, run_id: Option<String>) -> Self {
        self.workflow_run_id = run_id;
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_instructions(mut self, instructions: Vec<String>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct InterventionSettings {
    pub default_timeout: Duration,
    pub timeout_overrides: HashMap<String, Duration>,
    pub auto_assign: bool,
    pub channels: HashMap<String, Vec<ChannelConfig>>,
    pub dashboard_url: Option<String>,
}

impl From<&InterventionSection> for InterventionSettings {
    fn from(section: &InterventionSection) -> Self {
        Self {
            default_timeout: Duration::from_secs(section.default_timeout_mins * 60),
            timeout_overrides: section
                .timeout_mins
                .iter()
                .map(|(k, v)| (k.clone(), Duration::from_secs(v * 60)))
                .collect(),
            auto_assign: section.auto_assign,
            channels: section.channels.clone(),
            dashboard_url: section.dashboard_url.clone(),
        }
    }
}

impl InterventionSettings {
    pub fn timeout_for(&self, kind: InterventionKind) -> Duration {
        self.timeout_overrides
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn channels_for(&self, organization_id: &str) -> &[ChannelConfig] {
        self.channels
            .get(organization_id)
            .or_else(|| self.channels.get("default"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub struct InterventionService {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    assigner: Arc<dyn Assigner>,
    settings: InterventionSettings,
}

impl InterventionService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        assigner: Arc<dyn Assigner>,
        settings: InterventionSettings,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            assigner,
            settings,
        }
    }

    pub async fn get(&self, ticket_id: &str) -> PortalResult<Option<InterventionTicket>> {
        Ok(self.store.get_ticket(ticket_id).await?)
    }

    async fn load(&self, ticket_id: &str) -> PortalResult<InterventionTicket> {
        self.store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| PortalError::InterventionNotFound(ticket_id.to_string()))
    }

    fn ensure(
        ticket: &InterventionTicket,
        allowed: &[TicketStatus],
        to: TicketStatus,
    ) -> PortalResult<()> {
        if allowed.contains(&ticket.status) {
            Ok(())
        } else {
            Err(PortalError::InvalidTransition {
                entity: format!("intervention {}", ticket.id),
                from: ticket.status.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn resolved_status(resolution_type: ResolutionType) -> TicketStatus {
        match resolution_type {
            ResolutionType::Cancelled => TicketStatus::Cancelled,
            _ => TicketStatus::Resolved,
        }
    }

    /// 工单仍可解决时返回 Ok；已解决或已取消返回 InvalidTransition
    pub fn ensure_resolvable(
        ticket: &InterventionTicket,
        resolution_type: ResolutionType,
    ) -> PortalResult<()> {
        Self::ensure(
            ticket,
            &[
                TicketStatus::Pending,
                TicketStatus::Assigned,
                TicketStatus::InProgress,
                TicketStatus::Escalated,
            ],
            Self::resolved_status(resolution_type),
        )
    }

    async fn notify(&self, ticket: &mut InterventionTicket, event: NotificationEvent) {
        let message = render(
            ticket,
            event,
            self.clock.now_ms(),
            self.settings.dashboard_url.as_deref(),
        );
        let channels = self.settings.channels_for(&ticket.organization_id);
        let delivered = fan_out(self.notifier.as_ref(), channels, &message, ticket).await;
        for channel in delivered {
            if !ticket.notified_channels.contains(&channel) {
                ticket.notified_channels.push(channel);
            }
        }
    }

    /// 创建工单、扇出通知，按配置自动分派
    pub async fn create(&self, request: InterventionRequest) -> PortalResult<InterventionTicket> {
        let now = self.clock.now_ms();
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.settings.timeout_for(request.kind));

        let mut ticket = InterventionTicket {
            id: format!("int_{}", uuid::Uuid::new_v4()),
            kind: request.kind,
            category: request.category,
            priority: request.priority,
            status: TicketStatus::Pending,
            organization_id: request.organization_id,
            workflow_run_id: request.workflow_run_id,
            session_id: request.session_id,
            title: request.title,
            description: request.description,
            instructions: request.instructions,
            context: request.context,
            assigned_to: None,
            timeout_at: now + timeout.as_millis() as i64,
            created_at: now,
            assigned_at: None,
            started_at: None,
            resolved_at: None,
            escalated_at: None,
            escalation_reason: None,
            resolution: None,
            notified_channels: Vec::new(),
        };
        self.store.insert_ticket(&ticket).await?;
        tracing::info!(
            ticket_id = %ticket.id,
            kind = %ticket.kind,
            priority = ticket.priority.as_str(),
            "intervention requested"
        );

        self.notify(&mut ticket, NotificationEvent::Requested).await;
        self.store.update_ticket(&ticket).await?;

        if self.settings.auto_assign {
            match self.auto_assign(&ticket.id).await {
                Ok(Some(assigned)) => ticket = assigned,
                Ok(None) => {}
                Err(e) => tracing::warn!(ticket_id = %ticket.id, "auto-assign failed: {}", e),
            }
        }
        Ok(ticket)
    }

    pub async fn assign(&self, ticket_id: &str, assignee: &str) -> PortalResult<InterventionTicket> {
        let mut ticket = self.load(ticket_id).await?;
        Self::ensure(
            &ticket,
            &[TicketStatus::Pending, TicketStatus::Assigned],
            TicketStatus::Assigned,
        )?;
        ticket.status = TicketStatus::Assigned;
        ticket.assigned_to = Some(assignee.to_string());
        ticket.assigned_at = Some(self.clock.now_ms());
        self.store.update_ticket(&ticket).await?;
        tracing::info!(ticket_id = %ticket_id, assignee = %assignee, "intervention assigned");
        Ok(ticket)
    }

    /// 由分派策略选人；没有可用成员时返回 None
    pub async fn auto_assign(&self, ticket_id: &str) -> PortalResult<Option<InterventionTicket>> {
        let ticket = self.load(ticket_id).await?;
        match self.assigner.pick(&ticket.organization_id, ticket.kind) {
            Some(member) => Ok(Some(self.assign(ticket_id, &member).await?)),
            None => Ok(None),
        }
    }

    pub async fn start(&self, ticket_id: &str, by: &str) -> PortalResult<InterventionTicket> {
        let mut ticket = self.load(ticket_id).await?;
        Self::ensure(
            &ticket,
            &[TicketStatus::Pending, TicketStatus::Assigned],
            TicketStatus::InProgress,
        )?;
        ticket.status = TicketStatus::InProgress;
        ticket.started_at = Some(self.clock.now_ms());
        if ticket.assigned_to.is_none() {
            ticket.assigned_to = Some(by.to_string());
        }
        self.store.update_ticket(&ticket).await?;
        Ok(ticket)
    }

    /// 解决工单并回写关联 WorkflowRun 的状态；已升级的工单同样可以解决
    pub async fn resolve(
        &self,
        ticket_id: &str,
        resolution: Resolution,
    ) -> PortalResult<InterventionTicket> {
        let mut ticket = self.load(ticket_id).await?;
        Self::ensure_resolvable(&ticket, resolution.resolution_type)?;
        let to = Self::resolved_status(resolution.resolution_type);

        let now = self.clock.now_ms();
        ticket.status = to;
        ticket.resolved_at = Some(now);
        ticket.resolution = Some(resolution.clone());
        self.store.update_ticket(&ticket).await?;

        if let Some(run_id) = &ticket.workflow_run_id {
            if let Some(mut run) = self.store.get_run(run_id).await? {
                run.set_status(resolution.resolution_type.run_status(), now);
                self.store.update_run(&run).await?;
            }
        }

        tracing::info!(
            ticket_id = %ticket_id,
            resolution = ?resolution.resolution_type,
            resolved_by = %resolution.resolved_by,
            "intervention resolved"
        );
        self.notify(&mut ticket, NotificationEvent::Resolved).await;
        self.store.update_ticket(&ticket).await?;
        Ok(ticket)
    }

    pub async fn cancel(
        &self,
        ticket_id: &str,
        by: &str,
        reason: &str,
    ) -> PortalResult<InterventionTicket> {
        self.resolve(
            ticket_id,
            Resolution::new(ResolutionType::Cancelled, by).with_notes(reason),
        )
        .await
    }

    /// 升级：优先级提到 urgent 并重新通知
    pub async fn escalate(&self, ticket_id: &str, reason: &str) -> PortalResult<InterventionTicket> {
        let mut ticket = self.load(ticket_id).await?;
        Self::ensure(
            &ticket,
            &[
                TicketStatus::Pending,
                TicketStatus::Assigned,
                TicketStatus::InProgress,
            ],
            TicketStatus::Escalated,
        )?;
        ticket.status = TicketStatus::Escalated;
        ticket.priority = Priority::Urgent;
        ticket.escalated_at = Some(self.clock.now_ms());
        ticket.escalation_reason = Some(reason.to_string());
        self.store.update_ticket(&ticket).await?;
        tracing::warn!(ticket_id = %ticket_id, reason = %reason, "intervention escalated");

        self.notify(&mut ticket, NotificationEvent::Escalated).await;
        self.store.update_ticket(&ticket).await?;
        Ok(ticket)
    }

    /// 把超时未处理的工单升级，返回被升级的工单 ID
    pub async fn sweep_timeouts(&self) -> PortalResult<Vec<String>> {
        let now = self.clock.now_ms();
        let overdue: Vec<InterventionTicket> = self
            .store
            .list_tickets(&TicketFilter::open())
            .await?
            .into_iter()
            .filter(|t| t.is_overdue(now))
            .collect();

        let mut escalated = Vec::new();
        for ticket in overdue {
            match self.escalate(&ticket.id, TIMEOUT_ESCALATION_REASON).await {
                Ok(t) => escalated.push(t.id),
                Err(e) => tracing::warn!(ticket_id = %ticket.id, "timeout escalation failed: {}", e),
            }
        }
        Ok(escalated)
    }

    /// 优先级降序、创建时间降序，最多 50 条；未指定状态时取未关闭的工单
    pub async fn active_tickets(&self, mut filter: TicketFilter) -> PortalResult<Vec<InterventionTicket>> {
        if filter.statuses.is_empty() {
            filter.statuses = TicketFilter::open().statuses;
        }
        let mut tickets = self.store.list_tickets(&filter).await?;
        tickets.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        tickets.truncate(ACTIVE_LIMIT);
        Ok(tickets)
    }

    /// 从创建到解决的时长
    pub async fn response_time(&self, ticket_id: &str) -> PortalResult<Option<Duration>> {
        let ticket = self.load(ticket_id).await?;
        Ok(ticket
            .resolved_at
            .map(|resolved| Duration::from_millis((resolved - ticket.created_at).max(0) as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::intervention::{LogNotifier, RoundRobinAssigner};
    use crate::store::{MemoryStore, RunKind, RunStatus, WorkflowRun};

    fn service(
        clock: Arc<ManualClock>,
        team: HashMap<String, Vec<String>>,
        auto_assign: bool,
    ) -> (InterventionService, Arc<dyn RecordStore>) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let mut settings = InterventionSettings::from(&InterventionSection::default());
        settings.auto_assign = auto_assign;
        let svc = InterventionService::new(
            store.clone(),
            clock,
            Arc::new(LogNotifier),
            Arc::new(RoundRobinAssigner::new(team)),
            settings,
        );
        (svc, store)
    }

    fn request(kind: InterventionKind) -> InterventionRequest {
        InterventionRequest::new(kind, "org", "Portal error", "Selector missing")
    }

    #[tokio::test]
    async fn test_create_uses_kind_timeout() {
        let (svc, _) = service(Arc::new(ManualClock::new(0)), HashMap::new(), false);
        let t = svc.create(request(InterventionKind::PortalError)).await.unwrap();
        assert_eq!(t.timeout_at, 60 * 60_000);
        let t = svc.create(request(InterventionKind::CaptchaSolve)).await.unwrap();
        assert_eq!(t.timeout_at, 30 * 60_000);
        assert_eq!(t.status, TicketStatus::Pending);
    }

    #[tokio::test]
    async fn test_auto_assign_on_create() {
        let team = HashMap::from([("org".to_string(), vec!["alice".to_string()])]);
        let (svc, _) = service(Arc::new(ManualClock::new(0)), team, true);
        let t = svc.create(request(InterventionKind::ManualReview)).await.unwrap();
        assert_eq!(t.status, TicketStatus::Assigned);
        assert_eq!(t.assigned_to.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_timeout_sweep_escalates_open_tickets() {
        let clock = Arc::new(ManualClock::new(0));
        let (svc, _) = service(clock.clone(), HashMap::new(), false);
        let stale = svc
            .create(request(InterventionKind::CaptchaSolve).with_priority(Priority::Low))
            .await
            .unwrap();
        let done = svc.create(request(InterventionKind::CaptchaSolve)).await.unwrap();
        svc.resolve(&done.id, Resolution::new(ResolutionType::CompletedManually, "bob"))
            .await
            .unwrap();

        clock.advance_secs(29 * 60);
        assert!(svc.sweep_timeouts().await.unwrap().is_empty());
        clock.advance_secs(2 * 60);
        let escalated = svc.sweep_timeouts().await.unwrap();
        assert_eq!(escalated, vec![stale.id.clone()]);

        let t = svc.get(&stale.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::Escalated);
        assert_eq!(t.priority, Priority::Urgent);
        assert_eq!(t.escalation_reason.as_deref(), Some(TIMEOUT_ESCALATION_REASON));
        assert!(svc.sweep_timeouts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolution_feeds_back_into_run() {
        let clock = Arc::new(ManualClock::new(0));
        let (svc, store) = service(clock.clone(), HashMap::new(), false);
        let mut run = WorkflowRun::new(RunKind::Submission, "org", "anthem", "pa_1", 0);
        run.set_status(RunStatus::WaitingHuman, 0);
        store.insert_run(&run).await.unwrap();

        let t = svc
            .create(request(InterventionKind::UnexpectedUi).with_run(Some(run.id.clone())))
            .await
            .unwrap();
        svc.start(&t.id, "carol").await.unwrap();
        clock.advance_secs(90);
        svc.resolve(&t.id, Resolution::new(ResolutionType::CompletedManually, "carol"))
            .await
            .unwrap();

        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            svc.response_time(&t.id).await.unwrap(),
            Some(Duration::from_secs(90))
        );
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let (svc, _) = service(Arc::new(ManualClock::new(0)), HashMap::new(), false);
        let t = svc.create(request(InterventionKind::PortalError)).await.unwrap();
        svc.cancel(&t.id, "ops", "duplicate").await.unwrap();
        assert!(svc.assign(&t.id, "alice").await.is_err());
        assert!(svc.escalate(&t.id, "late").await.is_err());
        assert!(matches!(
            svc.start("int_missing", "x").await.unwrap_err(),
            PortalError::InterventionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_active_tickets_sorted_by_priority() {
        let clock = Arc::new(ManualClock::new(0));
        let (svc, _) = service(clock.clone(), HashMap::new(), false);
        svc.create(request(InterventionKind::PortalError).with_priority(Priority::Low))
            .await
            .unwrap();
        clock.advance_ms(1);
        svc.create(request(InterventionKind::PortalError).with_priority(Priority::Urgent))
            .await
            .unwrap();
        clock.advance_ms(1);
        svc.create(request(InterventionKind::PortalError).with_priority(Priority::Medium))
            .await
            .unwrap();

        let active = svc.active_tickets(TicketFilter::default()).await.unwrap();
        let priorities: Vec<_> = active.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![Priority::Urgent, Priority::Medium, Priority::Low]);
    }
}
