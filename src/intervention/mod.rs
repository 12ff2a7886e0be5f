//! 人工介入：工单生命周期、通知扇出、自动分派

pub mod assign;
pub mod notify;
pub mod service;

pub use assign::{Assigner, RoundRobinAssigner};
pub use notify::{
    fan_out, render, ChannelConfig, ChannelKind, HttpNotifier, LogNotifier, NotificationEvent,
    Notifier, RenderedMessage,
};
pub use service::{
    InterventionRequest, InterventionService, InterventionSettings, TIMEOUT_ESCALATION_REASON,
};
