//! AuthPilot - 支付方门户事前授权自动化编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、重试与熔断、时间源、周期任务、优雅关闭
//! - **store**: 会话 / OTP / 执行记录 / 工单 / 失败任务的持久化（内存 / SQLite）
//! - **browser**: 浏览器会话抽象、反自动化检测、脚本化与 Chrome 实现
//! - **session**: 会话锁、登录与短信验证、会话复用与过期
//! - **otp**: 短信验证码捕获、匹配、加密与人工录入
//! - **automation**: 步骤模型、执行器、计划构建
//! - **intervention**: 人工介入工单、通知、分派
//! - **orchestrator**: 提交 / 状态查询 / 附件上传入口
//! - **runtime** / **maintenance**: 装配与后台任务

pub mod automation;
pub mod browser;
pub mod config;
pub mod core;
pub mod intervention;
pub mod maintenance;
pub mod orchestrator;
pub mod otp;
pub mod runtime;
pub mod session;
pub mod store;

pub use orchestrator::{Orchestrator, OrchestrationResult, OrchestrationStatus, StatusResult};
pub use runtime::{Runtime, RuntimeBuilder};
