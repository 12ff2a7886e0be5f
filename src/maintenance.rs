//! 后台维护任务
//!
//! 全部通过 `spawn_periodic` 启动并共享同一个取消令牌：
//! 过期锁清扫、已持有锁续期、工单超时升级、过期 OTP 标记、空闲会话保活、失败任务重跑。

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::spawn_periodic;
use crate::runtime::Runtime;

/// 启动时的一次性清理
pub async fn startup_cleanup(runtime: &Runtime) {
    match runtime.locks.sweep_expired().await {
        Ok(n) if n > 0 => tracing::info!(cleared = n, "expired session locks cleared at startup"),
        Ok(_) => {}
        Err(e) => tracing::warn!("startup lock sweep failed: {}", e),
    }
    if runtime.config.session.cleanup_on_startup {
        match runtime.lifecycle.cleanup_stale_sessions().await {
            Ok(n) => tracing::info!(terminated = n, "stale portal sessions cleaned up"),
            Err(e) => tracing::warn!("startup session cleanup failed: {}", e),
        }
    }
    if let Err(e) = runtime.otp.expire_stale().await {
        tracing::warn!("startup otp expiry failed: {}", e);
    }
}

/// 启动全部周期任务，返回各任务句柄
pub fn spawn_maintenance(runtime: &Runtime, token: CancellationToken) -> Vec<JoinHandle<()>> {
    let config = &runtime.config;
    let mut handles = Vec::new();

    let locks = runtime.locks.clone();
    handles.push(spawn_periodic(
        "lock_sweep",
        Duration::from_secs(config.lock.sweep_interval_secs),
        token.clone(),
        move || {
            let locks = locks.clone();
            async move {
                match locks.sweep_expired().await {
                    Ok(n) if n > 0 => tracing::info!(cleared = n, "expired session locks cleared"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("lock sweep failed: {}", e),
                }
            }
        },
    ));

    let locks = runtime.locks.clone();
    handles.push(spawn_periodic(
        "lock_renew",
        Duration::from_secs(config.lock.renew_interval_secs),
        token.clone(),
        move || {
            let locks = locks.clone();
            async move {
                let lost = locks.renew_held().await;
                if lost > 0 {
                    tracing::warn!(lost, "session locks lost during renewal");
                }
            }
        },
    ));

    let interventions = runtime.interventions.clone();
    handles.push(spawn_periodic(
        "intervention_timeouts",
        Duration::from_secs(config.intervention.sweep_interval_secs),
        token.clone(),
        move || {
            let interventions = interventions.clone();
            async move {
                match interventions.sweep_timeouts().await {
                    Ok(ids) if !ids.is_empty() => {
                        tracing::warn!(escalated = ids.len(), "overdue interventions escalated")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("intervention sweep failed: {}", e),
                }
            }
        },
    ));

    let otp = runtime.otp.clone();
    handles.push(spawn_periodic(
        "otp_expiry",
        Duration::from_secs(config.otp.cleanup_interval_secs),
        token.clone(),
        move || {
            let otp = otp.clone();
            async move {
                if let Err(e) = otp.expire_stale().await {
                    tracing::warn!("otp expiry failed: {}", e);
                }
            }
        },
    ));

    if config.session.keep_alive {
        let lifecycle = runtime.lifecycle.clone();
        let portals = config.portals.clone();
        handles.push(spawn_periodic(
            "session_keep_alive",
            Duration::from_secs(config.session.keep_alive_interval_secs),
            token.clone(),
            move || {
                let lifecycle = lifecycle.clone();
                let portals = portals.clone();
                async move {
                    match lifecycle.refresh_idle_sessions(&portals).await {
                        Ok(n) if n > 0 => tracing::debug!(refreshed = n, "idle sessions kept alive"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!("session keep-alive failed: {}", e),
                    }
                }
            },
        ));
    }

    let orchestrator = runtime.orchestrator.clone();
    handles.push(spawn_periodic(
        "failed_job_retry",
        Duration::from_secs(config.retry.process_interval_secs),
        token,
        move || {
            let orchestrator = orchestrator.clone();
            async move {
                match orchestrator.retry_due_jobs().await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "due failed jobs retried"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("failed job processing error: {}", e),
                }
            }
        },
    ));

    handles
}
