//! 进程级关闭：监听信号、记录关闭原因、按原因停止调度
//!
//! 流程：[`run_until_shutdown`] 在主任务结束、主任务出错或收到 Ctrl+C / SIGTERM 时返回
//! [`ShutdownReason`]；随后 [`ShutdownCoordinator`] 带着该原因依次执行清理。
//! 致命错误时 [`ManagerCleanup`] 不再等待宽限期，直接取消在途执行。

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::Manager;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 主任务正常结束
    Finished,
    /// 主任务出错，在途执行不再等待
    Fatal(String),
}

impl ShutdownReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
            Self::Finished => f.write_str("finished"),
            Self::Fatal(e) => write!(f, "fatal error: {}", e),
        }
    }
}

/// 关闭信号；克隆后共享同一状态，第一个原因生效
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭；已触发过时返回 false，原因保持不变
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        {
            let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 等待触发并返回原因
    pub async fn wait(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Finished)
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                signal.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let signal = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                if let Ok(mut sigterm) = unix_signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    signal.trigger(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 运行主任务直到它结束或收到关闭信号，返回关闭原因。主任务出错记为 `Fatal`
pub async fn run_until_shutdown<F>(signal: &ShutdownSignal, app: F) -> ShutdownReason
where
    F: Future<Output = anyhow::Result<()>>,
{
    let finished = tokio::select! {
        result = app => match result {
            Ok(()) => ShutdownReason::Finished,
            Err(e) => ShutdownReason::Fatal(format!("{:#}", e)),
        },
        reason = signal.wait() => return reason,
    };
    signal.trigger(finished);
    signal.reason().unwrap_or(ShutdownReason::Finished)
}

/// 关闭时执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self, reason: &ShutdownReason) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每项受同一超时约束
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    /// 返回成功完成的清理数
    pub async fn run_cleanup(&self, reason: &ShutdownReason) -> usize {
        info!("Running {} cleanup tasks ({})", self.tasks.len(), reason);
        let mut succeeded = 0;
        for task in &self.tasks {
            match tokio::time::timeout(self.timeout, task.cleanup(reason)).await {
                Ok(Ok(())) => {
                    succeeded += 1;
                    info!("Cleanup '{}' completed", task.name());
                }
                Ok(Err(e)) => warn!("Cleanup '{}' failed: {:#}", task.name(), e),
                Err(_) => warn!("Cleanup '{}' timed out after {:?}", task.name(), self.timeout),
            }
        }
        succeeded
    }
}

/// 停止调度：正常关闭等待宽限期，致命错误立即取消在途执行
pub struct ManagerCleanup {
    manager: Manager,
}

impl ManagerCleanup {
    pub fn new(manager: Manager) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ManagerCleanup {
    async fn cleanup(&self, reason: &ShutdownReason) -> anyhow::Result<()> {
        if reason.is_fatal() {
            self.manager.stop_within(Duration::ZERO).await;
        } else {
            self.manager.stop().await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "manager"
    }
}
