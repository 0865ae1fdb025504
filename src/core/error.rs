//! 调度核心错误类型
//!
//! 四类错误：准入拒绝（配额 / 池满 / 未启动 / Robot 不存在）、存储 I/O、流水线失败、控制操作错误。
//! 准入拒绝通过 [`RobotError::is_rejection`] 判定，调用方不应靠匹配消息字符串区分。

use thiserror::Error;

use crate::execution::{ExecStatus, Phase, TriggerType};
use crate::store::StoreError;

pub type Result<T, E = RobotError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RobotError {
    // ---- 生命周期 ----
    #[error("manager not started")]
    ManagerNotStarted,

    #[error("manager already started")]
    ManagerAlreadyStarted,

    #[error("pool not started")]
    PoolNotStarted,

    #[error("pool already started")]
    PoolAlreadyStarted,

    // ---- 准入拒绝 ----
    #[error("robot not found: {0}")]
    RobotNotFound(String),

    #[error("robot {0} is paused")]
    RobotPaused(String),

    #[error("trigger type {0} is disabled")]
    TriggerDisabled(TriggerType),

    #[error("robot {0} quota exceeded")]
    QuotaExceeded(String),

    #[error("pool is full ({0} jobs in flight)")]
    PoolFull(usize),

    // ---- 控制操作 ----
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("execution {id} already finished with status {status}")]
    ExecutionFinished { id: String, status: ExecStatus },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: ExecStatus, to: ExecStatus },

    #[error("execution already paused")]
    AlreadyPaused,

    #[error("execution not paused")]
    NotPaused,

    #[error("execution cancelled")]
    Cancelled,

    // ---- 请求与配置 ----
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid robot config: {0}")]
    InvalidConfig(String),

    // ---- 流水线 ----
    #[error("phase {phase} failed: {message}")]
    PhaseFailed { phase: Phase, message: String },

    #[error("phase {0} output already recorded")]
    PhaseOutputExists(Phase),

    // ---- 存储 ----
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
}

impl RobotError {
    /// 包装存储错误并附带上下文
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    /// 是否属于准入拒绝（以 accepted=false 报告，而不是错误）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ManagerNotStarted
                | Self::PoolNotStarted
                | Self::RobotNotFound(_)
                | Self::RobotPaused(_)
                | Self::TriggerDisabled(_)
                | Self::QuotaExceeded(_)
                | Self::PoolFull(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// 给存储结果附加上下文
pub trait StoreResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, StoreError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| RobotError::store(context, e))
    }
}
