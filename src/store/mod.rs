//! 持久化抽象层
//!
//! 调度核心只通过两个接口访问存储：[`RobotStore`]（Robot 配置记录）与
//! [`ExecutionStore`]（执行记录及其状态投影）。提供内存实现与 SQLite 实现（`async-sqlite` 特性）。
//! 所有方法都视为可能失败的 I/O，错误由调用方包装上下文后返回，不在内部重试。

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::{
    CurrentState, DeliveryResult, ExecStatus, Execution, Goals, InspirationReport, LearningEntry,
    Phase, PhaseOutput, Task, TaskResult, TriggerInput, TriggerType,
};
use crate::robot::RobotStatus;

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    InvalidData(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "async-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Robot 持久化记录（成员表中与 Robot 相关的列）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotRecord {
    pub member_id: String,
    pub team_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub robot_status: RobotStatus,
    #[serde(default)]
    pub autonomous_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_config: Option<serde_json::Value>,
}

impl RobotRecord {
    /// 新建自治 Robot 记录，配置为空（全部取默认值）
    pub fn new(member_id: impl Into<String>, team_id: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            team_id: team_id.into(),
            display_name: None,
            system_prompt: None,
            robot_status: RobotStatus::Idle,
            autonomous_mode: true,
            robot_config: None,
        }
    }

    pub fn with_config(mut self, config: &crate::robot::RobotConfig) -> Self {
        self.robot_config = serde_json::to_value(config).ok();
        self
    }

    pub fn with_autonomous(mut self, autonomous: bool) -> Self {
        self.autonomous_mode = autonomous;
        self
    }

    pub fn with_status(mut self, status: RobotStatus) -> Self {
        self.robot_status = status;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RobotFilter {
    pub team_id: Option<String>,
    pub autonomous_only: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RobotFilter {
    pub fn autonomous() -> Self {
        Self {
            autonomous_only: true,
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, record: &RobotRecord) -> bool {
        if self.autonomous_only && !record.autonomous_mode {
            return false;
        }
        match &self.team_id {
            Some(team) => &record.team_id == team,
            None => true,
        }
    }
}

/// 执行记录：一次执行的完整持久化投影
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub member_id: String,
    pub team_id: String,
    pub job_id: Option<String>,
    pub trigger_type: TriggerType,
    pub status: ExecStatus,
    pub phase: Phase,
    pub current: Option<CurrentState>,
    pub error: Option<String>,
    pub input: TriggerInput,
    pub inspiration: Option<InspirationReport>,
    pub goals: Option<Goals>,
    pub tasks: Vec<Task>,
    pub results: Vec<TaskResult>,
    pub delivery: Option<DeliveryResult>,
    pub learning: Vec<LearningEntry>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Execution> for ExecutionRecord {
    fn from(exec: &Execution) -> Self {
        let now = Utc::now();
        Self {
            execution_id: exec.id.clone(),
            member_id: exec.member_id.clone(),
            team_id: exec.team_id.clone(),
            job_id: exec.job_id.clone(),
            trigger_type: exec.trigger_type,
            status: exec.status(),
            phase: exec.phase,
            current: exec.current.clone(),
            error: exec.error.clone(),
            input: exec.input.clone(),
            inspiration: exec.inspiration.clone(),
            goals: exec.goals.clone(),
            tasks: exec.tasks.clone(),
            results: exec.results.clone(),
            delivery: exec.delivery.clone(),
            learning: exec.learning.clone(),
            start_time: exec.start_time,
            end_time: exec.end_time(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl ExecutionRecord {
    pub fn into_execution(self) -> Execution {
        let mut exec = Execution::new(self.execution_id, self.member_id, self.team_id, self.input);
        exec.job_id = self.job_id;
        exec.trigger_type = self.trigger_type;
        exec.phase = self.phase;
        exec.current = self.current;
        exec.error = self.error;
        exec.inspiration = self.inspiration;
        exec.goals = self.goals;
        exec.tasks = self.tasks;
        exec.results = self.results;
        exec.delivery = self.delivery;
        exec.learning = self.learning;
        exec.start_time = self.start_time;
        exec.restore_status(self.status, self.end_time);
        exec
    }

    /// 把阶段产出写入对应字段（存储层投影，不做一次性校验）
    pub fn apply_output(&mut self, output: PhaseOutput) {
        match output {
            PhaseOutput::Inspiration(v) => self.inspiration = Some(v),
            PhaseOutput::Goals(v) => self.goals = Some(v),
            PhaseOutput::Tasks(v) => self.tasks = v,
            PhaseOutput::Run(v) => self.results = v,
            PhaseOutput::Delivery(v) => self.delivery = Some(v),
            PhaseOutput::Learning(v) => self.learning = v,
        }
    }

    /// 写入状态；进入终态时补写结束时间
    pub fn apply_status(&mut self, status: ExecStatus, error: Option<String>) {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        if status.is_terminal() {
            if self.end_time.is_none() {
                self.end_time = Some(Utc::now());
            }
        } else {
            self.end_time = None;
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub member_id: Option<String>,
    pub team_id: Option<String>,
    pub status: Option<ExecStatus>,
    pub trigger_type: Option<TriggerType>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// 按开始时间倒序（最新在前）
    pub newest_first: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            member_id: None,
            team_id: None,
            status: None,
            trigger_type: None,
            limit: None,
            offset: 0,
            newest_first: true,
        }
    }
}

impl ListOptions {
    pub fn member(member_id: impl Into<String>) -> Self {
        Self {
            member_id: Some(member_id.into()),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, record: &ExecutionRecord) -> bool {
        self.member_id.as_ref().map_or(true, |m| &record.member_id == m)
            && self.team_id.as_ref().map_or(true, |t| &record.team_id == t)
            && self.status.map_or(true, |s| record.status == s)
            && self.trigger_type.map_or(true, |t| record.trigger_type == t)
    }
}

#[async_trait]
pub trait RobotStore: Send + Sync {
    async fn get_robot(&self, member_id: &str) -> Result<Option<RobotRecord>, StoreError>;

    async fn save_robot(&self, record: &RobotRecord) -> Result<(), StoreError>;

    /// 返回当前页记录与满足过滤条件的总数
    async fn list_robots(&self, filter: &RobotFilter) -> Result<(Vec<RobotRecord>, usize), StoreError>;

    async fn update_robot_status(&self, member_id: &str, status: RobotStatus) -> Result<(), StoreError>;

    async fn delete_robot(&self, member_id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// 新增或整体覆盖
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    async fn list_executions(&self, opts: &ListOptions) -> Result<(Vec<ExecutionRecord>, usize), StoreError>;

    async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// 更新当前阶段，可同时写入该阶段产出
    async fn update_execution_phase(
        &self,
        execution_id: &str,
        phase: Phase,
        output: Option<PhaseOutput>,
    ) -> Result<(), StoreError>;

    async fn update_execution_current(
        &self,
        execution_id: &str,
        current: &CurrentState,
    ) -> Result<(), StoreError>;

    async fn delete_execution(&self, execution_id: &str) -> Result<bool, StoreError>;
}
