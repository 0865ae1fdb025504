//! Execution：一次触发到结束的运行记录与状态机
//!
//! 状态流转：
//! ```text
//! pending ──► running ──► completed | failed | cancelled
//!    │          ▲  │
//!    │          │  ▼
//!    │         paused ──► cancelled
//!    └──────────────────► cancelled   （排队中即被停止）
//! ```
//! 终态不可再迁出；进入终态时写入 `end_time`，因此 `end_time.is_some()` 当且仅当处于终态。

pub mod control;
pub mod trigger;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, RobotError};

pub use control::{ControlledExecution, ExecutionControl, ExecutionController};
pub use trigger::{
    ClockContext, EventInput, EventRequest, EventSource, HumanInput, InterveneRequest,
    InterventionAction, Message, Role, TriggerInput, TriggerType,
};

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, to: ExecStatus) -> bool {
        use ExecStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecStatus {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RobotError::InvalidRequest(format!("unknown status: {}", other))),
        }
    }
}

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Inspiration,
    Goals,
    Tasks,
    Run,
    Delivery,
    Learning,
}

impl Phase {
    /// 完整流水线（时钟触发）
    pub const ALL: [Phase; 6] = [
        Phase::Inspiration,
        Phase::Goals,
        Phase::Tasks,
        Phase::Run,
        Phase::Delivery,
        Phase::Learning,
    ];

    /// 触发类型对应的阶段序列：human / event 跳过 inspiration
    pub fn pipeline(trigger: TriggerType) -> &'static [Phase] {
        match trigger {
            TriggerType::Clock => &Self::ALL,
            TriggerType::Human | TriggerType::Event => &Self::ALL[1..],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inspiration => "inspiration",
            Self::Goals => "goals",
            Self::Tasks => "tasks",
            Self::Run => "run",
            Self::Delivery => "delivery",
            Self::Learning => "learning",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| RobotError::InvalidRequest(format!("unknown phase: {}", s)))
    }
}

/// run 阶段内的细粒度位置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentState {
    pub task_index: usize,
    pub progress: String,
}

/// inspiration 阶段产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspirationReport {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<ClockContext>,
}

/// goals 阶段产出（markdown 形式的目标列表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goals {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// 任务执行者类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    Assistant,
    Mcp,
    Process,
}

/// 任务来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Auto,
    Human,
    Event,
}

/// tasks 阶段拆解出的单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_ref: Option<String>,
    pub source: TaskSource,
    pub executor_type: ExecutorType,
    pub executor_id: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub status: TaskStatus,
    pub order: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub validated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningKind {
    Execution,
    Feedback,
    Insight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEntry {
    #[serde(rename = "type")]
    pub kind: LearningKind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// 单个阶段的产出，按阶段区分的和类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "data", rename_all = "lowercase")]
pub enum PhaseOutput {
    Inspiration(InspirationReport),
    Goals(Goals),
    Tasks(Vec<Task>),
    Run(Vec<TaskResult>),
    Delivery(DeliveryResult),
    Learning(Vec<LearningEntry>),
}

impl PhaseOutput {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Inspiration(_) => Phase::Inspiration,
            Self::Goals(_) => Phase::Goals,
            Self::Tasks(_) => Phase::Tasks,
            Self::Run(_) => Phase::Run,
            Self::Delivery(_) => Phase::Delivery,
            Self::Learning(_) => Phase::Learning,
        }
    }
}

/// 一次执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub member_id: String,
    pub team_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub trigger_type: TriggerType,
    status: ExecStatus,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input: TriggerInput,

    #[serde(default)]
    pub inspiration: Option<InspirationReport>,
    #[serde(default)]
    pub goals: Option<Goals>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub results: Vec<TaskResult>,
    #[serde(default)]
    pub delivery: Option<DeliveryResult>,
    #[serde(default)]
    pub learning: Vec<LearningEntry>,

    pub start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
}

impl Execution {
    /// 新建 pending 执行；起始阶段由触发类型决定
    pub fn new(
        id: impl Into<String>,
        member_id: impl Into<String>,
        team_id: impl Into<String>,
        input: TriggerInput,
    ) -> Self {
        let trigger_type = input.trigger_type();
        Self {
            id: id.into(),
            member_id: member_id.into(),
            team_id: team_id.into(),
            job_id: None,
            trigger_type,
            status: ExecStatus::Pending,
            phase: Phase::pipeline(trigger_type)[0],
            current: None,
            error: None,
            input,
            inspiration: None,
            goals: None,
            tasks: Vec::new(),
            results: Vec::new(),
            delivery: None,
            learning: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn status(&self) -> ExecStatus {
        self.status
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 按状态机迁移；进入终态时写入结束时间
    pub fn transition_to(&mut self, to: ExecStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(RobotError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition_to(ExecStatus::Completed)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition_to(ExecStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition_to(ExecStatus::Cancelled)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// 写入阶段产出。单值产出只允许写一次，run 阶段的结果只追加
    pub fn record(&mut self, output: PhaseOutput) -> Result<()> {
        let phase = output.phase();
        match output {
            PhaseOutput::Inspiration(v) => set_once(&mut self.inspiration, v, phase),
            PhaseOutput::Goals(v) => set_once(&mut self.goals, v, phase),
            PhaseOutput::Delivery(v) => set_once(&mut self.delivery, v, phase),
            PhaseOutput::Tasks(v) => {
                if !self.tasks.is_empty() {
                    return Err(RobotError::PhaseOutputExists(phase));
                }
                self.tasks = v;
                Ok(())
            }
            PhaseOutput::Learning(v) => {
                if !self.learning.is_empty() {
                    return Err(RobotError::PhaseOutputExists(phase));
                }
                self.learning = v;
                Ok(())
            }
            PhaseOutput::Run(v) => {
                self.results.extend(v);
                Ok(())
            }
        }
    }

    /// 从存储重建时恢复状态与结束时间（不经过状态机校验）
    pub(crate) fn restore_status(&mut self, status: ExecStatus, end_time: Option<DateTime<Utc>>) {
        self.status = status;
        self.end_time = end_time;
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, phase: Phase) -> Result<()> {
    if slot.is_some() {
        return Err(RobotError::PhaseOutputExists(phase));
    }
    *slot = Some(value);
    Ok(())
}
