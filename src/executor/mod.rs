//! 执行器：把一次执行跑完整条阶段流水线
//!
//! [`Executor`] 是可替换的策略接口；调度核心只关心返回的状态、阶段与时间戳。
//! - [`PipelineExecutor`]：通用流水线驱动，阶段内容委托给 [`PhaseHandler`]
//! - [`DryRunPhases`]：模拟阶段产出，用于 dry-run / sandbox 与测试
//! - [`ExecutorSet`]：按 [`ExecutorMode`] 选择执行器

pub mod dry_run;
pub mod pipeline;

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::core::error::Result;
use crate::execution::{Execution, ExecutionControl, TriggerInput};
use crate::robot::{ExecutorMode, Robot};

pub use dry_run::DryRunPhases;
pub use pipeline::{ExecutionHook, ExecutorStats, PhaseContext, PhaseHandler, PipelineExecutor};

/// 生成执行 ID
pub fn new_execution_id() -> String {
    format!("exec_{}", uuid::Uuid::new_v4().simple())
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// 使用新生成的执行 ID 运行
    async fn execute(&self, robot: Arc<Robot>, input: TriggerInput) -> Result<Execution> {
        self.execute_with_id(robot, input, new_execution_id()).await
    }

    /// 使用调用方给定的执行 ID 运行（配额与工作池在流水线开始前就看到同一 ID）
    async fn execute_with_id(
        &self,
        robot: Arc<Robot>,
        input: TriggerInput,
        exec_id: String,
    ) -> Result<Execution> {
        let control = ExecutionControl::new(
            exec_id,
            robot.member_id(),
            robot.team_id(),
            input.trigger_type(),
        );
        self.execute_with_control(robot, input, control).await
    }

    /// 通过控制句柄接收暂停 / 恢复 / 停止；执行 ID 取自 `control.id()`。
    /// 实现必须在每个阶段边界和 run 阶段的每个任务边界调用 `control.checkpoint()`。
    async fn execute_with_control(
        &self,
        robot: Arc<Robot>,
        input: TriggerInput,
        control: ExecutionControl,
    ) -> Result<Execution>;

    fn name(&self) -> &'static str {
        "executor"
    }
}

/// 各执行模式对应的执行器
pub struct ExecutorSet {
    standard: RwLock<Arc<dyn Executor>>,
    dry_run: RwLock<Arc<dyn Executor>>,
    sandbox: RwLock<Option<Arc<dyn Executor>>>,
}

impl ExecutorSet {
    pub fn new(standard: Arc<dyn Executor>) -> Self {
        Self {
            standard: RwLock::new(standard),
            dry_run: RwLock::new(Arc::new(PipelineExecutor::dry_run())),
            sandbox: RwLock::new(None),
        }
    }

    pub fn set(&self, mode: ExecutorMode, executor: Arc<dyn Executor>) {
        match mode {
            ExecutorMode::Standard => {
                *self.standard.write().unwrap_or_else(PoisonError::into_inner) = executor
            }
            ExecutorMode::DryRun => {
                *self.dry_run.write().unwrap_or_else(PoisonError::into_inner) = executor
            }
            ExecutorMode::Sandbox => {
                *self.sandbox.write().unwrap_or_else(PoisonError::into_inner) = Some(executor)
            }
        }
    }

    /// sandbox 未配置时回退到 dry-run
    pub fn get(&self, mode: ExecutorMode) -> Arc<dyn Executor> {
        match mode {
            ExecutorMode::Standard => Arc::clone(&self.standard.read().unwrap_or_else(PoisonError::into_inner)),
            ExecutorMode::Sandbox => {
                let sandbox = self.sandbox.read().unwrap_or_else(PoisonError::into_inner).clone();
                match sandbox {
                    Some(exec) => exec,
                    None => self.get(ExecutorMode::DryRun),
                }
            }
            ExecutorMode::DryRun => Arc::clone(&self.dry_run.read().unwrap_or_else(PoisonError::into_inner)),
        }
    }
}

impl Default for ExecutorSet {
    fn default() -> Self {
        Self::new(Arc::new(PipelineExecutor::dry_run()))
    }
}
