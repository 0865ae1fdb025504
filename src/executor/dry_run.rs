//! 模拟阶段处理器：不调用任何模型，按触发内容生成确定的阶段产出
//!
//! 可配置每阶段延迟、每任务延迟和失败阶段，用于 dry-run 模式和调度行为测试。

use std::time::Duration;

use async_trait::async_trait;

use super::pipeline::{PhaseContext, PhaseHandler};
use crate::core::error::{Result, RobotError};
use crate::execution::{
    DeliveryResult, ExecutionControl, ExecutorType, Goals, InspirationReport, LearningEntry,
    LearningKind, Message, Phase, PhaseOutput, Task, TaskResult, TaskSource, TaskStatus,
    TriggerInput,
};

#[derive(Debug, Clone)]
pub struct DryRunPhases {
    delay: Duration,
    task_delay: Duration,
    task_count: usize,
    fail_at: Option<Phase>,
}

impl Default for DryRunPhases {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            task_delay: Duration::ZERO,
            task_count: 2,
            fail_at: None,
        }
    }
}

impl DryRunPhases {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个阶段的模拟耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = delay;
        self
    }

    pub fn with_task_count(mut self, count: usize) -> Self {
        self.task_count = count;
        self
    }

    /// 到达该阶段时返回错误
    pub fn with_fail_at(mut self, phase: Phase) -> Self {
        self.fail_at = Some(phase);
        self
    }

    async fn simulate(&self, control: &ExecutionControl, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        let token = control.cancel_token();
        tokio::select! {
            _ = token.cancelled() => Err(RobotError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn fail_if_configured(&self, phase: Phase) -> Result<()> {
        if self.fail_at == Some(phase) {
            return Err(RobotError::PhaseFailed {
                phase,
                message: "simulated failure".into(),
            });
        }
        Ok(())
    }
}

fn task_source(input: &TriggerInput) -> TaskSource {
    match input {
        TriggerInput::Clock(_) => TaskSource::Auto,
        TriggerInput::Human(_) => TaskSource::Human,
        TriggerInput::Event(_) => TaskSource::Event,
    }
}

#[async_trait]
impl PhaseHandler for DryRunPhases {
    async fn run_phase(&self, ctx: &PhaseContext<'_>, phase: Phase) -> Result<PhaseOutput> {
        self.simulate(ctx.control, self.delay).await?;
        self.fail_if_configured(phase)?;

        let exec = ctx.execution;
        let summary = exec.input.summary();
        let output = match phase {
            Phase::Inspiration => PhaseOutput::Inspiration(InspirationReport {
                content: format!("[dry-run] {} reviews its context: {}", ctx.robot.display_name(), summary),
                clock: match &exec.input {
                    TriggerInput::Clock(c) => Some(c.clone()),
                    _ => None,
                },
            }),
            Phase::Goals => PhaseOutput::Goals(Goals {
                content: format!("## Goals\n1. {}", summary),
            }),
            Phase::Tasks => {
                let agent = ctx.robot.config().resources.phase_agent(Phase::Run);
                let tasks = (0..self.task_count)
                    .map(|i| Task {
                        id: format!("{}-task-{}", exec.id, i + 1),
                        messages: vec![Message::user(format!("step {} of {}", i + 1, summary))],
                        goal_ref: Some("goal-1".into()),
                        source: task_source(&exec.input),
                        executor_type: ExecutorType::Assistant,
                        executor_id: agent.clone(),
                        args: Vec::new(),
                        status: TaskStatus::Pending,
                        order: i,
                        start_time: None,
                        end_time: None,
                    })
                    .collect();
                PhaseOutput::Tasks(tasks)
            }
            Phase::Delivery => PhaseOutput::Delivery(DeliveryResult {
                kind: "dry-run".into(),
                success: true,
                details: Some(serde_json::json!({
                    "tasks": exec.tasks.len(),
                    "succeeded": exec.results.iter().filter(|r| r.success).count(),
                })),
                error: None,
            }),
            Phase::Learning => PhaseOutput::Learning(vec![LearningEntry {
                kind: LearningKind::Execution,
                content: format!("completed {} tasks for: {}", exec.results.len(), summary),
                tags: vec!["dry-run".into(), exec.trigger_type.to_string()],
                meta: None,
            }]),
            Phase::Run => {
                return Err(RobotError::PhaseFailed {
                    phase,
                    message: "run phase is driven task by task".into(),
                })
            }
        };
        Ok(output)
    }

    async fn run_task(&self, ctx: &PhaseContext<'_>, task: &Task) -> Result<TaskResult> {
        let started = std::time::Instant::now();
        self.simulate(ctx.control, self.task_delay).await?;
        self.fail_if_configured(Phase::Run)?;
        Ok(TaskResult {
            task_id: task.id.clone(),
            success: true,
            output: Some(serde_json::json!({ "executor": task.executor_id, "dry_run": true })),
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
            validated: true,
        })
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}
