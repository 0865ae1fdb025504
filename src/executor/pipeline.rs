//! 流水线执行器
//!
//! 负责阶段顺序、控制检查点、配额登记与释放、状态与阶段产出的持久化、计数；
//! 每个阶段具体产出什么由 [`PhaseHandler`] 决定。
//! 阶段失败不会回滚已记录的产出，便于诊断。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::Executor;
use crate::core::error::{Result, RobotError};
use crate::execution::{
    CurrentState, ExecStatus, Execution, ExecutionControl, Phase, PhaseOutput, Task, TaskResult,
    TaskStatus, TriggerInput,
};
use crate::robot::{ExecutionRef, Robot, RobotStatus};
use crate::store::{ExecutionRecord, ExecutionStore, RobotStore};

use super::dry_run::DryRunPhases;

/// 阶段处理器可见的上下文
pub struct PhaseContext<'a> {
    pub robot: &'a Robot,
    pub execution: &'a Execution,
    pub control: &'a ExecutionControl,
}

#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// 运行除 run 以外的阶段，返回该阶段的产出
    async fn run_phase(&self, ctx: &PhaseContext<'_>, phase: Phase) -> Result<PhaseOutput>;

    /// run 阶段中执行单个任务；返回 Err 视为阶段失败，success=false 的结果仅被记录
    async fn run_task(&self, ctx: &PhaseContext<'_>, task: &Task) -> Result<TaskResult>;

    fn name(&self) -> &'static str {
        "phases"
    }
}

/// 执行开始 / 结束回调
pub type ExecutionHook = Arc<dyn Fn(&ExecutionControl) + Send + Sync>;

/// 执行计数
#[derive(Debug, Default)]
pub struct ExecutorStats {
    total: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ExecutorStats {
    fn begin(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// 已开始的执行总数
    pub fn exec_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn current_count(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak_count(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// 离开作用域时从 Robot 的运行集合移除执行
struct SlotGuard<'a> {
    robot: &'a Robot,
    exec_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.robot.remove_execution(self.exec_id);
    }
}

pub struct PipelineExecutor {
    phases: Arc<dyn PhaseHandler>,
    store: Option<Arc<dyn ExecutionStore>>,
    robot_store: Option<Arc<dyn RobotStore>>,
    stats: ExecutorStats,
    on_start: Option<ExecutionHook>,
    on_end: Option<ExecutionHook>,
}

impl PipelineExecutor {
    pub fn new(phases: Arc<dyn PhaseHandler>) -> Self {
        Self {
            phases,
            store: None,
            robot_store: None,
            stats: ExecutorStats::default(),
            on_start: None,
            on_end: None,
        }
    }

    /// 模拟阶段、无延迟
    pub fn dry_run() -> Self {
        Self::new(Arc::new(DryRunPhases::new()))
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_robot_store(mut self, store: Arc<dyn RobotStore>) -> Self {
        self.robot_store = Some(store);
        self
    }

    pub fn with_callbacks(mut self, on_start: ExecutionHook, on_end: ExecutionHook) -> Self {
        self.on_start = Some(on_start);
        self.on_end = Some(on_end);
        self
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    async fn save(&self, exec: &Execution) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_execution(&ExecutionRecord::from(exec)).await {
                warn!("Failed to persist execution {}: {}", exec.id, e);
            }
        }
    }

    async fn save_phase(&self, exec_id: &str, phase: Phase, output: Option<PhaseOutput>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_execution_phase(exec_id, phase, output).await {
                warn!("Failed to persist phase {} of {}: {}", phase, exec_id, e);
            }
        }
    }

    async fn save_current(&self, exec_id: &str, current: &CurrentState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_execution_current(exec_id, current).await {
                warn!("Failed to persist progress of {}: {}", exec_id, e);
            }
        }
    }

    async fn set_robot_status(&self, robot: &Robot, status: RobotStatus) {
        let current = robot.status();
        let allowed = matches!(
            (current, status),
            (RobotStatus::Idle, RobotStatus::Working) | (RobotStatus::Working, RobotStatus::Idle)
        );
        if !allowed {
            return;
        }
        robot.set_status(status);
        if let Some(store) = &self.robot_store {
            if let Err(e) = store.update_robot_status(robot.member_id(), status).await {
                warn!("Failed to persist status of robot {}: {}", robot.member_id(), e);
            }
        }
    }

    async fn run_pipeline(
        &self,
        robot: &Robot,
        exec: &mut Execution,
        control: &ExecutionControl,
    ) -> Result<()> {
        for &phase in Phase::pipeline(exec.trigger_type) {
            control.checkpoint().await?;
            control.set_phase(phase);
            exec.phase = phase;
            self.save_phase(&exec.id, phase, None).await;
            debug!("Execution {} entering phase {}", exec.id, phase);

            if phase == Phase::Run {
                self.run_tasks(robot, exec, control).await?;
                continue;
            }

            let output = {
                let ctx = PhaseContext {
                    robot,
                    execution: exec,
                    control,
                };
                self.phases.run_phase(&ctx, phase).await?
            };
            if output.phase() != phase {
                return Err(RobotError::PhaseFailed {
                    phase,
                    message: format!("handler returned output for phase {}", output.phase()),
                });
            }
            exec.record(output.clone())?;
            self.save_phase(&exec.id, phase, Some(output)).await;
        }
        Ok(())
    }

    async fn run_tasks(
        &self,
        robot: &Robot,
        exec: &mut Execution,
        control: &ExecutionControl,
    ) -> Result<()> {
        let total = exec.tasks.len();
        for index in 0..total {
            control.checkpoint().await?;

            let current = CurrentState {
                task_index: index,
                progress: format!("{}/{}", index + 1, total),
            };
            exec.current = Some(current.clone());
            self.save_current(&exec.id, &current).await;

            exec.tasks[index].status = TaskStatus::Running;
            exec.tasks[index].start_time = Some(Utc::now());
            let task = exec.tasks[index].clone();

            let outcome = {
                let ctx = PhaseContext {
                    robot,
                    execution: exec,
                    control,
                };
                self.phases.run_task(&ctx, &task).await
            };

            exec.tasks[index].end_time = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    exec.tasks[index].status = if result.success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    exec.record(PhaseOutput::Run(vec![result]))?;
                }
                Err(e) => {
                    exec.tasks[index].status = TaskStatus::Failed;
                    for rest in exec.tasks.iter_mut().skip(index + 1) {
                        rest.status = TaskStatus::Skipped;
                    }
                    return Err(e);
                }
            }
        }
        self.save_phase(&exec.id, Phase::Run, Some(PhaseOutput::Run(exec.results.clone())))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Executor for PipelineExecutor {
    async fn execute_with_control(
        &self,
        robot: Arc<Robot>,
        input: TriggerInput,
        control: ExecutionControl,
    ) -> Result<Execution> {
        let exec_id = control.id().to_string();
        let trigger = input.trigger_type();
        let mut exec = Execution::new(exec_id.clone(), robot.member_id(), robot.team_id(), input);
        exec.start_time = control.started_at();

        if !robot.try_acquire_slot(ExecutionRef::new(exec_id.clone(), trigger)) {
            return Err(RobotError::QuotaExceeded(robot.member_id().to_string()));
        }
        let slot = SlotGuard {
            robot: &robot,
            exec_id: &exec_id,
        };

        if control.status() == ExecStatus::Pending {
            if let Err(e) = control.mark_running() {
                if e.is_cancelled() {
                    exec.cancel("execution cancelled before start")?;
                    self.save(&exec).await;
                    return Ok(exec);
                }
                return Err(e);
            }
        }
        exec.transition_to(ExecStatus::Running)?;

        self.stats.begin();
        if let Some(hook) = &self.on_start {
            hook(&control);
        }
        self.save(&exec).await;
        self.set_robot_status(&robot, RobotStatus::Working).await;
        info!(
            "Execution {} started for robot {} ({} trigger)",
            exec_id,
            robot.member_id(),
            trigger
        );

        let outcome = self.run_pipeline(&robot, &mut exec, &control).await;
        let (target, error) = match outcome {
            Ok(()) => (ExecStatus::Completed, None),
            Err(RobotError::Cancelled) => (
                ExecStatus::Cancelled,
                Some("execution cancelled by user".to_string()),
            ),
            Err(e) => (ExecStatus::Failed, Some(e.to_string())),
        };

        // 控制句柄上已有的终态（例如外部 stop）优先
        let status = control.finish(target, error.clone());
        let error = control.snapshot().error.or(error);
        exec.transition_to(status)?;
        exec.error = error;

        match status {
            ExecStatus::Completed => info!("Execution {} completed", exec_id),
            ExecStatus::Cancelled => info!("Execution {} cancelled in phase {}", exec_id, exec.phase),
            _ => warn!(
                "Execution {} failed in phase {}: {}",
                exec_id,
                exec.phase,
                exec.error.as_deref().unwrap_or("unknown error")
            ),
        }

        self.save(&exec).await;
        self.stats.end();
        if let Some(hook) = &self.on_end {
            hook(&control);
        }
        drop(slot);
        if robot.running_count() == 0 {
            self.set_robot_status(&robot, RobotStatus::Idle).await;
        }
        Ok(exec)
    }

    fn name(&self) -> &'static str {
        "pipeline"
    }
}
