//! 工作池：全局准入闸门
//!
//! - 固定 `worker_size` 个 worker，同时运行的任务数不超过它
//! - 已接受未结束（排队 + 运行）的任务数不超过 `worker_size + queue_size`，超过即刻拒绝，不阻塞
//! - 每个 Robot 排队的任务数不超过其 `quota.queue`
//! - worker 只会取走其 Robot 配额未满的任务（`try_acquire_slot` 成功），
//!   配额已满的 Robot 不会占用 worker，其任务留在队列中保持次序

pub mod queue;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{Result, RobotError};
use crate::execution::{ExecStatus, Execution, ExecutionControl, TriggerInput, TriggerType};
use crate::executor::{Executor, ExecutorSet};
use crate::robot::{ExecutionRef, ExecutorMode, Robot};

pub use queue::PriorityQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_worker_size")]
    pub worker_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_worker_size() -> usize {
    10
}

fn default_queue_size() -> usize {
    100
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_size: default_worker_size(),
            queue_size: default_queue_size(),
        }
    }
}

impl PoolConfig {
    pub fn new(worker_size: usize, queue_size: usize) -> Self {
        Self {
            worker_size: worker_size.max(1),
            queue_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.worker_size.max(1) + self.queue_size
    }
}

/// 一个待执行的任务
pub struct Job {
    robot: Arc<Robot>,
    input: TriggerInput,
    control: ExecutionControl,
    mode: ExecutorMode,
    pub(crate) priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(robot: Arc<Robot>, input: TriggerInput, control: ExecutionControl) -> Self {
        let priority = robot.quota().priority;
        Self {
            robot,
            input,
            control,
            mode: ExecutorMode::Standard,
            priority,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn id(&self) -> &str {
        self.control.id()
    }

    pub fn member_id(&self) -> &str {
        self.robot.member_id()
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.input.trigger_type()
    }

    pub fn robot(&self) -> &Arc<Robot> {
        &self.robot
    }

    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    pub fn mode(&self) -> ExecutorMode {
        self.mode
    }
}

/// 提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    /// 提交时没有可立即运行的空位（worker 全忙或 Robot 配额已满）
    pub queued: bool,
}

/// 任务结束通知
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub exec_id: String,
    pub member_id: String,
    pub status: ExecStatus,
    pub error: Option<String>,
    /// 执行器返回的执行；未调用执行器（排队中被取消）时为空
    pub execution: Option<Execution>,
}

pub type CompletionHook = Arc<dyn Fn(JobOutcome) + Send + Sync>;

struct PoolState {
    queue: PriorityQueue,
    running: usize,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    executors: Arc<ExecutorSet>,
    on_complete: RwLock<Option<CompletionHook>>,
}

pub struct Pool {
    shared: Arc<Shared>,
    started: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_executors(config, Arc::new(ExecutorSet::default()))
    }

    pub fn with_executors(config: PoolConfig, executors: Arc<ExecutorSet>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    queue: PriorityQueue::new(),
                    running: 0,
                }),
                notify: Notify::new(),
                executors,
                on_complete: RwLock::new(None),
            }),
            started: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.config
    }

    /// 替换 standard 模式的执行器
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        self.shared.executors.set(ExecutorMode::Standard, executor);
    }

    pub fn set_executor_for(&self, mode: ExecutorMode, executor: Arc<dyn Executor>) {
        self.shared.executors.set(mode, executor);
    }

    pub fn executor(&self, mode: ExecutorMode) -> Arc<dyn Executor> {
        self.shared.executors.get(mode)
    }

    pub fn set_on_complete(&self, hook: CompletionHook) {
        *self
            .shared
            .on_complete
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RobotError::PoolAlreadyStarted);
        }
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        let worker_size = self.shared.config.worker_size.max(1);
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..worker_size {
            let shared = Arc::clone(&self.shared);
            let token = token.clone();
            workers.push(tokio::spawn(async move {
                shared.worker_loop(worker_id, token).await;
            }));
        }
        info!(
            "Pool started with {} workers (queue size {})",
            worker_size, self.shared.config.queue_size
        );
        Ok(())
    }

    /// 停止：排队中的任务全部取消，等待正在运行的任务结束。重复调用无副作用
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.shared.notify.notify_waiters();

        let drained = self.shared.lock_state().queue.drain();
        if !drained.is_empty() {
            info!("Cancelling {} queued jobs on pool stop", drained.len());
        }
        for job in drained {
            self.shared.cancel_job(job, "pool stopped");
        }

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for result in futures_util::future::join_all(workers).await {
            if let Err(e) = result {
                warn!("Pool worker ended abnormally: {}", e);
            }
        }
        info!("Pool stopped");
    }

    /// 提交任务；立即返回接受或拒绝
    pub fn submit(&self, job: Job) -> Result<Submitted> {
        if !self.is_started() {
            return Err(RobotError::PoolNotStarted);
        }
        let member_id = job.member_id().to_string();
        let robot_queue_limit = job.robot().quota().effective_queue();

        let queued = {
            let mut state = self.shared.lock_state();
            let in_flight = state.queue.len() + state.running;
            if in_flight >= self.shared.config.capacity() {
                return Err(RobotError::PoolFull(in_flight));
            }
            if state.queue.robot_queued(&member_id) >= robot_queue_limit {
                return Err(RobotError::QuotaExceeded(member_id));
            }
            let queued = state.running >= self.shared.config.worker_size.max(1)
                || !job.robot().can_run();
            debug!("Job {} queued for robot {} ({} in flight)", job.id(), member_id, in_flight + 1);
            state.queue.push(job);
            queued
        };
        self.shared.notify.notify_waiters();
        Ok(Submitted { queued })
    }

    /// 取消仍在排队的任务；返回是否找到。被取消的任务不会交给执行器
    pub fn cancel_queued(&self, exec_id: &str) -> bool {
        let job = self.shared.lock_state().queue.remove(exec_id);
        match job {
            Some(job) => {
                self.shared.cancel_job(job, "execution cancelled by user");
                self.shared.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn is_queued(&self, exec_id: &str) -> bool {
        self.shared.lock_state().queue.contains(exec_id)
    }

    pub fn running(&self) -> usize {
        self.shared.lock_state().running
    }

    pub fn queued(&self) -> usize {
        self.shared.lock_state().queue.len()
    }

    pub fn robot_queued(&self, member_id: &str) -> usize {
        self.shared.lock_state().queue.robot_queued(member_id)
    }
}

enum Dispatch {
    Run(Job),
    Cancelled(Job),
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, token: CancellationToken) {
        debug!("Pool worker {} started", worker_id);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if token.is_cancelled() {
                break;
            }
            match self.next_job() {
                Some(Dispatch::Run(job)) => {
                    self.run_job(job).await;
                    continue;
                }
                Some(Dispatch::Cancelled(job)) => {
                    self.cancel_job(job, "execution cancelled by user");
                    continue;
                }
                None => {}
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = &mut notified => {}
            }
        }
        debug!("Pool worker {} stopped", worker_id);
    }

    /// 在队列锁内选出下一个任务，并为其登记 Robot 配额
    fn next_job(&self) -> Option<Dispatch> {
        let mut state = self.lock_state();
        if let Some(job) = state.queue.take_first(|job| job.control().is_cancelled()) {
            return Some(Dispatch::Cancelled(job));
        }
        if state.running >= self.config.worker_size.max(1) {
            return None;
        }
        let job = state.queue.take_first(|job| {
            job.robot()
                .try_acquire_slot(ExecutionRef::new(job.id(), job.trigger_type()))
        })?;
        state.running += 1;
        Some(Dispatch::Run(job))
    }

    async fn run_job(&self, job: Job) {
        let Job {
            robot,
            input,
            control,
            mode,
            ..
        } = job;
        let exec_id = control.id().to_string();

        let outcome = match control.mark_running() {
            Err(e) => JobOutcome {
                exec_id: exec_id.clone(),
                member_id: robot.member_id().to_string(),
                status: control.finish(ExecStatus::Cancelled, Some(e.to_string())),
                error: control.snapshot().error,
                execution: None,
            },
            Ok(()) => {
                let executor = self.executors.get(mode);
                debug!("Job {} picked up, executor {} ({})", exec_id, executor.name(), mode);
                let result = AssertUnwindSafe(executor.execute_with_control(
                    Arc::clone(&robot),
                    input,
                    control.clone(),
                ))
                .catch_unwind()
                .await;

                let (status, error, execution) = match result {
                    Ok(Ok(exec)) => (exec.status(), exec.error.clone(), Some(exec)),
                    Ok(Err(e)) => (ExecStatus::Failed, Some(e.to_string()), None),
                    Err(_) => {
                        warn!("Executor panicked while running {}", exec_id);
                        (ExecStatus::Failed, Some("executor panicked".to_string()), None)
                    }
                };
                let status = control.finish(status, error);
                JobOutcome {
                    exec_id: exec_id.clone(),
                    member_id: robot.member_id().to_string(),
                    status,
                    error: control.snapshot().error,
                    execution,
                }
            }
        };

        robot.remove_execution(&exec_id);
        {
            let mut state = self.lock_state();
            state.running = state.running.saturating_sub(1);
        }
        self.complete(outcome);
        self.notify.notify_waiters();
    }

    /// 未运行就结束的任务：置为 cancelled，不调用执行器
    fn cancel_job(&self, job: Job, reason: &str) {
        let control = job.control().clone();
        if let Err(e) = control.stop(reason) {
            debug!("Queued job {} already finished: {}", control.id(), e);
        }
        let status = control.finish(ExecStatus::Cancelled, Some(reason.to_string()));
        self.complete(JobOutcome {
            exec_id: control.id().to_string(),
            member_id: job.member_id().to_string(),
            status,
            error: control.snapshot().error,
            execution: None,
        });
    }

    fn complete(&self, outcome: JobOutcome) {
        let hook = self
            .on_complete
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(outcome);
        }
    }
}
