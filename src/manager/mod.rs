//! Manager：调度核心的顶层协调者
//!
//! 持有 Robot 缓存、工作池与时钟，负责：
//! - 触发路由（clock / human / event）与两级准入
//! - 执行控制（暂停 / 恢复 / 停止）与状态查询
//! - 生命周期（start / stop）
//!
//! 准入链路：`trigger` → 缓存取 Robot → 状态与触发开关检查 → 写入 pending 记录 →
//! `Pool::submit`（全局闸门 + Robot 排队上限）→ worker 在 Robot 配额允许时取走执行。
//! 准入拒绝以 `accepted=false` 报告；存储错误作为错误返回。

pub mod clock;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::RobotCache;
use crate::core::error::{Result, RobotError, StoreResultExt};
use crate::execution::{
    ClockContext, ControlledExecution, EventRequest, ExecStatus, Execution, ExecutionControl,
    ExecutionController, InterveneRequest, InterventionAction, TriggerInput, TriggerType,
};
use crate::executor::{new_execution_id, DryRunPhases, Executor, ExecutorSet, PipelineExecutor};
use crate::pool::{Job, JobOutcome, Pool, PoolConfig};
use crate::robot::{ExecutorMode, Robot, RobotStatus};
use crate::store::{ExecutionRecord, ExecutionStore, ListOptions, MemoryStore, RobotStore};

/// 调度核心可调的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// 时钟检查间隔；为零时不启动时钟
    pub tick_interval: Duration,
    pub pool: PoolConfig,
    /// stop 时等待运行中执行结束的最长时间
    pub stop_grace: Duration,
    /// 缓存整体重载间隔；None 表示不自动刷新
    pub cache_refresh: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            pool: PoolConfig::default(),
            stop_grace: Duration::from_secs(30),
            cache_refresh: Some(Duration::from_secs(3600)),
        }
    }
}

impl ManagerConfig {
    pub fn with_pool(mut self, worker_size: usize, queue_size: usize) -> Self {
        self.pool = PoolConfig::new(worker_size, queue_size);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_cache_refresh(mut self, interval: Option<Duration>) -> Self {
        self.cache_refresh = interval;
        self
    }
}

/// 一次触发请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub input: TriggerInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_mode: Option<ExecutorMode>,
}

impl TriggerRequest {
    pub fn new(input: TriggerInput) -> Self {
        Self {
            input,
            executor_mode: None,
        }
    }

    pub fn with_executor_mode(mut self, mode: ExecutorMode) -> Self {
        self.executor_mode = Some(mode);
        self
    }
}

impl From<TriggerInput> for TriggerRequest {
    fn from(input: TriggerInput) -> Self {
        Self::new(input)
    }
}

/// 触发结果；准入拒绝时 `accepted=false`，`message` 说明原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResult {
    pub accepted: bool,
    /// 已接受但暂时没有可用的 worker 或 Robot 配额
    pub queued: bool,
    pub execution_id: Option<String>,
    pub message: String,
}

impl TriggerResult {
    fn accepted(execution_id: String, queued: bool) -> Self {
        Self {
            accepted: true,
            queued,
            message: if queued {
                "execution queued".to_string()
            } else {
                "execution started".to_string()
            },
            execution_id: Some(execution_id),
        }
    }

    fn rejected(reason: &RobotError) -> Self {
        Self {
            accepted: false,
            queued: false,
            execution_id: None,
            message: reason.to_string(),
        }
    }
}

/// 人工干预 / 事件触发的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecStatus,
    pub message: String,
}

/// Robot 的调度状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotState {
    pub member_id: String,
    pub team_id: String,
    pub display_name: String,
    pub status: RobotStatus,
    pub running: usize,
    pub max_running: usize,
    pub queued: usize,
    pub running_ids: Vec<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// 启动后才存在的部件；stop 时整体释放
struct Runtime {
    cache: Arc<RobotCache>,
    pool: Arc<Pool>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    fn spawn(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

struct Inner {
    config: ManagerConfig,
    robot_store: Arc<dyn RobotStore>,
    exec_store: Arc<dyn ExecutionStore>,
    executors: Arc<ExecutorSet>,
    controller: Arc<ExecutionController>,
    lifecycle: tokio::sync::Mutex<()>,
    runtime: RwLock<Option<Arc<Runtime>>>,
}

/// 调度管理器；克隆得到同一实例的句柄
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// 默认配置 + 内存存储
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_stores(config, store.clone(), store)
    }

    /// 指定存储；standard 与 dry-run 执行器默认都是挂接这两个存储的模拟流水线
    pub fn with_stores(
        config: ManagerConfig,
        robot_store: Arc<dyn RobotStore>,
        exec_store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let pipeline = || {
            PipelineExecutor::new(Arc::new(DryRunPhases::new()))
                .with_store(Arc::clone(&exec_store))
                .with_robot_store(Arc::clone(&robot_store))
        };
        let executors = ExecutorSet::new(Arc::new(pipeline()));
        executors.set(ExecutorMode::DryRun, Arc::new(pipeline()));

        Self {
            inner: Arc::new(Inner {
                config,
                robot_store,
                exec_store,
                executors: Arc::new(executors),
                controller: Arc::new(ExecutionController::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                runtime: RwLock::new(None),
            }),
        }
    }

    /// 替换 standard 执行器（构建阶段）
    pub fn with_executor(self, executor: Arc<dyn Executor>) -> Self {
        self.set_executor(executor);
        self
    }

    /// 替换 standard 执行器；已启动时对之后取走的任务生效
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        self.inner.executors.set(ExecutorMode::Standard, executor);
    }

    pub fn set_executor_for(&self, mode: ExecutorMode, executor: Arc<dyn Executor>) {
        self.inner.executors.set(mode, executor);
    }

    pub fn executor(&self, mode: ExecutorMode) -> Arc<dyn Executor> {
        self.inner.executors.get(mode)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn robot_store(&self) -> Arc<dyn RobotStore> {
        Arc::clone(&self.inner.robot_store)
    }

    pub fn execution_store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.inner.exec_store)
    }

    pub fn controller(&self) -> Arc<ExecutionController> {
        Arc::clone(&self.inner.controller)
    }

    // ---- 生命周期 ----

    /// 启动：构建缓存与工作池、载入自治 Robot、启动时钟与缓存刷新。
    /// 已启动时返回 `ManagerAlreadyStarted`
    pub async fn start(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.current().is_some() {
            return Err(RobotError::ManagerAlreadyStarted);
        }

        let cache = Arc::new(RobotCache::new(Arc::clone(&self.inner.robot_store)));
        let loaded = cache.load().await?;

        let pool = Arc::new(Pool::with_executors(
            self.inner.config.pool,
            Arc::clone(&self.inner.executors),
        ));
        let weak = Arc::downgrade(&self.inner);
        pool.set_on_complete(Arc::new(move |outcome| Inner::on_job_complete(&weak, outcome)));
        pool.start()?;

        let runtime = Arc::new(Runtime {
            cache: Arc::clone(&cache),
            pool,
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        if !self.inner.config.tick_interval.is_zero() {
            runtime.spawn(self.spawn_ticker(runtime.token.clone()));
        }
        if let Some(interval) = self.inner.config.cache_refresh.filter(|d| !d.is_zero()) {
            runtime.spawn(cache.spawn_auto_refresh(interval, runtime.token.clone()));
        }

        *self.inner.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
        info!(
            "Manager started: {} robots, {} workers, queue {}",
            loaded, self.inner.config.pool.worker_size, self.inner.config.pool.queue_size
        );
        Ok(())
    }

    /// 停止：取消排队中的执行，等待运行中的执行结束或暂停（最多 `stop_grace`），
    /// 超时后取消剩余执行，再停止工作池并释放缓存与工作池。重复调用无副作用
    pub async fn stop(&self) {
        self.stop_within(self.inner.config.stop_grace).await
    }

    /// 同 [`Manager::stop`]，宽限期由调用方给定；`Duration::ZERO` 表示立即取消全部在途执行
    pub async fn stop_within(&self, grace: Duration) {
        let _guard = self.inner.lifecycle.lock().await;
        let runtime = self
            .inner
            .runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runtime) = runtime else {
            return;
        };
        info!("Stopping manager...");
        runtime.token.cancel();

        // 排队中的执行不算在途，直接取消
        for control in self.inner.controller.controls() {
            if control.status() == ExecStatus::Pending {
                let _ = control.stop("manager stopped");
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.inner.has_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut forced = 0;
        for control in self.inner.controller.controls() {
            if !control.status().is_terminal() && control.stop("manager stopped").is_ok() {
                forced += 1;
            }
        }
        if forced > 0 {
            warn!("Cancelled {} executions still in flight after grace period", forced);
        }

        runtime.pool.stop().await;

        let tasks: Vec<_> =
            std::mem::take(&mut *runtime.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Manager background task ended abnormally: {}", e);
            }
        }

        // 等待结束回调写完存储
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.inner.controller.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("Manager stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.current().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.is_started()
    }

    pub fn cache(&self) -> Option<Arc<RobotCache>> {
        self.inner.current().map(|rt| Arc::clone(&rt.cache))
    }

    pub fn pool(&self) -> Option<Arc<Pool>> {
        self.inner.current().map(|rt| Arc::clone(&rt.pool))
    }

    // ---- 触发 ----

    /// 触发一次执行；准入拒绝返回 `accepted=false`，存储错误返回 Err
    pub async fn trigger(&self, member_id: &str, request: TriggerRequest) -> Result<TriggerResult> {
        match self
            .inner
            .admit(member_id, request.input, request.executor_mode)
            .await
        {
            Ok((exec_id, queued)) => Ok(TriggerResult::accepted(exec_id, queued)),
            Err(e) if e.is_rejection() => {
                warn!("Trigger for robot {} rejected: {}", member_id, e);
                Ok(TriggerResult::rejected(&e))
            }
            Err(e) => Err(e),
        }
    }

    /// 触发一次执行并返回执行 ID；准入拒绝以错误返回，可用 [`RobotError::is_rejection`] 区分
    pub async fn trigger_manual(&self, member_id: &str, input: TriggerInput) -> Result<String> {
        let (exec_id, _) = self.inner.admit(member_id, input, None).await?;
        Ok(exec_id)
    }

    /// 人工干预。`plan.add` 带未来的 `plan_time` 时延迟到该时刻提交
    pub async fn intervene(&self, request: InterveneRequest) -> Result<ExecutionResult> {
        request.validate()?;
        let member_id = request.member_id.clone();
        let mode = request.executor_mode;

        if request.action == InterventionAction::PlanAdd {
            if let Some(at) = request.plan_time.filter(|at| *at > Utc::now()) {
                return self.schedule_plan(&member_id, request.into_input(), mode, at).await;
            }
        }

        let (exec_id, queued) = self.inner.admit(&member_id, request.into_input(), mode).await?;
        Ok(ExecutionResult {
            execution_id: exec_id,
            status: ExecStatus::Pending,
            message: if queued {
                "intervention queued".to_string()
            } else {
                "intervention started".to_string()
            },
        })
    }

    /// 外部事件触发
    pub async fn handle_event(&self, request: EventRequest) -> Result<ExecutionResult> {
        request.validate()?;
        let member_id = request.member_id.clone();
        let mode = request.executor_mode;
        let event_type = request.event_type.clone();
        let (exec_id, _) = self.inner.admit(&member_id, request.into_input(), mode).await?;
        Ok(ExecutionResult {
            execution_id: exec_id,
            status: ExecStatus::Pending,
            message: format!("event {} accepted", event_type),
        })
    }

    async fn schedule_plan(
        &self,
        member_id: &str,
        input: TriggerInput,
        mode: Option<ExecutorMode>,
        at: DateTime<Utc>,
    ) -> Result<ExecutionResult> {
        let runtime = self.inner.current().ok_or(RobotError::ManagerNotStarted)?;
        let robot = self.inner.check_robot(&runtime, member_id, TriggerType::Human).await?;
        let mode = ExecutorMode::resolve(mode, robot.config().executor.mode);
        let control = self.inner.prepare(&robot, &input).await?;
        let exec_id = control.id().to_string();

        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let inner = Arc::downgrade(&self.inner);
        let token = runtime.token.clone();
        let task = tokio::spawn(async move {
            let cancelled = control.cancel_token();
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(inner) = inner.upgrade() {
                        inner.finalize(&control, "manager stopped").await;
                    }
                }
                _ = cancelled.cancelled() => {
                    if let Some(inner) = inner.upgrade() {
                        inner.finalize(&control, "execution cancelled by user").await;
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    let Some(inner) = inner.upgrade() else { return };
                    let Some(runtime) = inner.current() else {
                        inner.finalize(&control, "manager stopped").await;
                        return;
                    };
                    let job = Job::new(robot, input, control.clone()).with_mode(mode);
                    if let Err(e) = runtime.pool.submit(job) {
                        warn!("Planned execution {} rejected: {}", control.id(), e);
                        inner.finalize(&control, &e.to_string()).await;
                    }
                }
            }
        });
        runtime.spawn(task);

        info!("Execution {} planned for robot {} at {}", exec_id, member_id, at);
        Ok(ExecutionResult {
            execution_id: exec_id,
            status: ExecStatus::Pending,
            message: format!("planned at {}", at.to_rfc3339()),
        })
    }

    /// 检查全部缓存 Robot 的时钟计划并提交到期的 clock 触发；返回被接受的数量
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.tick(now).await
    }

    fn spawn_ticker(&self, token: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        // 单次 tick 出错或 panic 都不能让时钟停下
                        match AssertUnwindSafe(inner.tick(Utc::now())).catch_unwind().await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("Clock tick failed: {}", e),
                            Err(_) => error!("Clock tick panicked, ticker keeps running"),
                        }
                    }
                }
            }
            debug!("Clock ticker stopped");
        })
    }

    // ---- 执行控制 ----

    pub async fn pause_execution(&self, exec_id: &str) -> Result<()> {
        let Some(control) = self.inner.controller.get(exec_id) else {
            return Err(self.inner.missing_execution(exec_id).await?);
        };
        control.pause()?;
        self.inner
            .exec_store
            .update_execution_status(exec_id, ExecStatus::Paused, None)
            .await
            .context(format!("persist pause of {}", exec_id))?;
        info!("Execution {} paused", exec_id);
        Ok(())
    }

    pub async fn resume_execution(&self, exec_id: &str) -> Result<()> {
        let Some(control) = self.inner.controller.get(exec_id) else {
            return Err(self.inner.missing_execution(exec_id).await?);
        };
        control.resume()?;
        self.inner
            .exec_store
            .update_execution_status(exec_id, ExecStatus::Running, None)
            .await
            .context(format!("persist resume of {}", exec_id))?;
        info!("Execution {} resumed", exec_id);
        Ok(())
    }

    /// 停止执行。仍在排队的执行直接置为 cancelled，不会交给执行器
    pub async fn stop_execution(&self, exec_id: &str) -> Result<()> {
        let Some(control) = self.inner.controller.get(exec_id) else {
            return Err(self.inner.missing_execution(exec_id).await?);
        };
        let dequeued = self
            .inner
            .current()
            .map(|rt| rt.pool.cancel_queued(exec_id))
            .unwrap_or(false);
        if !dequeued {
            control.stop("execution cancelled by user")?;
        }
        self.inner
            .exec_store
            .update_execution_status(
                exec_id,
                ExecStatus::Cancelled,
                Some("execution cancelled by user".to_string()),
            )
            .await
            .context(format!("persist stop of {}", exec_id))?;
        info!("Execution {} stopped", exec_id);
        Ok(())
    }

    /// 在途执行取自控制表，已结束的取自存储
    pub async fn get_execution_status(&self, exec_id: &str) -> Result<ControlledExecution> {
        if let Some(snapshot) = self.inner.controller.snapshot(exec_id) {
            return Ok(snapshot);
        }
        let record = self
            .inner
            .exec_store
            .get_execution(exec_id)
            .await
            .context(format!("load execution {}", exec_id))?
            .ok_or_else(|| RobotError::ExecutionNotFound(exec_id.to_string()))?;
        Ok(snapshot_from_record(&record))
    }

    /// 在途执行列表
    pub fn list_executions(&self) -> Vec<ControlledExecution> {
        self.inner.controller.list()
    }

    pub fn list_executions_by_member(&self, member_id: &str) -> Vec<ControlledExecution> {
        self.inner.controller.list_by_member(member_id)
    }

    /// 已持久化的执行（含已结束的），最新在前
    pub async fn execution_history(&self, opts: &ListOptions) -> Result<(Vec<Execution>, usize)> {
        let (records, total) = self
            .inner
            .exec_store
            .list_executions(opts)
            .await
            .context("list executions")?;
        Ok((records.into_iter().map(ExecutionRecord::into_execution).collect(), total))
    }

    // ---- 状态 ----

    pub fn running(&self) -> usize {
        self.inner.current().map(|rt| rt.pool.running()).unwrap_or(0)
    }

    pub fn queued(&self) -> usize {
        self.inner.current().map(|rt| rt.pool.queued()).unwrap_or(0)
    }

    pub fn cached_robots(&self) -> usize {
        self.inner.current().map(|rt| rt.cache.count()).unwrap_or(0)
    }

    pub fn robot_state(&self, member_id: &str) -> Option<RobotState> {
        let runtime = self.inner.current()?;
        let robot = runtime.cache.get(member_id)?;
        Some(RobotState {
            member_id: robot.member_id().to_string(),
            team_id: robot.team_id().to_string(),
            display_name: robot.display_name(),
            status: robot.status(),
            running: robot.running_count(),
            max_running: robot.quota().effective_max(),
            queued: runtime.pool.robot_queued(member_id),
            running_ids: robot.running_ids(),
            last_run: robot.last_run(),
            next_run: robot.next_run(),
        })
    }

    /// 从存储重新读取单个 Robot，更新或移出缓存
    pub async fn refresh_robot(&self, member_id: &str) -> Result<bool> {
        let runtime = self.inner.current().ok_or(RobotError::ManagerNotStarted)?;
        runtime.cache.refresh(member_id).await
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<Runtime>> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn has_running(&self) -> bool {
        self.controller
            .controls()
            .iter()
            .any(|c| c.status() == ExecStatus::Running)
    }

    /// 取 Robot 并做状态与触发开关检查
    async fn check_robot(
        &self,
        runtime: &Runtime,
        member_id: &str,
        trigger: TriggerType,
    ) -> Result<Arc<Robot>> {
        let robot = runtime.cache.load_by_id(member_id).await?;
        if robot.status() == RobotStatus::Paused {
            return Err(RobotError::RobotPaused(member_id.to_string()));
        }
        if !robot.config().triggers.is_enabled(trigger) {
            return Err(RobotError::TriggerDisabled(trigger));
        }
        Ok(robot)
    }

    /// 分配执行 ID，写入 pending 记录并登记到控制表
    async fn prepare(&self, robot: &Robot, input: &TriggerInput) -> Result<ExecutionControl> {
        let exec_id = new_execution_id();
        let control = ExecutionControl::new(
            exec_id.as_str(),
            robot.member_id(),
            robot.team_id(),
            input.trigger_type(),
        );
        let mut exec = Execution::new(&exec_id, robot.member_id(), robot.team_id(), input.clone());
        exec.start_time = control.started_at();
        self.exec_store
            .save_execution(&ExecutionRecord::from(&exec))
            .await
            .context(format!("save execution {}", exec_id))?;

        self.controller.track(control.clone());
        Ok(control)
    }

    /// 完整准入：返回 (执行 ID, 是否排队)
    async fn admit(
        &self,
        member_id: &str,
        input: TriggerInput,
        mode: Option<ExecutorMode>,
    ) -> Result<(String, bool)> {
        let runtime = self.current().ok_or(RobotError::ManagerNotStarted)?;
        let robot = self.check_robot(&runtime, member_id, input.trigger_type()).await?;
        self.submit(&runtime, robot, input, mode).await
    }

    async fn submit(
        &self,
        runtime: &Runtime,
        robot: Arc<Robot>,
        input: TriggerInput,
        mode: Option<ExecutorMode>,
    ) -> Result<(String, bool)> {
        let mode = ExecutorMode::resolve(mode, robot.config().executor.mode);
        let trigger = input.trigger_type();
        let control = self.prepare(&robot, &input).await?;
        let exec_id = control.id().to_string();

        match runtime.pool.submit(Job::new(robot, input, control).with_mode(mode)) {
            Ok(submitted) => {
                debug!(
                    "Execution {} ({}, {}) accepted, queued={}",
                    exec_id, trigger, mode, submitted.queued
                );
                Ok((exec_id, submitted.queued))
            }
            Err(e) => {
                self.controller.untrack(&exec_id);
                if let Err(store_err) = self.exec_store.delete_execution(&exec_id).await {
                    warn!("Failed to discard rejected execution {}: {}", exec_id, store_err);
                }
                Err(e)
            }
        }
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let runtime = self.current().ok_or(RobotError::ManagerNotStarted)?;
        let mut accepted = 0;

        for robot in runtime.cache.list_all() {
            let config = robot.config();
            let Some(clock_config) = config.clock.as_ref() else {
                continue;
            };
            let due = match clock::should_trigger(&robot, now) {
                Ok(due) => due,
                Err(e) => {
                    warn!("Invalid clock config for robot {}: {}", robot.member_id(), e);
                    continue;
                }
            };
            // daemon 模式下已有排队的执行时不重复提交
            let due = due && runtime.pool.robot_queued(robot.member_id()) == 0;
            if due {
                robot.set_last_run(now);
                let tz = clock_config.timezone().unwrap_or(chrono_tz::UTC);
                let input = TriggerInput::Clock(ClockContext::new(now, tz));
                match self.submit(&runtime, Arc::clone(&robot), input, None).await {
                    Ok((exec_id, _)) => {
                        accepted += 1;
                        info!("Clock trigger {} for robot {}", exec_id, robot.member_id());
                    }
                    Err(e) if e.is_rejection() => {
                        debug!("Clock trigger for robot {} rejected: {}", robot.member_id(), e)
                    }
                    Err(e) => warn!("Clock trigger for robot {} failed: {}", robot.member_id(), e),
                }
            }
            robot.set_next_run(clock::next_run(clock_config, robot.last_run(), now));
        }
        Ok(accepted)
    }

    /// 对不在控制表中的执行返回合适的错误
    async fn missing_execution(&self, exec_id: &str) -> Result<RobotError> {
        let record = self
            .exec_store
            .get_execution(exec_id)
            .await
            .context(format!("load execution {}", exec_id))?;
        Ok(match record {
            Some(record) if record.status.is_terminal() => RobotError::ExecutionFinished {
                id: exec_id.to_string(),
                status: record.status,
            },
            _ => RobotError::ExecutionNotFound(exec_id.to_string()),
        })
    }

    /// 未进入工作池就结束的执行：置为 cancelled、落库、移出控制表
    async fn finalize(&self, control: &ExecutionControl, reason: &str) {
        let _ = control.stop(reason);
        let status = control.finish(ExecStatus::Cancelled, Some(reason.to_string()));
        if let Err(e) = self
            .exec_store
            .update_execution_status(control.id(), status, Some(reason.to_string()))
            .await
        {
            warn!("Failed to persist cancellation of {}: {}", control.id(), e);
        }
        self.controller.untrack(control.id());
    }

    fn on_job_complete(weak: &Weak<Inner>, outcome: JobOutcome) {
        let Some(inner) = weak.upgrade() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.record_outcome(outcome).await });
            }
            Err(_) => {
                warn!("No runtime to persist outcome of {}", outcome.exec_id);
                inner.controller.untrack(&outcome.exec_id);
            }
        }
    }

    /// 落库最终状态后再移出控制表，期间查询仍能从控制表得到终态
    async fn record_outcome(&self, outcome: JobOutcome) {
        let exec_id = outcome.exec_id.clone();
        let existing = match self.exec_store.get_execution(&exec_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load execution {}: {}", exec_id, e);
                None
            }
        };

        let already = existing
            .as_ref()
            .map(|r| r.status == outcome.status && r.end_time.is_some())
            .unwrap_or(false);
        if !already {
            let result = match &outcome.execution {
                Some(exec) => {
                    let mut record = ExecutionRecord::from(exec);
                    if let Some(existing) = &existing {
                        record.created_at = existing.created_at;
                        record.start_time = existing.start_time;
                    }
                    if record.status != outcome.status {
                        record.apply_status(outcome.status, outcome.error.clone());
                    }
                    self.exec_store.save_execution(&record).await
                }
                None => {
                    self.exec_store
                        .update_execution_status(&exec_id, outcome.status, outcome.error.clone())
                        .await
                }
            };
            if let Err(e) = result {
                warn!("Failed to persist final status of {}: {}", exec_id, e);
            }
        }

        self.controller.untrack(&exec_id);
        match outcome.status {
            ExecStatus::Failed => warn!(
                "Execution {} of robot {} failed: {}",
                exec_id,
                outcome.member_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
            status => info!("Execution {} of robot {} {}", exec_id, outcome.member_id, status),
        }
    }
}

fn snapshot_from_record(record: &ExecutionRecord) -> ControlledExecution {
    ControlledExecution {
        id: record.execution_id.clone(),
        member_id: record.member_id.clone(),
        team_id: record.team_id.clone(),
        trigger_type: record.trigger_type,
        status: record.status,
        phase: record.phase,
        started_at: record.start_time,
        paused_at: None,
        ended_at: record.end_time,
        error: record.error.clone(),
    }
}
