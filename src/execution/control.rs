//! 执行控制：协作式暂停 / 恢复 / 停止
//!
//! 每个执行持有一个 [`ExecutionControl`]：取消令牌 + 暂停信号 + 状态快照。
//! 执行器在阶段与任务边界调用 [`ExecutionControl::checkpoint`]，
//! 取消会让检查点返回 [`RobotError::Cancelled`]，暂停会让检查点挂起直到恢复或停止。
//! 不做抢占：阶段内部不会被打断。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::error::{Result, RobotError};
use crate::execution::{ExecStatus, Phase, TriggerType};

/// 控制状态的只读快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlledExecution {
    pub id: String,
    pub member_id: String,
    pub team_id: String,
    pub trigger_type: TriggerType,
    pub status: ExecStatus,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct ControlState {
    status: ExecStatus,
    phase: Phase,
    started_at: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

#[derive(Debug)]
struct ControlInner {
    id: String,
    member_id: String,
    team_id: String,
    trigger_type: TriggerType,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    state: Mutex<ControlState>,
}

/// 单个执行的控制句柄，克隆后共享同一状态
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    inner: Arc<ControlInner>,
}

impl ExecutionControl {
    pub fn new(
        id: impl Into<String>,
        member_id: impl Into<String>,
        team_id: impl Into<String>,
        trigger_type: TriggerType,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControlInner {
                id: id.into(),
                member_id: member_id.into(),
                team_id: team_id.into(),
                trigger_type,
                cancel: CancellationToken::new(),
                paused,
                state: Mutex::new(ControlState {
                    status: ExecStatus::Pending,
                    phase: Phase::pipeline(trigger_type)[0],
                    started_at: Utc::now(),
                    paused_at: None,
                    ended_at: None,
                    error: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    pub fn team_id(&self) -> &str {
        &self.inner.team_id
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.inner.trigger_type
    }

    pub fn status(&self) -> ExecStatus {
        self.lock().status
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// 准入时刻；排队等待的时间也计入执行
    pub fn started_at(&self) -> DateTime<Utc> {
        self.lock().started_at
    }

    pub fn snapshot(&self) -> ControlledExecution {
        let state = self.lock();
        ControlledExecution {
            id: self.inner.id.clone(),
            member_id: self.inner.member_id.clone(),
            team_id: self.inner.team_id.clone(),
            trigger_type: self.inner.trigger_type,
            status: state.status,
            phase: state.phase,
            started_at: state.started_at,
            paused_at: state.paused_at,
            ended_at: state.ended_at,
            error: state.error.clone(),
        }
    }

    /// 工作线程取到任务时调用：pending -> running
    pub fn mark_running(&self) -> Result<()> {
        let mut state = self.lock();
        if self.inner.cancel.is_cancelled() {
            return Err(RobotError::Cancelled);
        }
        transition(&mut state, &self.inner.id, ExecStatus::Running)
    }

    pub fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.lock();
        match state.status {
            ExecStatus::Paused => return Err(RobotError::AlreadyPaused),
            s if s.is_terminal() => {
                return Err(RobotError::ExecutionFinished {
                    id: self.inner.id.clone(),
                    status: s,
                })
            }
            _ => {}
        }
        transition(&mut state, &self.inner.id, ExecStatus::Paused)?;
        state.paused_at = Some(Utc::now());
        self.inner.paused.send_replace(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.lock();
        match state.status {
            ExecStatus::Paused => {}
            s if s.is_terminal() => {
                return Err(RobotError::ExecutionFinished {
                    id: self.inner.id.clone(),
                    status: s,
                })
            }
            _ => return Err(RobotError::NotPaused),
        }
        transition(&mut state, &self.inner.id, ExecStatus::Running)?;
        state.paused_at = None;
        self.inner.paused.send_replace(false);
        Ok(())
    }

    /// 停止：立即进入 cancelled 并触发取消令牌，返回停止前的状态
    pub fn stop(&self, reason: impl Into<String>) -> Result<ExecStatus> {
        let mut state = self.lock();
        let previous = state.status;
        if previous.is_terminal() {
            return Err(RobotError::ExecutionFinished {
                id: self.inner.id.clone(),
                status: previous,
            });
        }
        transition(&mut state, &self.inner.id, ExecStatus::Cancelled)?;
        state.error = Some(reason.into());
        state.paused_at = None;
        drop(state);
        self.inner.cancel.cancel();
        Ok(previous)
    }

    /// 执行结束时写入最终状态；已处于终态时保持不变并返回已有状态
    pub fn finish(&self, status: ExecStatus, error: Option<String>) -> ExecStatus {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return state.status;
        }
        if state.status == ExecStatus::Paused && status != ExecStatus::Cancelled {
            state.status = ExecStatus::Running;
            state.paused_at = None;
        }
        if state.status == ExecStatus::Pending && status != ExecStatus::Cancelled {
            state.status = ExecStatus::Running;
        }
        let target = if status.is_terminal() { status } else { ExecStatus::Failed };
        if transition(&mut state, &self.inner.id, target).is_ok() && state.error.is_none() {
            state.error = error;
        }
        state.status
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// 子令牌，可传给阶段内部的异步调用
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            Err(RobotError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 暂停期间挂起；恢复后返回 Ok，被停止则返回 Cancelled
    pub async fn wait_if_paused(&self) -> Result<()> {
        let mut rx = self.inner.paused.subscribe();
        loop {
            self.check_cancelled()?;
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(RobotError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.check_cancelled();
                    }
                }
            }
        }
    }

    /// 阶段 / 任务边界检查点
    pub async fn checkpoint(&self) -> Result<()> {
        self.check_cancelled()?;
        self.wait_if_paused().await
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transition(state: &mut ControlState, id: &str, to: ExecStatus) -> Result<()> {
    if !state.status.can_transition_to(to) {
        if state.status.is_terminal() {
            return Err(RobotError::ExecutionFinished {
                id: id.to_string(),
                status: state.status,
            });
        }
        return Err(RobotError::InvalidTransition {
            from: state.status,
            to,
        });
    }
    state.status = to;
    if to.is_terminal() {
        state.ended_at = Some(Utc::now());
    }
    Ok(())
}

/// 在途执行的登记表
#[derive(Debug, Default)]
pub struct ExecutionController {
    executions: RwLock<HashMap<String, ExecutionControl>>,
}

impl ExecutionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, control: ExecutionControl) {
        self.write().insert(control.id().to_string(), control);
    }

    pub fn untrack(&self, exec_id: &str) -> Option<ExecutionControl> {
        self.write().remove(exec_id)
    }

    pub fn get(&self, exec_id: &str) -> Option<ExecutionControl> {
        self.read().get(exec_id).cloned()
    }

    pub fn snapshot(&self, exec_id: &str) -> Option<ControlledExecution> {
        self.read().get(exec_id).map(|c| c.snapshot())
    }

    pub fn list(&self) -> Vec<ControlledExecution> {
        let mut list: Vec<_> = self.read().values().map(|c| c.snapshot()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn list_by_member(&self, member_id: &str) -> Vec<ControlledExecution> {
        self.list()
            .into_iter()
            .filter(|e| e.member_id == member_id)
            .collect()
    }

    /// 所有在途控制句柄（停机时用于统一取消）
    pub fn controls(&self) -> Vec<ExecutionControl> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn pause(&self, exec_id: &str) -> Result<()> {
        self.require(exec_id)?.pause()
    }

    pub fn resume(&self, exec_id: &str) -> Result<()> {
        self.require(exec_id)?.resume()
    }

    pub fn stop(&self, exec_id: &str, reason: &str) -> Result<ExecStatus> {
        self.require(exec_id)?.stop(reason)
    }

    fn require(&self, exec_id: &str) -> Result<ExecutionControl> {
        self.get(exec_id)
            .ok_or_else(|| RobotError::ExecutionNotFound(exec_id.to_string()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ExecutionControl>> {
        self.executions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ExecutionControl>> {
        self.executions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
