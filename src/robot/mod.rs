//! Robot：可调度的自治成员
//!
//! Robot 自己持有准入状态（运行中的执行集合），`try_acquire_slot` 在内部锁下原子地
//! 检查并登记，调用方无需额外加锁。配置部分可被缓存刷新原地替换，Arc 身份不变，
//! 因此排队中或运行中的任务持有的仍是同一个 Robot。

pub mod config;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, RobotError};
use crate::execution::TriggerType;
use crate::store::RobotRecord;

pub use config::{
    ClockConfig, ClockMode, ExecutorMode, ExecutorSettings, Identity, Quota, Resources,
    RobotConfig, Triggers,
};

/// Robot 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotStatus {
    #[default]
    Idle,
    Working,
    Paused,
    Error,
    Maintenance,
}

impl RobotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
        }
    }

    /// 时钟触发是否应跳过此状态
    pub fn blocks_clock(&self) -> bool {
        matches!(self, Self::Paused | Self::Error | Self::Maintenance)
    }
}

impl fmt::Display for RobotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RobotStatus {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(RobotError::InvalidConfig(format!("unknown robot status: {}", other))),
        }
    }
}

/// 运行集合中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRef {
    pub id: String,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
}

impl ExecutionRef {
    pub fn new(id: impl Into<String>, trigger_type: TriggerType) -> Self {
        Self {
            id: id.into(),
            trigger_type,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct Profile {
    display_name: String,
    system_prompt: Option<String>,
    status: RobotStatus,
    autonomous_mode: bool,
    config: Arc<RobotConfig>,
}

#[derive(Debug, Default)]
struct Runtime {
    executions: HashMap<String, ExecutionRef>,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Robot {
    member_id: String,
    team_id: String,
    profile: RwLock<Profile>,
    runtime: Mutex<Runtime>,
}

impl Robot {
    pub fn new(member_id: impl Into<String>, team_id: impl Into<String>, config: RobotConfig) -> Self {
        let member_id = member_id.into();
        Self {
            profile: RwLock::new(Profile {
                display_name: member_id.clone(),
                system_prompt: None,
                status: RobotStatus::Idle,
                autonomous_mode: true,
                config: Arc::new(config),
            }),
            member_id,
            team_id: team_id.into(),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    pub fn with_display_name(self, name: impl Into<String>) -> Self {
        self.write_profile().display_name = name.into();
        self
    }

    pub fn with_autonomous(self, autonomous: bool) -> Self {
        self.write_profile().autonomous_mode = autonomous;
        self
    }

    pub fn with_status(self, status: RobotStatus) -> Self {
        self.write_profile().status = status;
        self
    }

    /// 从持久化记录构建；member_id / team_id 必填
    pub fn from_record(record: &RobotRecord) -> Result<Self> {
        let robot = Self::new(record.member_id.clone(), record.team_id.clone(), RobotConfig::default());
        robot.apply_record(record)?;
        Ok(robot)
    }

    /// 用新的持久化记录原地更新配置；运行集合与 last_run 保持不变
    pub fn apply_record(&self, record: &RobotRecord) -> Result<()> {
        if record.member_id.trim().is_empty() {
            return Err(RobotError::InvalidConfig("member_id is required".into()));
        }
        if record.team_id.trim().is_empty() {
            return Err(RobotError::InvalidConfig("team_id is required".into()));
        }
        let config = match &record.robot_config {
            Some(value) if !value.is_null() => serde_json::from_value::<RobotConfig>(value.clone())
                .map_err(|e| RobotError::InvalidConfig(format!("{}: {}", record.member_id, e)))?,
            _ => RobotConfig::default(),
        };
        config.validate()?;

        let mut profile = self.write_profile();
        profile.display_name = record
            .display_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| record.member_id.clone());
        profile.system_prompt = record.system_prompt.clone();
        profile.status = record.robot_status;
        profile.autonomous_mode = record.autonomous_mode;
        profile.config = Arc::new(config);
        Ok(())
    }

    pub fn to_record(&self) -> RobotRecord {
        let profile = self.read_profile();
        RobotRecord {
            member_id: self.member_id.clone(),
            team_id: self.team_id.clone(),
            display_name: Some(profile.display_name.clone()),
            system_prompt: profile.system_prompt.clone(),
            robot_status: profile.status,
            autonomous_mode: profile.autonomous_mode,
            robot_config: serde_json::to_value(profile.config.as_ref()).ok(),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn display_name(&self) -> String {
        self.read_profile().display_name.clone()
    }

    pub fn system_prompt(&self) -> Option<String> {
        self.read_profile().system_prompt.clone()
    }

    pub fn status(&self) -> RobotStatus {
        self.read_profile().status
    }

    pub fn set_status(&self, status: RobotStatus) {
        self.write_profile().status = status;
    }

    pub fn is_autonomous(&self) -> bool {
        self.read_profile().autonomous_mode
    }

    pub fn config(&self) -> Arc<RobotConfig> {
        Arc::clone(&self.read_profile().config)
    }

    pub fn quota(&self) -> Quota {
        self.read_profile().config.quota
    }

    /// 是否还有空闲配额
    pub fn can_run(&self) -> bool {
        let max = self.quota().effective_max();
        self.lock_runtime().executions.len() < max
    }

    /// 原子地检查配额并登记执行；已满时返回 false 且不产生副作用。
    /// 同一 ID 重复登记视为已持有。
    pub fn try_acquire_slot(&self, exec: ExecutionRef) -> bool {
        let max = self.quota().effective_max();
        let mut runtime = self.lock_runtime();
        if runtime.executions.contains_key(&exec.id) {
            return true;
        }
        if runtime.executions.len() >= max {
            return false;
        }
        runtime.executions.insert(exec.id.clone(), exec);
        true
    }

    /// 移除执行；不存在时什么也不做。返回是否真的移除了
    pub fn remove_execution(&self, exec_id: &str) -> bool {
        self.lock_runtime().executions.remove(exec_id).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.lock_runtime().executions.len()
    }

    pub fn get_execution(&self, exec_id: &str) -> Option<ExecutionRef> {
        self.lock_runtime().executions.get(exec_id).cloned()
    }

    /// 运行集合快照，按开始时间排序
    pub fn executions(&self) -> Vec<ExecutionRef> {
        let mut list: Vec<_> = self.lock_runtime().executions.values().cloned().collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.executions().into_iter().map(|e| e.id).collect()
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.lock_runtime().last_run
    }

    pub fn set_last_run(&self, at: DateTime<Utc>) {
        self.lock_runtime().last_run = Some(at);
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.lock_runtime().next_run
    }

    pub fn set_next_run(&self, at: Option<DateTime<Utc>>) {
        self.lock_runtime().next_run = at;
    }

    fn read_profile(&self) -> std::sync::RwLockReadGuard<'_, Profile> {
        self.profile.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_profile(&self) -> std::sync::RwLockWriteGuard<'_, Profile> {
        self.profile.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn robot_with_max(max: usize) -> Robot {
        Robot::new("m1", "t1", RobotConfig::default().with_quota(Quota::new(max, 10, 5)))
    }

    #[test]
    fn test_try_acquire_respects_max() {
        let robot = robot_with_max(2);
        assert!(robot.try_acquire_slot(ExecutionRef::new("e1", TriggerType::Human)));
        assert!(robot.try_acquire_slot(ExecutionRef::new("e2", TriggerType::Human)));
        assert!(!robot.try_acquire_slot(ExecutionRef::new("e3", TriggerType::Human)));
        assert_eq!(robot.running_count(), 2);
        assert!(robot.get_execution("e3").is_none());
    }

    #[test]
    fn test_reacquire_same_id_does_not_double_count() {
        let robot = robot_with_max(2);
        assert!(robot.try_acquire_slot(ExecutionRef::new("e1", TriggerType::Clock)));
        assert!(robot.try_acquire_slot(ExecutionRef::new("e1", TriggerType::Clock)));
        assert_eq!(robot.running_count(), 1);
    }

    #[test]
    fn test_remove_execution_idempotent() {
        let robot = robot_with_max(1);
        assert!(robot.try_acquire_slot(ExecutionRef::new("e1", TriggerType::Event)));
        assert!(robot.remove_execution("e1"));
        assert!(!robot.remove_execution("e1"));
        assert!(!robot.remove_execution("missing"));
        assert_eq!(robot.running_count(), 0);
        assert!(robot.can_run());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_max() {
        let robot = Arc::new(robot_with_max(3));
        let acquired = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let robot = Arc::clone(&robot);
                let acquired = Arc::clone(&acquired);
                std::thread::spawn(move || {
                    if robot.try_acquire_slot(ExecutionRef::new(format!("e{}", i), TriggerType::Human)) {
                        acquired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(acquired.load(Ordering::SeqCst), 3);
        assert_eq!(robot.running_count(), 3);
    }

    #[test]
    fn test_from_record_requires_ids() {
        let mut record = RobotRecord::new("m1", "t1");
        assert!(Robot::from_record(&record).is_ok());
        record.team_id = String::new();
        assert!(matches!(Robot::from_record(&record), Err(RobotError::InvalidConfig(_))));
    }

    #[test]
    fn test_apply_record_keeps_running_set() {
        let robot = robot_with_max(2);
        assert!(robot.try_acquire_slot(ExecutionRef::new("e1", TriggerType::Human)));

        let mut record = RobotRecord::new("m1", "t1");
        record.robot_config = Some(serde_json::json!({"quota": {"max": 5}}));
        robot.apply_record(&record).unwrap();

        assert_eq!(robot.quota().max, 5);
        assert_eq!(robot.running_ids(), vec!["e1".to_string()]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut record = RobotRecord::new("m1", "t1");
        record.robot_config = Some(serde_json::json!({"quota": {"max": "lots"}}));
        assert!(Robot::from_record(&record).is_err());
    }
}
