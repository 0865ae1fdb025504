//! Robot 配置：配额、触发开关、时钟计划、资源绑定、执行模式
//!
//! 对应持久化记录中的 `robot_config` JSON 字段；所有字段都有默认值，空对象即合法配置。

use std::collections::HashMap;
use std::fmt;

use chrono::{Duration, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, RobotError};
use crate::execution::{Phase, TriggerType};

/// 每个 Robot 的准入配额
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// 同时运行的执行数上限
    #[serde(default = "default_quota_max")]
    pub max: usize,
    /// 在工作池中排队等待的执行数上限
    #[serde(default = "default_quota_queue")]
    pub queue: usize,
    /// 出队优先级，越大越先
    #[serde(default = "default_quota_priority")]
    pub priority: i32,
}

fn default_quota_max() -> usize {
    2
}

fn default_quota_queue() -> usize {
    10
}

fn default_quota_priority() -> i32 {
    5
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max: default_quota_max(),
            queue: default_quota_queue(),
            priority: default_quota_priority(),
        }
    }
}

impl Quota {
    pub fn new(max: usize, queue: usize, priority: i32) -> Self {
        Self { max, queue, priority }
    }

    /// 生效的并发上限；配置为 0 时取默认值
    pub fn effective_max(&self) -> usize {
        if self.max == 0 {
            default_quota_max()
        } else {
            self.max
        }
    }

    /// 生效的排队上限；配置为 0 时取默认值
    pub fn effective_queue(&self) -> usize {
        if self.queue == 0 {
            default_quota_queue()
        } else {
            self.queue
        }
    }
}

/// 各触发类型的开关，缺省全部开启
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default = "enabled")]
    pub clock: bool,
    #[serde(default = "enabled")]
    pub human: bool,
    #[serde(default = "enabled")]
    pub event: bool,
}

fn enabled() -> bool {
    true
}

impl Default for Triggers {
    fn default() -> Self {
        Self {
            clock: true,
            human: true,
            event: true,
        }
    }
}

impl Triggers {
    pub fn is_enabled(&self, trigger: TriggerType) -> bool {
        match trigger {
            TriggerType::Clock => self.clock,
            TriggerType::Human => self.human,
            TriggerType::Event => self.event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// 在指定的 `HH:MM` 时刻运行
    Times,
    /// 按固定间隔运行
    Interval,
    /// 只要有空闲配额就运行
    Daemon,
}

/// 解析 `30m`、`2h`、`1h30m`、`45s`、`1d` 形式的间隔。超出范围的数值报 `InvalidConfig`，不会 panic
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || RobotError::InvalidConfig(format!("invalid duration: {:?}", text));
    let text = text.trim();
    if text.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let part = match ch.to_ascii_lowercase() {
            'h' => Duration::try_hours(value),
            'm' => Duration::try_minutes(value),
            's' => Duration::try_seconds(value),
            'd' => Duration::try_days(value),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(&part))
            .ok_or_else(invalid)?;
    }
    if !digits.is_empty() || total <= Duration::zero() {
        return Err(invalid());
    }
    Ok(total)
}

/// 时钟计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    pub mode: ClockMode,
    /// times 模式：`["09:00", "14:30"]`
    #[serde(default)]
    pub times: Vec<String>,
    /// times 模式：`["Mon", "Friday"]`，空或包含 `*` 表示每天
    #[serde(default)]
    pub days: Vec<String>,
    /// interval 模式：`30m`、`2h`、`1h30m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<String>,
    /// IANA 时区名，缺省 UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

impl ClockConfig {
    pub fn times(times: &[&str]) -> Self {
        Self {
            mode: ClockMode::Times,
            times: times.iter().map(|t| t.to_string()).collect(),
            days: Vec::new(),
            every: None,
            tz: None,
        }
    }

    pub fn interval(every: &str) -> Self {
        Self {
            mode: ClockMode::Interval,
            times: Vec::new(),
            days: Vec::new(),
            every: Some(every.to_string()),
            tz: None,
        }
    }

    pub fn daemon() -> Self {
        Self {
            mode: ClockMode::Daemon,
            times: Vec::new(),
            days: Vec::new(),
            every: None,
            tz: None,
        }
    }

    pub fn with_days(mut self, days: &[&str]) -> Self {
        self.days = days.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_tz(mut self, tz: &str) -> Self {
        self.tz = Some(tz.to_string());
        self
    }

    /// 逐项检查 times / days / every / tz；拼写错误的条目在加载时即报错，而不是永远匹配不上
    pub fn validate(&self) -> Result<()> {
        self.timezone()?;
        for time in &self.times {
            NaiveTime::parse_from_str(time.trim(), "%H:%M").map_err(|_| {
                RobotError::InvalidConfig(format!("clock.times entry {:?} is not HH:MM", time))
            })?;
        }
        for day in &self.days {
            let day = day.trim();
            if day != "*" && day.parse::<Weekday>().is_err() {
                return Err(RobotError::InvalidConfig(format!("clock.days entry {:?} is not a weekday", day)));
            }
        }
        if let Some(every) = &self.every {
            parse_duration(every)?;
        }
        match self.mode {
            ClockMode::Times if self.times.is_empty() => {
                Err(RobotError::InvalidConfig("clock.times is empty".into()))
            }
            ClockMode::Interval if self.every.is_none() => {
                Err(RobotError::InvalidConfig("clock.every is required".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn timezone(&self) -> Result<Tz> {
        match self.tz.as_deref() {
            None | Some("") => Ok(Tz::UTC),
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| RobotError::InvalidConfig(format!("unknown timezone: {}", name))),
        }
    }
}

/// 执行策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
    #[default]
    Standard,
    #[serde(alias = "dry-run", alias = "dry_run")]
    DryRun,
    Sandbox,
}

impl ExecutorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::DryRun => "dryrun",
            Self::Sandbox => "sandbox",
        }
    }

    /// 请求 > Robot 配置 > standard
    pub fn resolve(request: Option<ExecutorMode>, robot: Option<ExecutorMode>) -> ExecutorMode {
        request.or(robot).unwrap_or_default()
    }
}

impl fmt::Display for ExecutorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutorMode>,
}

/// 身份设定（写入阶段提示词）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub role: String,
    #[serde(default)]
    pub duties: Vec<String>,
}

/// 资源绑定：各阶段使用的 agent、可用工具与 agent 白名单
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub phases: HashMap<Phase, String>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Resources {
    /// 阶段使用的 agent，未绑定时返回默认 `__robot.<phase>`
    pub fn phase_agent(&self, phase: Phase) -> String {
        self.phases
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| format!("__robot.{}", phase))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default)]
    pub quota: Quota,
    #[serde(default)]
    pub triggers: Triggers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<ClockConfig>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_locale: Option<String>,
}

impl RobotConfig {
    pub fn with_quota(mut self, quota: Quota) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_clock(mut self, clock: ClockConfig) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_triggers(mut self, triggers: Triggers) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_executor_mode(mut self, mode: ExecutorMode) -> Self {
        self.executor.mode = Some(mode);
        self
    }

    /// 配额为 0 的字段按默认值生效（见 [`Quota::effective_max`]），不视为错误
    pub fn validate(&self) -> Result<()> {
        match &self.clock {
            Some(clock) => clock.validate(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: RobotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.quota, Quota::new(2, 10, 5));
        assert!(cfg.triggers.is_enabled(TriggerType::Clock));
        assert!(cfg.triggers.is_enabled(TriggerType::Human));
        assert!(cfg.clock.is_none());
    }

    #[test]
    fn test_partial_quota() {
        let cfg: RobotConfig = serde_json::from_value(serde_json::json!({
            "quota": {"max": 1},
            "triggers": {"event": false}
        }))
        .unwrap();
        assert_eq!(cfg.quota.max, 1);
        assert_eq!(cfg.quota.queue, 10);
        assert!(!cfg.triggers.is_enabled(TriggerType::Event));
        assert!(cfg.triggers.is_enabled(TriggerType::Clock));
    }

    #[test]
    fn test_zero_quota_uses_defaults() {
        assert_eq!(Quota::new(0, 0, 1).effective_max(), 2);
        assert_eq!(Quota::new(0, 0, 1).effective_queue(), 10);
        assert_eq!(Quota::new(3, 4, 1).effective_queue(), 4);
    }

    #[test]
    fn test_executor_mode_resolution() {
        assert_eq!(ExecutorMode::resolve(None, None), ExecutorMode::Standard);
        assert_eq!(
            ExecutorMode::resolve(None, Some(ExecutorMode::Sandbox)),
            ExecutorMode::Sandbox
        );
        assert_eq!(
            ExecutorMode::resolve(Some(ExecutorMode::DryRun), Some(ExecutorMode::Sandbox)),
            ExecutorMode::DryRun
        );
        let mode: ExecutorMode = serde_json::from_str("\"dry-run\"").unwrap();
        assert_eq!(mode, ExecutorMode::DryRun);
    }

    #[test]
    fn test_clock_validation() {
        let cfg = RobotConfig::default().with_clock(ClockConfig::times(&[]));
        assert!(cfg.validate().is_err());
        let cfg = RobotConfig::default().with_clock(ClockConfig::daemon().with_tz("Mars/Olympus"));
        assert!(cfg.validate().is_err());
        let cfg = RobotConfig::default().with_clock(ClockConfig::interval("30m").with_tz("Asia/Shanghai"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_clock_validation_rejects_bad_entries() {
        let bad_time = ClockConfig::times(&["09:00", "25:99"]);
        assert!(matches!(bad_time.validate(), Err(RobotError::InvalidConfig(m)) if m.contains("25:99")));

        let bad_day = ClockConfig::times(&["09:00"]).with_days(&["Mon", "Mondy"]);
        assert!(matches!(bad_day.validate(), Err(RobotError::InvalidConfig(m)) if m.contains("Mondy")));

        assert!(ClockConfig::interval("30x").validate().is_err());
        assert!(ClockConfig::interval("9999999999999999h").validate().is_err());

        let ok = ClockConfig::times(&["09:00", " 14:30 "]).with_days(&["*", "friday"]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        assert!(parse_duration("9999999999999999h").is_err());
        assert!(parse_duration("99999999999999999999s").is_err());
        // 单项合法、累加溢出
        assert!(parse_duration("106751991167d106751991167d").is_err());
        assert_eq!(parse_duration("1d2h").unwrap(), Duration::hours(26));
    }

    #[test]
    fn test_zero_quota_is_valid_config() {
        let cfg = RobotConfig::default().with_quota(Quota::new(0, 0, 5));
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.quota.effective_max(), 2);
    }

    #[test]
    fn test_phase_agent_default() {
        let mut res = Resources::default();
        assert_eq!(res.phase_agent(Phase::Goals), "__robot.goals");
        res.phases.insert(Phase::Goals, "planner".into());
        assert_eq!(res.phase_agent(Phase::Goals), "planner");
    }
}
