//! 触发类型与触发负载
//!
//! 负载按触发类型区分：时钟上下文、人工指令消息、外部事件数据，各自强类型。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, RobotError};
use crate::robot::ExecutorMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Clock,
    Human,
    Event,
}

impl TriggerType {
    /// 同优先级下的出队次序：human > event > clock
    pub fn rank(&self) -> u8 {
        match self {
            Self::Human => 2,
            Self::Event => 1,
            Self::Clock => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clock => "clock",
            Self::Human => "human",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clock" => Ok(Self::Clock),
            "human" => Ok(Self::Human),
            "event" => Ok(Self::Event),
            other => Err(RobotError::InvalidRequest(format!("unknown trigger type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 时钟触发时的时间上下文（按 Robot 时区计算）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockContext {
    pub time: DateTime<Utc>,
    pub timezone: String,
    /// 本地时间，形如 `2026-10-16 09:00`
    pub local_time: String,
    pub weekday: String,
}

impl ClockContext {
    pub fn new(now: DateTime<Utc>, tz: Tz) -> Self {
        let local = now.with_timezone(&tz);
        Self {
            time: now,
            timezone: tz.name().to_string(),
            local_time: local.format("%Y-%m-%d %H:%M").to_string(),
            weekday: local.weekday().to_string(),
        }
    }
}

/// 人工干预动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterventionAction {
    #[serde(rename = "task.add")]
    TaskAdd,
    #[serde(rename = "task.cancel")]
    TaskCancel,
    #[serde(rename = "task.update")]
    TaskUpdate,
    #[serde(rename = "goal.adjust")]
    GoalAdjust,
    #[serde(rename = "instruct")]
    Instruct,
    #[serde(rename = "plan.add")]
    PlanAdd,
}

impl InterventionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAdd => "task.add",
            Self::TaskCancel => "task.cancel",
            Self::TaskUpdate => "task.update",
            Self::GoalAdjust => "goal.adjust",
            Self::Instruct => "instruct",
            Self::PlanAdd => "plan.add",
        }
    }
}

impl FromStr for InterventionAction {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task.add" => Ok(Self::TaskAdd),
            "task.cancel" => Ok(Self::TaskCancel),
            "task.update" => Ok(Self::TaskUpdate),
            "goal.adjust" => Ok(Self::GoalAdjust),
            "instruct" => Ok(Self::Instruct),
            "plan.add" => Ok(Self::PlanAdd),
            other => Err(RobotError::InvalidRequest(format!("unknown action: {}", other))),
        }
    }
}

/// 外部事件来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Webhook,
    Database,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Database => "database",
        }
    }
}

impl FromStr for EventSource {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "database" => Ok(Self::Database),
            other => Err(RobotError::InvalidRequest(format!("unknown event source: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInput {
    pub action: InterventionAction,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    pub source: EventSource,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// 触发负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerInput {
    Clock(ClockContext),
    Human(HumanInput),
    Event(EventInput),
}

impl TriggerInput {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Clock(_) => TriggerType::Clock,
            Self::Human(_) => TriggerType::Human,
            Self::Event(_) => TriggerType::Event,
        }
    }

    /// 供阶段处理器使用的简短描述
    pub fn summary(&self) -> String {
        match self {
            Self::Clock(ctx) => format!("scheduled run at {} ({})", ctx.local_time, ctx.timezone),
            Self::Human(h) => {
                let last = h.messages.last().map(|m| m.content.as_str()).unwrap_or("");
                format!("{}: {}", h.action.as_str(), last)
            }
            Self::Event(e) => format!("{} event {}", e.source.as_str(), e.event_type),
        }
    }
}

/// 人工干预请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterveneRequest {
    pub member_id: String,
    pub action: InterventionAction,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// plan.add 的计划执行时间；为空则立即执行
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_mode: Option<ExecutorMode>,
}

impl InterveneRequest {
    pub fn new(member_id: impl Into<String>, action: InterventionAction) -> Self {
        Self {
            member_id: member_id.into(),
            action,
            messages: Vec::new(),
            plan_time: None,
            user_id: None,
            locale: None,
            executor_mode: None,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_plan_time(mut self, at: DateTime<Utc>) -> Self {
        self.plan_time = Some(at);
        self
    }

    pub fn with_executor_mode(mut self, mode: ExecutorMode) -> Self {
        self.executor_mode = Some(mode);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.member_id.trim().is_empty() {
            return Err(RobotError::InvalidRequest("member_id is required".into()));
        }
        if self.messages.is_empty() && self.action != InterventionAction::TaskCancel {
            return Err(RobotError::InvalidRequest(format!(
                "action {} requires at least one message",
                self.action.as_str()
            )));
        }
        Ok(())
    }

    pub fn into_input(self) -> TriggerInput {
        TriggerInput::Human(HumanInput {
            action: self.action,
            messages: self.messages,
            user_id: self.user_id,
            locale: self.locale,
        })
    }
}

/// 外部事件请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRequest {
    pub member_id: String,
    pub source: EventSource,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_mode: Option<ExecutorMode>,
}

impl EventRequest {
    pub fn new(member_id: impl Into<String>, source: EventSource, event_type: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            source,
            event_type: event_type.into(),
            data: serde_json::Value::Null,
            executor_mode: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.member_id.trim().is_empty() {
            return Err(RobotError::InvalidRequest("member_id is required".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(RobotError::InvalidRequest("event_type is required".into()));
        }
        Ok(())
    }

    pub fn into_input(self) -> TriggerInput {
        TriggerInput::Event(EventInput {
            source: self.source,
            event_type: self.event_type,
            data: self.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_trigger_rank_order() {
        assert!(TriggerType::Human.rank() > TriggerType::Event.rank());
        assert!(TriggerType::Event.rank() > TriggerType::Clock.rank());
    }

    #[test]
    fn test_trigger_input_is_tagged() {
        let input = TriggerInput::Event(EventInput {
            source: EventSource::Webhook,
            event_type: "lead.created".into(),
            data: serde_json::json!({"name": "ACME"}),
        });
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["source"], "webhook");

        let back: TriggerInput = serde_json::from_value(value).unwrap();
        assert_eq!(back.trigger_type(), TriggerType::Event);
    }

    #[test]
    fn test_clock_context_uses_timezone() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 1, 30, 0).unwrap();
        let ctx = ClockContext::new(now, chrono_tz::Asia::Shanghai);
        assert_eq!(ctx.local_time, "2026-10-16 09:30");
        assert_eq!(ctx.weekday, "Fri");
        assert_eq!(ctx.timezone, "Asia/Shanghai");
    }

    #[test]
    fn test_intervene_validation() {
        let req = InterveneRequest::new("", InterventionAction::Instruct);
        assert!(req.validate().is_err());

        let req = InterveneRequest::new("m1", InterventionAction::Instruct);
        assert!(req.validate().is_err());

        let req = InterveneRequest::new("m1", InterventionAction::TaskCancel);
        assert!(req.validate().is_ok());

        let req = InterveneRequest::new("m1", InterventionAction::TaskAdd)
            .with_message(Message::user("add a follow-up call"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_event_validation() {
        assert!(EventRequest::new("m1", EventSource::Database, "").validate().is_err());
        assert!(EventRequest::new(" ", EventSource::Database, "row.insert").validate().is_err());
        assert!(EventRequest::new("m1", EventSource::Database, "row.insert").validate().is_ok());
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("plan.add".parse::<InterventionAction>().unwrap(), InterventionAction::PlanAdd);
        assert!("task.delete".parse::<InterventionAction>().is_err());
        assert_eq!("webhook".parse::<EventSource>().unwrap(), EventSource::Webhook);
    }
}
