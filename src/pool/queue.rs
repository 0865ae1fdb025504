//! 工作池的优先队列
//!
//! 出队次序：Robot 优先级（大者先）> 触发类型（human > event > clock）> 入队先后。
//! 取任务时可以跳过当前不可运行的任务（其 Robot 配额已满），被跳过的任务保留原位。

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use super::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    rank: Reverse<u8>,
    seq: u64,
}

#[derive(Default)]
pub struct PriorityQueue {
    jobs: BTreeMap<QueueKey, Job>,
    index: HashMap<String, QueueKey>,
    per_robot: HashMap<String, usize>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        let key = QueueKey {
            priority: Reverse(job.priority),
            rank: Reverse(job.trigger_type().rank()),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        *self.per_robot.entry(job.member_id().to_string()).or_default() += 1;
        self.index.insert(job.id().to_string(), key);
        self.jobs.insert(key, job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// 某个 Robot 在队列中等待的任务数
    pub fn robot_queued(&self, member_id: &str) -> usize {
        self.per_robot.get(member_id).copied().unwrap_or(0)
    }

    pub fn contains(&self, exec_id: &str) -> bool {
        self.index.contains_key(exec_id)
    }

    pub fn remove(&mut self, exec_id: &str) -> Option<Job> {
        let key = self.index.remove(exec_id)?;
        let job = self.jobs.remove(&key)?;
        self.forget_robot(job.member_id());
        Some(job)
    }

    /// 按出队次序取第一个满足条件的任务
    pub fn take_first<F>(&mut self, mut eligible: F) -> Option<Job>
    where
        F: FnMut(&Job) -> bool,
    {
        let key = self
            .jobs
            .iter()
            .find(|(_, job)| eligible(job))
            .map(|(key, _)| *key)?;
        let job = self.jobs.remove(&key)?;
        self.index.remove(job.id());
        self.forget_robot(job.member_id());
        Some(job)
    }

    /// 取出全部任务（按出队次序）
    pub fn drain(&mut self) -> Vec<Job> {
        self.index.clear();
        self.per_robot.clear();
        std::mem::take(&mut self.jobs).into_values().collect()
    }

    /// 当前出队次序下的执行 ID
    pub fn order(&self) -> Vec<String> {
        self.jobs.values().map(|j| j.id().to_string()).collect()
    }

    fn forget_robot(&mut self, member_id: &str) {
        if let Some(count) = self.per_robot.get_mut(member_id) {
            *count -= 1;
            if *count == 0 {
                self.per_robot.remove(member_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use proptest::prelude::*;

    use crate::execution::{
        ClockContext, EventInput, EventSource, ExecutionControl, HumanInput, InterventionAction,
        TriggerInput, TriggerType,
    };
    use crate::robot::{Quota, Robot, RobotConfig};

    fn input(trigger: TriggerType) -> TriggerInput {
        match trigger {
            TriggerType::Clock => TriggerInput::Clock(ClockContext::new(Utc::now(), chrono_tz::UTC)),
            TriggerType::Human => TriggerInput::Human(HumanInput {
                action: InterventionAction::Instruct,
                messages: vec![],
                user_id: None,
                locale: None,
            }),
            TriggerType::Event => TriggerInput::Event(EventInput {
                source: EventSource::Webhook,
                event_type: "ping".into(),
                data: serde_json::Value::Null,
            }),
        }
    }

    fn job(id: &str, member: &str, priority: i32, trigger: TriggerType) -> Job {
        let robot = Arc::new(Robot::new(
            member,
            "t1",
            RobotConfig::default().with_quota(Quota::new(2, 10, priority)),
        ));
        let control = ExecutionControl::new(id, member, "t1", trigger);
        Job::new(robot, input(trigger), control)
    }

    #[test]
    fn test_priority_by_robot_priority() {
        let mut q = PriorityQueue::new();
        q.push(job("low", "m1", 1, TriggerType::Clock));
        q.push(job("high", "m2", 10, TriggerType::Clock));
        q.push(job("mid", "m3", 5, TriggerType::Clock));
        assert_eq!(q.order(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_priority_by_trigger_type() {
        let mut q = PriorityQueue::new();
        q.push(job("clock", "m1", 5, TriggerType::Clock));
        q.push(job("event", "m1", 5, TriggerType::Event));
        q.push(job("human", "m1", 5, TriggerType::Human));
        assert_eq!(q.order(), vec!["human", "event", "clock"]);
    }

    #[test]
    fn test_robot_priority_beats_trigger_type() {
        let mut q = PriorityQueue::new();
        q.push(job("human-low", "m1", 1, TriggerType::Human));
        q.push(job("clock-high", "m2", 9, TriggerType::Clock));
        assert_eq!(q.order(), vec!["clock-high", "human-low"]);
    }

    #[test]
    fn test_fifo_for_equal_keys() {
        let mut q = PriorityQueue::new();
        for i in 0..5 {
            q.push(job(&format!("j{}", i), "m1", 5, TriggerType::Event));
        }
        assert_eq!(q.order(), vec!["j0", "j1", "j2", "j3", "j4"]);
    }

    #[test]
    fn test_take_first_skips_ineligible() {
        let mut q = PriorityQueue::new();
        q.push(job("a", "busy", 9, TriggerType::Human));
        q.push(job("b", "free", 1, TriggerType::Clock));
        q.push(job("c", "busy", 9, TriggerType::Human));

        let taken = q.take_first(|j| j.member_id() != "busy").unwrap();
        assert_eq!(taken.id(), "b");
        assert_eq!(q.order(), vec!["a", "c"]);
        assert_eq!(q.robot_queued("busy"), 2);
        assert_eq!(q.robot_queued("free"), 0);
    }

    #[test]
    fn test_remove_and_drain() {
        let mut q = PriorityQueue::new();
        q.push(job("a", "m1", 5, TriggerType::Human));
        q.push(job("b", "m1", 5, TriggerType::Human));
        assert!(q.remove("a").is_some());
        assert!(q.remove("a").is_none());
        assert!(!q.contains("a"));
        assert_eq!(q.robot_queued("m1"), 1);

        let drained = q.drain();
        assert_eq!(drained.len(), 1);
        assert!(q.is_empty());
        assert_eq!(q.robot_queued("m1"), 0);
    }

    fn trigger_strategy() -> impl Strategy<Value = TriggerType> {
        prop_oneof![
            Just(TriggerType::Clock),
            Just(TriggerType::Event),
            Just(TriggerType::Human),
        ]
    }

    proptest! {
        #[test]
        fn prop_dequeue_order_is_priority_then_type_then_fifo(
            entries in proptest::collection::vec((0i32..4, trigger_strategy()), 1..24)
        ) {
            let mut q = PriorityQueue::new();
            for (i, (priority, trigger)) in entries.iter().enumerate() {
                q.push(job(&format!("{}", i), &format!("m{}", i), *priority, *trigger));
            }

            let mut expected: Vec<(usize, i32, u8)> = entries
                .iter()
                .enumerate()
                .map(|(i, (p, t))| (i, *p, t.rank()))
                .collect();
            expected.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));

            let mut actual = Vec::new();
            while let Some(job) = q.take_first(|_| true) {
                actual.push(job.id().parse::<usize>().unwrap());
            }
            let expected: Vec<usize> = expected.into_iter().map(|e| e.0).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
