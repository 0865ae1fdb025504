//! 调度核心集成测试：通过 Manager 公共接口驱动，使用内存存储与带计数的执行器

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hive::execution::{
    ClockContext, EventInput, EventSource, ExecStatus, Execution, ExecutionControl, HumanInput,
    InterveneRequest, InterventionAction, Message, TriggerInput,
};
use hive::executor::{DryRunPhases, Executor, PipelineExecutor};
use hive::robot::{ExecutorMode, Quota, Robot, RobotConfig};
use hive::store::{ExecutionStore, MemoryStore, RobotRecord, RobotStore};
use hive::{Manager, ManagerConfig, RobotError, TriggerRequest};

/// 记录每个 Robot 与全局的并发峰值、调用顺序；睡眠期间响应停止
struct TrackingExecutor {
    delay: Duration,
    global_current: AtomicUsize,
    global_peak: AtomicUsize,
    per_robot: Mutex<HashMap<String, (usize, usize)>>,
    order: Mutex<Vec<String>>,
    quota_violations: AtomicUsize,
}

impl TrackingExecutor {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            global_current: AtomicUsize::new(0),
            global_peak: AtomicUsize::new(0),
            per_robot: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            quota_violations: AtomicUsize::new(0),
        })
    }

    fn peak(&self, member_id: &str) -> usize {
        self.per_robot
            .lock()
            .unwrap()
            .get(member_id)
            .map(|(_, peak)| *peak)
            .unwrap_or(0)
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.order.lock().unwrap().len()
    }
}

#[async_trait]
impl Executor for TrackingExecutor {
    async fn execute_with_control(
        &self,
        robot: Arc<Robot>,
        input: TriggerInput,
        control: ExecutionControl,
    ) -> hive::Result<Execution> {
        let now = self.global_current.fetch_add(1, Ordering::SeqCst) + 1;
        self.global_peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut per_robot = self.per_robot.lock().unwrap();
            let entry = per_robot.entry(robot.member_id().to_string()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        if robot.running_count() > robot.quota().effective_max() {
            self.quota_violations.fetch_add(1, Ordering::SeqCst);
        }
        self.order.lock().unwrap().push(control.id().to_string());

        let token = control.cancel_token();
        let cancelled = tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(self.delay) => false,
        };

        self.per_robot
            .lock()
            .unwrap()
            .get_mut(robot.member_id())
            .unwrap()
            .0 -= 1;
        self.global_current.fetch_sub(1, Ordering::SeqCst);

        let mut exec = Execution::new(control.id(), robot.member_id(), robot.team_id(), input);
        exec.transition_to(ExecStatus::Running)?;
        if cancelled {
            exec.cancel("stopped")?;
        } else {
            exec.complete()?;
        }
        Ok(exec)
    }

    fn name(&self) -> &'static str {
        "tracking"
    }
}

fn config(worker_size: usize, queue_size: usize) -> ManagerConfig {
    ManagerConfig::default()
        .with_pool(worker_size, queue_size)
        .with_tick_interval(Duration::ZERO)
        .with_cache_refresh(None)
        .with_stop_grace(Duration::from_secs(5))
}

fn record(member: &str, max: usize, queue: usize, priority: i32) -> RobotRecord {
    RobotRecord::new(member, "team-1")
        .with_config(&RobotConfig::default().with_quota(Quota::new(max, queue, priority)))
}

async fn manager(cfg: ManagerConfig, records: &[RobotRecord]) -> Manager {
    let store = Arc::new(MemoryStore::new());
    for r in records {
        store.save_robot(r).await.unwrap();
    }
    Manager::with_stores(cfg, store.clone(), store)
}

fn human(text: &str) -> TriggerInput {
    TriggerInput::Human(HumanInput {
        action: InterventionAction::Instruct,
        messages: vec![Message::user(text)],
        user_id: None,
        locale: None,
    })
}

fn event(kind: &str) -> TriggerInput {
    TriggerInput::Event(EventInput {
        source: EventSource::Webhook,
        event_type: kind.to_string(),
        data: serde_json::json!({}),
    })
}

fn clock() -> TriggerInput {
    TriggerInput::Clock(ClockContext::new(Utc::now(), chrono_tz::UTC))
}

async fn wait_idle(manager: &Manager) {
    for _ in 0..1000 {
        if manager.controller().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("executions still in flight: {:?}", manager.list_executions());
}

async fn wait_status(manager: &Manager, exec_id: &str, status: ExecStatus) {
    for _ in 0..500 {
        if manager.get_execution_status(exec_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached {}", exec_id, status);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_robot_quota_limits_concurrency() {
    let executor = TrackingExecutor::new(Duration::from_millis(60));
    let manager = manager(config(10, 100), &[record("r1", 2, 10, 5)]).await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..10 {
        let result = manager
            .trigger("r1", TriggerRequest::new(human(&format!("job {}", i))))
            .await
            .unwrap();
        assert!(result.accepted, "{}", result.message);
        ids.push(result.execution_id.unwrap());
    }
    wait_idle(&manager).await;

    assert!(executor.peak("r1") <= 2);
    assert_eq!(executor.calls(), 10);
    assert_eq!(executor.quota_violations.load(Ordering::SeqCst), 0);
    for id in &ids {
        let status = manager.get_execution_status(id).await.unwrap();
        assert_eq!(status.status, ExecStatus::Completed);
        assert!(status.ended_at.is_some());
    }
    assert_eq!(manager.robot_state("r1").unwrap().running, 0);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_worker_limit() {
    let executor = TrackingExecutor::new(Duration::from_millis(40));
    let records: Vec<_> = (0..8).map(|i| record(&format!("r{}", i), 2, 10, 5)).collect();
    let manager = manager(config(3, 20), &records).await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    for round in 0..2 {
        for i in 0..8 {
            let result = manager
                .trigger(&format!("r{}", i), human(&format!("round {}", round)).into())
                .await
                .unwrap();
            assert!(result.accepted, "{}", result.message);
        }
    }
    wait_idle(&manager).await;

    assert!(executor.global_peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(executor.calls(), 16);
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admission_ceiling() {
    let executor = TrackingExecutor::new(Duration::from_secs(2));
    let records: Vec<_> = (0..8).map(|i| record(&format!("r{}", i), 1, 10, 5)).collect();
    let manager = manager(config(2, 3), &records).await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    let mut accepted = 0;
    let mut rejected = Vec::new();
    for i in 0..8 {
        let result = manager
            .trigger(&format!("r{}", i), human("load").into())
            .await
            .unwrap();
        if result.accepted {
            accepted += 1;
        } else {
            assert!(result.execution_id.is_none());
            rejected.push(result.message);
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(rejected.len(), 3);
    assert!(rejected.iter().all(|m| m.contains("full")));
    assert_eq!(manager.running() + manager.queued(), 5);

    manager.stop().await;
    assert!(executor.calls() <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_quotas() {
    let executor = TrackingExecutor::new(Duration::from_millis(150));
    let manager = manager(
        config(10, 100),
        &[record("a", 1, 10, 5), record("b", 3, 10, 5)],
    )
    .await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    let triggers = (0..5).flat_map(|i| {
        let m = manager.clone();
        let n = manager.clone();
        [
            tokio::spawn(async move { m.trigger("a", human(&format!("a{}", i)).into()).await }),
            tokio::spawn(async move { n.trigger("b", human(&format!("b{}", i)).into()).await }),
        ]
    });
    for handle in futures_util::future::join_all(triggers).await {
        assert!(handle.unwrap().unwrap().accepted);
    }
    wait_idle(&manager).await;

    assert_eq!(executor.peak("a"), 1);
    assert!(executor.peak("b") <= 3);
    assert!(executor.peak("b") >= 2);
    assert_eq!(executor.calls(), 10);
    manager.stop().await;
}

#[tokio::test]
async fn test_single_worker_dequeue_order() {
    let executor = TrackingExecutor::new(Duration::from_millis(30));
    let manager = manager(
        config(1, 20),
        &[
            record("blocker", 1, 10, 5),
            record("low", 2, 10, 1),
            record("mid", 2, 10, 5),
            record("high", 2, 10, 9),
        ],
    )
    .await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    let first = manager.trigger_manual("blocker", human("first")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let low = manager.trigger_manual("low", human("low")).await.unwrap();
    let mid_clock = manager.trigger_manual("mid", clock()).await.unwrap();
    let mid_event = manager.trigger_manual("mid", event("push")).await.unwrap();
    let mid_human = manager.trigger_manual("mid", human("mid")).await.unwrap();
    let high = manager.trigger_manual("high", clock()).await.unwrap();

    wait_idle(&manager).await;
    assert_eq!(
        executor.order(),
        vec![first, high, mid_human, mid_event, mid_clock, low]
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_queued_execution_never_runs() {
    let executor = TrackingExecutor::new(Duration::from_millis(200));
    let manager = manager(config(1, 10), &[record("r1", 1, 10, 5)]).await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    let running = manager.trigger_manual("r1", human("running")).await.unwrap();
    wait_status(&manager, &running, ExecStatus::Running).await;
    let queued = manager
        .trigger("r1", human("queued").into())
        .await
        .unwrap();
    assert!(queued.queued);
    let queued_id = queued.execution_id.unwrap();

    manager.stop_execution(&queued_id).await.unwrap();
    let status = manager.get_execution_status(&queued_id).await.unwrap();
    assert_eq!(status.status, ExecStatus::Cancelled);
    assert!(status.ended_at.is_some());

    wait_idle(&manager).await;
    assert_eq!(executor.order(), vec![running]);

    let record = manager
        .execution_store()
        .get_execution(&queued_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecStatus::Cancelled);
    assert!(record.end_time.is_some());
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_completed_execution_is_an_error() {
    let manager = manager(config(2, 10), &[record("r1", 1, 10, 5)]).await;
    manager.start().await.unwrap();

    let id = manager.trigger_manual("r1", event("ping")).await.unwrap();
    wait_idle(&manager).await;

    let err = manager.stop_execution(&id).await.unwrap_err();
    assert!(matches!(
        err,
        RobotError::ExecutionFinished { status: ExecStatus::Completed, .. }
    ));
    let err = manager.stop_execution(&id).await.unwrap_err();
    assert!(matches!(err, RobotError::ExecutionFinished { .. }));
    assert_eq!(
        manager.get_execution_status(&id).await.unwrap().status,
        ExecStatus::Completed
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_pause_keeps_slot_and_resume_completes() {
    let store = Arc::new(MemoryStore::new());
    store.save_robot(&record("r1", 1, 10, 5)).await.unwrap();
    let slow = PipelineExecutor::new(Arc::new(
        DryRunPhases::new().with_delay(Duration::from_millis(40)),
    ))
    .with_store(store.clone())
    .with_robot_store(store.clone());
    let manager = Manager::with_stores(config(2, 10), store.clone(), store.clone())
        .with_executor(Arc::new(slow));
    manager.start().await.unwrap();

    let id = manager.trigger_manual("r1", human("long task")).await.unwrap();
    wait_status(&manager, &id, ExecStatus::Running).await;

    manager.pause_execution(&id).await.unwrap();
    assert!(matches!(
        manager.pause_execution(&id).await,
        Err(RobotError::AlreadyPaused)
    ));
    let paused_phase = manager.get_execution_status(&id).await.unwrap().phase;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = manager.get_execution_status(&id).await.unwrap();
    assert_eq!(status.status, ExecStatus::Paused);
    assert!(status.paused_at.is_some());
    // 暂停中的执行最多推进到当前阶段结束
    assert!(status.phase as u8 <= paused_phase as u8 + 1);
    assert_eq!(manager.robot_state("r1").unwrap().running, 1);

    // 配额仍被占用，新的触发只能排队
    let second = manager.trigger("r1", human("next").into()).await.unwrap();
    assert!(second.accepted);
    assert!(second.queued);

    manager.resume_execution(&id).await.unwrap();
    assert!(matches!(
        manager.resume_execution(&id).await,
        Err(RobotError::NotPaused)
    ));
    wait_idle(&manager).await;
    assert_eq!(
        manager.get_execution_status(&id).await.unwrap().status,
        ExecStatus::Completed
    );
    let record = store.get_execution(&id).await.unwrap().unwrap();
    assert!(record.inspiration.is_none());
    assert!(record.goals.is_some());
    assert!(record.delivery.is_some());
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_running_execution_releases_slot() {
    let executor = TrackingExecutor::new(Duration::from_secs(30));
    let manager = manager(config(2, 10), &[record("r1", 1, 10, 5)]).await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    let id = manager.trigger_manual("r1", human("forever")).await.unwrap();
    wait_status(&manager, &id, ExecStatus::Running).await;
    manager.stop_execution(&id).await.unwrap();

    wait_idle(&manager).await;
    assert_eq!(
        manager.get_execution_status(&id).await.unwrap().status,
        ExecStatus::Cancelled
    );
    assert_eq!(manager.robot_state("r1").unwrap().running, 0);
    manager.stop().await;
}

#[tokio::test]
async fn test_lifecycle() {
    let manager = manager(config(2, 10), &[record("r1", 1, 10, 5)]).await;
    assert!(!manager.is_started());

    let result = manager.trigger("r1", human("early").into()).await.unwrap();
    assert!(!result.accepted);

    manager.start().await.unwrap();
    assert!(matches!(
        manager.start().await,
        Err(RobotError::ManagerAlreadyStarted)
    ));
    assert!(manager.is_running());
    assert!(manager.cache().is_some());

    manager.stop().await;
    manager.stop().await;
    assert!(!manager.is_started());
    assert!(manager.cache().is_none());
    assert!(manager.pool().is_none());

    manager.start().await.unwrap();
    let result = manager.trigger("r1", human("again").into()).await.unwrap();
    assert!(result.accepted, "{}", result.message);
    wait_idle(&manager).await;
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_after_grace_period() {
    let executor = TrackingExecutor::new(Duration::from_secs(30));
    let manager = manager(
        config(2, 10).with_stop_grace(Duration::from_millis(100)),
        &[record("r1", 1, 10, 5)],
    )
    .await;
    manager.set_executor(executor.clone());
    manager.start().await.unwrap();

    let running = manager.trigger_manual("r1", human("slow")).await.unwrap();
    let queued = manager.trigger_manual("r1", human("waiting")).await.unwrap();
    wait_status(&manager, &running, ExecStatus::Running).await;

    let started = std::time::Instant::now();
    manager.stop().await;
    assert!(started.elapsed() < Duration::from_secs(10));

    for id in [&running, &queued] {
        assert_eq!(
            manager.get_execution_status(id).await.unwrap().status,
            ExecStatus::Cancelled
        );
    }
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_executor_mode_selection() {
    let standard = TrackingExecutor::new(Duration::from_millis(5));
    let dry_run = TrackingExecutor::new(Duration::from_millis(5));
    let dry_cfg = RobotConfig::default().with_executor_mode(ExecutorMode::DryRun);
    let manager = manager(
        config(2, 10),
        &[
            record("plain", 2, 10, 5),
            RobotRecord::new("rehearsal", "team-1").with_config(&dry_cfg),
        ],
    )
    .await;
    manager.set_executor(standard.clone());
    manager.set_executor_for(ExecutorMode::DryRun, dry_run.clone());
    manager.start().await.unwrap();

    manager.trigger_manual("plain", human("real")).await.unwrap();
    manager.trigger_manual("rehearsal", human("robot default")).await.unwrap();
    manager
        .trigger(
            "plain",
            TriggerRequest::new(human("request override")).with_executor_mode(ExecutorMode::Sandbox),
        )
        .await
        .unwrap();
    manager
        .intervene(
            InterveneRequest::new("rehearsal", InterventionAction::TaskAdd)
                .with_message(Message::user("forced standard"))
                .with_executor_mode(ExecutorMode::Standard),
        )
        .await
        .unwrap();
    wait_idle(&manager).await;

    assert_eq!(standard.calls(), 2);
    // sandbox 未配置时回退到 dry-run
    assert_eq!(dry_run.calls(), 2);
    manager.stop().await;
}

#[tokio::test]
async fn test_refresh_evicts_robot_but_keeps_record() {
    let store = Arc::new(MemoryStore::new());
    store.save_robot(&record("r1", 1, 10, 5)).await.unwrap();
    let manager = Manager::with_stores(config(2, 10), store.clone(), store.clone());
    manager.start().await.unwrap();
    assert_eq!(manager.cached_robots(), 1);

    store
        .save_robot(&record("r1", 1, 10, 5).with_autonomous(false))
        .await
        .unwrap();
    assert!(!manager.refresh_robot("r1").await.unwrap());
    assert_eq!(manager.cached_robots(), 0);
    assert!(store.get_robot("r1").await.unwrap().is_some());

    let result = manager.trigger("r1", human("gone").into()).await.unwrap();
    assert!(!result.accepted);
    manager.stop().await;
}

#[tokio::test]
async fn test_queued_execution_keeps_admission_start_time() {
    let store = Arc::new(MemoryStore::new());
    store.save_robot(&record("r1", 2, 10, 5)).await.unwrap();
    let slow = PipelineExecutor::new(Arc::new(
        DryRunPhases::new().with_delay(Duration::from_millis(60)),
    ))
    .with_store(store.clone())
    .with_robot_store(store.clone());
    let manager = Manager::with_stores(config(1, 10), store.clone(), store.clone())
        .with_executor(Arc::new(slow));
    manager.start().await.unwrap();

    manager.trigger_manual("r1", human("first")).await.unwrap();
    let second = manager.trigger_manual("r1", human("second")).await.unwrap();
    let admitted = store.get_execution(&second).await.unwrap().unwrap();
    assert_eq!(admitted.status, ExecStatus::Pending);

    wait_idle(&manager).await;
    let finished = store.get_execution(&second).await.unwrap().unwrap();
    assert_eq!(finished.status, ExecStatus::Completed);
    assert_eq!(finished.start_time, admitted.start_time);
    assert_eq!(
        manager.get_execution_status(&second).await.unwrap().started_at,
        admitted.start_time
    );
    assert!(finished.end_time.unwrap() - admitted.start_time >= chrono::Duration::milliseconds(60));
    manager.stop().await;
}
