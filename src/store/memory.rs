//! 内存存储：测试与无数据库部署使用

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    ExecutionRecord, ExecutionStore, ListOptions, RobotFilter, RobotRecord, RobotStore, StoreError,
};
use crate::execution::{CurrentState, ExecStatus, Phase, PhaseOutput};
use crate::robot::RobotStatus;

#[derive(Debug, Default)]
pub struct MemoryStore {
    robots: RwLock<HashMap<String, RobotRecord>>,
    executions: RwLock<HashMap<String, ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn robot_count(&self) -> usize {
        self.robots.read().await.len()
    }

    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

fn paginate<T>(mut items: Vec<T>, offset: usize, limit: Option<usize>) -> (Vec<T>, usize) {
    let total = items.len();
    let items = if offset >= total {
        Vec::new()
    } else {
        let mut rest = items.split_off(offset);
        if let Some(limit) = limit {
            rest.truncate(limit);
        }
        rest
    };
    (items, total)
}

#[async_trait]
impl RobotStore for MemoryStore {
    async fn get_robot(&self, member_id: &str) -> Result<Option<RobotRecord>, StoreError> {
        Ok(self.robots.read().await.get(member_id).cloned())
    }

    async fn save_robot(&self, record: &RobotRecord) -> Result<(), StoreError> {
        self.robots
            .write()
            .await
            .insert(record.member_id.clone(), record.clone());
        Ok(())
    }

    async fn list_robots(&self, filter: &RobotFilter) -> Result<(Vec<RobotRecord>, usize), StoreError> {
        let mut matched: Vec<_> = self
            .robots
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        Ok(paginate(matched, filter.offset, filter.limit))
    }

    async fn update_robot_status(&self, member_id: &str, status: RobotStatus) -> Result<(), StoreError> {
        let mut robots = self.robots.write().await;
        let record = robots
            .get_mut(member_id)
            .ok_or_else(|| StoreError::NotFound(member_id.to_string()))?;
        record.robot_status = status;
        Ok(())
    }

    async fn delete_robot(&self, member_id: &str) -> Result<bool, StoreError> {
        Ok(self.robots.write().await.remove(member_id).is_some())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let mut record = record.clone();
        if let Some(existing) = executions.get(&record.execution_id) {
            record.created_at = existing.created_at;
        }
        record.updated_at = Utc::now();
        executions.insert(record.execution_id.clone(), record);
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.executions.read().await.get(execution_id).cloned())
    }

    async fn list_executions(&self, opts: &ListOptions) -> Result<(Vec<ExecutionRecord>, usize), StoreError> {
        let mut matched: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|r| opts.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        if opts.newest_first {
            matched.reverse();
        }
        Ok(paginate(matched, opts.offset, opts.limit))
    }

    async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let record = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        record.apply_status(status, error);
        Ok(())
    }

    async fn update_execution_phase(
        &self,
        execution_id: &str,
        phase: Phase,
        output: Option<PhaseOutput>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let record = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        record.phase = phase;
        if let Some(output) = output {
            record.apply_output(output);
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_execution_current(
        &self,
        execution_id: &str,
        current: &CurrentState,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let record = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        record.current = Some(current.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<bool, StoreError> {
        Ok(self.executions.write().await.remove(execution_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{EventInput, EventSource, Execution, Goals, TriggerInput, TriggerType};

    fn event_execution(id: &str, member: &str) -> Execution {
        Execution::new(
            id,
            member,
            "t1",
            TriggerInput::Event(EventInput {
                source: EventSource::Webhook,
                event_type: "order.paid".into(),
                data: serde_json::json!({"order": 42}),
            }),
        )
    }

    #[tokio::test]
    async fn test_robot_crud() {
        let store = MemoryStore::new();
        store.save_robot(&RobotRecord::new("m1", "t1")).await.unwrap();
        store
            .save_robot(&RobotRecord::new("m2", "t1").with_autonomous(false))
            .await
            .unwrap();

        let (list, total) = store.list_robots(&RobotFilter::autonomous()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(list[0].member_id, "m1");

        store.update_robot_status("m1", RobotStatus::Working).await.unwrap();
        assert_eq!(
            store.get_robot("m1").await.unwrap().unwrap().robot_status,
            RobotStatus::Working
        );
        assert!(matches!(
            store.update_robot_status("missing", RobotStatus::Idle).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.delete_robot("m2").await.unwrap());
        assert!(!store.delete_robot("m2").await.unwrap());
    }

    #[tokio::test]
    async fn test_execution_projection_updates() {
        let store = MemoryStore::new();
        let exec = event_execution("e1", "m1");
        store.save_execution(&ExecutionRecord::from(&exec)).await.unwrap();

        store
            .update_execution_status("e1", ExecStatus::Running, None)
            .await
            .unwrap();
        store
            .update_execution_phase(
                "e1",
                Phase::Goals,
                Some(PhaseOutput::Goals(Goals { content: "g".into() })),
            )
            .await
            .unwrap();
        store
            .update_execution_current(
                "e1",
                &CurrentState {
                    task_index: 2,
                    progress: "2/3".into(),
                },
            )
            .await
            .unwrap();
        store
            .update_execution_status("e1", ExecStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        let record = store.get_execution("e1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.goals.unwrap().content, "g");
        assert_eq!(record.current.unwrap().task_index, 2);
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let member = if i % 2 == 0 { "m1" } else { "m2" };
            store
                .save_execution(&ExecutionRecord::from(&event_execution(&format!("e{}", i), member)))
                .await
                .unwrap();
        }

        let (page, total) = store
            .list_executions(&ListOptions {
                member_id: Some("m1".into()),
                limit: Some(2),
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let (page, total) = store
            .list_executions(&ListOptions {
                trigger_type: Some(TriggerType::Clock),
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 0);
        assert!(page.is_empty());

        let (page, _) = store
            .list_executions(&ListOptions {
                offset: 10,
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_execution() {
        let store = MemoryStore::new();
        let err = store
            .update_execution_phase("nope", Phase::Run, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
