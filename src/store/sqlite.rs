//! SQLite 存储（sqlx，异步）
//!
//! 阶段产出与触发负载以 JSON 文本列保存；时间统一存 RFC 3339（纳秒精度、UTC），
//! 因此按 `start_time` 的字典序即时间序。

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{
    ExecutionRecord, ExecutionStore, ListOptions, RobotFilter, RobotRecord, RobotStore, StoreError,
};
use crate::execution::{CurrentState, ExecStatus, Phase, PhaseOutput, TriggerType};
use crate::robot::RobotStatus;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// 进程内数据库；单连接，否则每个连接各自一份
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS robots (
                member_id TEXT PRIMARY KEY,
                team_id TEXT NOT NULL,
                display_name TEXT,
                system_prompt TEXT,
                robot_status TEXT NOT NULL,
                autonomous_mode INTEGER NOT NULL DEFAULT 0,
                robot_config TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS robot_executions (
                execution_id TEXT PRIMARY KEY,
                member_id TEXT NOT NULL,
                team_id TEXT NOT NULL,
                job_id TEXT,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                current TEXT,
                error TEXT,
                input TEXT NOT NULL,
                inspiration TEXT,
                goals TEXT,
                tasks TEXT NOT NULL,
                results TEXT NOT NULL,
                delivery TEXT,
                learning TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_robots_team ON robots(team_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_exec_member ON robot_executions(member_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_exec_status ON robot_executions(status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO robot_executions
             (execution_id, member_id, team_id, job_id, trigger_type, status, phase, current, error,
              input, inspiration, goals, tasks, results, delivery, learning,
              start_time, end_time, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(execution_id) DO UPDATE SET
              job_id = excluded.job_id,
              status = excluded.status,
              phase = excluded.phase,
              current = excluded.current,
              error = excluded.error,
              input = excluded.input,
              inspiration = excluded.inspiration,
              goals = excluded.goals,
              tasks = excluded.tasks,
              results = excluded.results,
              delivery = excluded.delivery,
              learning = excluded.learning,
              start_time = excluded.start_time,
              end_time = excluded.end_time,
              updated_at = excluded.updated_at",
        )
        .bind(&record.execution_id)
        .bind(&record.member_id)
        .bind(&record.team_id)
        .bind(&record.job_id)
        .bind(record.trigger_type.as_str())
        .bind(record.status.as_str())
        .bind(record.phase.as_str())
        .bind(to_json_opt(&record.current)?)
        .bind(&record.error)
        .bind(serde_json::to_string(&record.input)?)
        .bind(to_json_opt(&record.inspiration)?)
        .bind(to_json_opt(&record.goals)?)
        .bind(serde_json::to_string(&record.tasks)?)
        .bind(serde_json::to_string(&record.results)?)
        .bind(to_json_opt(&record.delivery)?)
        .bind(serde_json::to_string(&record.learning)?)
        .bind(format_time(&record.start_time))
        .bind(record.end_time.as_ref().map(format_time))
        .bind(format_time(&record.created_at))
        .bind(format_time(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn require_execution(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
        self.get_execution(execution_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("timestamp {}: {}", s, e)))
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<String>, StoreError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn from_json_opt<T: DeserializeOwned>(value: Option<String>) -> Result<Option<T>, StoreError> {
    value
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)
}

fn parse_enum<T>(s: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    s.parse::<T>().map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn row_to_robot(row: &SqliteRow) -> Result<RobotRecord, StoreError> {
    Ok(RobotRecord {
        member_id: row.try_get("member_id")?,
        team_id: row.try_get("team_id")?,
        display_name: row.try_get("display_name")?,
        system_prompt: row.try_get("system_prompt")?,
        robot_status: parse_enum::<RobotStatus>(&row.try_get::<String, _>("robot_status")?)?,
        autonomous_mode: row.try_get::<i64, _>("autonomous_mode")? != 0,
        robot_config: from_json_opt(row.try_get("robot_config")?)?,
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<ExecutionRecord, StoreError> {
    Ok(ExecutionRecord {
        execution_id: row.try_get("execution_id")?,
        member_id: row.try_get("member_id")?,
        team_id: row.try_get("team_id")?,
        job_id: row.try_get("job_id")?,
        trigger_type: parse_enum::<TriggerType>(&row.try_get::<String, _>("trigger_type")?)?,
        status: parse_enum::<ExecStatus>(&row.try_get::<String, _>("status")?)?,
        phase: parse_enum::<Phase>(&row.try_get::<String, _>("phase")?)?,
        current: from_json_opt(row.try_get("current")?)?,
        error: row.try_get("error")?,
        input: serde_json::from_str(&row.try_get::<String, _>("input")?)?,
        inspiration: from_json_opt(row.try_get("inspiration")?)?,
        goals: from_json_opt(row.try_get("goals")?)?,
        tasks: serde_json::from_str(&row.try_get::<String, _>("tasks")?)?,
        results: serde_json::from_str(&row.try_get::<String, _>("results")?)?,
        delivery: from_json_opt(row.try_get("delivery")?)?,
        learning: serde_json::from_str(&row.try_get::<String, _>("learning")?)?,
        start_time: parse_time(&row.try_get::<String, _>("start_time")?)?,
        end_time: row
            .try_get::<Option<String>, _>("end_time")?
            .map(|s| parse_time(&s))
            .transpose()?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn push_robot_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RobotFilter) {
    qb.push(" WHERE 1 = 1");
    if filter.autonomous_only {
        qb.push(" AND autonomous_mode = 1");
    }
    if let Some(team) = &filter.team_id {
        qb.push(" AND team_id = ").push_bind(team.clone());
    }
}

fn push_execution_filters(qb: &mut QueryBuilder<'_, Sqlite>, opts: &ListOptions) {
    qb.push(" WHERE 1 = 1");
    if let Some(member) = &opts.member_id {
        qb.push(" AND member_id = ").push_bind(member.clone());
    }
    if let Some(team) = &opts.team_id {
        qb.push(" AND team_id = ").push_bind(team.clone());
    }
    if let Some(status) = opts.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(trigger) = opts.trigger_type {
        qb.push(" AND trigger_type = ").push_bind(trigger.as_str());
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Sqlite>, offset: usize, limit: Option<usize>) {
    // SQLite 要求 OFFSET 前必须有 LIMIT，-1 表示不限
    qb.push(" LIMIT ")
        .push_bind(limit.map(|l| l as i64).unwrap_or(-1))
        .push(" OFFSET ")
        .push_bind(offset as i64);
}

#[async_trait]
impl RobotStore for SqliteStore {
    async fn get_robot(&self, member_id: &str) -> Result<Option<RobotRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM robots WHERE member_id = ?")
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_robot).transpose()
    }

    async fn save_robot(&self, record: &RobotRecord) -> Result<(), StoreError> {
        let config = record
            .robot_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT OR REPLACE INTO robots
             (member_id, team_id, display_name, system_prompt, robot_status, autonomous_mode, robot_config)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.member_id)
        .bind(&record.team_id)
        .bind(&record.display_name)
        .bind(&record.system_prompt)
        .bind(record.robot_status.as_str())
        .bind(record.autonomous_mode as i64)
        .bind(config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_robots(&self, filter: &RobotFilter) -> Result<(Vec<RobotRecord>, usize), StoreError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM robots");
        push_robot_filters(&mut count, filter);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM robots");
        push_robot_filters(&mut select, filter);
        select.push(" ORDER BY member_id");
        push_page(&mut select, filter.offset, filter.limit);
        let rows = select.build().fetch_all(&self.pool).await?;

        let records = rows.iter().map(row_to_robot).collect::<Result<Vec<_>, _>>()?;
        Ok((records, total as usize))
    }

    async fn update_robot_status(&self, member_id: &str, status: RobotStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE robots SET robot_status = ? WHERE member_id = ?")
            .bind(status.as_str())
            .bind(member_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(member_id.to_string()));
        }
        Ok(())
    }

    async fn delete_robot(&self, member_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM robots WHERE member_id = ?")
            .bind(member_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.write_execution(record).await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM robot_executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_executions(&self, opts: &ListOptions) -> Result<(Vec<ExecutionRecord>, usize), StoreError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM robot_executions");
        push_execution_filters(&mut count, opts);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM robot_executions");
        push_execution_filters(&mut select, opts);
        if opts.newest_first {
            select.push(" ORDER BY start_time DESC, execution_id DESC");
        } else {
            select.push(" ORDER BY start_time ASC, execution_id ASC");
        }
        push_page(&mut select, opts.offset, opts.limit);
        let rows = select.build().fetch_all(&self.pool).await?;

        let records = rows.iter().map(row_to_execution).collect::<Result<Vec<_>, _>>()?;
        Ok((records, total as usize))
    }

    async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut record = self.require_execution(execution_id).await?;
        record.apply_status(status, error);
        self.write_execution(&record).await
    }

    async fn update_execution_phase(
        &self,
        execution_id: &str,
        phase: Phase,
        output: Option<PhaseOutput>,
    ) -> Result<(), StoreError> {
        let mut record = self.require_execution(execution_id).await?;
        record.phase = phase;
        if let Some(output) = output {
            record.apply_output(output);
        }
        self.write_execution(&record).await
    }

    async fn update_execution_current(
        &self,
        execution_id: &str,
        current: &CurrentState,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE robot_executions SET current = ?, updated_at = ? WHERE execution_id = ?",
        )
        .bind(serde_json::to_string(current)?)
        .bind(format_time(&Utc::now()))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(execution_id.to_string()));
        }
        Ok(())
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM robot_executions WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{
        ClockContext, Execution, Goals, InspirationReport, Task, TaskResult, TaskSource, TaskStatus,
        ExecutorType, Message, TriggerInput,
    };

    fn clock_execution(id: &str) -> Execution {
        let mut exec = Execution::new(
            id,
            "m1",
            "t1",
            TriggerInput::Clock(ClockContext::new(Utc::now(), chrono_tz::UTC)),
        );
        exec.transition_to(ExecStatus::Running).unwrap();
        exec.record(PhaseOutput::Inspiration(InspirationReport {
            content: "market is quiet".into(),
            clock: None,
        }))
        .unwrap();
        exec.record(PhaseOutput::Goals(Goals { content: "call three leads".into() }))
            .unwrap();
        exec.record(PhaseOutput::Tasks(vec![Task {
            id: "task-1".into(),
            messages: vec![Message::user("call ACME")],
            goal_ref: Some("goal-1".into()),
            source: TaskSource::Auto,
            executor_type: ExecutorType::Assistant,
            executor_id: "caller".into(),
            args: vec![],
            status: TaskStatus::Completed,
            order: 0,
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
        }]))
        .unwrap();
        exec.record(PhaseOutput::Run(vec![TaskResult {
            task_id: "task-1".into(),
            success: true,
            output: Some(serde_json::json!("done")),
            error: None,
            duration_ms: 12,
            validated: true,
        }]))
        .unwrap();
        exec.phase = Phase::Learning;
        exec.complete().unwrap();
        exec
    }

    #[tokio::test]
    async fn test_sqlite_execution_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let exec = clock_execution("e1");
        store.save_execution(&ExecutionRecord::from(&exec)).await.unwrap();

        let back = store.get_execution("e1").await.unwrap().unwrap().into_execution();
        assert_eq!(back.status(), exec.status());
        assert_eq!(back.phase, exec.phase);
        assert_eq!(back.tasks, exec.tasks);
        assert_eq!(back.results, exec.results);
        assert_eq!(back.start_time, exec.start_time);
        assert_eq!(back.end_time(), exec.end_time());
        assert_eq!(back.inspiration, exec.inspiration);
    }

    #[tokio::test]
    async fn test_sqlite_robot_list_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("robots.db")).await.unwrap();

        store.save_robot(&RobotRecord::new("m1", "t1")).await.unwrap();
        store.save_robot(&RobotRecord::new("m2", "t1")).await.unwrap();
        store
            .save_robot(&RobotRecord::new("m3", "t2").with_autonomous(false))
            .await
            .unwrap();

        let (page, total) = store
            .list_robots(&RobotFilter {
                autonomous_only: true,
                limit: Some(1),
                ..RobotFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].member_id, "m1");

        store.update_robot_status("m2", RobotStatus::Paused).await.unwrap();
        let m2 = store.get_robot("m2").await.unwrap().unwrap();
        assert_eq!(m2.robot_status, RobotStatus::Paused);
        assert!(store.update_robot_status("zz", RobotStatus::Idle).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_status_and_phase_updates() {
        let store = SqliteStore::in_memory().await.unwrap();
        let exec = Execution::new(
            "e2",
            "m1",
            "t1",
            TriggerInput::Clock(ClockContext::new(Utc::now(), chrono_tz::UTC)),
        );
        store.save_execution(&ExecutionRecord::from(&exec)).await.unwrap();

        store
            .update_execution_phase("e2", Phase::Goals, Some(PhaseOutput::Goals(Goals { content: "g".into() })))
            .await
            .unwrap();
        store
            .update_execution_status("e2", ExecStatus::Cancelled, Some("stopped".into()))
            .await
            .unwrap();

        let (list, total) = store
            .list_executions(&ListOptions {
                status: Some(ExecStatus::Cancelled),
                ..ListOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(list[0].phase, Phase::Goals);
        assert!(list[0].end_time.is_some());
        assert!(store.delete_execution("e2").await.unwrap());
        assert!(store.get_execution("e2").await.unwrap().is_none());
    }
}
