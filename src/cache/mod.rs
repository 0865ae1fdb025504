//! Robot 缓存：自治 Robot 的注册表
//!
//! 调度决策以缓存为准，持久化层仍是事实来源。整体重载先在锁外构建新表再一次性替换，
//! 已缓存的 Robot 原地更新（Arc 身份与运行集合不变），读者不会看到半更新的表。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{Result, RobotError, StoreResultExt};
use crate::robot::Robot;
use crate::store::{RobotFilter, RobotStore};

pub struct RobotCache {
    store: Arc<dyn RobotStore>,
    robots: RwLock<HashMap<String, Arc<Robot>>>,
}

impl RobotCache {
    pub fn new(store: Arc<dyn RobotStore>) -> Self {
        Self {
            store,
            robots: RwLock::new(HashMap::new()),
        }
    }

    /// 从存储重载全部自治 Robot，返回载入数量。
    /// 无法解析配置的记录会被跳过并记录告警。
    pub async fn load(&self) -> Result<usize> {
        let (records, total) = self
            .store
            .list_robots(&RobotFilter::autonomous())
            .await
            .context("load autonomous robots")?;

        let mut next = HashMap::with_capacity(records.len());
        for record in &records {
            let existing = self.get(&record.member_id);
            let robot = match existing {
                Some(robot) => match robot.apply_record(record) {
                    Ok(()) => robot,
                    Err(e) => {
                        warn!("Skipping robot {}: {}", record.member_id, e);
                        continue;
                    }
                },
                None => match Robot::from_record(record) {
                    Ok(robot) => Arc::new(robot),
                    Err(e) => {
                        warn!("Skipping robot {}: {}", record.member_id, e);
                        continue;
                    }
                },
            };
            next.insert(record.member_id.clone(), robot);
        }

        let loaded = next.len();
        *self.write() = next;
        info!("Robot cache loaded {} of {} autonomous robots", loaded, total);
        Ok(loaded)
    }

    pub fn get(&self, member_id: &str) -> Option<Arc<Robot>> {
        self.read().get(member_id).cloned()
    }

    /// 某个团队的全部自治 Robot，按 member_id 排序
    pub fn list(&self, team_id: &str) -> Vec<Arc<Robot>> {
        let mut robots: Vec<_> = self
            .read()
            .values()
            .filter(|r| r.team_id() == team_id)
            .cloned()
            .collect();
        robots.sort_by(|a, b| a.member_id().cmp(b.member_id()));
        robots
    }

    pub fn list_all(&self) -> Vec<Arc<Robot>> {
        let mut robots: Vec<_> = self.read().values().cloned().collect();
        robots.sort_by(|a, b| a.member_id().cmp(b.member_id()));
        robots
    }

    /// 缓存未命中时从存储读取并放入缓存；记录不存在或非自治时返回 `RobotNotFound`
    pub async fn load_by_id(&self, member_id: &str) -> Result<Arc<Robot>> {
        if let Some(robot) = self.get(member_id) {
            return Ok(robot);
        }
        let record = self
            .store
            .get_robot(member_id)
            .await
            .context(format!("load robot {}", member_id))?
            .filter(|r| r.autonomous_mode)
            .ok_or_else(|| RobotError::RobotNotFound(member_id.to_string()))?;

        let robot = Arc::new(Robot::from_record(&record)?);
        let mut robots = self.write();
        // 并发加载时保留先放入的那个
        let robot = robots
            .entry(member_id.to_string())
            .or_insert(robot)
            .clone();
        debug!("Robot {} loaded into cache", member_id);
        Ok(robot)
    }

    /// 重新读取单个 Robot：仍为自治则新增或原地更新，否则移出缓存。
    /// 返回刷新后是否在缓存中。
    pub async fn refresh(&self, member_id: &str) -> Result<bool> {
        let record = self
            .store
            .get_robot(member_id)
            .await
            .context(format!("refresh robot {}", member_id))?;

        match record {
            Some(record) if record.autonomous_mode => {
                match self.get(member_id) {
                    Some(robot) => robot.apply_record(&record)?,
                    None => {
                        let robot = Arc::new(Robot::from_record(&record)?);
                        self.write().insert(member_id.to_string(), robot);
                    }
                }
                debug!("Robot {} refreshed", member_id);
                Ok(true)
            }
            _ => {
                if self.remove(member_id) {
                    info!("Robot {} evicted from cache (missing or not autonomous)", member_id);
                }
                Ok(false)
            }
        }
    }

    /// 无条件移出缓存；返回是否存在
    pub fn remove(&self, member_id: &str) -> bool {
        self.write().remove(member_id).is_some()
    }

    /// 直接放入（测试与种子数据用）；同 ID 的已有条目被替换
    pub fn add(&self, robot: Arc<Robot>) {
        self.write().insert(robot.member_id().to_string(), robot);
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 按固定间隔整体重载，直到令牌取消
    pub fn spawn_auto_refresh(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即完成，启动时已加载过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.load().await {
                            warn!("Robot cache refresh failed: {}", e);
                        }
                    }
                }
            }
            debug!("Robot cache auto-refresh stopped");
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Robot>>> {
        self.robots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Robot>>> {
        self.robots.write().unwrap_or_else(PoisonError::into_inner)
    }
}
