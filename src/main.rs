//! Hive - Robot 调度服务
//!
//! 入口：加载配置、初始化日志、构建存储与调度管理器，运行到收到关闭信号后优雅停止。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::{load_config, StoreBackend};
use hive::core::{run_until_shutdown, ManagerCleanup, ShutdownCoordinator, ShutdownSignal};
use hive::store::{ExecutionStore, MemoryStore, RobotFilter, RobotRecord, RobotStore};
use hive::{Manager, ManagerConfig};

type Stores = (Arc<dyn RobotStore>, Arc<dyn ExecutionStore>);

async fn open_stores(backend: StoreBackend, path: &Path) -> anyhow::Result<Stores> {
    match backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
        #[cfg(feature = "async-sqlite")]
        StoreBackend::Sqlite => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            let store = Arc::new(
                hive::store::SqliteStore::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            );
            Ok((store.clone(), store))
        }
        #[cfg(not(feature = "async-sqlite"))]
        StoreBackend::Sqlite => anyhow::bail!(
            "store backend sqlite ({}) requires the async-sqlite feature",
            path.display()
        ),
    }
}

/// 导入种子 Robot 记录（JSON 数组），返回导入数量
async fn import_seed(store: &dyn RobotStore, seed: &Path) -> anyhow::Result<usize> {
    let text = std::fs::read_to_string(seed)
        .with_context(|| format!("Failed to read seed file {}", seed.display()))?;
    let records: Vec<RobotRecord> =
        serde_json::from_str(&text).context("Seed file must be a JSON array of robot records")?;
    for record in &records {
        store
            .save_robot(record)
            .await
            .with_context(|| format!("Failed to import robot {}", record.member_id))?;
    }
    Ok(records.len())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let app_config = load_config(config_path).context("Failed to load config")?;

    let (robot_store, exec_store) =
        open_stores(app_config.store.backend, &app_config.store.path).await?;
    if let Some(seed) = &app_config.store.seed_file {
        let count = import_seed(robot_store.as_ref(), seed).await?;
        tracing::info!("Imported {} robots from {}", count, seed.display());
    }

    let manager = Manager::with_stores(
        ManagerConfig::from(&app_config.scheduler),
        robot_store.clone(),
        exec_store,
    );
    manager.start().await.context("Failed to start manager")?;

    let signal = ShutdownSignal::new();
    signal.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new()
        .with_timeout(Duration::from_secs(app_config.scheduler.stop_grace_secs + 10));
    coordinator.register(ManagerCleanup::new(manager.clone()));

    let reason = run_until_shutdown(&signal, watch_store(robot_store)).await;
    tracing::info!("Shutting down: {}", reason);
    coordinator.run_cleanup(&reason).await;

    Ok(())
}

/// 定期探测 Robot 存储；连续失败即视为致命错误
async fn watch_store(store: Arc<dyn RobotStore>) -> anyhow::Result<()> {
    const MAX_FAILURES: u32 = 3;
    let filter = RobotFilter { limit: Some(1), ..RobotFilter::default() };
    let mut failures = 0;
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        match store.list_robots(&filter).await {
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                tracing::warn!("Robot store check failed ({}/{}): {}", failures, MAX_FAILURES, e);
                if failures >= MAX_FAILURES {
                    return Err(e).context("Robot store unreachable");
                }
            }
        }
    }
}
