//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SCHEDULER__POOL__WORKER_SIZE=4`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::manager::ManagerConfig;
use crate::pool::PoolConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerSection,
    pub store: StoreSection,
}

/// [scheduler] 段：时钟、停止宽限期、缓存刷新、工作池
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// 时钟检查间隔（秒），0 表示不启动时钟
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// stop 时等待运行中执行的最长时间（秒）
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// 缓存整体重载间隔（秒），0 表示关闭
    #[serde(default = "default_cache_refresh_secs")]
    pub cache_refresh_secs: u64,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_stop_grace_secs() -> u64 {
    30
}

fn default_cache_refresh_secs() -> u64 {
    3600
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            cache_refresh_secs: default_cache_refresh_secs(),
            pool: PoolConfig::default(),
        }
    }
}

impl From<&SchedulerSection> for ManagerConfig {
    fn from(section: &SchedulerSection) -> Self {
        ManagerConfig {
            tick_interval: Duration::from_secs(section.tick_interval_secs),
            pool: PoolConfig::new(section.pool.worker_size, section.pool.queue_size),
            stop_grace: Duration::from_secs(section.stop_grace_secs),
            cache_refresh: (section.cache_refresh_secs > 0)
                .then(|| Duration::from_secs(section.cache_refresh_secs)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// 需要 `async-sqlite` feature
    Sqlite,
}

/// [store] 段：持久化后端与种子数据
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    /// sqlite 数据库文件
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// 启动时导入的 Robot 记录（JSON 数组）
    pub seed_file: Option<PathBuf>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/hive.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            seed_file: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        let manager = ManagerConfig::from(&cfg.scheduler);
        assert_eq!(manager, ManagerConfig::default());
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
tick_interval_secs = 5
cache_refresh_secs = 0

[scheduler.pool]
worker_size = 3

[store]
backend = "sqlite"
path = "/tmp/robots.db"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.scheduler.tick_interval_secs, 5);
        assert_eq!(cfg.scheduler.pool.worker_size, 3);
        assert_eq!(cfg.scheduler.pool.queue_size, 100);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);

        let manager = ManagerConfig::from(&cfg.scheduler);
        assert_eq!(manager.tick_interval, Duration::from_secs(5));
        assert_eq!(manager.cache_refresh, None);
        assert_eq!(manager.stop_grace, Duration::from_secs(30));
    }
}
