//! Hive - Robot 调度核心
//!
//! 模块划分：
//! - **robot**: Robot 实体、配置与配额守卫
//! - **execution**: 执行实体、状态机、触发输入与控制句柄
//! - **executor**: 可替换的执行策略（流水线驱动 / 模拟阶段）
//! - **pool**: 工作池与优先队列（全局准入闸门）
//! - **cache**: 自治 Robot 缓存
//! - **manager**: 触发路由、执行控制、生命周期、时钟
//! - **store**: 持久化协作者（内存 / SQLite）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **observability**: 日志初始化

pub mod cache;
pub mod config;
pub mod core;
pub mod execution;
pub mod executor;
pub mod manager;
pub mod observability;
pub mod pool;
pub mod robot;
pub mod store;

pub use crate::core::error::{Result, RobotError};
pub use manager::{ExecutionResult, Manager, ManagerConfig, RobotState, TriggerRequest, TriggerResult};
