//! 核心层：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{Result, RobotError, StoreResultExt};
pub use shutdown::{
    run_until_shutdown, ManagerCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownReason,
    ShutdownSignal,
};
