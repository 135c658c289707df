//! Worker：阶段执行器契约与消费循环
//!
//! 消息到达后先经状态适配器认领，执行结束再把结果交给适配器，
//! 最后才确认消息（延迟确认）。

pub mod executor;
pub mod executors;
pub mod service;

pub use executor::{ExecutorRegistry, ProgressReporter, StageContext, StageError, StageExecutor};
pub use executors::SimulatedExecutor;
pub use service::{WorkerOptions, WorkerService, HARD_TIME_LIMIT_ERROR, SOFT_TIME_LIMIT_ERROR};
