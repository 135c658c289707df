//! 阶段派发、状态适配与回收
//!
//! `StageDispatcher` 建立任务并发布阶段消息，`StatusAdapter` 把消息代理的
//! 原生状态翻译成登记表转换，`Reclaimer` 周期清理卡死与过期的任务。

pub mod reclaimer;
pub mod retry_policy;
pub mod stage_dispatcher;
pub mod status_adapter;

pub use reclaimer::{CategoryReport, ReclaimReport, Reclaimer, ReclaimerConfig};
pub use retry_policy::RetryPolicy;
pub use stage_dispatcher::StageDispatcher;
pub use status_adapter::{
    AdapterConfig, BrokerSignal, Claim, CompletionKind, CompletionPolicy, ErrorClassifier,
    FieldSetCompletionPolicy, KeywordErrorClassifier, SignalOutcome, StatusAdapter,
};
