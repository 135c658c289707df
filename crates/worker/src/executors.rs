use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info};

use mediaflow_domain::Stage;

use crate::executor::{ExecutorRegistry, ProgressReporter, StageContext, StageError, StageExecutor};

/// 模拟执行器
///
/// 分步休眠并上报进度，最后返回描述本次执行的结果。用于本地联调和
/// 没有真实阶段执行器的部署。
pub struct SimulatedExecutor {
    name: String,
    steps: u32,
    step_delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(stage: Stage, steps: u32, step_delay: Duration) -> Self {
        Self {
            name: format!("simulated-{stage}"),
            steps: steps.max(1),
            step_delay,
        }
    }

    /// 为给定阶段各注册一个模拟执行器
    pub fn registry(stages: impl IntoIterator<Item = Stage>, step_delay: Duration) -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        for stage in stages {
            registry.register(stage, Arc::new(Self::new(stage, 4, step_delay)));
        }
        registry
    }
}

#[async_trait]
impl StageExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        context: StageContext,
        reporter: ProgressReporter,
    ) -> Result<Value, StageError> {
        info!(
            "模拟执行 item={} stage={} attempt={}",
            context.item_id(),
            context.stage(),
            context.task.attempt
        );

        for step in 1..self.steps {
            tokio::select! {
                _ = context.cancelled() => {
                    return Err(StageError::recoverable("execution cancelled"));
                }
                _ = sleep(self.step_delay) => {}
            }

            let progress = (step * 100 / self.steps) as i32;
            if let Err(e) = reporter
                .report(progress, Some(format!("{} {progress}%", context.stage())))
                .await
            {
                debug!("上报进度失败: {}", e);
            }
        }

        tokio::select! {
            _ = context.cancelled() => Err(StageError::recoverable("execution cancelled")),
            _ = sleep(self.step_delay) => Ok(json!({
                "item_id": context.item_id(),
                "stage": context.stage().as_str(),
                "executor": self.name,
                "input": context.input.clone().unwrap_or(Value::Null),
            })),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
