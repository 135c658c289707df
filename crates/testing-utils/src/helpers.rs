//! Test helper utilities and common testing patterns

use mediaflow_domain::{StageGraph, TaskRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::mocks::{MockTaskRepository, RecordingListener};

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    /// Registry over an in-memory repository with a recording listener attached
    pub fn registry() -> (TaskRegistry, MockTaskRepository, RecordingListener) {
        let repository = MockTaskRepository::new();
        let listener = RecordingListener::new();
        let registry = TaskRegistry::new(Arc::new(repository.clone()), StageGraph::standard())
            .with_listener(Arc::new(listener.clone()));
        (registry, repository, listener)
    }
}
