use crate::*;

#[test]
fn test_pipeline_error_display() {
    let task_error = PipelineError::TaskNotFound { id: 123 };
    assert_eq!(task_error.to_string(), "任务未找到: 123");

    let conflict = PipelineError::conflict(1, "acquire");
    assert_eq!(conflict.to_string(), "阶段 acquire 已存在活跃任务: 媒体项 1");

    let mismatch = PipelineError::version_mismatch(7, 2, 3);
    assert_eq!(mismatch.to_string(), "任务 7 版本不匹配: 期望 2, 实际 3");

    let transition = PipelineError::invalid_transition(9, "SUCCESS", "RUNNING");
    assert_eq!(
        transition.to_string(),
        "任务 9 的状态转换无效: SUCCESS -> RUNNING"
    );

    let mq_error = PipelineError::MessageQueue("Connection failed".to_string());
    assert_eq!(mq_error.to_string(), "消息队列错误: Connection failed");
}

#[test]
fn test_control_signals() {
    assert!(PipelineError::conflict(1, "audio").is_control_signal());
    assert!(PipelineError::version_mismatch(1, 0, 1).is_control_signal());
    assert!(PipelineError::version_mismatch(1, 0, 1).is_version_mismatch());
    assert!(!PipelineError::task_not_found(1).is_control_signal());
    assert!(!PipelineError::invalid_transition(1, "A", "B").is_control_signal());
}

#[test]
fn test_error_classification() {
    assert!(PipelineError::MessageQueue("x".into()).is_retryable());
    assert!(PipelineError::database_error("locked").is_retryable());
    assert!(!PipelineError::validation_error("bad").is_retryable());

    assert!(PipelineError::config_error("missing").is_fatal());
    assert!(PipelineError::Internal("boom".into()).is_fatal());
    assert!(!PipelineError::task_not_found(1).is_fatal());
}

#[test]
fn test_user_message() {
    assert_eq!(
        PipelineError::conflict(1, "segment").user_message(),
        "该阶段已有正在进行的任务"
    );
    assert_eq!(
        PipelineError::Internal("x".into()).user_message(),
        "系统繁忙，请稍后重试"
    );
}

#[test]
fn test_from_serde_json_error() {
    let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let converted: PipelineError = err.into();
    assert!(matches!(converted, PipelineError::Serialization(_)));
}
