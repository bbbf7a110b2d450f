use mechaway_orchestrator::runtime::ScheduleUpdate;
use mechaway_orchestrator::{
    EngineType, ErrorCode, ExecutionStatus, LocalAdapter, OrchestrationEngine, OrchestratorError, OrchestratorEvent,
    Priority, ScheduleConfig, WorkflowDefinition,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod common;
use common::{engine_with, fast_config, wait_until, workflow, ScriptedAdapter};

#[tokio::test]
async fn retryable_failures_are_retried_until_success() {
    let adapter = Arc::new(
        ScriptedAdapter::new(EngineType::N8n).failing_with(vec![ErrorCode::NetworkError, ErrorCode::Timeout]),
    );
    let engine = engine_with(Arc::clone(&adapter), EngineType::N8n);
    engine.start().await.unwrap();

    let result = engine
        .execute_workflow(workflow("flaky", EngineType::N8n), json!({"x": 1}), Priority::Normal, "tester")
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.metrics.attempts, 3);
    assert_eq!(adapter.calls(), 3);
    assert_eq!(result.result.unwrap()["echo"]["x"], 1);

    let stats = engine.get_queue_stats().await;
    assert_eq!(stats.total_retried, 2);
    assert_eq!(stats.total_completed, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn retry_budget_is_exhausted_then_reported_failed() {
    let adapter = Arc::new(
        ScriptedAdapter::new(EngineType::N8n).failing_with(vec![ErrorCode::ServiceUnavailable; 10]),
    );
    let engine = engine_with(Arc::clone(&adapter), EngineType::N8n);
    engine.start().await.unwrap();

    let result = engine
        .execute_workflow(workflow("down", EngineType::N8n), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::ServiceUnavailable));
    // first attempt plus max_attempts re-submissions
    assert_eq!(adapter.calls(), 4);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn terminal_failures_are_not_retried() {
    let adapter = Arc::new(ScriptedAdapter::new(EngineType::N8n).failing_with(vec![ErrorCode::WorkflowFailed]));
    let engine = engine_with(Arc::clone(&adapter), EngineType::N8n);
    engine.start().await.unwrap();

    let result = engine
        .execute_workflow(workflow("broken", EngineType::N8n), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(adapter.calls(), 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_workflows_never_reach_the_queue() {
    let adapter = Arc::new(ScriptedAdapter::new(EngineType::Langflow).rejecting_workflows());
    let engine = engine_with(Arc::clone(&adapter), EngineType::Langflow);
    engine.start().await.unwrap();

    let err = engine
        .submit_workflow(workflow("nope", EngineType::Langflow), json!({}), Priority::High, "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let scheduled = engine
        .schedule_workflow(
            workflow("nope", EngineType::Langflow),
            ScheduleConfig::new("* * * * *"),
            json!({}),
            "tester",
        )
        .await;
    assert!(!scheduled.success);
    assert_eq!(adapter.calls(), 0);
    assert_eq!(engine.get_scheduler_stats().await.total_schedules, 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn full_queue_applies_backpressure() {
    let mut config = fast_config();
    config.orchestration.queue.max_queue_size = 1;
    let engine = OrchestrationEngine::new(config);
    let adapter = Arc::new(ScriptedAdapter::new(EngineType::N8n));
    engine.register_adapter(EngineType::N8n, adapter);

    // not started, so nothing drains the queue
    engine
        .submit_workflow(workflow("a", EngineType::N8n), json!({}), Priority::Low, "tester")
        .await
        .unwrap();
    let err = engine
        .submit_workflow(workflow("b", EngineType::N8n), json!({}), Priority::Critical, "tester")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QueueFull { max_size: 1 }));

    let stats = engine.get_queue_stats().await;
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total_rejected, 1);
}

#[tokio::test]
async fn pending_execution_cancels_definitively() {
    let engine = engine_with(Arc::new(ScriptedAdapter::new(EngineType::N8n)), EngineType::N8n);
    let id = engine
        .submit_workflow(workflow("later", EngineType::N8n), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();
    assert_eq!(engine.get_execution_status(&id).await, Some(ExecutionStatus::Queued));

    assert!(engine.cancel_execution(&id).await.unwrap());
    assert!(!engine.cancel_execution(&id).await.unwrap());
    assert!(!engine.cancel_execution("unknown").await.unwrap());
}

#[tokio::test]
async fn running_execution_on_engine_without_cancel_support_reports_cancellation_error() {
    let adapter = Arc::new(ScriptedAdapter::new(EngineType::N8n).with_delay(Duration::from_millis(500)));
    let engine = engine_with(Arc::clone(&adapter), EngineType::N8n);
    engine.start().await.unwrap();

    let id = engine
        .submit_workflow(workflow("slow", EngineType::N8n), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();
    assert!(wait_until(1000, || async { engine.get_execution(&id).await.is_some() }).await);

    let err = engine.cancel_execution(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancellation { .. }));
    // bookkeeping is untouched when the engine declines
    assert_eq!(engine.get_execution_status(&id).await, Some(ExecutionStatus::Running));

    assert!(
        wait_until(2000, || async {
            engine.get_execution_status(&id).await == Some(ExecutionStatus::Completed)
        })
        .await
    );
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn schedule_with_fire_budget_removes_itself() {
    let adapter = Arc::new(ScriptedAdapter::new(EngineType::N8n));
    let engine = engine_with(Arc::clone(&adapter), EngineType::N8n);
    engine.start().await.unwrap();

    // midnight on January 1st: the timer never fires during the test
    let scheduled = engine
        .schedule_workflow(
            workflow("yearly", EngineType::N8n),
            ScheduleConfig::new("0 0 1 1 *").with_max_executions(2),
            json!({"source": "schedule"}),
            "tester",
        )
        .await;
    assert!(scheduled.success);
    let schedule_id = scheduled.schedule_id.unwrap();

    engine.trigger_scheduled_workflow(&schedule_id).await.unwrap();
    engine.trigger_scheduled_workflow(&schedule_id).await.unwrap();

    let err = engine.trigger_scheduled_workflow(&schedule_id).await.unwrap_err();
    assert!(err.to_string().contains("Scheduled workflow not found"));
    assert!(engine.list_schedules().await.is_empty());

    // both produced requests were admitted and ran
    assert!(wait_until(2000, || async { adapter.calls() == 2 }).await);
    assert!(
        wait_until(2000, || async {
            engine.list_executions(Some(ExecutionStatus::Completed)).await.len() == 2
        })
        .await
    );
    assert_eq!(engine.get_scheduler_stats().await.total_fired, 2);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn schedule_updates_flow_through_the_facade() {
    let engine = engine_with(Arc::new(ScriptedAdapter::new(EngineType::N8n)), EngineType::N8n);
    let scheduled = engine
        .schedule_workflow(
            workflow("hourly", EngineType::N8n),
            ScheduleConfig::new("@hourly"),
            json!({}),
            "tester",
        )
        .await;
    let schedule_id = scheduled.schedule_id.unwrap();

    let update = ScheduleUpdate {
        cron_expression: Some("30 2 * * *".to_string()),
        ..ScheduleUpdate::default()
    };
    assert!(engine.update_schedule(&schedule_id, update).await.unwrap());
    let next = engine.get_next_execution_time(&schedule_id).await.unwrap();
    assert_eq!(next.format("%H:%M:%S").to_string(), "02:30:00");

    assert!(engine.toggle_schedule(&schedule_id, false).await);
    assert!(engine.get_next_execution_time(&schedule_id).await.is_none());
    assert!(engine.unschedule_workflow(&schedule_id).await);
    assert!(!engine.unschedule_workflow(&schedule_id).await);
}

#[tokio::test]
async fn subscribers_see_execution_lifecycle_events() {
    let engine = engine_with(Arc::new(ScriptedAdapter::new(EngineType::N8n)), EngineType::N8n);
    let mut events = engine.subscribe();
    engine.start().await.unwrap();

    let result = engine
        .execute_workflow(workflow("observed", EngineType::N8n), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        if event.execution_id() == Some(result.id.as_str()) {
            names.push(event.name());
        }
        if matches!(event, OrchestratorEvent::ExecutionCompleted { .. }) {
            break;
        }
    }
    assert_eq!(names, vec!["executionQueued", "executionStarted", "executionCompleted"]);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn pooled_submissions_run_on_workers() {
    let adapter = Arc::new(ScriptedAdapter::new(EngineType::N8n).failing_with(vec![ErrorCode::NetworkError]));
    let engine = engine_with(Arc::clone(&adapter), EngineType::N8n);
    engine.start().await.unwrap();
    assert_eq!(engine.worker_pool().worker_count().await, 1);

    let id = engine
        .submit_pooled_workflow(workflow("pooled", EngineType::N8n), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();
    let result = engine
        .worker_pool()
        .wait_for_result(&id, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(adapter.calls_for(&id), 2);
    assert!(
        wait_until(1000, || async {
            engine.get_execution_status(&id).await == Some(ExecutionStatus::Completed)
        })
        .await
    );
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn retried_execution_keeps_parameters_and_last_error_in_its_side_channel() {
    let adapter = Arc::new(
        ScriptedAdapter::new(EngineType::N8n)
            .failing_with(vec![ErrorCode::NetworkError])
            .with_delay(Duration::from_millis(300)),
    );
    let engine = engine_with(Arc::clone(&adapter), EngineType::N8n);
    engine.start().await.unwrap();

    let id = engine
        .submit_workflow(workflow("flaky", EngineType::N8n), json!({"region": "eu"}), Priority::Normal, "tester")
        .await
        .unwrap();
    assert!(
        wait_until(2000, || async {
            engine.get_execution(&id).await.is_some_and(|snapshot| snapshot.attempt == 2)
        })
        .await
    );

    let snapshot = engine.get_execution(&id).await.unwrap();
    assert_eq!(snapshot.variables["region"], "eu");
    assert!(snapshot.variables["last_error"].as_str().unwrap().contains("scripted failure"));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_cancels_every_live_execution_even_when_one_engine_declines() {
    let engine = OrchestrationEngine::new(fast_config());
    let scripted = Arc::new(ScriptedAdapter::new(EngineType::N8n).with_delay(Duration::from_secs(10)));
    engine.register_adapter(EngineType::N8n, scripted);
    engine.register_adapter(EngineType::Local, Arc::new(LocalAdapter::new()));
    engine.start().await.unwrap();

    let slow_local = |id: &str| {
        Arc::new(WorkflowDefinition::new(id, id, EngineType::Local).with_node("wait", "delay", json!({"ms": 10_000})))
    };
    let first = engine
        .submit_workflow(slow_local("first"), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();
    let second = engine
        .submit_workflow(slow_local("second"), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();
    let stubborn = engine
        .submit_workflow(workflow("stubborn", EngineType::N8n), json!({}), Priority::Normal, "tester")
        .await
        .unwrap();
    assert!(wait_until(2000, || async { engine.get_active_executions().await.len() == 3 }).await);

    let started = Instant::now();
    engine.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!engine.is_running());

    assert_eq!(engine.get_execution_status(&first).await, Some(ExecutionStatus::Cancelled));
    assert_eq!(engine.get_execution_status(&second).await, Some(ExecutionStatus::Cancelled));
    // a declined cancellation is logged, not raised
    assert_eq!(engine.get_execution_status(&stubborn).await, Some(ExecutionStatus::Running));
}
