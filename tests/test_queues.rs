//! Integration tests running the queue manager, workers and shutdown against an in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use callqueue::application::{processor_fn, Lifecycle, ProcessorError, ProcessorRegistry};
use callqueue::config::Config;
use callqueue::models::job::{JobType, QueueName, State};
use callqueue::models::QueueError;
use callqueue::service::JobService;

use crate::support::*;

mod support;

#[tokio::test]
async fn submissions_are_counted_by_type() {
    let (manager, _store) = test_manager();

    manager
        .add_call_job("CA123", "transcribe", json!({"audioUrl": "https://r.example.com/1.wav"}), None)
        .await
        .unwrap();
    manager
        .add_analytics_job("daily_aggregation", daily_aggregation_payload(), None)
        .await
        .unwrap();

    let snapshot = manager.get_metrics().await.unwrap();
    assert_eq!(snapshot.counters.total_jobs_added, 2);
    assert_eq!(snapshot.counters.total_jobs_completed, 0);
    assert_eq!(snapshot.counters.total_jobs_failed, 0);
    assert_eq!(snapshot.current_queue_counts.get(QueueName::Calls).waiting, 1);
    assert_eq!(snapshot.current_queue_counts.get(QueueName::Analytics).waiting, 1);
    assert_eq!(snapshot.current_queue_counts.get(QueueName::Integrations).depth(), 0);
    assert_eq!(snapshot.workers, 0);

    let value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["totalJobsAdded"], 2);
    assert_eq!(value["jobsAddedByType"]["transcribe"], 1);
    assert_eq!(value["jobsAddedByType"]["daily_aggregation"], 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn default_and_explicit_priorities() {
    let (manager, _store) = test_manager();

    let call = manager
        .add_call_job("CA1", "transcribe", transcribe_payload(), None)
        .await
        .unwrap();
    let analytics = manager
        .add_analytics_job("daily_aggregation", daily_aggregation_payload(), None)
        .await
        .unwrap();
    let integration = manager
        .add_integration_job("webhook_delivery", webhook_payload(), None)
        .await
        .unwrap();
    assert_eq!(call.priority, 5);
    assert_eq!(analytics.priority, 3);
    assert_eq!(integration.priority, 5);

    let urgent = manager
        .add_call_job("CA2", "transcribe", transcribe_payload(), Some(9))
        .await
        .unwrap();
    assert_eq!(urgent.priority, 9);

    // the higher priority job is claimed first even though it was added later
    let claimed = manager.queue(QueueName::Calls).claim().await.unwrap().unwrap();
    assert_eq!(claimed.id, urgent.job_id);

    let err = manager
        .add_call_job("CA3", "transcribe", transcribe_payload(), Some(11))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("Invalid priority 11"));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_job_types_are_rejected_without_side_effects() {
    let (manager, _store) = test_manager();

    let err = manager
        .add_call_job("CA1", "summarize", transcribe_payload(), None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    let msg = err.to_string();
    assert!(msg.contains("Invalid"));
    assert!(msg.contains("summarize"));

    // valid type, but for a different queue
    let err = manager
        .add_analytics_job("transcribe", transcribe_payload(), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("transcribe"));

    let err = manager
        .add_integration_job("email_send", json!({"to": "ops@example.com"}), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("'subject'"));

    let snapshot = manager.get_metrics().await.unwrap();
    assert_eq!(snapshot.counters.total_jobs_added, 0);
    assert!(snapshot.counters.jobs_added_by_type.is_empty());
    for name in QueueName::ALL.iter() {
        assert_eq!(snapshot.current_queue_counts.get(*name).depth(), 0);
    }

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn call_jobs_carry_their_call_sid() {
    let (manager, _store) = test_manager();

    let handle = manager
        .add_call_job("CA77", "transcribe", transcribe_payload(), None)
        .await
        .unwrap();
    assert!(handle.job_id.starts_with("CA77-transcribe-"));
    let job = manager.job(QueueName::Calls, &handle.job_id).await.unwrap();
    assert_eq!(job.payload["callSid"], "CA77");
    assert_eq!(job.payload["conversationId"], "CA77");
    assert_eq!(job.state, State::Waiting);

    let payload = json!({"conversationId": "conv-9", "messages": []});
    let handle = manager.add_call_job("CA78", "analyze", payload, None).await.unwrap();
    let job = manager.job(QueueName::Calls, &handle.job_id).await.unwrap();
    assert_eq!(job.payload["conversationId"], "conv-9");

    let err = manager
        .add_call_job("  ", "transcribe", transcribe_payload(), None)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    match manager.job(QueueName::Calls, "CA0-transcribe-1").await {
        Err(QueueError::NoSuchJob(id)) => assert_eq!(id, "CA0-transcribe-1"),
        other => panic!("expected missing job, got {:?}", other),
    }

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_submissions_get_unique_ids() {
    let (manager, _store) = test_manager();

    let handles = join_all((0..60).map(|i| {
        let manager = manager.clone();
        async move {
            let submitted = match i % 3 {
                0 => manager.add_call_job("CA500", "transcribe", transcribe_payload(), None).await,
                1 => {
                    manager
                        .add_analytics_job("daily_aggregation", daily_aggregation_payload(), None)
                        .await
                }
                _ => manager.add_integration_job("webhook_delivery", webhook_payload(), None).await,
            };
            submitted.unwrap()
        }
    }))
    .await;

    let ids: HashSet<String> = handles.into_iter().map(|h| h.job_id).collect();
    assert_eq!(ids.len(), 60);

    let snapshot = manager.get_metrics().await.unwrap();
    let counters = &snapshot.counters;
    assert_eq!(counters.total_jobs_added, 60);
    assert_eq!(counters.jobs_added_by_type[&JobType::Transcribe], 20);
    assert_eq!(counters.jobs_added_by_type[&JobType::DailyAggregation], 20);
    assert_eq!(counters.jobs_added_by_type[&JobType::WebhookDelivery], 20);
    for name in QueueName::ALL.iter() {
        assert_eq!(snapshot.current_queue_counts.get(*name).waiting, 20);
    }

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn workers_complete_jobs() {
    let (manager, _store) = test_manager();
    let processed = Arc::new(AtomicUsize::new(0));

    let counter = processed.clone();
    let registry = ProcessorRegistry::new().with_calls(processor_fn(move |job, ctx| {
        let counter = counter.clone();
        async move {
            assert_eq!(job.queue_name, QueueName::Calls);
            ctx.report_progress(50).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));
    assert_eq!(manager.setup_workers(&registry).unwrap(), 1);

    for sid in &["CA1", "CA2", "CA3"] {
        manager
            .add_call_job(sid, "transcribe", transcribe_payload(), None)
            .await
            .unwrap();
    }

    let snapshot = wait_for_metrics(&manager, |m| m.counters.total_jobs_completed == 3).await;
    assert_eq!(processed.load(Ordering::SeqCst), 3);
    assert_eq!(snapshot.counters.jobs_completed_by_type[&JobType::Transcribe], 3);
    assert_eq!(snapshot.current_queue_counts.calls.completed, 3);
    assert_eq!(snapshot.current_queue_counts.calls.active, 0);
    assert_eq!(snapshot.workers, 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_attempts_are_retried_with_backoff() {
    let (manager, _store) = test_manager();

    let registry = ProcessorRegistry::new().with_integrations(processor_fn(|job, _ctx| async move {
        if job.attempts_made < 2 {
            Err(ProcessorError::from(format!("endpoint returned 503 on attempt {}", job.attempts_made + 1)))
        } else {
            Ok(())
        }
    }));
    manager.setup_workers(&registry).unwrap();

    let handle = manager
        .add_integration_job("webhook_delivery", webhook_payload(), None)
        .await
        .unwrap();

    let snapshot = wait_for_metrics(&manager, |m| m.counters.total_jobs_completed == 1).await;
    assert_eq!(snapshot.counters.total_jobs_retried, 2);
    assert_eq!(snapshot.counters.total_jobs_failed, 0);

    let job = manager.job(QueueName::Integrations, &handle.job_id).await.unwrap();
    assert_eq!(job.state, State::Completed);
    assert_eq!(job.attempts_made, 2);
    assert_eq!(job.last_error, None);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn jobs_fail_after_max_attempts() {
    let (manager, _store) = test_manager();

    let registry = ProcessorRegistry::new().with_integrations(processor_fn(crm_unavailable));
    manager.setup_workers(&registry).unwrap();

    let handle = manager
        .add_integration_job("customer_sync", json!({"customerId": "cus_1", "action": "update"}), None)
        .await
        .unwrap();

    let snapshot = wait_for_metrics(&manager, |m| m.counters.total_jobs_failed == 1).await;
    assert_eq!(snapshot.counters.total_jobs_retried, 2);
    assert_eq!(snapshot.counters.total_jobs_completed, 0);
    assert_eq!(snapshot.counters.jobs_failed_by_type[&JobType::CustomerSync], 1);
    assert_eq!(snapshot.current_queue_counts.integrations.failed, 1);

    let failed = manager.failed_jobs(QueueName::Integrations, 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, handle.job_id);
    assert_eq!(failed[0].attempts_made, 3);
    assert_eq!(failed[0].last_error.as_deref(), Some("CRM unavailable"));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn panics_and_silent_errors_fail_attempts() {
    let (manager, _store) = test_manager();

    let registry = ProcessorRegistry::new()
        .with_calls(processor_fn(crash))
        .with_integrations(processor_fn(fail_silently));
    manager.setup_workers(&registry).unwrap();

    manager
        .add_call_job("CA9", "transcribe", transcribe_payload(), None)
        .await
        .unwrap();
    manager
        .add_integration_job("webhook_delivery", webhook_payload(), None)
        .await
        .unwrap();

    wait_for_metrics(&manager, |m| m.counters.total_jobs_failed == 2).await;

    let failed = manager.failed_jobs(QueueName::Calls, 10).await.unwrap();
    assert!(failed[0].last_error.as_deref().unwrap().contains("decoder crashed"));

    let failed = manager.failed_jobs(QueueName::Integrations, 10).await.unwrap();
    assert!(!failed[0].last_error.as_deref().unwrap().is_empty());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn worker_concurrency_is_bounded() {
    let (manager, _store) = test_manager();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (running_c, peak_c) = (running.clone(), peak.clone());
    let registry = ProcessorRegistry::new().with_analytics(processor_fn(move |_job, _ctx| {
        let (running, peak) = (running_c.clone(), peak_c.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }));
    manager.setup_workers(&registry).unwrap();

    for _ in 0..12 {
        manager
            .add_analytics_job("daily_aggregation", daily_aggregation_payload(), None)
            .await
            .unwrap();
    }

    wait_for_metrics(&manager, |m| m.counters.total_jobs_completed == 12).await;
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= 3, "analytics ran {} jobs at once", peak);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn only_queues_with_processors_get_workers() {
    let (manager, _store) = test_manager();

    let registry = ProcessorRegistry::new().with_calls(processor_fn(succeed));
    assert_eq!(manager.setup_workers(&registry).unwrap(), 1);
    assert_eq!(manager.worker_queues(), vec![QueueName::Calls]);

    manager
        .add_analytics_job("daily_aggregation", daily_aggregation_payload(), None)
        .await
        .unwrap();
    manager
        .add_call_job("CA1", "transcribe", transcribe_payload(), None)
        .await
        .unwrap();

    let snapshot = wait_for_metrics(&manager, |m| m.counters.total_jobs_completed == 1).await;
    assert_eq!(snapshot.current_queue_counts.analytics.waiting, 1);

    // a second worker for the same queue is refused
    let err = manager
        .register_worker(QueueName::Calls, processor_fn(succeed), None)
        .unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn store_failures_surface_verbatim() {
    let (manager, store) = test_manager();

    store.fail_with("ECONNREFUSED 127.0.0.1:6379");
    let err = manager
        .add_call_job("CA1", "transcribe", transcribe_payload(), None)
        .await
        .unwrap_err();
    assert!(!err.is_validation());
    assert_eq!(err.to_string(), "ECONNREFUSED 127.0.0.1:6379");

    let err = manager.get_metrics().await.unwrap_err();
    assert_eq!(err.to_string(), "ECONNREFUSED 127.0.0.1:6379");
    assert!(manager.health().await.is_err());

    store.recover();
    let snapshot = manager.get_metrics().await.unwrap();
    assert_eq!(snapshot.counters.total_jobs_added, 0);
    assert!(manager.health().await.is_ok());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_shutdown_drains_once() {
    let (manager, store) = test_manager();
    let registry = ProcessorRegistry::new()
        .with_calls(processor_fn(succeed))
        .with_analytics(processor_fn(succeed));
    manager.setup_workers(&registry).unwrap();

    let (a, b) = tokio::join!(manager.shutdown(), manager.shutdown());
    a.unwrap();
    b.unwrap();
    assert_eq!(store.close_calls(), 1);
    assert_eq!(store.close_queue_calls(), 3);
    assert_eq!(manager.lifecycle(), Lifecycle::Closed);
    assert_eq!(manager.worker_count(), 0);

    manager.shutdown().await.unwrap();
    assert_eq!(store.close_calls(), 1);
    assert_eq!(store.close_queue_calls(), 3);

    let err = manager
        .add_call_job("CA1", "transcribe", transcribe_payload(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Closed(_)));

    let err = manager
        .register_worker(QueueName::Calls, processor_fn(succeed), None)
        .unwrap_err();
    assert!(matches!(err, QueueError::Closed(_)));
}

#[tokio::test]
async fn failed_shutdown_step_still_runs_the_rest() {
    let (manager, store) = test_manager();
    manager
        .setup_workers(&ProcessorRegistry::new().with_calls(processor_fn(succeed)))
        .unwrap();
    store.fail_close_queue(QueueName::Analytics, "queue handle stuck");

    let failures = match manager.shutdown().await {
        Err(QueueError::Shutdown(failures)) => failures,
        other => panic!("expected failed shutdown, got {:?}", other),
    };
    assert_eq!(failures.len(), 1);
    assert!(failures[0].starts_with("queue analytics"), "{}", failures[0]);
    assert!(failures[0].contains("queue handle stuck"));

    // the other queues and the store were still closed
    assert_eq!(store.close_queue_calls(), 3);
    assert_eq!(store.close_calls(), 1);
    assert_eq!(manager.lifecycle(), Lifecycle::Closed);
    assert_eq!(manager.worker_count(), 0);

    // later calls report the same outcome without draining again
    match manager.shutdown().await {
        Err(QueueError::Shutdown(again)) => assert_eq!(again, failures),
        other => panic!("expected failed shutdown, got {:?}", other),
    }
    assert_eq!(store.close_calls(), 1);
    assert_eq!(store.close_queue_calls(), 3);
}

#[tokio::test]
async fn durations_beyond_the_calendar_fail_jobs_instead_of_stalling() {
    let config = Config::from_toml(
        r#"
[worker]
poll_interval = "10ms"

[queue.integrations]
backoff_delay = "400000years"
completed_max_age = "400000years"
failed_max_age = "400000years"
"#,
    )
    .unwrap();
    let (manager, _store) = test_manager_with(&config);
    manager
        .setup_workers(&ProcessorRegistry::new().with_integrations(processor_fn(crm_unavailable)))
        .unwrap();

    let handle = manager
        .add_integration_job("webhook_delivery", webhook_payload(), None)
        .await
        .unwrap();

    // the retry can't be scheduled, so the first failure is final
    let snapshot = wait_for_metrics(&manager, |m| m.counters.total_jobs_failed == 1).await;
    assert_eq!(snapshot.counters.total_jobs_retried, 0);
    assert_eq!(snapshot.current_queue_counts.integrations.active, 0);
    let job = manager.job(QueueName::Integrations, &handle.job_id).await.unwrap();
    assert_eq!(job.state, State::Failed);
    assert_eq!(job.attempts_made, 1);

    // nothing is old enough to prune
    assert_eq!(manager.queue(QueueName::Integrations).prune().await.unwrap(), 0);
    assert_eq!(manager.failed_jobs(QueueName::Integrations, 10).await.unwrap().len(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let (manager, _store) = test_manager();
    let finished = Arc::new(AtomicBool::new(false));

    let flag = finished.clone();
    let registry = ProcessorRegistry::new().with_calls(processor_fn(move |_job, _ctx| {
        let flag = flag.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    }));
    manager.setup_workers(&registry).unwrap();

    let handle = manager
        .add_call_job("CA1", "transcribe", transcribe_payload(), None)
        .await
        .unwrap();
    wait_for_metrics(&manager, |m| m.current_queue_counts.calls.active == 1).await;

    manager.shutdown().await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(manager.lifecycle(), Lifecycle::Closed);

    // the store is closed too, so the job can no longer be looked up
    assert!(manager.job(QueueName::Calls, &handle.job_id).await.is_err());
}

#[tokio::test]
async fn service_responses_use_the_envelope() {
    let (manager, _store) = test_manager();
    let service = JobService::new(manager);

    let reply = service
        .add_call_to_queue("CA123", "transcribe", transcribe_payload(), None)
        .await;
    assert!(reply.is_success());
    let resp = reply.response;
    assert!(resp.success);
    assert!(resp.error.is_none());
    let data = resp.data.unwrap();
    assert!(data.job_id.starts_with("CA123-transcribe-"));
    assert_eq!(data.call_sid, "CA123");
    assert_eq!(data.action, "transcribe");
    assert_eq!(data.queue_name, QueueName::Calls);
    assert_eq!(data.priority, 5);

    let reply = service.add_analytics_job("weekly_rollup", json!({}), None).await;
    assert!(matches!(reply.error, Some(QueueError::Validation(_))));
    let resp = reply.response;
    assert!(!resp.success);
    assert!(resp.data.is_none());
    let msg = resp.error.unwrap();
    assert!(msg.contains("Invalid"));
    assert!(msg.contains("weekly_rollup"));

    let reply = service
        .add_integration_job("email_send", json!({"to": "a@example.com", "subject": "Hi", "text": "Thanks"}), Some(8))
        .await;
    assert_eq!(reply.response.data.unwrap().priority, 8);

    let reply = service.job("billing", "CA1-transcribe-1").await;
    assert!(matches!(reply.error, Some(QueueError::Validation(_))));
    let reply = service.job("calls", &data.job_id).await;
    assert_eq!(reply.response.data.unwrap().state, State::Waiting);
    let reply = service.failed_jobs("integrations", 10).await;
    assert_eq!(reply.response.data.unwrap().len(), 0);

    let reply = service.get_metrics().await;
    let value = serde_json::to_value(&reply.response).unwrap();
    assert_eq!(value["success"], true);
    assert_eq!(value["data"]["totalJobsAdded"], 2);
    assert!(value["requestId"].is_string());

    service.shutdown().await.unwrap();

    // the aggregator is gone once shut down
    let reply = service.get_metrics().await;
    assert!(!reply.response.success);
    assert!(matches!(reply.error, Some(QueueError::Closed(_))));
}
