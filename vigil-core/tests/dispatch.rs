use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;
use vigil_core::{
    database::ports::{PolicyRepository, RunFilter, RunRepository},
    services::UpdatePolicy,
};
use vigil_model::{
    ErrorCategory, PageRequest, PolicyStatus, RunPayload, RunStatus,
    ScheduleDescriptor,
};

#[path = "support/mod.rs"]
mod support;

use support::{FlakyQueue, Harness, discovery_policy};

#[tokio::test]
async fn quick_policy_dispatches_exactly_once() {
    let h = Harness::new();
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let t0 = policy.created_at;
    assert_eq!(policy.next_run_at, Some(t0));

    let run_id = h.dispatch_one(t0).await;

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.created_at, t0);
    assert_eq!(run.policy_id, policy.id);

    let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
    assert_eq!(stored.last_run_at, Some(t0));
    assert_eq!(stored.next_run_at, None);

    let job = h.lease(t0).await.expect("job on the queue");
    assert_eq!(job.job.run_id, run_id);
    assert_eq!(job.job.targets, policy.targets);

    let again = h
        .runtime
        .dispatcher()
        .dispatch_due(t0 + Duration::seconds(1))
        .await
        .unwrap();
    assert!(again.dispatched.is_empty());
}

#[tokio::test]
async fn quick_policy_is_never_due_again_after_completion() {
    let h = Harness::new();
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let t0 = policy.created_at;

    let run_id = h.dispatch_one(t0).await;
    h.succeed(run_id, RunPayload::default(), t0 + Duration::seconds(30))
        .await;

    let much_later = t0 + Duration::days(365);
    let report = h.runtime.dispatcher().dispatch_due(much_later).await.unwrap();
    assert!(report.dispatched.is_empty());

    let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_at, None);
    assert_eq!(stored.status, PolicyStatus::Active);
}

#[tokio::test]
async fn interval_policy_is_due_one_interval_after_last_dispatch() {
    let h = Harness::new();
    let policy = h
        .create_policy(discovery_policy(ScheduleDescriptor::interval("24h")))
        .await;
    let t = policy.created_at;

    let first = h.dispatch_one(t).await;
    let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
    assert_eq!(stored.last_run_at, Some(t));
    assert_eq!(stored.next_run_at, Some(t + Duration::hours(24)));

    h.succeed(first, RunPayload::default(), t + Duration::minutes(5))
        .await;

    let early = h
        .runtime
        .dispatcher()
        .dispatch_due(t + Duration::hours(24) - Duration::seconds(1))
        .await
        .unwrap();
    assert!(early.dispatched.is_empty());

    let second = h.dispatch_one(t + Duration::hours(24)).await;
    assert_ne!(first, second);
    let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_at, Some(t + Duration::hours(48)));
}

#[tokio::test]
async fn in_flight_run_blocks_the_next_interval() {
    let h = Harness::new();
    let policy = h
        .create_policy(discovery_policy(ScheduleDescriptor::interval("1h")))
        .await;
    let t = policy.created_at;

    h.dispatch_one(t).await;

    // Still QUEUED an interval later: the policy is due but single-flight.
    let report = h
        .runtime
        .dispatcher()
        .dispatch_due(t + Duration::hours(1))
        .await
        .unwrap();
    assert!(report.dispatched.is_empty());

    let runs = h
        .store
        .list_runs(
            &RunFilter {
                policy_id: Some(policy.id),
                ..RunFilter::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(runs.total, 1);
}

#[tokio::test]
async fn manual_trigger_rearms_a_quick_policy() {
    let h = Harness::new();
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let t0 = policy.created_at;
    let run_id = h.dispatch_one(t0).await;
    h.succeed(run_id, RunPayload::default(), t0 + Duration::seconds(10))
        .await;

    let triggered = h.policies.trigger_policy(h.owner, policy.id).await.unwrap();
    let requested = triggered.trigger_requested_at.expect("trigger recorded");
    assert_eq!(triggered.next_run_at, Some(requested));

    let rerun = h.dispatch_one(requested).await;
    assert_ne!(rerun, run_id);

    let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
    assert_eq!(stored.trigger_requested_at, None);
    assert_eq!(stored.next_run_at, None);
}

#[tokio::test]
async fn paused_policies_are_not_dispatched() {
    let h = Harness::new();
    let policy = h
        .create_policy(discovery_policy(ScheduleDescriptor::interval("1h")))
        .await;
    h.policies
        .update_policy(
            h.owner,
            policy.id,
            UpdatePolicy {
                status: Some(PolicyStatus::Paused),
                ..UpdatePolicy::default()
            },
        )
        .await
        .unwrap();

    let report = h
        .runtime
        .dispatcher()
        .dispatch_due(policy.created_at + Duration::hours(2))
        .await
        .unwrap();
    assert!(report.dispatched.is_empty());
}

#[tokio::test]
async fn failed_enqueue_fails_the_run_and_keeps_the_policy_due() {
    let queue = Arc::new(FlakyQueue::failing());
    let h = Harness::with_queue(queue.clone());
    let policy = h.create_policy(discovery_policy(ScheduleDescriptor::quick())).await;
    let t0 = policy.created_at;

    let report = h.runtime.dispatcher().dispatch_due(t0).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.enqueue_failures.len(), 1);
    assert_eq!(queue.enqueue_calls(), 3, "retried up to max_attempts");

    let failed = h
        .store
        .get_run(report.enqueue_failures[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    let error = failed.summary.error.expect("dispatch error recorded");
    assert_eq!(error.category, ErrorCategory::Dispatch);
    assert!(error.retryable);

    let stored = h.store.get_policy(policy.id).await.unwrap().unwrap();
    assert_eq!(stored.trigger_requested_at, Some(t0));
    assert_eq!(stored.next_run_at, Some(t0));
    assert_eq!(stored.status, PolicyStatus::Active);

    queue.set_failing(false);
    let recovered = h.dispatch_one(t0 + Duration::seconds(5)).await;
    assert!(queue.contains(recovered).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_dispatchers_never_double_book_a_policy() {
    let h = Harness::new();
    let mut policies = Vec::new();
    for _ in 0..10 {
        policies.push(
            h.create_policy(discovery_policy(ScheduleDescriptor::interval("1h")))
                .await,
        );
    }
    let now = policies
        .iter()
        .map(|p| p.created_at)
        .max()
        .unwrap()
        + Duration::seconds(1);

    let tasks = (0..32).map(|_| {
        let dispatcher = h.runtime.dispatcher().clone();
        tokio::spawn(async move { dispatcher.dispatch_due(now).await })
    });
    let reports: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("dispatch"))
        .collect();

    let dispatched: usize = reports.iter().map(|r| r.dispatched.len()).sum();
    assert_eq!(dispatched, policies.len());

    for policy in &policies {
        let in_flight = h
            .store
            .list_runs(
                &RunFilter {
                    policy_id: Some(policy.id),
                    ..RunFilter::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap()
            .items
            .into_iter()
            .filter(|run| run.status.is_in_flight())
            .count();
        assert_eq!(in_flight, 1, "policy {} has {in_flight} runs in flight", policy.id);
    }
}
