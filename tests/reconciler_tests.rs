//! Worker reconciler against fake clusters and the in-memory store.
//!
//! Every test drives one or more passes and checks the local rows converge to
//! what the cluster reports: new workers are inserted with the right billing
//! state, first start times open billing, and workers that leave the listing
//! end up OFFLINE with a termination time.

mod common;

use std::sync::Arc;

use common::{
    at, cluster, endpoint, registry, registry_per_cluster, remote_worker, t0, worker, FakeCluster,
    MemStore, RecordingPublisher, RecordingScaler,
};
use fleetmeter::db::BillingStatus;
use fleetmeter::error::FleetError;
use fleetmeter::metering::{MeteringEngine, MeteringSettings, WorkerOutcome};
use fleetmeter::prom_metrics::Metrics;
use fleetmeter::reconciler::WorkerReconciler;
use fleetmeter::store::FleetStore;
use serde_json::json;

const PRICE: i64 = 3_600_000_000;

fn reconciler(store: &Arc<MemStore>, fake: &Arc<FakeCluster>) -> WorkerReconciler {
    WorkerReconciler::new(store.clone(), registry(fake.clone()), Arc::new(Metrics::new()))
}

fn one_endpoint() -> (Arc<MemStore>, Arc<FakeCluster>, fleetmeter::db::EndpointRow) {
    let store = MemStore::new();
    store.add_cluster(cluster("c1", "us-east", 100));
    let ep = store.add_endpoint(endpoint("u1", "model", "c1", PRICE));
    (store, FakeCluster::new(), ep)
}

#[tokio::test]
async fn new_workers_are_inserted_with_billing_state() {
    let (store, fake, ep) = one_endpoint();
    fake.set_workers(
        &ep.physical_name,
        vec![
            remote_worker("w-started", "RUNNING", Some(t0())),
            remote_worker("w-pending", "STARTING", None),
        ],
    );

    let summary = reconciler(&store, &fake).run_pass().await.unwrap();
    assert_eq!(summary.endpoints, 1);
    assert_eq!(summary.discovered, 2);

    let started = store.worker("w-started").unwrap();
    assert_eq!(started.billing_status, BillingStatus::Active);
    assert_eq!(started.last_billed_at, Some(t0()));
    assert_eq!(started.total_tasks_completed, 4);
    assert_eq!(started.user_id, "u1");
    assert_eq!(started.endpoint_id, ep.id);

    let pending = store.worker("w-pending").unwrap();
    assert_eq!(pending.billing_status, BillingStatus::Pending);
    assert_eq!(pending.last_billed_at, None);

    let billable = store.list_billable_workers().await.unwrap();
    assert_eq!(billable.len(), 1);
    assert_eq!(billable[0].worker_id, "w-started");
}

#[tokio::test]
async fn first_start_time_activates_billing() {
    let (store, fake, ep) = one_endpoint();
    let r = reconciler(&store, &fake);
    fake.set_workers(&ep.physical_name, vec![remote_worker("w1", "STARTING", None)]);
    r.run_pass().await.unwrap();

    fake.set_workers(&ep.physical_name, vec![remote_worker("w1", "RUNNING", Some(at(30)))]);
    let summary = r.run_pass().await.unwrap();
    assert_eq!(summary.activated, 1);
    assert_eq!(summary.discovered, 0);

    let w = store.worker("w1").unwrap();
    assert_eq!(w.billing_status, BillingStatus::Active);
    assert_eq!(w.pod_started_at, Some(at(30)));
    assert_eq!(w.last_billed_at, Some(at(30)));
    assert_eq!(w.status, "RUNNING");
}

#[tokio::test]
async fn later_start_times_do_not_move_billing_cursor() {
    let (store, fake, ep) = one_endpoint();
    let r = reconciler(&store, &fake);
    fake.set_workers(&ep.physical_name, vec![remote_worker("w1", "RUNNING", Some(t0()))]);
    r.run_pass().await.unwrap();

    fake.set_workers(&ep.physical_name, vec![remote_worker("w1", "RUNNING", Some(at(500)))]);
    let summary = r.run_pass().await.unwrap();
    assert_eq!(summary.activated, 0);
    assert_eq!(store.worker("w1").unwrap().last_billed_at, Some(t0()));
}

#[tokio::test]
async fn vanished_worker_takes_termination_from_detail() {
    let (store, fake, ep) = one_endpoint();
    let r = reconciler(&store, &fake);
    fake.set_workers(&ep.physical_name, vec![remote_worker("w1", "RUNNING", Some(t0()))]);
    r.run_pass().await.unwrap();

    fake.set_workers(&ep.physical_name, vec![]);
    fake.set_worker_detail(
        "w1",
        json!({"id": "w1", "status": "OFFLINE", "terminatedAt": at(200).to_rfc3339()}),
    );
    let summary = r.run_pass().await.unwrap();
    assert_eq!(summary.marked_offline, 1);

    let w = store.worker("w1").unwrap();
    assert!(w.is_offline());
    assert_eq!(w.pod_terminated_at, Some(at(200)));
}

#[tokio::test]
async fn vanished_worker_without_detail_ends_at_last_heartbeat() {
    let (store, fake, ep) = one_endpoint();
    let r = reconciler(&store, &fake);
    let mut payload = remote_worker("w1", "RUNNING", Some(t0()));
    payload["lastHeartbeat"] = json!(at(75).to_rfc3339());
    fake.set_workers(&ep.physical_name, vec![payload]);
    r.run_pass().await.unwrap();

    fake.set_workers(&ep.physical_name, vec![]);
    r.run_pass().await.unwrap();

    let w = store.worker("w1").unwrap();
    assert!(w.is_offline());
    assert_eq!(w.pod_terminated_at, Some(at(75)));
    assert_eq!(fake.count("get_worker"), 1);
}

#[tokio::test]
async fn vanished_worker_billed_past_its_heartbeat_still_closes_out() {
    let (store, fake, ep) = one_endpoint();
    let r = reconciler(&store, &fake);
    let mut payload = remote_worker("w1", "RUNNING", Some(t0()));
    payload["lastHeartbeat"] = json!(at(75).to_rfc3339());
    fake.set_workers(&ep.physical_name, vec![payload]);
    r.run_pass().await.unwrap();

    // A metering cycle charged up to 120s, after the last heartbeat.
    store.edit_worker("w1", |w| w.last_billed_at = Some(at(120)));
    fake.set_workers(&ep.physical_name, vec![]);
    r.run_pass().await.unwrap();

    let w = store.worker("w1").unwrap();
    assert!(w.is_offline());
    assert_eq!(w.pod_terminated_at, Some(at(120)));

    let engine = MeteringEngine::new(
        store.clone(),
        RecordingScaler::new(),
        None,
        RecordingPublisher::new(),
        Arc::new(Metrics::new()),
        MeteringSettings::default(),
    );
    assert_eq!(engine.bill_worker(&w, at(600)).await.unwrap(), WorkerOutcome::Finalized);
    assert_eq!(store.worker("w1").unwrap().billing_status, BillingStatus::FinalBilled);
    assert!(store.transactions().is_empty());
}

#[tokio::test]
async fn offline_status_in_listing_marks_worker_offline() {
    let (store, fake, ep) = one_endpoint();
    let r = reconciler(&store, &fake);
    fake.set_workers(&ep.physical_name, vec![remote_worker("w1", "RUNNING", Some(t0()))]);
    r.run_pass().await.unwrap();

    let mut gone = remote_worker("w1", "OFFLINE", Some(t0()));
    gone["terminatedAt"] = json!(at(40).to_rfc3339());
    fake.set_workers(&ep.physical_name, vec![gone]);
    let summary = r.run_pass().await.unwrap();
    assert_eq!(summary.marked_offline, 1);
    assert_eq!(store.worker("w1").unwrap().pod_terminated_at, Some(at(40)));

    // Already offline: the next pass does not touch the termination time.
    let summary = r.run_pass().await.unwrap();
    assert_eq!(summary.marked_offline, 0);
    assert_eq!(store.worker("w1").unwrap().pod_terminated_at, Some(at(40)));
}

#[tokio::test]
async fn repeated_passes_converge() {
    let (store, fake, ep) = one_endpoint();
    let r = reconciler(&store, &fake);
    fake.set_workers(
        &ep.physical_name,
        vec![
            remote_worker("w1", "RUNNING", Some(t0())),
            remote_worker("w2", "RUNNING", Some(at(5))),
        ],
    );
    r.run_pass().await.unwrap();
    let first: Vec<_> = ["w1", "w2"].iter().map(|id| store.worker(id).unwrap()).collect();

    let summary = r.run_pass().await.unwrap();
    assert_eq!(summary.discovered, 0);
    assert_eq!(summary.activated, 0);
    assert_eq!(summary.marked_offline, 0);
    assert_eq!(summary.updated, 2);
    for before in first {
        let after = store.worker(&before.worker_id).unwrap();
        assert_eq!(after.billing_status, before.billing_status);
        assert_eq!(after.last_billed_at, before.last_billed_at);
    }
}

#[tokio::test]
async fn failing_cluster_does_not_block_others() {
    let store = MemStore::new();
    store.add_cluster(cluster("c-good", "us-east", 100));
    store.add_cluster(cluster("c-bad", "eu", 50));
    let good_ep = store.add_endpoint(endpoint("u1", "good", "c-good", PRICE));
    let bad_ep = store.add_endpoint(endpoint("u1", "bad", "c-bad", PRICE));
    store.add_worker(worker("w-bad", &bad_ep, t0()));

    let good = FakeCluster::new();
    good.set_workers(&good_ep.physical_name, vec![remote_worker("w-good", "RUNNING", Some(t0()))]);
    let bad = FakeCluster::new();
    bad.fail("list_workers");

    let r = WorkerReconciler::new(
        store.clone(),
        registry_per_cluster(vec![("c-good", good), ("c-bad", bad)]),
        Arc::new(Metrics::new()),
    );
    let summary = r.run_pass().await.unwrap();

    assert_eq!(summary.endpoints, 2);
    assert_eq!(summary.endpoints_failed, 1);
    assert!(store.worker("w-good").is_some());
    // A failed listing must not be read as "every worker vanished".
    assert!(!store.worker("w-bad").unwrap().is_offline());
}

#[tokio::test]
async fn suspended_endpoints_are_not_reconciled() {
    let (store, fake, ep) = one_endpoint();
    store
        .set_endpoint_status(ep.id, fleetmeter::db::EndpointStatus::Suspended)
        .await
        .unwrap();
    fake.set_workers(&ep.physical_name, vec![remote_worker("w1", "RUNNING", Some(t0()))]);

    let summary = reconciler(&store, &fake).run_pass().await.unwrap();
    assert_eq!(summary.endpoints, 0);
    assert!(store.worker("w1").is_none());
    assert_eq!(fake.count("list_workers"), 0);
}

#[tokio::test]
async fn termination_report_confirmed_by_missing_worker() {
    let (store, fake, ep) = one_endpoint();
    let mut w = worker("w1", &ep, t0());
    w.last_heartbeat = Some(at(50));
    store.add_worker(w);

    let row = reconciler(&store, &fake).reconcile_worker("w1").await.unwrap();
    assert!(row.is_offline());
    assert_eq!(row.pod_terminated_at, Some(at(50)));
}

#[tokio::test]
async fn termination_report_rejected_while_cluster_shows_worker_alive() {
    let (store, fake, ep) = one_endpoint();
    store.add_worker(worker("w1", &ep, t0()));
    fake.set_worker_detail("w1", remote_worker("w1", "RUNNING", Some(t0())));

    let row = reconciler(&store, &fake).reconcile_worker("w1").await.unwrap();
    assert!(!row.is_offline());
    assert_eq!(row.pod_terminated_at, None);
}

#[tokio::test]
async fn termination_report_for_unknown_worker_is_not_found() {
    let (store, fake, _) = one_endpoint();
    let err = reconciler(&store, &fake)
        .reconcile_worker("nope")
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound { entity: "worker", .. }));
}
