//! Leadership lifecycle, recovery and reconciliation behavior.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Semaphore};

use flotilla_cluster::{
    ClusterResult, InstanceTracker, MemoryHealthChecks, MemoryLaunchQueue, MemoryReconciler,
    MemoryTracker, TaskReconciler,
};
use flotilla_core::event::{EventBus, SchedulerEvent};
use flotilla_core::instance::{Condition, Instance, InstanceId, Task, TaskStatus};
use flotilla_core::path::AppPath;
use flotilla_core::plan::DeploymentPlan;
use flotilla_core::spec::{Group, RootGroup, RunSpec};
use flotilla_scheduler::{
    Scheduler, SchedulerConfig, SchedulerDeps, SchedulerError, SchedulerRef,
};
use flotilla_state::PlanStore;

struct Rig {
    scheduler: SchedulerRef,
    tracker: Arc<MemoryTracker>,
    queue: Arc<MemoryLaunchQueue>,
    health: Arc<MemoryHealthChecks>,
    events: EventBus,
    store: PlanStore,
}

fn rig_with(store: PlanStore, driver: Arc<dyn TaskReconciler>) -> Rig {
    let tracker = Arc::new(MemoryTracker::new());
    let queue = Arc::new(MemoryLaunchQueue::new(tracker.clone()));
    let health = Arc::new(MemoryHealthChecks::new());
    let events = EventBus::default();
    let deps = SchedulerDeps {
        tracker: tracker.clone(),
        launch_queue: queue.clone(),
        health_checks: health.clone(),
        driver,
        events: events.clone(),
        store: store.clone(),
    };
    let scheduler = Scheduler::spawn(deps, SchedulerConfig::default());
    Rig {
        scheduler,
        tracker,
        queue,
        health,
        events,
        store,
    }
}

fn rig() -> Rig {
    rig_with(
        PlanStore::open_in_memory().unwrap(),
        Arc::new(MemoryReconciler::new()),
    )
}

fn path(raw: &str) -> AppPath {
    AppPath::parse(raw).unwrap()
}

fn root_with(specs: Vec<RunSpec>) -> RootGroup {
    let mut root = Group::empty_root();
    for spec in specs {
        root.put_spec(spec);
    }
    root
}

fn running_instance(app: &str, token: &str) -> Instance {
    Instance {
        condition: Condition::Running,
        started_at: 100,
        ..Instance::provisioned(InstanceId::new(path(app), token), 0)
    }
}

async fn await_event(
    rx: &mut broadcast::Receiver<SchedulerEvent>,
    pred: impl Fn(&SchedulerEvent) -> bool,
) -> SchedulerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// A reconciler that blocks each call until a permit is released.
struct GatedReconciler {
    gate: Semaphore,
    calls: Mutex<Vec<Vec<TaskStatus>>>,
}

impl GatedReconciler {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    fn calls(&self) -> Vec<Vec<TaskStatus>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskReconciler for GatedReconciler {
    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> ClusterResult<()> {
        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();
        self.calls.lock().unwrap().push(statuses);
        Ok(())
    }
}

#[tokio::test]
async fn commands_buffer_until_elected() {
    let rig = rig();

    let mut target = Group::empty_root();
    target.put_spec(RunSpec::new(path("/app"), 1));
    let plan = DeploymentPlan::build(Group::empty_root(), target, HashMap::new());
    let plan_id = plan.id.clone();

    let mut events = rig.events.subscribe();

    // Submitted before election: buffered, resolved after.
    let scheduler = rig.scheduler.clone();
    let pending = tokio::spawn(async move { scheduler.deploy(plan, false).await });
    tokio::task::yield_now().await;

    rig.scheduler.elected().await;
    pending.await.unwrap().unwrap();

    await_event(&mut events, |e| {
        matches!(e, SchedulerEvent::DeploymentSuccess { plan_id: id } if *id == plan_id)
    })
    .await;
}

#[tokio::test]
async fn election_reconciles_health_checks_from_the_group_tree() {
    let rig = rig();
    let app = RunSpec {
        health_checks: vec![flotilla_core::spec::HealthCheckSpec {
            endpoint: "/healthz".to_string(),
            interval: "5s".to_string(),
            unhealthy_threshold: 3,
        }],
        ..RunSpec::new(path("/app"), 1)
    };
    rig.store.put_root(&root_with(vec![app.clone()])).unwrap();

    rig.scheduler.elected().await;
    // Election is processed before any later command, so a round trip
    // through the scheduler is enough to observe the registration.
    rig.scheduler.reconcile_tasks().await.unwrap();

    assert_eq!(rig.health.registered_ids(), vec![app.id.clone()]);
}

#[tokio::test]
async fn recovery_resumes_persisted_plans() {
    // "First process": accept a plan that stays in flight, so it
    // remains persisted.
    let first = rig();
    first.scheduler.elected().await;
    first.tracker.set_auto_kill(false);
    first.tracker.upsert(running_instance("/app", "i1")).await;
    first.tracker.upsert(running_instance("/app", "i2")).await;

    let app = RunSpec::new(path("/app"), 2);
    let plan = DeploymentPlan::build(
        root_with(vec![app.clone()]),
        root_with(vec![app.with_instances(1)]),
        HashMap::new(),
    );
    let plan_id = plan.id.clone();
    first.scheduler.deploy(plan, false).await.unwrap();
    assert_eq!(first.store.all_plans().unwrap().len(), 1);

    // "Restarted process": fresh collaborators, same repository.
    let second = rig_with(first.store.clone(), Arc::new(MemoryReconciler::new()));
    let mut events = second.events.subscribe();
    second.scheduler.elected().await;

    // Exactly the persisted plan is resumed and driven to completion
    // (the fresh cluster has no instances, so the scale step launches).
    let started = await_event(&mut events, |e| {
        matches!(e, SchedulerEvent::DeploymentStarted { .. })
    })
    .await;
    assert!(matches!(
        started,
        SchedulerEvent::DeploymentStarted { plan_id: id, .. } if id == plan_id
    ));
    await_event(&mut events, |e| {
        matches!(e, SchedulerEvent::DeploymentSuccess { plan_id: id } if *id == plan_id)
    })
    .await;

    assert_eq!(second.queue.adds(), vec![(path("/app"), 1)]);
    assert!(second.store.all_plans().unwrap().is_empty());
}

#[tokio::test]
async fn standby_fails_reconcile_waiters_and_drops_stale_completions() {
    let driver = Arc::new(GatedReconciler::new());
    let rig = rig_with(PlanStore::open_in_memory().unwrap(), driver.clone());
    rig.scheduler.elected().await;

    // A reconciliation that cannot finish while the gate is shut.
    let scheduler = rig.scheduler.clone();
    let pending = tokio::spawn(async move { scheduler.reconcile_tasks().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    rig.scheduler.standby().await;
    match pending.await.unwrap() {
        Err(SchedulerError::NotReady) => {}
        other => panic!("expected NotReady, got {other:?}"),
    }

    // Releasing the gate lets the stale task finish; its completion is
    // from the old epoch and is dropped, so a fresh election and
    // reconcile run cleanly.
    driver.release(2);
    rig.scheduler.elected().await;
    rig.scheduler.reconcile_tasks().await.unwrap();
}

#[tokio::test]
async fn concurrent_reconcile_requests_share_one_run() {
    let driver = Arc::new(GatedReconciler::new());
    let rig = rig_with(PlanStore::open_in_memory().unwrap(), driver.clone());
    rig.scheduler.elected().await;

    // One known app whose instance reports a live task status, so a
    // full reconciliation is a (non-empty, empty) call pair.
    let app = RunSpec::new(path("/app"), 1);
    rig.store.put_root(&root_with(vec![app])).unwrap();
    let mut instance = running_instance("/app", "i1");
    instance.tasks = vec![Task {
        id: "t1".to_string(),
        status: Some(TaskStatus {
            task_id: "t1".to_string(),
            condition: Condition::Running,
        }),
    }];
    rig.tracker.upsert(instance).await;

    let mut requests = Vec::new();
    for _ in 0..3 {
        let scheduler = rig.scheduler.clone();
        requests.push(tokio::spawn(
            async move { scheduler.reconcile_tasks().await },
        ));
    }
    // Let all three reach the scheduler while the driver is gated.
    tokio::time::sleep(Duration::from_millis(100)).await;

    driver.release(2);
    for request in requests {
        request.await.unwrap().unwrap();
    }

    // Three requests, one underlying call pair.
    let calls = driver.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].len(), 1);
    assert!(calls[1].is_empty());

    // A sequential request afterwards triggers a fresh reconciliation.
    driver.release(2);
    rig.scheduler.reconcile_tasks().await.unwrap();
    assert_eq!(driver.calls().len(), 4);
}

#[tokio::test]
async fn kill_command_is_locked_out_by_active_deployment() {
    let rig = rig();
    rig.scheduler.elected().await;
    rig.tracker.set_auto_kill(false);
    rig.tracker.upsert(running_instance("/app", "i1")).await;
    rig.tracker.upsert(running_instance("/app", "i2")).await;

    let app = RunSpec::new(path("/app"), 2);
    let plan = DeploymentPlan::build(
        root_with(vec![app.clone()]),
        root_with(vec![app.with_instances(1)]),
        HashMap::new(),
    );
    let plan_id = plan.id.clone();
    let mut events = rig.events.subscribe();
    rig.scheduler.deploy(plan, false).await.unwrap();

    match rig.scheduler.kill_instances(path("/app"), Vec::new()).await {
        Err(SchedulerError::Locked(id)) => assert_eq!(id, path("/app")),
        other => panic!("expected Locked, got {other:?}"),
    }

    // Canceling the deployment releases the lock.
    rig.scheduler.cancel_deployment(&plan_id).await.unwrap();
    await_event(&mut events, |e| {
        matches!(e, SchedulerEvent::DeploymentFailed { plan_id: id, .. } if *id == plan_id)
    })
    .await;

    rig.scheduler
        .kill_instances(path("/app"), Vec::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn kill_instances_decommissions_and_waits() {
    let rig = rig();
    rig.scheduler.elected().await;
    let victim = running_instance("/app", "i1");
    rig.tracker.upsert(victim.clone()).await;

    rig.scheduler
        .kill_instances(path("/app"), vec![victim.id.clone()])
        .await
        .unwrap();

    let changes = rig.tracker.goal_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].instance, victim.id);
    assert_eq!(
        changes[0].reason,
        flotilla_core::instance::GoalReason::UserRequest
    );

    // Lock released: a follow-up command is accepted.
    rig.scheduler
        .kill_instances(path("/app"), Vec::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn background_scale_drives_spec_to_target() {
    let rig = rig();
    rig.scheduler.elected().await;
    let app = RunSpec::new(path("/app"), 2);
    rig.store.put_root(&root_with(vec![app.clone()])).unwrap();

    rig.scheduler.scale_run_spec(path("/app")).await;

    // The scale runs in the background; poll until the launches land.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rig.tracker.spec_instances(&path("/app")).await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scale never reached the target");

    assert_eq!(rig.queue.adds(), vec![(path("/app"), 2)]);
}

#[tokio::test]
async fn standby_before_election_is_ignored() {
    let rig = rig();
    rig.scheduler.standby().await;
    rig.scheduler.elected().await;

    // Still functional.
    rig.scheduler.reconcile_tasks().await.unwrap();
}
