//! End-to-end scheduling scenarios against simulated devices.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use labman_core::{
    DeviceStatus, ExperimentSpec, LabConfig, PositionId, PositionStatus, Task, TaskFilter, TaskStatus,
};
use labman_execution::{GraphError, Lab, LabError};
use labman_rpc::SimulatedDevice;
use labman_storage::{JsonStorage, Storage};
use labman_work::{builtin_task_types, TaskContext, TaskError, TaskLogic, TaskTypeRegistry};

const SIM_LAB: &str = r#"
    [general]
    name = "scenario"
    sim_mode = true

    [[devices]]
    name = "d1"
    type = "robot"
    methods = ["pick"]

    [[positions]]
    name = "p1"

    [scheduler]
    tick_ms = 5
"#;

struct Hold;

#[async_trait]
impl TaskLogic for Hold {
    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
        loop {
            ctx.checkpoint().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn task_types() -> TaskTypeRegistry {
    builtin_task_types().with("hold", |_| Ok(Box::new(Hold)))
}

fn spec(json: serde_json::Value) -> ExperimentSpec {
    serde_json::from_value(json).unwrap()
}

fn by_key(lab: &Lab, tasks: &[labman_core::TaskId]) -> Vec<Task> {
    tasks.iter().map(|id| lab.task(*id).unwrap()).collect()
}

#[tokio::test]
async fn linear_chain_shares_device_and_position() {
    let config = LabConfig::from_toml(SIM_LAB).unwrap();
    let (lab, mut scheduler) = Lab::with_storage(config, task_types(), None).unwrap();

    let id = lab
        .admit_experiment(spec(serde_json::json!({
            "name": "chain",
            "tasks": [
                {
                    "key": "t1",
                    "task_type": "sequence",
                    "resources": {"devices": [{"selector": {"name": "d1"}}]},
                    "parameters": {"steps": [{"op": "call", "device": "d1", "method": "pick"}]}
                },
                {
                    "key": "t2",
                    "task_type": "sequence",
                    "after": ["t1"],
                    "resources": {
                        "devices": [{"selector": {"name": "d1"}}],
                        "positions": [{"prefix": "p1"}]
                    },
                    "parameters": {"steps": [
                        {"op": "call", "device": "d1", "method": "pick"},
                        {"op": "sleep", "ms": 10}
                    ]}
                },
                {
                    "key": "t3",
                    "task_type": "sequence",
                    "after": ["t2"],
                    "resources": {"positions": [{"prefix": "p1"}]},
                    "parameters": {"steps": [{"op": "sleep", "ms": 5}]}
                }
            ]
        })))
        .await
        .unwrap();

    let stats = scheduler.run_until_idle(Duration::from_secs(10)).await.unwrap();
    assert_eq!(stats.completed, 3);

    let experiment = lab.experiment(id).unwrap();
    let tasks = by_key(&lab, &experiment.tasks);
    for pair in tasks.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        assert!(after.started_at.unwrap() >= before.completed_at.unwrap());
    }

    let d1 = lab.registry().device("d1").unwrap();
    assert_eq!(d1.status, DeviceStatus::Idle);
    assert!(d1.owner.is_none());
    let p1 = lab.registry().position(&"p1/1".parse::<PositionId>().unwrap()).unwrap();
    assert_eq!(p1.status(), PositionStatus::Empty);
    assert_eq!(lab.registry().active_locks(), 0);
}

#[tokio::test]
async fn rpc_timeout_fails_task_and_releases_lock() {
    let config = LabConfig::from_toml(
        r#"
        [general]
        name = "slowlab"

        [[devices]]
        name = "slow"
        type = "pump"
        methods = ["drain"]

        [scheduler]
        tick_ms = 5

        [rpc]
        default_timeout_ms = 100
        "#,
    )
    .unwrap();
    let (lab, mut scheduler) = Lab::with_storage(config, task_types(), None).unwrap();
    lab.host_device(Arc::new(SimulatedDevice::new("slow", vec!["drain".into()]).hanging("drain")))
        .unwrap();

    let id = lab
        .admit_experiment(spec(serde_json::json!({
            "name": "drain",
            "tasks": [
                {
                    "key": "drain",
                    "task_type": "sequence",
                    "resources": {"devices": [{"selector": {"type": "pump"}}]},
                    "parameters": {"steps": [{"op": "call", "device": "type:pump", "method": "drain"}]}
                },
                {"key": "after", "task_type": "noop", "after": ["drain"]}
            ]
        })))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    scheduler.run_until_idle(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    let experiment = lab.experiment(id).unwrap();
    let tasks = by_key(&lab, &experiment.tasks);
    assert_eq!(tasks[0].status, TaskStatus::Error);
    assert!(tasks[0].message.contains("timed out"), "message: {}", tasks[0].message);
    assert_eq!(tasks[1].status, TaskStatus::Error);
    assert!(tasks[1].started_at.is_none());

    let slow = lab.registry().device("slow").unwrap();
    assert!(slow.owner.is_none());
    assert_eq!(slow.status, DeviceStatus::Idle);
    assert_eq!(lab.registry().active_locks(), 0);
}

#[tokio::test]
async fn cancel_while_requesting_never_grants() {
    let config = LabConfig::from_toml(SIM_LAB).unwrap();
    let (lab, mut scheduler) = Lab::with_storage(config, task_types(), None).unwrap();
    let handle = lab.scheduler().clone();

    let request = labman_core::ResourceRequest::new().with_device("d1");
    let holder = Task::new("hold").with_resources(request.clone());
    let waiter = Task::new("noop").with_resources(request);
    handle.admit(vec![holder.clone(), waiter.clone()]).unwrap();

    scheduler.tick().await;
    assert_eq!(lab.task(holder.id).unwrap().status, TaskStatus::Running);
    assert_eq!(lab.task(waiter.id).unwrap().status, TaskStatus::RequestingResources);

    lab.cancel_task(waiter.id).unwrap();
    assert_eq!(lab.task(waiter.id).unwrap().status, TaskStatus::Cancelled);

    // the device frees up right after
    lab.cancel_task(holder.id).unwrap();
    scheduler.run_until_idle(Duration::from_secs(5)).await.unwrap();

    let waiter = lab.task(waiter.id).unwrap();
    assert_eq!(waiter.status, TaskStatus::Cancelled);
    assert!(waiter.started_at.is_none());
    assert!(lab.registry().devices_owned_by(waiter.id).is_empty());
    assert!(lab.registry().device("d1").unwrap().owner.is_none());
}

#[tokio::test]
async fn device_failure_cascades_error() {
    let config = LabConfig::from_toml(
        r#"
        [[devices]]
        name = "arm"
        type = "robot"
        methods = ["grip"]

        [scheduler]
        tick_ms = 5
        "#,
    )
    .unwrap();
    let (lab, mut scheduler) = Lab::with_storage(config, task_types(), None).unwrap();
    lab.host_device(Arc::new(SimulatedDevice::new("arm", vec!["grip".into()]).failing("grip")))
        .unwrap();

    let id = lab
        .admit_experiment(spec(serde_json::json!({
            "name": "grip",
            "tasks": [
                {
                    "key": "grip",
                    "task_type": "sequence",
                    "resources": {"devices": [{"selector": {"name": "arm"}}]},
                    "parameters": {"steps": [{"op": "call", "device": "arm", "method": "grip"}]}
                },
                {"key": "next", "task_type": "noop", "after": ["grip"]},
                {"key": "last", "task_type": "noop", "after": ["next"]},
                {"key": "free", "task_type": "noop"}
            ]
        })))
        .await
        .unwrap();

    scheduler.run_until_idle(Duration::from_secs(5)).await.unwrap();
    let experiment = lab.experiment(id).unwrap();
    let statuses: Vec<TaskStatus> = by_key(&lab, &experiment.tasks).iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Error, TaskStatus::Error, TaskStatus::Error, TaskStatus::Completed]
    );
    assert_eq!(experiment.status, labman_core::ExperimentStatus::Error);
}

#[tokio::test]
async fn cyclic_experiment_is_rejected() {
    let config = LabConfig::from_toml(SIM_LAB).unwrap();
    let (lab, _scheduler) = Lab::with_storage(config, task_types(), None).unwrap();

    let result = lab
        .admit_experiment(spec(serde_json::json!({
            "name": "loop",
            "tasks": [
                {"key": "a", "task_type": "noop", "after": ["c"]},
                {"key": "b", "task_type": "noop", "after": ["a"]},
                {"key": "c", "task_type": "noop", "after": ["b"]}
            ]
        })))
        .await;

    match result {
        Err(LabError::Graph(GraphError::CycleDetected(cycle))) => assert_eq!(cycle.len(), 3),
        other => panic!("expected a cycle, got {:?}", other.map(|_| ())),
    }
    assert!(lab.tasks(&TaskFilter::default()).is_empty());
}

#[tokio::test]
async fn reroute_inserts_task_before_pending_successors() {
    let config = LabConfig::from_toml(SIM_LAB).unwrap();
    let (lab, mut scheduler) = Lab::with_storage(config, task_types(), None).unwrap();

    let id = lab
        .admit_experiment(spec(serde_json::json!({
            "name": "reroute",
            "tasks": [
                {"key": "measure", "task_type": "noop"},
                {"key": "report", "task_type": "noop", "after": ["measure"]}
            ]
        })))
        .await
        .unwrap();
    let experiment = lab.experiment(id).unwrap();
    let (measure, report) = (experiment.tasks[0], experiment.tasks[1]);

    let recalibrate = lab.reroute(measure, Task::new("noop")).unwrap();
    assert_eq!(lab.task(report).unwrap().predecessors, vec![recalibrate]);
    assert!(matches!(
        lab.reroute(measure, Task::new("teleport")),
        Err(LabError::UnknownTaskType { .. })
    ));

    scheduler.run_until_idle(Duration::from_secs(5)).await.unwrap();
    let recalibrate = lab.task(recalibrate).unwrap();
    let report = lab.task(report).unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert!(report.started_at.unwrap() >= recalibrate.completed_at.unwrap());
}

#[tokio::test]
async fn json_store_keeps_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LabConfig::from_toml(SIM_LAB).unwrap();
    config.storage.root = Some(dir.path().to_path_buf());
    let (lab, scheduler) = Lab::new(config, task_types()).await.unwrap();
    lab.start(scheduler);

    let id = lab
        .admit_experiment(spec(serde_json::json!({
            "name": "stored",
            "samples": [{"name": "s1", "position": "p1/1"}],
            "tasks": [{
                "key": "pick",
                "task_type": "sequence",
                "samples": ["s1"],
                "resources": {"devices": [{"selector": {"name": "d1"}}]},
                "parameters": {"steps": [{"op": "call", "device": "d1", "method": "pick"}]}
            }]
        })))
        .await
        .unwrap();

    for _ in 0..200 {
        if lab.experiment(id).map(|e| e.completed_at.is_some()).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    lab.shutdown().await;

    let store = JsonStorage::new(dir.path()).await.unwrap();
    let experiment = store.load_experiment(id).await.unwrap().unwrap();
    assert_eq!(experiment.status, labman_core::ExperimentStatus::Completed);
    let task = store.load_task(experiment.tasks[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(store.list_samples().await.unwrap().len(), 1);
}

#[tokio::test]
async fn shutdown_stops_running_tasks() {
    let config = LabConfig::from_toml(SIM_LAB).unwrap();
    let (lab, scheduler) = Lab::with_storage(config, task_types(), None).unwrap();
    lab.start(scheduler);

    let hold = Task::new("hold").with_resources(labman_core::ResourceRequest::new().with_device("d1"));
    lab.scheduler().admit(vec![hold.clone()]).unwrap();
    for _ in 0..200 {
        if lab.task(hold.id).unwrap().status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    lab.shutdown().await;

    assert_eq!(lab.task(hold.id).unwrap().status, TaskStatus::Stopped);
    assert!(lab.registry().device("d1").unwrap().owner.is_none());
}
