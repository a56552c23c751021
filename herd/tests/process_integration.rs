//! End-to-end supervision of real `/bin/sh` workers.

use std::sync::Arc;
use std::time::Duration;

use herd::{
    CommandLauncher, HerdError, LifecycleEvent, LifecyclePayload, Readiness, Supervisor,
    SupervisorConfig, WorkerCommand, WorkerId,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Prints the ready token and exits promptly on SIGTERM.
const WELL_BEHAVED: &str = "trap 'exit 0' TERM; echo READY; while true; do sleep 0.05; done";

/// Prints the ready token and ignores SIGTERM.
const STUBBORN: &str = "trap '' TERM; echo READY; while true; do sleep 0.05; done";

fn sh_config(script: &str, workers: usize) -> SupervisorConfig {
    SupervisorConfig::new(WorkerCommand::new("/bin/sh").args(["-c", script]))
        .with_workers(workers)
        .with_grace_period(Duration::from_secs(30))
}

fn supervisor(config: SupervisorConfig) -> Supervisor<CommandLauncher> {
    let launcher = Arc::new(CommandLauncher::from_config(&config).unwrap());
    Supervisor::new(config, launcher)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<LifecycleEvent>, mut pred: F) -> LifecycleEvent
where
    F: FnMut(&LifecyclePayload) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event.payload) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("lifecycle bus closed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for lifecycle event")
}

async fn wait_ready(rx: &mut broadcast::Receiver<LifecycleEvent>, count: usize) -> Vec<WorkerId> {
    let mut ready = Vec::new();
    while ready.len() < count {
        let event = wait_for(rx, |p| matches!(p, LifecyclePayload::Ready { .. })).await;
        if let LifecyclePayload::Ready { id } = event.payload {
            ready.push(id);
        }
    }
    ready
}

#[tokio::test]
async fn sh_workers_roll_and_shut_down() {
    let mut sup = supervisor(sh_config(WELL_BEHAVED, 2));
    let mut rx = sup.subscribe();
    let handle = sup.handle();
    sup.start().await.unwrap();

    let task = tokio::spawn(async move {
        let result = sup.run().await;
        (sup, result)
    });

    let mut ready = wait_ready(&mut rx, 2).await;
    ready.sort();
    assert_eq!(ready, vec![WorkerId(1), WorkerId(2)]);

    handle.reload().unwrap();
    wait_for(&mut rx, |p| matches!(p, LifecyclePayload::RollingRestartCompleted)).await;

    handle.shutdown().unwrap();
    let (sup, result) = timeout(WAIT, task).await.expect("run did not return").unwrap();
    result.unwrap();
    assert!(sup.workers().is_empty());
}

#[tokio::test]
async fn stubborn_workers_are_killed_after_grace() {
    let config = sh_config(STUBBORN, 2).with_grace_period(Duration::from_millis(300));
    let mut sup = supervisor(config);
    let mut rx = sup.subscribe();
    let handle = sup.handle();
    sup.start().await.unwrap();

    let task = tokio::spawn(async move {
        let result = sup.run().await;
        (sup, result)
    });
    wait_ready(&mut rx, 2).await;

    handle.shutdown().unwrap();
    let mut killed = Vec::new();
    while killed.len() < 2 {
        let event = wait_for(&mut rx, |p| matches!(p, LifecyclePayload::ForceKilled { .. })).await;
        if let LifecyclePayload::ForceKilled { id, .. } = event.payload {
            killed.push(id);
        }
    }
    killed.sort();
    assert_eq!(killed, vec![WorkerId(1), WorkerId(2)]);

    let (_, result) = timeout(WAIT, task).await.expect("run did not return").unwrap();
    result.unwrap();
}

#[tokio::test]
async fn crashed_worker_is_replaced() {
    let script = "echo READY; if [ \"$HERD_WORKER_ID\" = 1 ]; then exit 3; fi; \
                  trap 'exit 0' TERM; while true; do sleep 0.05; done";
    let mut sup = supervisor(sh_config(script, 2));
    let mut rx = sup.subscribe();
    let handle = sup.handle();
    sup.start().await.unwrap();

    let task = tokio::spawn(async move {
        let result = sup.run().await;
        (sup, result)
    });

    let exited = wait_for(&mut rx, |p| matches!(p, LifecyclePayload::Exited { .. })).await;
    match exited.payload {
        LifecyclePayload::Exited { id, reason, .. } => {
            assert_eq!(id, WorkerId(1));
            assert_eq!(reason, herd::ExitReason::Code(3));
        }
        other => panic!("unexpected payload {other:?}"),
    }
    wait_for(&mut rx, |p| {
        matches!(p, LifecyclePayload::Spawned { id, .. } if *id == WorkerId(3))
    })
    .await;

    handle.shutdown().unwrap();
    let (_, result) = timeout(WAIT, task).await.expect("run did not return").unwrap();
    result.unwrap();
}

#[tokio::test]
async fn spawned_readiness_needs_no_token() {
    let config = sh_config("trap 'exit 0' TERM; while true; do sleep 0.05; done", 1)
        .with_readiness(Readiness::Spawned);
    let mut sup = supervisor(config);
    let mut rx = sup.subscribe();
    sup.start().await.unwrap();

    sup.step().await.unwrap();
    wait_for(&mut rx, |p| matches!(p, LifecyclePayload::Ready { .. })).await;

    sup.handle().shutdown().unwrap();
    timeout(WAIT, sup.run()).await.expect("run did not return").unwrap();
}

#[tokio::test]
async fn missing_program_fails_startup() {
    let config = SupervisorConfig::new(WorkerCommand::new("/nonexistent/herd-test-worker"));
    let mut sup = supervisor(config);
    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, HerdError::NoCapacity { target: 2, .. }));
}
