mod common;

use common::{harness, FakeRuntime, Harness};
use shellbox::error::Error;
use shellbox::registry::WorkspaceState;
use shellbox::runtime::{RuntimeError, RuntimeErrorKind, RuntimeState};
use shellbox::workspace::CreateParams;

fn params(name: &str) -> CreateParams {
    CreateParams {
        name: Some(name.into()),
        description: None,
        image: None,
    }
}

#[tokio::test]
async fn create_lands_in_stopped_with_container() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();

    assert_eq!(ws.state, WorkspaceState::Stopped);
    assert_eq!(ws.name, "dev");
    assert!(ws.last_error.is_none());
    let container = ws.container_ref.expect("provisioned workspace has a container");
    assert_eq!(h.fake.container_state(&container), Some(RuntimeState::Created));
}

#[tokio::test]
async fn unknown_image_rejected_without_side_effects() {
    let h = harness();
    let result = h
        .orchestrator
        .create(CreateParams {
            name: Some("dev".into()),
            description: None,
            image: Some("no-such-image".into()),
        })
        .await;

    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(h.orchestrator.list().await.is_empty());
    assert_eq!(h.fake.container_count(), 0);
}

#[tokio::test]
async fn duplicate_name_rejected() {
    let h = harness();
    h.orchestrator.create(params("dev")).await.unwrap();
    let result = h.orchestrator.create(params("dev")).await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(h.orchestrator.list().await.len(), 1);
}

#[tokio::test]
async fn workspace_limit_enforced() {
    let h = common::harness_with(|c| c.limits.max_workspaces = 2);
    h.orchestrator.create(params("a")).await.unwrap();
    h.orchestrator.create(params("b")).await.unwrap();
    let result = h.orchestrator.create(params("c")).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn create_failure_lands_in_error_with_message() {
    let h = harness();
    h.fake.fail_next_create(RuntimeError::new(
        RuntimeErrorKind::ImagePull,
        "pull access denied",
    ));

    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Error);
    assert!(ws.container_ref.is_none());
    assert!(ws.last_error.as_deref().unwrap().contains("pull access denied"));
}

#[tokio::test]
async fn transient_create_failure_is_retried() {
    let h = harness();
    h.fake.fail_next_create(RuntimeError::new(
        RuntimeErrorKind::Transient,
        "engine hiccup",
    ));

    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Stopped);
    assert!(ws.container_ref.is_some());
}

#[tokio::test]
async fn start_stop_cycle() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    let container = ws.container_ref.clone().unwrap();

    let ws = h.orchestrator.start(ws.id).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Running);
    assert_eq!(h.fake.container_state(&container), Some(RuntimeState::Running));

    let ws = h.orchestrator.stop(ws.id).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Stopped);
    assert_eq!(h.fake.container_state(&container), Some(RuntimeState::Exited));
    // The record keeps its container across stop.
    assert_eq!(ws.container_ref, Some(container));
}

#[tokio::test]
async fn stop_requires_running() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    let result = h.orchestrator.stop(ws.id).await;
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn start_requires_stopped() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    h.orchestrator.start(ws.id).await.unwrap();
    let result = h.orchestrator.start(ws.id).await;
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn delete_removes_record_and_container() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    let id = ws.id;

    h.orchestrator.delete(id).await.unwrap();
    assert!(matches!(h.orchestrator.get(id).await, Err(Error::NotFound(_))));
    assert_eq!(h.fake.container_count(), 0);
}

#[tokio::test]
async fn delete_survives_already_removed_container() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    h.fake.forget(ws.container_ref.as_ref().unwrap());

    h.orchestrator.delete(ws.id).await.unwrap();
    assert!(matches!(h.orchestrator.get(ws.id).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn retry_after_create_failure_provisions() {
    let h = harness();
    h.fake
        .fail_next_create(RuntimeError::new(RuntimeErrorKind::ImagePull, "pull failed"));
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Error);

    let ws = h.orchestrator.retry(ws.id).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Stopped);
    assert!(ws.container_ref.is_some());
    assert!(ws.last_error.is_none());
}

#[tokio::test]
async fn retry_requires_error_state() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    let result = h.orchestrator.retry(ws.id).await;
    assert!(matches!(result, Err(Error::Precondition(_))));
}

/// The container reference is absent exactly while the workspace has nothing
/// provisioned: always during `creating`, never in the started states, and
/// present in `stopped` because stop keeps the container around.
fn assert_ref_invariant(ws: &shellbox::registry::Workspace) {
    match ws.state {
        WorkspaceState::Creating => assert!(
            ws.container_ref.is_none(),
            "creating workspace {} must not have a container",
            ws.name
        ),
        WorkspaceState::Stopped
        | WorkspaceState::Starting
        | WorkspaceState::Running
        | WorkspaceState::Stopping => assert!(
            ws.container_ref.is_some(),
            "workspace {} in state {} must have a container",
            ws.name,
            ws.state
        ),
        WorkspaceState::Deleting | WorkspaceState::Error => {}
    }
}

#[tokio::test]
async fn container_ref_invariant_holds_across_random_ops() {
    let h = harness();
    let mut seed: u64 = 0x2545f4914f6cdd1d;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let mut ids = Vec::new();
    for round in 0..60 {
        match next() % 6 {
            0 => {
                if next() % 4 == 0 {
                    h.fake.fail_next_create(RuntimeError::new(
                        RuntimeErrorKind::ImagePull,
                        "simulated pull failure",
                    ));
                }
                if let Ok(ws) = h
                    .orchestrator
                    .create(params(&format!("ws-{}", round)))
                    .await
                {
                    ids.push(ws.id);
                }
            }
            1 => {
                if let Some(&id) = ids.first() {
                    let _ = h.orchestrator.start(id).await;
                }
            }
            2 => {
                if let Some(&id) = ids.first() {
                    let _ = h.orchestrator.stop(id).await;
                }
            }
            3 => {
                if let Some(&id) = ids.first() {
                    let _ = h.orchestrator.retry(id).await;
                }
            }
            4 => {
                if ids.len() > 1 {
                    let id = ids.remove(0);
                    let _ = h.orchestrator.delete(id).await;
                }
            }
            _ => {}
        }

        for ws in h.orchestrator.list().await {
            assert_ref_invariant(&ws);
        }
    }
}

#[tokio::test]
async fn concurrent_transitions_on_one_workspace_serialize() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    let id = ws.id;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let orchestrator = h.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let _ = orchestrator.start(id).await;
            } else {
                let _ = orchestrator.stop(id).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(!h.fake.saw_overlap(), "engine operations must never interleave per workspace");

    // Record and engine agree on the final state.
    let ws = h.orchestrator.get(id).await.unwrap();
    let engine = h.fake.container_state(ws.container_ref.as_ref().unwrap());
    match ws.state {
        WorkspaceState::Running => assert_eq!(engine, Some(RuntimeState::Running)),
        WorkspaceState::Stopped => {
            assert!(matches!(engine, Some(RuntimeState::Created | RuntimeState::Exited)))
        }
        state => panic!("unexpected final state: {}", state),
    }
}

// ---------------------------------------------------------------------------
// Startup reconciliation
// ---------------------------------------------------------------------------

async fn restarted(h: &Harness) -> (std::sync::Arc<shellbox::workspace::Orchestrator>, std::sync::Arc<FakeRuntime>) {
    // Same registry and engine, fresh orchestrator: what a daemon restart
    // looks like to the persisted state.
    let sessions = std::sync::Arc::new(shellbox::term::PtySessionManager::new(
        h.config.clone(),
        h.registry.clone(),
        h.fake.clone(),
    ));
    let orchestrator = std::sync::Arc::new(shellbox::workspace::Orchestrator::new(
        h.config.clone(),
        h.registry.clone(),
        h.fake.clone(),
        sessions,
    ));
    (orchestrator, h.fake.clone())
}

#[tokio::test]
async fn reconcile_running_record_to_stopped() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    h.orchestrator.start(ws.id).await.unwrap();

    let (orchestrator, fake) = restarted(&h).await;
    orchestrator.reconcile().await.unwrap();

    let ws = orchestrator.get(ws.id).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Stopped);
    assert_eq!(
        fake.container_state(ws.container_ref.as_ref().unwrap()),
        Some(RuntimeState::Exited)
    );
}

#[tokio::test]
async fn reconcile_vanished_container_to_error() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    h.orchestrator.start(ws.id).await.unwrap();
    h.fake.forget(ws.container_ref.as_ref().unwrap());

    let (orchestrator, _) = restarted(&h).await;
    orchestrator.reconcile().await.unwrap();

    let ws = orchestrator.get(ws.id).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Error);
    assert!(ws.container_ref.is_none());
    assert!(ws.last_error.is_some());
}

#[tokio::test]
async fn reconcile_interrupted_create_to_error() {
    let h = harness();
    let now = chrono::Utc::now();
    let id = uuid::Uuid::new_v4();
    h.registry
        .insert(shellbox::registry::Workspace {
            id,
            name: "half-made".into(),
            description: String::new(),
            image: "ubuntu".into(),
            state: WorkspaceState::Creating,
            container_ref: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        })
        .await
        .unwrap();

    h.orchestrator.reconcile().await.unwrap();

    let ws = h.orchestrator.get(id).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Error);
    assert!(ws.last_error.is_some());
}

#[tokio::test]
async fn reconcile_finishes_interrupted_delete() {
    let h = harness();
    let ws = h.orchestrator.create(params("dev")).await.unwrap();
    let id = ws.id;
    h.registry
        .update(id, |ws| ws.state = WorkspaceState::Deleting)
        .await
        .unwrap();

    h.orchestrator.reconcile().await.unwrap();

    assert!(matches!(h.orchestrator.get(id).await, Err(Error::NotFound(_))));
    assert_eq!(h.fake.container_count(), 0);
}
