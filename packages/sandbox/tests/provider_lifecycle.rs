// ABOUTME: End-to-end sandbox lifecycle tests against a local-process backend
// ABOUTME: Covers create/destroy, concurrent creation, drift, timeouts, file sync and recovery

mod common;

use common::{factory, test_settings, LocalBackend};
use devbox_sandbox::{
    CommandStatus, CreateSandboxOptions, SandboxError, SandboxProvider, SandboxStatus,
    TIMEOUT_EXIT_CODE,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

async fn setup(backend: LocalBackend) -> (Arc<SandboxProvider>, Arc<LocalBackend>, TempDir) {
    let scratch = TempDir::new().unwrap();
    let backend = Arc::new(backend);
    let factory = factory(backend.clone(), test_settings(scratch.path()));
    let provider = factory.create(Some("docker")).await.unwrap();
    (provider, backend, scratch)
}

#[tokio::test]
async fn test_create_execute_destroy() {
    let (provider, backend, _scratch) = setup(LocalBackend::new()).await;

    let handle = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    {
        let h = handle.read().await;
        assert_eq!(h.status, SandboxStatus::Running);
        assert_eq!(h.resource_name, "devbox-p1");
        assert!(h.backend_ref.is_some());
    }
    assert!(provider.is_sandbox_active("p1").await.unwrap());

    let output = provider
        .execute_command("p1", "echo hi", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(output.status, CommandStatus::Completed);
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, "hi\n");

    assert!(provider.destroy_sandbox("p1").await.unwrap());
    assert!(!provider.is_sandbox_active("p1").await.unwrap());
    assert!(!provider.destroy_sandbox("p1").await.unwrap());
    assert_eq!(handle.read().await.status, SandboxStatus::Destroyed);
    assert_eq!(backend.provisions(), 1);
}

#[tokio::test]
async fn test_create_is_idempotent_for_running_sandbox() {
    let (provider, backend, _scratch) = setup(LocalBackend::new()).await;

    let first = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    let second = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(backend.provisions(), 1);
}

#[tokio::test]
async fn test_concurrent_creates_provision_once() {
    let (provider, backend, _scratch) =
        setup(LocalBackend::new().with_provision_delay(Duration::from_millis(200))).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let provider = provider.clone();
        tasks.push(tokio::spawn(async move {
            provider
                .create_sandbox("p1", CreateSandboxOptions::default())
                .await
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(backend.provisions(), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(provider.list_sandboxes().await.len(), 1);
}

#[tokio::test]
async fn test_failed_provision_is_retryable() {
    let (provider, backend, _scratch) = setup(LocalBackend::new()).await;
    backend.fail_provisioning(Some(SandboxError::BackendUnavailable(
        "daemon down".to_string(),
    )));

    let err = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, SandboxError::BackendUnavailable("daemon down".to_string()));
    assert!(err.is_retryable());

    let handle = provider.get_sandbox("p1").await.unwrap().unwrap();
    assert_eq!(handle.read().await.status, SandboxStatus::Unreachable);

    backend.fail_provisioning(None);
    let handle = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    assert!(handle.read().await.is_running());
    assert_eq!(backend.provisions(), 2);
}

#[tokio::test]
async fn test_vanished_resource_is_detected_and_evicted() {
    let (provider, backend, _scratch) = setup(LocalBackend::new()).await;
    let handle = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    backend.vanish("devbox-p1");

    assert!(!provider.is_sandbox_active("p1").await.unwrap());
    assert_eq!(handle.read().await.status, SandboxStatus::Destroyed);
    assert!(provider.get_sandbox("p1").await.unwrap().is_none());

    // The next create provisions a fresh resource
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    assert_eq!(backend.provisions(), 2);
}

#[tokio::test]
async fn test_stopped_resource_is_restarted_by_create() {
    let (provider, backend, _scratch) = setup(LocalBackend::new()).await;
    let handle = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    backend.stop_out_of_band("devbox-p1");
    assert!(!provider.is_sandbox_active("p1").await.unwrap());
    assert_eq!(handle.read().await.status, SandboxStatus::Stopped);

    let restarted = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&handle, &restarted));
    assert!(restarted.read().await.is_running());
    assert!(provider.is_sandbox_active("p1").await.unwrap());
}

#[tokio::test]
async fn test_unknown_sandbox_operations() {
    let (provider, _backend, _scratch) = setup(LocalBackend::new()).await;

    assert!(!provider.is_sandbox_active("ghost").await.unwrap());
    assert!(provider.get_sandbox_info("ghost").await.unwrap().is_none());
    assert!(!provider.destroy_sandbox("ghost").await.unwrap());
    assert!(matches!(
        provider
            .execute_command("ghost", "true", Duration::from_secs(1))
            .await,
        Err(SandboxError::SandboxNotFound(_))
    ));
    assert!(matches!(
        provider.sync_files_to_vm("ghost", &[]).await,
        Err(SandboxError::SandboxNotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_project_id_is_rejected() {
    let (provider, backend, _scratch) = setup(LocalBackend::new()).await;

    let err = provider
        .create_sandbox("../escape", CreateSandboxOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Configuration(_)));
    assert_eq!(backend.provisions(), 0);
}

#[tokio::test]
async fn test_command_exit_code_and_stderr() {
    let (provider, _backend, _scratch) = setup(LocalBackend::new()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    let output = provider
        .execute_command("p1", "echo oops >&2; exit 7", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(output.status, CommandStatus::Completed);
    assert_eq!(output.exit_code, 7);
    assert_eq!(output.stderr, "oops\n");
    assert!(!output.success());
}

#[tokio::test]
async fn test_timeout_kills_command_and_keeps_partial_output() {
    let (provider, _backend, scratch) = setup(LocalBackend::new()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let output = provider
        .execute_command("p1", "echo start; sleep 30", Duration::from_secs(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(output.status, CommandStatus::TimedOut);
    assert!(output.timed_out());
    assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(output.stdout, "start\n");
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);

    // The wrapper's pid file is gone once the group was killed
    let leftovers: Vec<_> = std::fs::read_dir(scratch.path().join("run"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("exec-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_serialized_backend_runs_one_command_at_a_time() {
    let (provider, _backend, _scratch) = setup(LocalBackend::new().serialized()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let (a, b) = tokio::join!(
        provider.execute_command("p1", "sleep 0.4", Duration::from_secs(5)),
        provider.execute_command("p1", "sleep 0.4", Duration::from_secs(5)),
    );
    assert!(a.unwrap().success());
    assert!(b.unwrap().success());
    assert!(started.elapsed() >= Duration::from_millis(800));
}

#[tokio::test]
async fn test_queued_command_times_out_while_waiting_for_its_turn() {
    let (provider, _backend, _scratch) = setup(LocalBackend::new().serialized()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    let busy = {
        let provider = provider.clone();
        tokio::spawn(async move {
            provider
                .execute_command("p1", "sleep 3", Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let queued = provider
        .execute_command("p1", "echo hi", Duration::from_secs(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(queued.status, CommandStatus::TimedOut);
    assert_eq!(queued.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(queued.stdout, "");
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);

    assert!(busy.await.unwrap().unwrap().success());
}

#[tokio::test]
async fn test_timed_out_command_keeps_lane_until_killed() {
    let (provider, _backend, scratch) = setup(LocalBackend::new().serialized()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    let log = scratch.path().join("order.log");

    let slow = format!(
        "trap 'echo slow-end >> {log}; exit 0' TERM; echo slow-start >> {log}; sleep 5 & wait",
        log = log.display()
    );
    let next = format!("echo next >> {}", log.display());
    let (timed_out, followed) = tokio::join!(
        provider.execute_command("p1", &slow, Duration::from_millis(500)),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            provider
                .execute_command("p1", &next, Duration::from_secs(10))
                .await
        }
    );

    assert_eq!(timed_out.unwrap().status, CommandStatus::TimedOut);
    assert!(followed.unwrap().success());
    assert_eq!(
        std::fs::read_to_string(&log).unwrap(),
        "slow-start\nslow-end\nnext\n"
    );
}

#[tokio::test]
async fn test_provision_timeout_leaves_handle_unreachable_and_retryable() {
    let scratch = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new().with_provision_delay(Duration::from_secs(2)));
    let mut settings = test_settings(scratch.path());
    settings.provision_timeout = Duration::from_millis(200);
    let provider = factory(backend.clone(), settings)
        .create(Some("docker"))
        .await
        .unwrap();

    let err = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, SandboxError::ProvisioningTimeout { ref project_id, .. } if project_id == "p1"),
        "unexpected error: {:?}",
        err
    );
    assert!(err.is_retryable());

    let handle = provider.get_sandbox("p1").await.unwrap().unwrap();
    {
        let h = handle.read().await;
        assert_eq!(h.status, SandboxStatus::Unreachable);
        assert!(h.last_error.is_some());
    }

    backend.set_provision_delay(Duration::ZERO);
    let retried = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&handle, &retried));
    assert!(retried.read().await.is_running());
    assert!(provider.is_sandbox_active("p1").await.unwrap());
}

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn test_sync_files_copies_tree_into_workspace() {
    let (provider, backend, _scratch) = setup(LocalBackend::new()).await;
    let handle = provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();
    let backend_ref = handle.read().await.backend_ref.clone().unwrap();

    let workspace = backend.filesystem(&backend_ref).join("workspace");
    write(&workspace.join("keep.txt"), "already there");

    let local = TempDir::new().unwrap();
    let project = local.path().join("project");
    write(&project.join("src/main.rs"), "fn main() {}\n");
    write(&project.join("README.md"), "# demo\n");
    write(&project.join(".git/HEAD"), "ref: refs/heads/main\n");

    let report = provider
        .sync_files_to_vm("p1", &[project.clone()])
        .await
        .unwrap();
    assert_eq!(report.files, 2);
    assert_eq!(report.skipped, 1);

    assert_eq!(
        std::fs::read_to_string(workspace.join("src/main.rs")).unwrap(),
        "fn main() {}\n"
    );
    assert!(workspace.join("README.md").exists());
    assert!(!workspace.join(".git").exists());
    // Sync only adds and overwrites
    assert_eq!(
        std::fs::read_to_string(workspace.join("keep.txt")).unwrap(),
        "already there"
    );
}

#[tokio::test]
async fn test_sync_missing_local_path_fails() {
    let (provider, _backend, _scratch) = setup(LocalBackend::new()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    let err = provider
        .sync_files_to_vm("p1", &["/definitely/not/here".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::FileSync(_)));
}

#[tokio::test]
async fn test_recover_adopts_surviving_resources() {
    let backend = LocalBackend::new();
    backend.seed("p1", "devbox-p1");
    backend.seed("p2", "devbox-p2");
    // Not named after its project; left alone
    backend.seed("p3", "someone-else");
    let (provider, backend, _scratch) = setup(backend).await;

    let mut recovered = provider.recover().await.unwrap();
    recovered.sort();
    assert_eq!(recovered, vec!["p1".to_string(), "p2".to_string()]);

    let output = provider
        .execute_command("p2", "echo adopted", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(output.stdout, "adopted\n");

    // A second pass finds nothing new, and nothing was provisioned
    assert!(provider.recover().await.unwrap().is_empty());
    assert_eq!(backend.provisions(), 0);
}

#[tokio::test]
async fn test_untracked_resource_is_adopted_on_query_and_destroyed() {
    let backend = LocalBackend::new();
    backend.seed("p1", "devbox-p1");
    let (provider, backend, _scratch) = setup(backend).await;

    assert!(provider.is_sandbox_active("p1").await.unwrap());
    assert!(provider.get_sandbox("p1").await.unwrap().is_some());

    assert!(provider.destroy_sandbox("p1").await.unwrap());
    assert!(backend.list_managed_names().is_empty());
}

#[tokio::test]
async fn test_sandbox_info_reports_backend_state() {
    let (provider, _backend, _scratch) = setup(LocalBackend::new()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    let info = provider.get_sandbox_info("p1").await.unwrap().unwrap();
    assert_eq!(info.project_id, "p1");
    assert_eq!(info.name, "devbox-p1");
    assert!(info.running);
    assert_eq!(info.state, "running");
    assert!(info.usage.is_none());
}

#[tokio::test]
async fn test_idle_sandboxes() {
    let (provider, _backend, _scratch) = setup(LocalBackend::new()).await;
    provider
        .create_sandbox("p1", CreateSandboxOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        provider.idle_sandboxes(Duration::from_millis(1)).await,
        vec!["p1".to_string()]
    );
    assert!(provider
        .idle_sandboxes(Duration::from_secs(3600))
        .await
        .is_empty());
}
