//! Debug session lifecycle with `/bin/sh` standing in for the debugger.
#![cfg(unix)]

use std::{path::PathBuf, sync::Arc, time::Duration};
use xcbridge::{
    AttachRequest, DebugSessionManager, ErrorKind, ProcessExecutor, ResourceLockRegistry,
    config::{DebuggerConfig, ExecutorConfig},
    resource_lock::resource_key,
    utils::logging::init_test_logging,
};

fn fake_debugger_config() -> DebuggerConfig {
    DebuggerConfig {
        executable: PathBuf::from("/bin/sh"),
        args: Vec::new(),
        attach_preamble: Vec::new(),
        attach_pid_command: "echo attached {pid}".into(),
        attach_bundle_command: "echo attached {bundle_id}".into(),
        boundary_command: "echo {marker}".into(),
        detach_commands: vec!["exit".into()],
        attach_timeout_seconds: 5,
        command_timeout_seconds: 5,
        verify_local_pid: true,
    }
}

fn manager() -> (DebugSessionManager, Arc<ResourceLockRegistry>) {
    init_test_logging();
    let executor = Arc::new(ProcessExecutor::new(ExecutorConfig {
        termination_grace_ms: 300,
        ..ExecutorConfig::default()
    }));
    let locks = Arc::new(ResourceLockRegistry::new());
    (
        DebugSessionManager::new(executor, Arc::clone(&locks), fake_debugger_config()),
        locks,
    )
}

fn own_pid_request(lock_key: Option<String>) -> AttachRequest {
    AttachRequest {
        device_id: "SIM-TEST".into(),
        pid: Some(std::process::id()),
        bundle_id: None,
        lock_key,
        owner: "debug_session_test".into(),
    }
}

#[tokio::test]
async fn test_attach_send_detach() {
    let (manager, locks) = manager();
    let key = resource_key::debugger(std::process::id());
    let id = manager.attach(own_pid_request(Some(key.clone()))).await.unwrap();
    assert!(id.starts_with("dbg_"));
    assert!(locks.is_held(&key));

    let reply = manager
        .send_command(&id, "echo frame-0", None, false)
        .await
        .unwrap();
    assert_eq!(reply.output, "frame-0");
    assert!(!reply.bypassed_denylist);

    let summary = manager.detach(&id).await.unwrap();
    assert!(summary.released_lock);
    assert!(!locks.is_held(&key));

    let err = manager.detach(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_denylisted_command_is_refused_without_override() {
    let (manager, _) = manager();
    let id = manager.attach(own_pid_request(None)).await.unwrap();

    let err = manager
        .send_command(&id, "process kill", None, false)
        .await
        .unwrap_err();
    assert!(err.is_denied());
    assert_eq!(err.kind(), ErrorKind::CommandFailed);
    assert!(err.to_string().contains("detach"));

    // The session is untouched by the refusal.
    let reply = manager.send_command(&id, "echo still-here", None, false).await.unwrap();
    assert_eq!(reply.output, "still-here");
    manager.detach(&id).await.unwrap();
}

#[tokio::test]
async fn test_unsafe_override_runs_and_flags_output() {
    let (manager, _) = manager();
    let id = manager.attach(own_pid_request(None)).await.unwrap();

    let reply = manager
        .send_command(&id, "kill -0 $$ && echo alive", None, true)
        .await
        .unwrap();
    assert!(reply.bypassed_denylist);
    assert_eq!(reply.output, "alive");
    manager.detach(&id).await.unwrap();
}

#[tokio::test]
async fn test_command_timeout_keeps_session_usable() {
    let (manager, _) = manager();
    let id = manager.attach(own_pid_request(None)).await.unwrap();

    let err = manager
        .send_command(&id, "sleep 1; echo late", Some(Duration::from_millis(200)), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommandFailed);

    let reply = manager
        .send_command(&id, "echo next", Some(Duration::from_secs(5)), false)
        .await
        .unwrap();
    assert_eq!(reply.output, "next");
    manager.detach(&id).await.unwrap();
}

#[tokio::test]
async fn test_repeated_timeouts_never_leak_into_later_replies() {
    let (manager, _) = manager();
    let id = manager.attach(own_pid_request(None)).await.unwrap();

    for script in ["sleep 1; echo first-late", "sleep 1; echo second-late"] {
        let err = manager
            .send_command(&id, script, Some(Duration::from_millis(100)), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
    }

    let reply = manager
        .send_command(&id, "echo fresh", Some(Duration::from_secs(5)), false)
        .await
        .unwrap();
    assert_eq!(reply.output, "fresh");

    // The tail has been consumed; an ordinary command is unaffected.
    let reply = manager.send_command(&id, "echo again", None, false).await.unwrap();
    assert_eq!(reply.output, "again");
    manager.detach(&id).await.unwrap();
}

#[tokio::test]
async fn test_debugger_exit_tears_down_session_and_lock() {
    let (manager, locks) = manager();
    let id = manager
        .attach(own_pid_request(Some("lldb:exit-test".into())))
        .await
        .unwrap();

    let err = manager.send_command(&id, "exit 0", None, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommandFailed);
    assert!(!locks.is_held("lldb:exit-test"));

    let err = manager.send_command(&id, "echo gone", None, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_second_attach_on_same_key_is_busy() {
    let (manager, _) = manager();
    let key = "lldb:busy-test".to_string();
    let first = manager.attach(own_pid_request(Some(key.clone()))).await.unwrap();

    let err = manager.attach(own_pid_request(Some(key))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceBusy);
    assert_eq!(manager.registry().ids().await, [first.clone()]);
    manager.detach(&first).await.unwrap();
}

#[tokio::test]
async fn test_dead_pid_is_stale() {
    let (manager, _) = manager();
    let mut child = tokio::process::Command::new("/bin/sh")
        .args(["-c", "exit 0"])
        .spawn()
        .unwrap();
    let pid = child.id().unwrap();
    child.wait().await.unwrap();

    let err = manager
        .attach(AttachRequest {
            pid: Some(pid),
            ..own_pid_request(None)
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleDefault);
}

#[tokio::test]
async fn test_attach_requires_a_target() {
    let (manager, _) = manager();
    let err = manager
        .attach(AttachRequest {
            device_id: "SIM-TEST".into(),
            ..AttachRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_attach_by_bundle_id() {
    let (manager, _) = manager();
    let id = manager
        .attach(AttachRequest {
            device_id: "SIM-TEST".into(),
            bundle_id: Some("com.example.Demo".into()),
            owner: "test".into(),
            ..AttachRequest::default()
        })
        .await
        .unwrap();
    let summaries = manager.registry().summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].target.bundle_id.as_deref(), Some("com.example.Demo"));
    assert_eq!(manager.shutdown().await, 1);
    assert!(manager.registry().get(&id).await.is_err());
}
