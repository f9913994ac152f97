use std::path::Path;
use std::sync::Arc;

use common::ActionRequest;
use common::config::{HelperConfig, ToolConfig};
use rkm_helper::exec::ProcessRunner;
use rkm_helper::orchestrator::MountOrchestrator;

/// Shell snippets standing in for umount and ntfs-3g, logging to `log`.
fn config(root: &Path, log: &Path, unmount: &str, mount: &str) -> HelperConfig {
    let log = log.display();
    let unmount_script = format!("echo unmount {{device}} >> {log}; {unmount}");
    let mount_script =
        format!("test -d {{mountpoint}} && echo mount {{device}} {{volume}} >> {log}; {mount}");
    HelperConfig {
        volumes_root: root.join("media"),
        step_timeout_secs: 1,
        unmount: ToolConfig::new("/bin/sh", &["-c", unmount_script.as_str()]),
        mount: ToolConfig::new("/bin/sh", &["-c", mount_script.as_str()]),
        ..HelperConfig::default()
    }
}

fn read_log(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_steps_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("steps.log");
    let orchestrator = MountOrchestrator::new(
        config(dir.path(), &log, "exit 0", "exit 0"),
        Arc::new(ProcessRunner),
    );

    let result = orchestrator
        .remount_read_write(&ActionRequest::new("/dev/sdb1", "Backup"))
        .await;
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(
        read_log(&log),
        vec!["unmount /dev/sdb1", "mount /dev/sdb1 Backup"]
    );
}

#[tokio::test]
async fn test_failed_unmount_stops_the_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("steps.log");
    let orchestrator = MountOrchestrator::new(
        config(dir.path(), &log, "exit 1", "exit 0"),
        Arc::new(ProcessRunner),
    );

    let result = orchestrator
        .remount_read_write(&ActionRequest::new("/dev/sdb1", "Backup"))
        .await;
    assert_eq!(
        result.error_message.as_deref(),
        Some("Failed to unmount /dev/sdb1")
    );
    assert_eq!(read_log(&log), vec!["unmount /dev/sdb1"]);
    assert!(!dir.path().join("media").join("Backup").exists());
}

#[tokio::test]
async fn test_mount_exit_code_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("steps.log");
    let orchestrator = MountOrchestrator::new(
        config(dir.path(), &log, "exit 0", "exit 21"),
        Arc::new(ProcessRunner),
    );

    let result = orchestrator
        .remount_read_write(&ActionRequest::new("/dev/sdb1", "Backup"))
        .await;
    assert!(!result.success);
    assert_eq!(result.error_message.as_deref(), Some("sh failed with status 21"));
}

#[tokio::test]
async fn test_hanging_mount_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("steps.log");
    let orchestrator = MountOrchestrator::new(
        config(dir.path(), &log, "exit 0", "sleep 30"),
        Arc::new(ProcessRunner),
    );

    let started = std::time::Instant::now();
    let result = orchestrator
        .remount_read_write(&ActionRequest::new("/dev/sdb1", "Backup"))
        .await;
    assert_eq!(result.error_message.as_deref(), Some("sh timed out after 1s"));
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
}

#[tokio::test]
async fn test_missing_mount_tool() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("steps.log");
    let mut config = config(dir.path(), &log, "exit 0", "exit 0");
    config.mount = ToolConfig::new("/nonexistent/ntfs-3g", &["{device}", "{mountpoint}"]);
    let orchestrator = MountOrchestrator::new(config, Arc::new(ProcessRunner));

    let result = orchestrator
        .remount_read_write(&ActionRequest::new("/dev/sdb1", "Backup"))
        .await;
    let message = result.error_message.unwrap();
    assert!(
        message.starts_with("Execution error: failed to launch /nonexistent/ntfs-3g"),
        "{message}"
    );
}
