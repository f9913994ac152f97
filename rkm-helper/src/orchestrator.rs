//! The unmount, prepare mountpoint, mount sequence.
//!
//! Steps of one request run strictly in order, each to completion. Requests
//! for the same device node are serialized; different devices proceed in
//! parallel. Every failure becomes an unsuccessful [`ActionResult`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::config::{HelperConfig, MountpointFailure, ToolVars};
use common::{ActionRequest, ActionResult};
use tracing::{info, warn};

use crate::exec::{CommandRunner, StepStatus};

pub struct MountOrchestrator {
    config: HelperConfig,
    runner: Arc<dyn CommandRunner>,
    devices: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MountOrchestrator {
    pub fn new(config: HelperConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn mountpoint(&self, volume_name: &str) -> PathBuf {
        self.config.volumes_root.join(volume_name)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.config.step_timeout_secs)
    }

    pub async fn remount_read_write(&self, request: &ActionRequest) -> ActionResult {
        if let Err(message) = validate(request) {
            warn!("rejecting remount request: {message}");
            return ActionResult::failed(message);
        }

        let device_lock = self.device_lock(&request.device_node);
        let serial = device_lock.lock().await;
        let result = self.run_sequence(request).await;
        drop(serial);
        self.release_device(&request.device_node, device_lock);

        match &result.error_message {
            None => info!(
                device = %request.device_node,
                volume = %request.volume_name,
                "remounted read/write"
            ),
            Some(message) => warn!(device = %request.device_node, "remount failed: {message}"),
        }
        result
    }

    async fn run_sequence(&self, request: &ActionRequest) -> ActionResult {
        let device = request.device_node.as_str();
        let mountpoint = self.mountpoint(&request.volume_name);
        let vars = ToolVars {
            device,
            mountpoint: &mountpoint,
            volume: &request.volume_name,
        };
        let timeout = self.step_timeout();

        let unmount = &self.config.unmount;
        match self
            .runner
            .run(&unmount.program, &unmount.render_args(&vars), timeout)
            .await
        {
            Ok(status) if status.success() => {}
            Ok(_) => return ActionResult::failed(format!("Failed to unmount {device}")),
            Err(e) => return ActionResult::failed(format!("Execution error: {e}")),
        }

        if let Err(e) = tokio::fs::create_dir_all(&mountpoint).await {
            match self.config.mountpoint_failure {
                MountpointFailure::BestEffort => {
                    warn!("failed to prepare mountpoint {}: {e}", mountpoint.display());
                }
                MountpointFailure::FailFast => {
                    return ActionResult::failed(format!(
                        "Failed to prepare mountpoint {}: {e}",
                        mountpoint.display()
                    ));
                }
            }
        }

        let mount = &self.config.mount;
        let tool = mount.display_name();
        match self
            .runner
            .run(&mount.program, &mount.render_args(&vars), timeout)
            .await
        {
            Ok(StepStatus::Exited(0)) => ActionResult::succeeded(),
            Ok(StepStatus::Exited(code)) => {
                ActionResult::failed(format!("{tool} failed with status {code}"))
            }
            Ok(StepStatus::Signaled) => ActionResult::failed(format!("{tool} terminated by signal")),
            Ok(StepStatus::TimedOut(after)) => ActionResult::failed(format!(
                "{tool} timed out after {}s",
                after.as_secs()
            )),
            Err(e) => ActionResult::failed(format!("Execution error: {e}")),
        }
    }

    fn device_lock(&self, device: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        devices.entry(device.to_string()).or_default().clone()
    }

    /// Forget the device's lock unless another request still holds it.
    fn release_device(&self, device: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            devices.remove(device);
        }
    }

    #[cfg(test)]
    fn tracked_devices(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn validate(request: &ActionRequest) -> Result<(), String> {
    let name = request.volume_name.as_str();
    // the name also lands in the mount tool's comma separated option list
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', ','])
        || name.chars().any(char::is_control)
    {
        return Err(format!("Invalid volume name {name:?}"));
    }

    let device = request.device_node.as_str();
    let path = Path::new(device);
    if !device.starts_with("/dev/")
        || device.contains('\0')
        || path.components().any(|c| c == Component::ParentDir)
    {
        return Err(format!("Invalid device node {device:?}"));
    }
    Ok(())
}
