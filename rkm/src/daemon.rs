//! The long running monitor: udev arrivals in, remount requests out.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use common::config::RkmConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::client::{HelperClient, PrivilegedActions};
use crate::controller::Controller;
use crate::monitor::{UdevSource, VolumeMonitor};
use crate::policy::PolicyStore;
use crate::service::SystemdService;

/// Arrivals waiting for the controller.
const VOLUME_QUEUE: usize = 64;

pub async fn run(config: RkmConfig) -> Result<()> {
    let store = PolicyStore::open(&config.policy.state_dir).with_context(|| {
        format!(
            "failed to open policy store at {}",
            config.policy.state_dir.display()
        )
    })?;
    let client = Arc::new(HelperClient::from_config(&config));
    match client.helper_version().await {
        Ok(version) => info!(%version, "privileged helper reachable"),
        Err(e) => warn!("privileged helper not reachable yet: {e}"),
    }

    let mut controller = Controller::new(Arc::new(store), client);
    if config.helper.check_service {
        let service = SystemdService::from_config(&config.helper);
        controller = controller.with_service_probe(Arc::new(service));
    }

    let mut source = UdevSource::new(&config.monitor.udevadm);
    if config.monitor.scan_existing {
        source = source.with_initial_scan(&config.monitor.lsblk);
    }
    let monitor = VolumeMonitor::new(Arc::new(source), &config.monitor.target_fs_type);

    serve(monitor, controller, common::signal::shutdown_signal()).await
}

/// Feed the monitor's arrivals to the controller until `shutdown` resolves.
///
/// Returns an error when the event source ends on its own.
pub async fn serve(
    mut monitor: VolumeMonitor,
    controller: Controller,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(VOLUME_QUEUE);
    monitor.start(tx).context("failed to start volume monitor")?;

    let result = tokio::select! {
        _ = controller.run(rx) => Err(anyhow!("volume event source ended")),
        _ = shutdown => {
            info!("shutting down");
            Ok(())
        }
    };
    monitor.stop();
    result
}
