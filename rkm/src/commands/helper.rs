use anyhow::{Result, bail};
use common::ActionRequest;

use super::HelperCommand;
use crate::client::{HelperClient, PrivilegedActions};
use crate::service::{ServiceProbe, SystemdService};

pub async fn execute(service: &SystemdService, client: &HelperClient, command: HelperCommand) -> Result<()> {
    match command {
        HelperCommand::Status => {
            println!("{}: {}", service.unit(), service.status().await);
        }
        HelperCommand::Install => service.install().await?,
        HelperCommand::Uninstall => service.uninstall().await?,
        HelperCommand::Version => {
            println!("{}", client.helper_version().await?);
        }
    }
    Ok(())
}

/// Send one remount request, as the daemon would for a ReadWrite volume.
pub async fn remount(client: &HelperClient, device: &str, volume: &str) -> Result<()> {
    let result = client
        .remount_read_write(ActionRequest::new(device, volume))
        .await?;
    if !result.success {
        bail!(
            "{}",
            result
                .error_message
                .unwrap_or_else(|| "remount failed".to_string())
        );
    }
    println!("{device} remounted read/write as {volume}");
    Ok(())
}
