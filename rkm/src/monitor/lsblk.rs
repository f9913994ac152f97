//! Enumeration of block devices that are already attached.

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

use super::{MonitorError, RawVolumeEvent};

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    path: Option<String>,
    fstype: Option<String>,
    uuid: Option<String>,
    label: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

/// Parse `lsblk -J -o PATH,FSTYPE,UUID,LABEL`, partitions included.
pub fn parse(output: &[u8]) -> Result<Vec<RawVolumeEvent>, MonitorError> {
    let output: LsblkOutput = serde_json::from_slice(output).map_err(MonitorError::ScanOutput)?;
    let mut events = Vec::new();
    let mut pending: Vec<BlockDevice> = output.blockdevices.into_iter().rev().collect();
    while let Some(mut device) = pending.pop() {
        pending.extend(std::mem::take(&mut device.children).into_iter().rev());
        events.push(RawVolumeEvent {
            media_name: device.label,
            content_type: device.fstype,
            media_uuid: device.uuid,
            device_node: device.path,
        });
    }
    Ok(events)
}

pub async fn scan(lsblk: &Path) -> Result<Vec<RawVolumeEvent>, MonitorError> {
    let output = Command::new(lsblk)
        .args(["-J", "-o", "PATH,FSTYPE,UUID,LABEL"])
        .output()
        .await
        .map_err(|source| MonitorError::Spawn {
            program: lsblk.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(MonitorError::Scan(format!(
            "{} exited with {}: {}",
            lsblk.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse(&output.stdout)
}
