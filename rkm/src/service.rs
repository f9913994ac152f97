//! Registration state of the privileged helper with the service manager.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use common::config::HelperConfig;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperStatus {
    NotRegistered,
    Enabled,
    RequiresApproval,
    NotFound,
    Unknown,
}

impl HelperStatus {
    /// Whether a privileged action is worth attempting.
    pub fn allows_elevation(self) -> bool {
        matches!(self, HelperStatus::Enabled | HelperStatus::Unknown)
    }

    /// Map the output of `systemctl is-enabled`.
    pub fn from_is_enabled(stdout: &str, stderr: &str) -> Self {
        match stdout.trim() {
            "enabled" | "enabled-runtime" | "static" | "alias" | "indirect" | "generated"
            | "transient" => HelperStatus::Enabled,
            "disabled" | "linked" | "linked-runtime" => HelperStatus::NotRegistered,
            "masked" | "masked-runtime" => HelperStatus::RequiresApproval,
            "not-found" => HelperStatus::NotFound,
            _ if stderr.contains("No such file or directory") || stderr.contains("not found") => {
                HelperStatus::NotFound
            }
            _ => HelperStatus::Unknown,
        }
    }
}

impl fmt::Display for HelperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            HelperStatus::NotRegistered => "not registered",
            HelperStatus::Enabled => "enabled",
            HelperStatus::RequiresApproval => "requires approval",
            HelperStatus::NotFound => "not found",
            HelperStatus::Unknown => "unknown",
        };
        f.write_str(status)
    }
}

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn status(&self) -> HelperStatus;
}

/// The helper installed as a systemd unit.
#[derive(Debug, Clone)]
pub struct SystemdService {
    systemctl: PathBuf,
    unit: String,
}

impl SystemdService {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            systemctl: PathBuf::from("systemctl"),
            unit: unit.into(),
        }
    }

    pub fn from_config(config: &HelperConfig) -> Self {
        Self::new(&config.service_unit).with_systemctl(&config.systemctl)
    }

    pub fn with_systemctl(mut self, systemctl: impl Into<PathBuf>) -> Self {
        self.systemctl = systemctl.into();
        self
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub async fn install(&self) -> Result<()> {
        self.systemctl(&["enable", "--now"]).await?;
        info!(unit = %self.unit, "helper service enabled");
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<()> {
        self.systemctl(&["disable", "--now"]).await?;
        info!(unit = %self.unit, "helper service disabled");
        Ok(())
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.systemctl)
            .args(args)
            .arg(&self.unit)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.systemctl.display()))?;
        if !output.status.success() {
            bail!(
                "systemctl {} {} failed with {}: {}",
                args.join(" "),
                self.unit,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceProbe for SystemdService {
    async fn status(&self) -> HelperStatus {
        match Command::new(&self.systemctl)
            .args(["is-enabled", self.unit.as_str()])
            .output()
            .await
        {
            Ok(output) => HelperStatus::from_is_enabled(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ),
            Err(e) => {
                warn!("failed to query {}: {e}", self.unit);
                HelperStatus::Unknown
            }
        }
    }
}
