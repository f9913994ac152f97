use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rk8s/rkm.toml";

static SOCKET_PATH: &str = "/run/rkm/helper.sock";
static RUN_DIR: &str = "/run/rkm";
static STATE_DIR: &str = "/var/lib/rkm";
static VOLUMES_ROOT: &str = "/media";
static SERVICE_UNIT: &str = "rkm-helper.service";

/// Configuration shared by `rkm` and `rkm-helper`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RkmConfig {
    /// Unix socket the privileged helper listens on.
    pub socket_path: PathBuf,
    pub monitor: MonitorConfig,
    pub policy: PolicyConfig,
    pub helper: HelperConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// udev `ID_FS_TYPE` of the volumes to act on.
    pub target_fs_type: String,
    /// Report volumes that are already attached when the monitor starts.
    pub scan_existing: bool,
    pub udevadm: PathBuf,
    pub lsblk: PathBuf,
    /// Pid and log files of a detached daemon.
    pub run_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Namespace directory shared by every process reading the policies.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Mountpoints are created as `<volumes_root>/<volume name>`.
    pub volumes_root: PathBuf,
    pub step_timeout_secs: u64,
    pub mountpoint_failure: MountpointFailure,
    /// Octal mode of the helper socket.
    pub socket_mode: String,
    pub request_timeout_secs: u64,
    /// Only dispatch remounts when the helper unit is enabled.
    pub check_service: bool,
    pub service_unit: String,
    pub systemctl: PathBuf,
    pub unmount: ToolConfig,
    pub mount: ToolConfig,
}

/// What to do when the mountpoint directory cannot be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountpointFailure {
    /// Log the error and try to mount anyway.
    #[default]
    BestEffort,
    FailFast,
}

/// An external program and its arguments.
///
/// Arguments may contain the `{device}`, `{mountpoint}` and `{volume}`
/// placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Values substituted into [`ToolConfig::args`].
pub struct ToolVars<'a> {
    pub device: &'a str,
    pub mountpoint: &'a Path,
    pub volume: &'a str,
}

impl Default for RkmConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            monitor: MonitorConfig::default(),
            policy: PolicyConfig::default(),
            helper: HelperConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target_fs_type: "ntfs".to_string(),
            scan_existing: true,
            udevadm: PathBuf::from("/usr/bin/udevadm"),
            lsblk: PathBuf::from("/usr/bin/lsblk"),
            run_dir: PathBuf::from(RUN_DIR),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(STATE_DIR),
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            volumes_root: PathBuf::from(VOLUMES_ROOT),
            step_timeout_secs: 30,
            mountpoint_failure: MountpointFailure::default(),
            socket_mode: "660".to_string(),
            request_timeout_secs: 120,
            check_service: true,
            service_unit: SERVICE_UNIT.to_string(),
            systemctl: PathBuf::from("/usr/bin/systemctl"),
            unmount: ToolConfig::new("/usr/bin/umount", &["-f", "{device}"]),
            mount: ToolConfig::new(
                "/usr/bin/ntfs-3g",
                &["{device}", "{mountpoint}", "-o", "rw,allow_other,fsname={volume}"],
            ),
        }
    }
}

impl RkmConfig {
    /// Load the config file, creating it with defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        confy::load_path(path)
            .with_context(|| format!("failed to load config file `{}`", path.display()))
    }
}

impl HelperConfig {
    pub fn socket_mode(&self) -> Result<u32> {
        u32::from_str_radix(self.socket_mode.trim_start_matches("0o"), 8)
            .with_context(|| format!("invalid socket mode `{}`", self.socket_mode))
    }
}

impl ToolConfig {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Short name used in error messages, e.g. `ntfs-3g`.
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn render_args(&self, vars: &ToolVars<'_>) -> Vec<String> {
        let mountpoint = vars.mountpoint.to_string_lossy();
        let values = [
            ("{device}", vars.device),
            ("{mountpoint}", &*mountpoint),
            ("{volume}", vars.volume),
        ];
        self.args
            .iter()
            .map(|arg| substitute(arg, &values))
            .collect()
    }
}

/// Single pass substitution, so a volume name that itself looks like a
/// placeholder is left alone.
fn substitute(arg: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match values.iter().find(|(key, _)| tail.starts_with(*key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
