use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod logging;
pub mod protocol;
pub mod signal;

/// Key prefix used for volumes that carry no filesystem UUID.
pub const UNKNOWN_UUID: &str = "UnknownUUID";

/// A volume that arrived on the host and matched the target filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeIdentity {
    pub uuid: Option<String>,
    /// Device node, e.g. `/dev/sdb1`.
    pub device_node: String,
    pub display_name: String,
    pub content_type: String,
}

impl VolumeIdentity {
    /// Key under which the volume's policy is looked up and registered.
    ///
    /// Volumes without a UUID are keyed by their device node so that two of
    /// them attached at the same time never share one record.
    pub fn policy_key(&self) -> String {
        match &self.uuid {
            Some(uuid) => uuid.clone(),
            None => format!("{UNKNOWN_UUID}:{}", self.device_node),
        }
    }
}

/// What to do with a volume when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MountPolicy {
    /// Remount with write access through the privileged helper.
    #[default]
    ReadWrite,
    /// Keep the read-only mount the system made.
    ReadOnly,
    Ignore,
}

impl MountPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountPolicy::ReadWrite => "ReadWrite",
            MountPolicy::ReadOnly => "ReadOnly",
            MountPolicy::Ignore => "Ignore",
        }
    }
}

impl fmt::Display for MountPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mount policy `{0}`, expected one of ReadWrite, ReadOnly, Ignore")]
pub struct ParsePolicyError(String);

impl FromStr for MountPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "readwrite" | "rw" => Ok(MountPolicy::ReadWrite),
            "readonly" | "ro" => Ok(MountPolicy::ReadOnly),
            "ignore" => Ok(MountPolicy::Ignore),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Persisted policy of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRecord {
    pub uuid: String,
    pub name: String,
    pub mode: MountPolicy,
    pub last_connected: DateTime<Utc>,
}

/// Request sent across the privilege boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub device_node: String,
    pub volume_name: String,
}

impl ActionRequest {
    pub fn new(device_node: impl Into<String>, volume_name: impl Into<String>) -> Self {
        Self {
            device_node: device_node.into(),
            volume_name: volume_name.into(),
        }
    }
}

/// Structured answer of the privileged helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub error_message: Option<String>,
}

impl ActionResult {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy() {
        assert_eq!("ReadWrite".parse::<MountPolicy>().unwrap(), MountPolicy::ReadWrite);
        assert_eq!("read-only".parse::<MountPolicy>().unwrap(), MountPolicy::ReadOnly);
        assert_eq!("rw".parse::<MountPolicy>().unwrap(), MountPolicy::ReadWrite);
        assert_eq!("IGNORE".parse::<MountPolicy>().unwrap(), MountPolicy::Ignore);
        assert!("writable".parse::<MountPolicy>().is_err());
        for policy in [MountPolicy::ReadWrite, MountPolicy::ReadOnly, MountPolicy::Ignore] {
            assert_eq!(policy.to_string().parse::<MountPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn test_policy_key() {
        let mut volume = VolumeIdentity {
            uuid: Some("ABC".to_string()),
            device_node: "/dev/sdb1".to_string(),
            display_name: "Backup".to_string(),
            content_type: "ntfs".to_string(),
        };
        assert_eq!(volume.policy_key(), "ABC");

        volume.uuid = None;
        assert_eq!(volume.policy_key(), "UnknownUUID:/dev/sdb1");
    }

    #[test]
    fn test_record_json_layout() {
        let record = PolicyRecord {
            uuid: "ABC".to_string(),
            name: "Backup".to_string(),
            mode: MountPolicy::ReadOnly,
            last_connected: DateTime::parse_from_rfc3339("2026-10-17T08:30:00.123456789Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["uuid"], "ABC");
        assert_eq!(value["name"], "Backup");
        assert_eq!(value["mode"], "ReadOnly");
        assert!(value["lastConnected"].is_string());

        let decoded: PolicyRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, record);
    }
}
