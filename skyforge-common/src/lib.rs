use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod tags;
pub mod template;

pub use template::{ScalingGroupSpec, SpotSpec, Template, TemplateError, VolumeSpec};

// --- Identifiers ---

/// Caller-assigned logical instance id.
///
/// Stable for the lifetime of a logical instance, whatever the cloud does to
/// the machine behind it. It travels to the cloud only as the value of the
/// ownership tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualInstanceId(String);

impl VirtualInstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for VirtualInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VirtualInstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for VirtualInstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The cloud platform's own instance id (ephemeral, assigned at launch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderInstanceId(String);

impl ProviderInstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderInstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderInstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// --- Enums ---

/// Lifecycle state as reported by the provider.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown,
}

impl InstanceState {
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" | "shutting_down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        }
    }

    /// Terminal states never come back; a record in one of them loses
    /// against any other record carrying the same id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Portable status handed back to callers of `get_state`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Running,
    Pending,
    Stopping,
    Stopped,
    Deleted,
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    Attaching,
    InUse,
    Deleting,
    Deleted,
    Error,
    Unknown,
}

impl VolumeState {
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "attaching" => VolumeState::Attaching,
            "in-use" | "in_use" | "attached" => VolumeState::InUse,
            "deleting" => VolumeState::Deleting,
            "deleted" => VolumeState::Deleted,
            "error" => VolumeState::Error,
            _ => VolumeState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::Attaching => "attaching",
            VolumeState::InUse => "in-use",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
            VolumeState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Records ---

/// What a describe call observed for one managed instance.
///
/// Records are only ever produced by describing the provider; nothing
/// transitions them locally.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceRecord {
    pub virtual_id: VirtualInstanceId,
    pub provider_id: ProviderInstanceId,
    pub state: InstanceState,
    pub tags: BTreeMap<String, String>,
    pub instance_type: Option<String>,
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub availability_zone: Option<String>,
    pub private_ip_address: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Volume id recorded when the create call itself failed.
pub const UNCREATED_VOLUME_ID: &str = "uncreated";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub virtual_id: VirtualInstanceId,
    pub provider_instance_id: ProviderInstanceId,
    pub volume_id: String,
    pub state: VolumeState,
    pub device_name: String,
}

impl VolumeRecord {
    pub fn uncreated(
        virtual_id: VirtualInstanceId,
        provider_instance_id: ProviderInstanceId,
        device_name: String,
    ) -> Self {
        Self {
            virtual_id,
            provider_instance_id,
            volume_id: UNCREATED_VOLUME_ID.to_string(),
            state: VolumeState::Error,
            device_name,
        }
    }

    pub fn is_created(&self) -> bool {
        self.volume_id != UNCREATED_VOLUME_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_parse_roundtrip() {
        for s in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::ShuttingDown,
            InstanceState::Terminated,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ] {
            assert_eq!(InstanceState::from_provider(s.as_str()), s);
            assert_eq!(InstanceState::from_provider(&s.as_str().to_uppercase()), s);
        }
        assert_eq!(InstanceState::from_provider("rebooting"), InstanceState::Unknown);
    }

    #[test]
    fn terminal_states() {
        assert!(InstanceState::Terminated.is_terminal());
        assert!(InstanceState::ShuttingDown.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
        assert!(!InstanceState::Stopped.is_terminal());
    }

    #[test]
    fn uncreated_volume_sentinel() {
        let v = VolumeRecord::uncreated("vm-1".into(), "i-1".into(), "/dev/sdf".to_string());
        assert!(!v.is_created());
        assert_eq!(v.volume_id, UNCREATED_VOLUME_ID);
        assert_eq!(VolumeState::from_provider("in-use"), VolumeState::InUse);
    }
}
