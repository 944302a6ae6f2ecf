//! Mappings from raw provider states to the states the workflows act on.
//! Nothing here transitions a record locally; every input comes from a
//! describe call.

use skyforge_common::{InstanceState, InstanceStatus, VolumeState};
use skyforge_providers::inventory::{DescribedVolume, GroupMember};

/// Portable status reported by `get_state`.
pub fn portable_status(state: InstanceState) -> InstanceStatus {
    match state {
        InstanceState::Pending => InstanceStatus::Pending,
        InstanceState::Running => InstanceStatus::Running,
        // Shutting down is on its way out but not gone yet.
        InstanceState::ShuttingDown | InstanceState::Stopping => InstanceStatus::Stopping,
        InstanceState::Stopped => InstanceStatus::Stopped,
        InstanceState::Terminated => InstanceStatus::Deleted,
        InstanceState::Unknown => InstanceStatus::Unknown,
    }
}

/// State of `volume` from the point of view of `instance_id`.
///
/// A volume counts as `InUse` only once its attachment to that instance has
/// completed; an attachment to another instance is an error for this one.
pub fn volume_state_for(volume: &DescribedVolume, instance_id: &str) -> VolumeState {
    let raw = VolumeState::from_provider(&volume.state);
    if raw != VolumeState::InUse {
        return raw;
    }
    match volume.attachments.iter().find(|a| a.instance_id == instance_id) {
        Some(att) => match att.state.as_str() {
            "attached" => VolumeState::InUse,
            "attaching" => VolumeState::Attaching,
            _ => VolumeState::Unknown,
        },
        None => VolumeState::Error,
    }
}

/// True if the volume is attached (or attaching) to `instance_id` at
/// `device_name`.
pub fn is_attached_to(volume: &DescribedVolume, instance_id: &str, device_name: &str) -> bool {
    volume.attachments.iter().any(|a| {
        a.instance_id == instance_id
            && a.device_name == device_name
            && matches!(a.state.as_str(), "attaching" | "attached")
    })
}

pub fn is_in_service(member: &GroupMember) -> bool {
    member.lifecycle_state == "InService"
}

pub fn is_leaving_group(member: &GroupMember) -> bool {
    member.lifecycle_state.starts_with("Terminat")
}
