use async_trait::async_trait;

pub mod client_provider;
pub mod error;

pub use client_provider::{ClientConfig, ClientProvider};
pub use error::{codes, ProviderError, ProviderResult};

/// Capability checked once per process before a client is handed out.
#[async_trait]
pub trait Verifiable: Send + Sync {
    /// One authenticated call with no side effects; fails fast on bad
    /// credentials or connectivity.
    async fn verify_access(&self) -> ProviderResult<()>;
}

/// The cloud control plane as seen by the orchestrator.
///
/// Every call is a single remote request (bulk where the API allows it).
/// Implementations must not retry internally on eventual-consistency
/// errors; the orchestrator owns retry policy.
#[async_trait]
pub trait CloudComputeClient: Verifiable {
    // Instances
    async fn run_instances(
        &self,
        request: &inventory::LaunchRequest,
    ) -> ProviderResult<Vec<inventory::DescribedInstance>>;

    /// One page of a describe call. Callers follow `next_token` until it is `None`.
    async fn describe_instances(
        &self,
        query: &inventory::DescribeInstancesQuery,
    ) -> ProviderResult<inventory::Page<inventory::DescribedInstance>>;

    /// Terminating an instance that is already gone is not an error.
    async fn terminate_instances(&self, instance_ids: &[String]) -> ProviderResult<()>;

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &std::collections::BTreeMap<String, String>,
    ) -> ProviderResult<()>;

    async fn describe_image(
        &self,
        image_id: &str,
    ) -> ProviderResult<Option<inventory::ImageDescription>>;

    // Spot
    async fn request_spot_instance(
        &self,
        request: &inventory::SpotRequest,
    ) -> ProviderResult<String>;

    async fn describe_spot_requests(
        &self,
        filter: &inventory::SpotRequestFilter,
    ) -> ProviderResult<Vec<inventory::DescribedSpotRequest>>;

    async fn cancel_spot_requests(&self, request_ids: &[String]) -> ProviderResult<()>;

    // Scaling groups
    async fn create_scaling_group(
        &self,
        request: &inventory::ScalingGroupRequest,
    ) -> ProviderResult<()>;

    async fn describe_scaling_group(
        &self,
        group_name: &str,
    ) -> ProviderResult<Option<inventory::DescribedScalingGroup>>;

    /// Set desired capacity, raising the group's max size to `max_size`
    /// first when given. Desired capacity outside [min, max] is rejected.
    async fn set_scaling_group_capacity(
        &self,
        group_name: &str,
        desired_capacity: u32,
        max_size: Option<u32>,
    ) -> ProviderResult<()>;

    /// Terminate one member, optionally shrinking desired capacity so the
    /// group does not replace it.
    async fn terminate_in_scaling_group(
        &self,
        instance_id: &str,
        decrement_desired_capacity: bool,
    ) -> ProviderResult<()>;

    async fn delete_scaling_group(&self, group_name: &str) -> ProviderResult<()>;

    // Volumes
    async fn create_volume(
        &self,
        request: &inventory::CreateVolumeRequest,
    ) -> ProviderResult<String>;

    async fn describe_volumes(
        &self,
        volume_ids: &[String],
    ) -> ProviderResult<Vec<inventory::DescribedVolume>>;

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device_name: &str,
    ) -> ProviderResult<()>;

    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()>;

    async fn set_delete_on_termination(
        &self,
        instance_id: &str,
        device_name: &str,
        delete_on_termination: bool,
    ) -> ProviderResult<()>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct BlockDeviceMapping {
        pub device_name: String,
        pub size_gib: u32,
        pub volume_type: String,
        pub iops: Option<u32>,
        pub throughput_mibps: Option<u32>,
        pub encrypted: bool,
        pub kms_key_id: Option<String>,
        pub delete_on_termination: bool,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct LaunchRequest {
        pub image_id: String,
        pub instance_type: String,
        pub subnet_id: String,
        pub security_group_ids: Vec<String>,
        pub key_name: Option<String>,
        pub availability_zone: Option<String>,
        /// Idempotency token; a repeated launch with the same token returns
        /// the instance created the first time.
        pub client_token: Option<String>,
        pub count: u32,
        pub tags: BTreeMap<String, String>,
        pub block_device_mappings: Vec<BlockDeviceMapping>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct AttachedDevice {
        pub device_name: String,
        pub volume_id: String,
        pub delete_on_termination: bool,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    pub struct DescribedInstance {
        pub instance_id: String,
        pub state: String,
        pub tags: BTreeMap<String, String>,
        pub instance_type: Option<String>,
        pub image_id: Option<String>,
        pub key_name: Option<String>,
        pub availability_zone: Option<String>,
        pub private_ip_address: Option<String>,
        pub launch_time: Option<DateTime<Utc>>,
        pub block_devices: Vec<AttachedDevice>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub enum InstanceFilter {
        InstanceIds(Vec<String>),
        TagValues { key: String, values: Vec<String> },
    }

    impl InstanceFilter {
        pub fn len(&self) -> usize {
            match self {
                InstanceFilter::InstanceIds(ids) => ids.len(),
                InstanceFilter::TagValues { values, .. } => values.len(),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct DescribeInstancesQuery {
        pub filter: InstanceFilter,
        pub next_token: Option<String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct Page<T> {
        pub items: Vec<T>,
        pub next_token: Option<String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct ImageDescription {
        pub image_id: String,
        pub root_device_name: Option<String>,
        /// Device names taken by the image's own block-device mappings.
        pub block_device_names: Vec<String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct SpotRequest {
        pub launch: LaunchRequest,
        pub max_price: String,
        pub block_duration_minutes: Option<u32>,
        /// Tags on the spot request itself (not the instance it produces).
        pub request_tags: BTreeMap<String, String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub enum SpotRequestFilter {
        RequestIds(Vec<String>),
        TagValues { key: String, values: Vec<String> },
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct DescribedSpotRequest {
        pub request_id: String,
        /// open | active | closed | cancelled | failed
        pub state: String,
        pub status_code: Option<String>,
        pub instance_id: Option<String>,
        pub tags: BTreeMap<String, String>,
    }

    impl DescribedSpotRequest {
        pub fn is_fulfilled(&self) -> bool {
            self.state == "active" && self.instance_id.is_some()
        }

        pub fn is_finished(&self) -> bool {
            matches!(self.state.as_str(), "closed" | "cancelled" | "failed")
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct ScalingGroupRequest {
        pub group_name: String,
        pub launch: LaunchRequest,
        pub min_size: u32,
        pub max_size: u32,
        pub desired_capacity: u32,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct GroupMember {
        pub instance_id: String,
        /// Pending | InService | Terminating | ...
        pub lifecycle_state: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct DescribedScalingGroup {
        pub group_name: String,
        pub min_size: u32,
        pub max_size: u32,
        pub desired_capacity: u32,
        pub instances: Vec<GroupMember>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct CreateVolumeRequest {
        pub availability_zone: String,
        pub size_gib: u32,
        pub volume_type: String,
        pub iops: Option<u32>,
        pub throughput_mibps: Option<u32>,
        pub encrypted: bool,
        pub kms_key_id: Option<String>,
        pub tags: BTreeMap<String, String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct VolumeAttachment {
        pub instance_id: String,
        pub device_name: String,
        /// attaching | attached | detaching
        pub state: String,
        pub delete_on_termination: bool,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct DescribedVolume {
        pub volume_id: String,
        /// creating | available | in-use | deleting | deleted | error
        pub state: String,
        pub availability_zone: String,
        pub size_gib: u32,
        pub tags: BTreeMap<String, String>,
        pub attachments: Vec<VolumeAttachment>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;
