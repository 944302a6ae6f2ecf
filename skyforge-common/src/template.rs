use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::tags::{self, TagKeys};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("tag key '{0}' is reserved")]
    ReservedTagKey(String),

    #[error("too many tags: {count} (max {max})")]
    TooManyTags { count: usize, max: usize },

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("volumes must all use the same KMS key or none (found {0:?})")]
    MixedVolumeKeys(Vec<String>),

    #[error("invalid volume #{index}: {reason}")]
    InvalidVolume { index: usize, reason: String },

    #[error("invalid spot configuration: {0}")]
    InvalidSpot(String),

    #[error("invalid scaling group configuration: {0}")]
    InvalidScalingGroup(String),
}

/// One data volume requested for every instance of a template.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct VolumeSpec {
    pub size_gib: u32,
    pub volume_type: String,
    pub iops: Option<u32>,
    pub throughput_mibps: Option<u32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
}

impl VolumeSpec {
    pub fn new(size_gib: u32, volume_type: &str) -> Self {
        Self {
            size_gib,
            volume_type: volume_type.to_string(),
            iops: None,
            throughput_mibps: None,
            encrypted: false,
            kms_key_id: None,
        }
    }

    pub fn with_kms_key(mut self, key: &str) -> Self {
        self.encrypted = true;
        self.kms_key_id = Some(key.to_string());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct SpotSpec {
    /// Maximum hourly price, kept as the decimal string the provider takes.
    pub max_price: String,
    pub block_duration_minutes: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct ScalingGroupSpec {
    pub group_name: String,
}

/// Immutable description of the desired instance shape.
///
/// Equality is structural: two equal templates must drive identical calls.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub key_name: Option<String>,
    pub availability_zone: Option<String>,
    pub volumes: Vec<VolumeSpec>,
    /// False in regions whose launch API cannot carry a per-volume KMS key.
    pub launch_supports_volume_kms: bool,
    pub spot: Option<SpotSpec>,
    pub scaling_group: Option<ScalingGroupSpec>,
    pub tags: BTreeMap<String, String>,
}

impl Template {
    pub fn new(name: &str, image_id: &str, instance_type: &str) -> Self {
        Self {
            name: name.to_string(),
            image_id: image_id.to_string(),
            instance_type: instance_type.to_string(),
            subnet_id: String::new(),
            security_group_ids: Vec::new(),
            key_name: None,
            availability_zone: None,
            volumes: Vec::new(),
            launch_supports_volume_kms: true,
            spot: None,
            scaling_group: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_subnet(mut self, subnet_id: &str) -> Self {
        self.subnet_id = subnet_id.to_string();
        self
    }

    pub fn with_key_name(mut self, key_name: &str) -> Self {
        self.key_name = Some(key_name.to_string());
        self
    }

    pub fn with_availability_zone(mut self, zone: &str) -> Self {
        self.availability_zone = Some(zone.to_string());
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<VolumeSpec>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn with_launch_volume_kms(mut self, supported: bool) -> Self {
        self.launch_supports_volume_kms = supported;
        self
    }

    pub fn with_spot(mut self, max_price: &str) -> Self {
        self.spot = Some(SpotSpec {
            max_price: max_price.to_string(),
            block_duration_minutes: None,
        });
        self
    }

    pub fn with_scaling_group(mut self, group_name: &str) -> Self {
        self.scaling_group = Some(ScalingGroupSpec {
            group_name: group_name.to_string(),
        });
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Group-managed templates hand instance lifecycle to a scaling group.
    pub fn is_automatic(&self) -> bool {
        self.scaling_group.is_some()
    }

    pub fn uses_spot(&self) -> bool {
        self.spot.is_some()
    }

    /// The single KMS key shared by all volumes, if any.
    pub fn volume_kms_key(&self) -> Option<&str> {
        self.volumes.iter().find_map(|v| v.kms_key_id.as_deref())
    }

    /// Cross-field checks the per-field validators cannot make.
    pub fn validate(&self, keys: &TagKeys) -> Result<(), TemplateError> {
        tags::validate_user_tags(keys, &self.tags)?;

        let mut distinct: Vec<String> = Vec::new();
        let mut keyless = 0usize;
        for (index, v) in self.volumes.iter().enumerate() {
            if v.size_gib == 0 {
                return Err(TemplateError::InvalidVolume {
                    index,
                    reason: "size must be positive".to_string(),
                });
            }
            if v.volume_type.trim().is_empty() {
                return Err(TemplateError::InvalidVolume {
                    index,
                    reason: "volume type is empty".to_string(),
                });
            }
            match &v.kms_key_id {
                Some(k) => {
                    if !v.encrypted {
                        return Err(TemplateError::InvalidVolume {
                            index,
                            reason: "KMS key set on an unencrypted volume".to_string(),
                        });
                    }
                    if !distinct.contains(k) {
                        distinct.push(k.clone());
                    }
                }
                None => keyless += 1,
            }
        }
        if distinct.len() > 1 || (!distinct.is_empty() && keyless > 0) {
            return Err(TemplateError::MixedVolumeKeys(distinct));
        }

        if let Some(spot) = &self.spot {
            let price = spot.max_price.trim().parse::<f64>().map_err(|_| {
                TemplateError::InvalidSpot(format!("max price '{}' is not a number", spot.max_price))
            })?;
            if price.is_nan() || price <= 0.0 {
                return Err(TemplateError::InvalidSpot(
                    "max price must be positive".to_string(),
                ));
            }
        }

        if let Some(group) = &self.scaling_group {
            if group.group_name.trim().is_empty() {
                return Err(TemplateError::InvalidScalingGroup(
                    "group name is empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}
