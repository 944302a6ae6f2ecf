use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::template::TemplateError;

// -----------------------------------------------------------------------------
// Reserved keys
// -----------------------------------------------------------------------------

/// Every managed instance carries this tag; its value is the virtual instance id.
pub const DEFAULT_OWNERSHIP_TAG_KEY: &str = "SkyforgeVirtualInstanceId";
/// Name of the template an instance was launched from.
pub const DEFAULT_TEMPLATE_TAG_KEY: &str = "SkyforgeTemplateName";
/// Tag the provider puts on scaling-group members.
pub const SCALING_GROUP_TAG_KEY: &str = "aws:autoscaling:groupName";

// -----------------------------------------------------------------------------
// Provider limits
// -----------------------------------------------------------------------------

pub const MAX_TAGS_PER_RESOURCE: usize = 50;
pub const MAX_TAG_KEY_LEN: usize = 128;
pub const MAX_TAG_VALUE_LEN: usize = 256;

/// Prefix the provider keeps for itself.
const PROVIDER_RESERVED_PREFIX: &str = "aws:";

/// The pair of keys the orchestrator writes on every resource it owns.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TagKeys {
    pub ownership: String,
    pub template: String,
}

impl Default for TagKeys {
    fn default() -> Self {
        Self {
            ownership: DEFAULT_OWNERSHIP_TAG_KEY.to_string(),
            template: DEFAULT_TEMPLATE_TAG_KEY.to_string(),
        }
    }
}

impl TagKeys {
    pub fn is_reserved(&self, key: &str) -> bool {
        key == self.ownership
            || key == self.template
            || key.to_ascii_lowercase().starts_with(PROVIDER_RESERVED_PREFIX)
    }

    /// Full tag set for a managed resource: user tags first, then the
    /// template-name tag and the ownership tag on top.
    pub fn managed_tags(
        &self,
        virtual_id: &str,
        template_name: &str,
        user_tags: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut out = user_tags.clone();
        out.insert(self.template.clone(), template_name.to_string());
        out.insert(self.ownership.clone(), virtual_id.to_string());
        out
    }
}

/// Check user supplied tags against reserved keys and provider limits.
///
/// The two managed tags count against the per-resource limit.
pub fn validate_user_tags(
    keys: &TagKeys,
    tags: &BTreeMap<String, String>,
) -> Result<(), TemplateError> {
    if tags.len() + 2 > MAX_TAGS_PER_RESOURCE {
        return Err(TemplateError::TooManyTags {
            count: tags.len(),
            max: MAX_TAGS_PER_RESOURCE - 2,
        });
    }
    for (k, v) in tags {
        if k.trim().is_empty() {
            return Err(TemplateError::InvalidTag("empty tag key".to_string()));
        }
        if keys.is_reserved(k) {
            return Err(TemplateError::ReservedTagKey(k.clone()));
        }
        if k.chars().count() > MAX_TAG_KEY_LEN {
            return Err(TemplateError::InvalidTag(format!(
                "tag key '{}' exceeds {} characters",
                k, MAX_TAG_KEY_LEN
            )));
        }
        if v.chars().count() > MAX_TAG_VALUE_LEN {
            return Err(TemplateError::InvalidTag(format!(
                "value of tag '{}' exceeds {} characters",
                k, MAX_TAG_VALUE_LEN
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn managed_tags_override_user_tags() {
        let keys = TagKeys::default();
        let out = keys.managed_tags("vm-1", "workers", &tags(&[("team", "data")]));
        assert_eq!(out.get(DEFAULT_OWNERSHIP_TAG_KEY).map(String::as_str), Some("vm-1"));
        assert_eq!(out.get(DEFAULT_TEMPLATE_TAG_KEY).map(String::as_str), Some("workers"));
        assert_eq!(out.get("team").map(String::as_str), Some("data"));
    }

    #[test]
    fn reserved_keys_rejected() {
        let keys = TagKeys::default();
        assert!(matches!(
            validate_user_tags(&keys, &tags(&[(DEFAULT_OWNERSHIP_TAG_KEY, "x")])),
            Err(TemplateError::ReservedTagKey(_))
        ));
        assert!(matches!(
            validate_user_tags(&keys, &tags(&[("AWS:cloudformation", "x")])),
            Err(TemplateError::ReservedTagKey(_))
        ));
        assert!(validate_user_tags(&keys, &tags(&[("owner", "ops")])).is_ok());
    }

    #[test]
    fn limits_enforced() {
        let keys = TagKeys::default();
        let long_key = "k".repeat(MAX_TAG_KEY_LEN + 1);
        assert!(validate_user_tags(&keys, &tags(&[(long_key.as_str(), "v")])).is_err());

        let many: BTreeMap<String, String> = (0..MAX_TAGS_PER_RESOURCE)
            .map(|i| (format!("k{}", i), "v".to_string()))
            .collect();
        assert!(matches!(
            validate_user_tags(&keys, &many),
            Err(TemplateError::TooManyTags { .. })
        ));
    }
}
