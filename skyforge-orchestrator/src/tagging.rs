//! Ownership tagging.
//!
//! A virtual instance id never exists as platform state. It travels only as
//! the value of the ownership tag on the provider resources, and every
//! lookup by virtual id is a tag-filtered describe. Any replacement storage
//! must stay queryable by that same tag.

use skyforge_common::tags::TagKeys;
use skyforge_common::{ProviderInstanceId, Template, VirtualInstanceId};
use skyforge_providers::inventory::DescribedInstance;
use skyforge_providers::CloudComputeClient;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::errors::{OrchestratorError, Result};
use crate::retry::{retry_until, Cancellation, RetryPolicy};

#[derive(Debug, Clone)]
pub struct IdentityTagger {
    keys: TagKeys,
}

impl IdentityTagger {
    pub fn new(keys: TagKeys) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &TagKeys {
        &self.keys
    }

    pub fn ownership_key(&self) -> &str {
        &self.keys.ownership
    }

    pub fn managed_tags(
        &self,
        virtual_id: &VirtualInstanceId,
        template: &Template,
    ) -> BTreeMap<String, String> {
        self.keys
            .managed_tags(virtual_id.as_str(), &template.name, &template.tags)
    }

    /// Tag a freshly launched instance with its ownership tag, the template
    /// tag and the template's user tags.
    ///
    /// The instance may not be visible to the tagging API yet, so not-found
    /// errors are retried until `timeout`.
    pub async fn tag(
        &self,
        client: &dyn CloudComputeClient,
        provider_id: &ProviderInstanceId,
        virtual_id: &VirtualInstanceId,
        template: &Template,
        policy: RetryPolicy,
        cancel: &Cancellation,
    ) -> Result<()> {
        if virtual_id.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "virtual instance id must not be empty".to_string(),
            ));
        }
        let tags = self.managed_tags(virtual_id, template);
        let resources = vec![provider_id.as_str().to_string()];

        retry_until(
            "tag_instance",
            policy.deadline(),
            policy.backoff,
            cancel,
            OrchestratorError::is_retryable,
            |attempt| {
                let resources = &resources;
                let tags = &tags;
                async move {
                    debug!(
                        provider_id = %provider_id,
                        virtual_id = %virtual_id,
                        attempt,
                        "[Tagging] applying ownership tags"
                    );
                    client
                        .create_tags(resources, tags)
                        .await
                        .map_err(OrchestratorError::from)
                }
            },
        )
        .await
        .map_err(OrchestratorError::from)
    }

    /// Read the virtual id off a described instance.
    ///
    /// A missing or empty ownership tag is fatal: an instance this system
    /// does not own must never come back from a lookup. With a template,
    /// key name, instance type and image are compared too; differences are
    /// only logged.
    pub fn resolve_ownership(
        &self,
        instance: &DescribedInstance,
        template: Option<&Template>,
    ) -> Result<VirtualInstanceId> {
        let virtual_id = instance
            .tags
            .get(&self.keys.ownership)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(VirtualInstanceId::from)
            .ok_or_else(|| OrchestratorError::OwnershipViolation {
                provider_id: instance.instance_id.clone(),
                tag_key: self.keys.ownership.clone(),
            })?;

        if let Some(template) = template {
            self.check_consistency(instance, &virtual_id, template);
        }
        Ok(virtual_id)
    }

    fn check_consistency(
        &self,
        instance: &DescribedInstance,
        virtual_id: &VirtualInstanceId,
        template: &Template,
    ) {
        let mismatch = |field: &str, expected: &str, observed: Option<&str>| {
            if observed != Some(expected) {
                warn!(
                    virtual_id = %virtual_id,
                    provider_id = %instance.instance_id,
                    field,
                    expected,
                    observed = observed.unwrap_or("<none>"),
                    "[Tagging] instance differs from its template"
                );
            }
        };
        if let Some(key_name) = &template.key_name {
            mismatch("key_name", key_name, instance.key_name.as_deref());
        }
        mismatch(
            "instance_type",
            &template.instance_type,
            instance.instance_type.as_deref(),
        );
        mismatch("image_id", &template.image_id, instance.image_id.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyforge_providers::inventory::LaunchRequest;
    use skyforge_providers::mock::{ops, MockProvider};
    use skyforge_providers::{codes, inventory::DescribeInstancesQuery, inventory::InstanceFilter};
    use std::time::Duration;

    fn template() -> Template {
        Template::new("web", "ami-123", "m5.large").with_tag("team", "infra")
    }

    async fn launch(mock: &MockProvider) -> ProviderInstanceId {
        let launched = mock
            .run_instances(&LaunchRequest {
                image_id: "ami-123".to_string(),
                instance_type: "m5.large".to_string(),
                count: 1,
                ..LaunchRequest::default()
            })
            .await
            .unwrap();
        ProviderInstanceId::from(launched[0].instance_id.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn tag_then_resolve_round_trips() {
        let mock = MockProvider::new();
        let tagger = IdentityTagger::new(TagKeys::default());
        let provider_id = launch(&mock).await;
        let virtual_id = VirtualInstanceId::from("vm-42");

        mock.inject_error(ops::CREATE_TAGS, codes::INSTANCE_NOT_FOUND, 2);
        tagger
            .tag(
                &mock,
                &provider_id,
                &virtual_id,
                &template(),
                RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
                &Cancellation::never(),
            )
            .await
            .unwrap();
        assert_eq!(mock.calls(ops::CREATE_TAGS), 3);

        let page = mock
            .describe_instances(&DescribeInstancesQuery {
                filter: InstanceFilter::InstanceIds(vec![provider_id.to_string()]),
                next_token: None,
            })
            .await
            .unwrap();
        let described = &page.items[0];
        assert_eq!(described.tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(
            tagger.resolve_ownership(described, Some(&template())).unwrap(),
            virtual_id
        );
    }

    #[tokio::test]
    async fn missing_ownership_tag_is_a_violation() {
        let mock = MockProvider::new();
        let tagger = IdentityTagger::new(TagKeys::default());
        let provider_id = launch(&mock).await;
        let described = mock.instance(provider_id.as_str()).unwrap();

        let err = tagger.resolve_ownership(&described, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::OwnershipViolation { .. }));
    }

    #[test]
    fn soft_mismatch_still_resolves() {
        let tagger = IdentityTagger::new(TagKeys::default());
        let mut tags = BTreeMap::new();
        tags.insert(TagKeys::default().ownership, "vm-1".to_string());
        let described = DescribedInstance {
            instance_id: "i-1".to_string(),
            state: "running".to_string(),
            tags,
            instance_type: Some("t3.micro".to_string()),
            image_id: Some("ami-other".to_string()),
            key_name: None,
            availability_zone: None,
            private_ip_address: None,
            launch_time: None,
            block_devices: vec![],
        };
        let resolved = tagger.resolve_ownership(&described, Some(&template())).unwrap();
        assert_eq!(resolved.as_str(), "vm-1");
    }
}
