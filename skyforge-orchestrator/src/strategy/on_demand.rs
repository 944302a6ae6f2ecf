use anyhow::anyhow;
use async_trait::async_trait;
use skyforge_common::{InstanceState, ProviderInstanceId, Template, VirtualInstanceId};
use skyforge_providers::ProviderError;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

use super::{
    launch_request, partition_ready, shortfall_error, terminate_instances, Allocation,
    AllocationStrategy, Launched, StrategyContext, StrategyKind,
};
use crate::errors::{OrchestratorError, Result};
use crate::reconciliation::IdResolution;

/// Provider limit on client token length.
const MAX_CLIENT_TOKEN_LEN: usize = 64;

/// Idempotency token for launching `virtual_id` from `template`. The same
/// pair always maps to the same token, so a repeated launch returns the
/// instance the first one created even before its tag is visible.
pub(crate) fn client_token(template: &Template, virtual_id: &VirtualInstanceId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.name.as_bytes());
    hasher.update([0u8]);
    hasher.update(virtual_id.as_str().as_bytes());
    // 32 bytes as hex is exactly the provider limit.
    format!("{:x}", hasher.finalize())
}

pub struct OnDemandStrategy {
    ctx: StrategyContext,
}

impl OnDemandStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    async fn launch_one(
        &self,
        template: &Template,
        virtual_id: &VirtualInstanceId,
    ) -> Result<ProviderInstanceId> {
        let mut request = launch_request(&self.ctx, template, BTreeMap::new()).await?;
        request.client_token = Some(client_token(template, virtual_id));

        let launched = self.ctx.client.run_instances(&request).await?;
        let provider_id = launched
            .first()
            .map(|i| ProviderInstanceId::from(i.instance_id.clone()))
            .ok_or_else(|| {
                OrchestratorError::Provider(ProviderError::Other(anyhow!("launch returned no instance")))
            })?;
        info!(
            virtual_id = %virtual_id,
            provider_id = %provider_id,
            "[OnDemand] instance launched"
        );

        let tagged = self
            .ctx
            .tagger
            .tag(
                self.ctx.client.as_ref(),
                &provider_id,
                virtual_id,
                template,
                self.ctx.policy(self.ctx.settings.tagging_timeout),
                &self.ctx.cancel,
            )
            .await;
        if let Err(e) = tagged {
            if e.is_cancelled() {
                return Err(e);
            }
            // Untagged instances can never be found again; drop it now.
            warn!(provider_id = %provider_id, error = %e, "[OnDemand] tagging failed, terminating");
            if let Err(te) = terminate_instances(&self.ctx, std::slice::from_ref(&provider_id)).await {
                error!(provider_id = %provider_id, error = %te, "[OnDemand] could not terminate untagged instance");
            }
            return Err(e);
        }
        Ok(provider_id)
    }
}

#[async_trait]
impl AllocationStrategy for OnDemandStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OnDemand
    }

    fn id_resolution(&self) -> IdResolution {
        IdResolution::ByOwnershipTag
    }

    async fn allocate(
        &self,
        template: &Template,
        virtual_ids: &[VirtualInstanceId],
        min_count: usize,
    ) -> Result<Allocation> {
        let requested = virtual_ids.len();
        let existing = self
            .ctx
            .reconciler
            .find(virtual_ids, IdResolution::ByOwnershipTag, Some(template))
            .await?;

        let mut launched: Vec<Launched> = Vec::new();
        let mut launch_errors: Vec<OrchestratorError> = Vec::new();
        let mut limit_hit = false;

        for virtual_id in virtual_ids {
            if let Some(rec) = existing.get(virtual_id).filter(|r| !r.is_terminal()) {
                info!(
                    virtual_id = %virtual_id,
                    provider_id = %rec.provider_id,
                    "[OnDemand] instance already exists, reusing"
                );
                launched.push(Launched {
                    virtual_id: virtual_id.clone(),
                    provider_id: rec.provider_id.clone(),
                });
                continue;
            }
            if limit_hit {
                continue;
            }
            match self.launch_one(template, virtual_id).await {
                Ok(provider_id) => launched.push(Launched {
                    virtual_id: virtual_id.clone(),
                    provider_id,
                }),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    if matches!(e, OrchestratorError::ResourceLimitExceeded { .. }) {
                        warn!(error = %e, "[OnDemand] limit reached, no further launches");
                        limit_hit = true;
                    } else {
                        warn!(virtual_id = %virtual_id, error = %e, "[OnDemand] launch failed");
                    }
                    launch_errors.push(e);
                }
            }
        }

        let ids: Vec<VirtualInstanceId> = launched.iter().map(|l| l.virtual_id.clone()).collect();
        let found = if ids.is_empty() {
            Default::default()
        } else {
            self.ctx
                .reconciler
                .wait_until_found(
                    &ids,
                    IdResolution::ByOwnershipTag,
                    Some(template),
                    |r| r.state == InstanceState::Running,
                    self.ctx.settings.instance_wait_timeout,
                )
                .await?
        };
        let (ready, failed) = partition_ready(&launched, &found);

        if ready.len() < min_count {
            let all: Vec<ProviderInstanceId> = launched.iter().map(|l| l.provider_id.clone()).collect();
            warn!(
                ready = ready.len(),
                min_count,
                "[OnDemand] below minimum, releasing every launched instance"
            );
            let rollback = terminate_instances(&self.ctx, &all).await;
            return Err(shortfall_error(requested, min_count, ready.len(), launch_errors, rollback));
        }

        // Never release an instance that is also being handed back.
        let kept: BTreeSet<&ProviderInstanceId> = ready.iter().map(|r| &r.provider_id).collect();
        let ids: Vec<ProviderInstanceId> = failed
            .iter()
            .map(|l| l.provider_id.clone())
            .filter(|id| !kept.contains(id))
            .collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), "[OnDemand] releasing instances that never became ready");
            terminate_instances(&self.ctx, &ids).await?;
        }

        Ok(Allocation {
            instances: ready,
            requested,
            min_count,
        })
    }

    async fn delete(&self, template: Option<&Template>, ids: &[VirtualInstanceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let found = self
            .ctx
            .reconciler
            .find(ids, IdResolution::ByOwnershipTag, template)
            .await?;
        let live: Vec<ProviderInstanceId> = found
            .live_instances()
            .map(|r| r.provider_id.clone())
            .collect();
        if live.is_empty() {
            info!(requested = ids.len(), "[OnDemand] nothing left to delete");
            return Ok(());
        }
        terminate_instances(&self.ctx, &live).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_token_is_bounded_and_stable() {
        let t = Template::new(&"x".repeat(80), "ami-1", "m5.large");
        let id = VirtualInstanceId::from("vm-1");
        let a = client_token(&t, &id);
        assert_eq!(a.len(), MAX_CLIENT_TOKEN_LEN);
        assert_eq!(a, client_token(&t, &id));
    }

    #[test]
    fn client_token_keeps_ids_apart_under_long_template_names() {
        let t = Template::new(&"a".repeat(200), "ami-1", "m5.large");
        let tokens: BTreeSet<String> = (1..=3)
            .map(|i| client_token(&t, &VirtualInstanceId::from(format!("vm-{}", i))))
            .collect();
        assert_eq!(tokens.len(), 3);

        // The separator keeps (name, id) pairs from colliding by concatenation.
        let ab = client_token(&Template::new("ab", "ami-1", "m5.large"), &VirtualInstanceId::from("c"));
        let a_bc = client_token(&Template::new("a", "ami-1", "m5.large"), &VirtualInstanceId::from("bc"));
        assert_ne!(ab, a_bc);
    }
}
