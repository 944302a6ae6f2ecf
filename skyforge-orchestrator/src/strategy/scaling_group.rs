use async_trait::async_trait;
use skyforge_common::{InstanceState, ProviderInstanceId, Template, VirtualInstanceId};
use skyforge_providers::codes;
use skyforge_providers::inventory::{DescribedScalingGroup, ScalingGroupRequest};
use skyforge_providers::ProviderError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::{
    launch_request, partition_ready, shortfall_error, Allocation, AllocationStrategy, Launched,
    StrategyContext, StrategyKind,
};
use crate::errors::{OrchestratorError, Result};
use crate::reconciliation::IdResolution;
use crate::retry::{retry_until, RetryError};
use crate::state_machine::{is_in_service, is_leaving_group};

/// Capacity handed to a cloud-managed group. Members are known only by
/// provider id, so the virtual id of every returned record is its provider
/// id.
pub struct ScalingGroupStrategy {
    ctx: StrategyContext,
}

fn group_name(template: &Template) -> Result<&str> {
    template
        .scaling_group
        .as_ref()
        .map(|g| g.group_name.as_str())
        .ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!("template '{}' names no scaling group", template.name))
        })
}

fn group_not_found(name: &str) -> OrchestratorError {
    ProviderError::api(codes::SCALING_GROUP_NOT_FOUND, format!("group '{}' not found", name)).into()
}

impl ScalingGroupStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    /// Wait until `count` members that were not in `known` are in service.
    async fn wait_for_members(&self, name: &str, known: &BTreeSet<String>, count: usize) -> Result<Vec<String>> {
        let latest: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let outcome = retry_until(
            "scaling_group_members",
            self.ctx.policy(self.ctx.settings.group_wait_timeout).deadline(),
            self.ctx.settings.retry_backoff,
            &self.ctx.cancel,
            OrchestratorError::is_retryable,
            |attempt| {
                let latest = &latest;
                async move {
                    let group = self
                        .ctx
                        .client
                        .describe_scaling_group(name)
                        .await?
                        .ok_or_else(|| group_not_found(name))?;
                    let fresh: Vec<_> = group
                        .instances
                        .iter()
                        .filter(|m| !known.contains(&m.instance_id) && !is_leaving_group(m))
                        .collect();
                    let in_service = fresh.iter().filter(|m| is_in_service(m)).count();
                    *latest.lock().unwrap_or_else(PoisonError::into_inner) =
                        fresh.iter().map(|m| m.instance_id.clone()).collect();
                    if in_service >= count {
                        return Ok(());
                    }
                    debug!(attempt, in_service, count, "[ScalingGroup] waiting for members");
                    Err(OrchestratorError::Transient(format!(
                        "{} of {} member(s) in service",
                        in_service, count
                    )))
                }
            },
        )
        .await;

        let latest = latest.into_inner().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) => Ok(latest),
            Err(RetryError::DeadlineExceeded { attempts, .. }) => {
                warn!(group = name, attempts, members = latest.len(), "[ScalingGroup] members did not all come up");
                Ok(latest)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Terminate members while shrinking the group so it does not replace
    /// them. Members already gone are skipped.
    async fn release(&self, instance_ids: &[String]) -> Result<()> {
        let mut errors = Vec::new();
        for id in instance_ids {
            match self.ctx.client.terminate_in_scaling_group(id, true).await {
                Ok(()) => info!(provider_id = %id, "[ScalingGroup] member terminated"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(provider_id = %id, error = %e, "[ScalingGroup] terminate failed");
                    errors.push(e.into());
                }
            }
        }
        OrchestratorError::aggregate(errors)
    }

    /// Bring desired capacity to `target` and delete the group once it is
    /// empty and nothing is left to keep.
    async fn settle_capacity(&self, name: &str, target: u32, delete_when_empty: bool) -> Result<()> {
        let Some(group) = self.ctx.client.describe_scaling_group(name).await? else {
            return Ok(());
        };
        if group.desired_capacity != target {
            self.ctx.client.set_scaling_group_capacity(name, target, None).await?;
            info!(group = name, desired = target, "[ScalingGroup] desired capacity adjusted");
        }
        if !delete_when_empty || target > 0 {
            return Ok(());
        }

        // Membership only reflects the new capacity on the next describe.
        let Some(group) = self.ctx.client.describe_scaling_group(name).await? else {
            return Ok(());
        };
        if !group.instances.iter().all(is_leaving_group) {
            info!(group = name, members = group.instances.len(), "[ScalingGroup] group not empty, kept");
            return Ok(());
        }
        match self.ctx.client.delete_scaling_group(name).await {
            Ok(()) => info!(group = name, "[ScalingGroup] empty group deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn grow(&self, name: &str, template: &Template, count: u32) -> Result<Option<DescribedScalingGroup>> {
        let before = self.ctx.client.describe_scaling_group(name).await?;
        match &before {
            Some(group) => {
                let desired = group.desired_capacity + count;
                let max_size = group.max_size.max(desired);
                self.ctx
                    .client
                    .set_scaling_group_capacity(name, desired, Some(max_size))
                    .await?;
                info!(group = name, desired, max_size, "[ScalingGroup] desired capacity raised");
            }
            None => {
                let mut tags = BTreeMap::new();
                tags.insert(self.ctx.tagger.keys().template.clone(), template.name.clone());
                tags.extend(template.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
                let launch = launch_request(&self.ctx, template, tags).await?;
                self.ctx
                    .client
                    .create_scaling_group(&ScalingGroupRequest {
                        group_name: name.to_string(),
                        launch,
                        min_size: 0,
                        max_size: count,
                        desired_capacity: count,
                    })
                    .await?;
                info!(group = name, desired = count, "[ScalingGroup] group created");
            }
        }
        Ok(before)
    }
}

#[async_trait]
impl AllocationStrategy for ScalingGroupStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ScalingGroup
    }

    fn id_resolution(&self) -> IdResolution {
        IdResolution::ByProviderId
    }

    async fn allocate(
        &self,
        template: &Template,
        virtual_ids: &[VirtualInstanceId],
        min_count: usize,
    ) -> Result<Allocation> {
        let name = group_name(template)?;
        let requested = virtual_ids.len();
        debug!(group = name, requested, "[ScalingGroup] virtual ids are replaced by provider ids");

        let before = self.grow(name, template, requested as u32).await?;
        let base_desired = before.as_ref().map(|g| g.desired_capacity).unwrap_or(0);
        let known: BTreeSet<String> = before
            .iter()
            .flat_map(|g| g.instances.iter().map(|m| m.instance_id.clone()))
            .collect();

        let members = self.wait_for_members(name, &known, requested).await?;
        let launched: Vec<Launched> = members
            .iter()
            .map(|id| Launched {
                virtual_id: VirtualInstanceId::from(id.as_str()),
                provider_id: ProviderInstanceId::from(id.as_str()),
            })
            .collect();
        let ids: Vec<VirtualInstanceId> = launched.iter().map(|l| l.virtual_id.clone()).collect();
        let found = if ids.is_empty() {
            Default::default()
        } else {
            self.ctx
                .reconciler
                .wait_until_found(
                    &ids,
                    IdResolution::ByProviderId,
                    Some(template),
                    |r| r.state == InstanceState::Running,
                    self.ctx.settings.instance_wait_timeout,
                )
                .await?
        };
        let (mut ready, failed) = partition_ready(&launched, &found);
        ready.truncate(requested);

        if ready.len() < min_count {
            warn!(group = name, ready = ready.len(), min_count, "[ScalingGroup] below minimum, releasing new members");
            let mut rollback = self.release(&members).await;
            if rollback.is_ok() {
                rollback = self.settle_capacity(name, base_desired, before.is_none()).await;
            }
            return Err(shortfall_error(requested, min_count, ready.len(), Vec::new(), rollback));
        }

        let kept: BTreeSet<&str> = ready.iter().map(|r| r.provider_id.as_str()).collect();
        let extra: Vec<String> = failed
            .iter()
            .map(|l| l.provider_id.as_str().to_string())
            .chain(members.iter().filter(|m| !kept.contains(m.as_str())).cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !extra.is_empty() {
            self.release(&extra).await?;
        }
        self.settle_capacity(name, base_desired + ready.len() as u32, false).await?;

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
        let members: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let mut errors = Vec::new();
        if let Err(e) = self.release(&members).await {
            errors.push(e);
        }

        if let Some(name) = template.and_then(|t| t.scaling_group.as_ref()).map(|g| g.group_name.as_str()) {
            match self.ctx.client.describe_scaling_group(name).await {
                Ok(Some(group)) if group.desired_capacity == 0 => {
                    if let Err(e) = self.settle_capacity(name, 0, true).await {
                        errors.push(e);
                    }
                }
                Ok(_) => {}
                Err(e) => errors.push(e.into()),
            }
        }
        OrchestratorError::aggregate(errors)
    }
}
