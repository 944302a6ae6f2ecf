use async_trait::async_trait;
use skyforge_common::{InstanceState, ProviderInstanceId, Template, VirtualInstanceId};
use skyforge_providers::inventory::{DescribedSpotRequest, SpotRequest, SpotRequestFilter};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use super::{
    launch_request, partition_ready, shortfall_error, terminate_instances, Allocation,
    AllocationStrategy, Launched, StrategyContext, StrategyKind,
};
use crate::errors::{OrchestratorError, Result};
use crate::reconciliation::IdResolution;
use crate::retry::{retry_until, RetryError};

pub struct SpotStrategy {
    ctx: StrategyContext,
}

impl SpotStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    async fn describe_requests(&self, request_ids: &[String]) -> Result<Vec<DescribedSpotRequest>> {
        let mut out = Vec::with_capacity(request_ids.len());
        for batch in request_ids.chunks(self.ctx.settings.instance_id_batch_size.max(1)) {
            let found = self
                .ctx
                .client
                .describe_spot_requests(&SpotRequestFilter::RequestIds(batch.to_vec()))
                .await?;
            out.extend(found);
        }
        Ok(out)
    }

    /// Poll until every request is fulfilled or finished. At the deadline the
    /// last snapshot is returned; whatever is still open is the caller's to
    /// cancel.
    async fn wait_for_fulfillment(&self, request_ids: &[String]) -> Result<Vec<DescribedSpotRequest>> {
        let latest: Mutex<Vec<DescribedSpotRequest>> = Mutex::new(Vec::new());
        let outcome = retry_until(
            "spot_fulfillment",
            self.ctx.policy(self.ctx.settings.spot_fulfillment_timeout).deadline(),
            self.ctx.settings.retry_backoff,
            &self.ctx.cancel,
            OrchestratorError::is_retryable,
            |attempt| {
                let latest = &latest;
                async move {
                    let requests = self.describe_requests(request_ids).await?;
                    let open = requests
                        .iter()
                        .filter(|r| !r.is_fulfilled() && !r.is_finished())
                        .count();
                    *latest.lock().unwrap_or_else(PoisonError::into_inner) = requests;
                    if open == 0 {
                        return Ok(());
                    }
                    debug!(attempt, open, "[Spot] waiting for fulfillment");
                    Err(OrchestratorError::Transient(format!("{} spot request(s) open", open)))
                }
            },
        )
        .await;

        let latest = latest.into_inner().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) => Ok(latest),
            Err(RetryError::DeadlineExceeded { attempts, .. }) => {
                warn!(attempts, "[Spot] fulfillment timed out");
                Ok(latest)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel_requests(&self, request_ids: &[String]) -> Result<()> {
        if request_ids.is_empty() {
            return Ok(());
        }
        let mut errors = Vec::new();
        for batch in request_ids.chunks(self.ctx.settings.instance_id_batch_size.max(1)) {
            match self.ctx.client.cancel_spot_requests(batch).await {
                Ok(()) => info!(count = batch.len(), "[Spot] cancelled requests"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(error = %e, "[Spot] cancel failed");
                    errors.push(e.into());
                }
            }
        }
        OrchestratorError::aggregate(errors)
    }

    /// Cancel the requests and terminate the instances of `entries`. Both
    /// halves are attempted.
    async fn release(&self, entries: &[SpotLaunch]) -> Result<()> {
        let request_ids: Vec<String> = entries.iter().filter_map(|e| e.request_id.clone()).collect();
        let instance_ids: Vec<ProviderInstanceId> = entries
            .iter()
            .filter_map(|e| e.provider_id.clone())
            .collect();

        let mut errors = Vec::new();
        if let Err(e) = self.cancel_requests(&request_ids).await {
            errors.push(e);
        }
        if !instance_ids.is_empty() {
            if let Err(e) = terminate_instances(&self.ctx, &instance_ids).await {
                errors.push(e);
            }
        }
        OrchestratorError::aggregate(errors)
    }
}

#[derive(Debug, Clone)]
struct SpotLaunch {
    virtual_id: VirtualInstanceId,
    request_id: Option<String>,
    provider_id: Option<ProviderInstanceId>,
}

#[async_trait]
impl AllocationStrategy for SpotStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Spot
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
        let spot = template.spot.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!("template '{}' has no spot settings", template.name))
        })?;
        let requested = virtual_ids.len();
        let existing = self
            .ctx
            .reconciler
            .find(virtual_ids, IdResolution::ByOwnershipTag, Some(template))
            .await?;

        let mut entries: Vec<SpotLaunch> = Vec::new();
        let mut launch_errors: Vec<OrchestratorError> = Vec::new();
        let mut limit_hit = false;
        let launch = launch_request(&self.ctx, template, BTreeMap::new()).await?;

        for virtual_id in virtual_ids {
            if let Some(rec) = existing.get(virtual_id).filter(|r| !r.is_terminal()) {
                info!(virtual_id = %virtual_id, provider_id = %rec.provider_id, "[Spot] instance already exists, reusing");
                entries.push(SpotLaunch {
                    virtual_id: virtual_id.clone(),
                    request_id: None,
                    provider_id: Some(rec.provider_id.clone()),
                });
                continue;
            }
            if limit_hit {
                continue;
            }
            let request = SpotRequest {
                launch: launch.clone(),
                max_price: spot.max_price.clone(),
                block_duration_minutes: spot.block_duration_minutes,
                request_tags: self.ctx.tagger.managed_tags(virtual_id, template),
            };
            match self.ctx.client.request_spot_instance(&request).await {
                Ok(request_id) => {
                    info!(virtual_id = %virtual_id, request_id = %request_id, "[Spot] request placed");
                    entries.push(SpotLaunch {
                        virtual_id: virtual_id.clone(),
                        request_id: Some(request_id),
                        provider_id: None,
                    });
                }
                Err(e) => {
                    let e = OrchestratorError::from(e);
                    if matches!(e, OrchestratorError::ResourceLimitExceeded { .. }) {
                        warn!(error = %e, "[Spot] limit reached, no further requests");
                        limit_hit = true;
                    } else {
                        warn!(virtual_id = %virtual_id, error = %e, "[Spot] request failed");
                    }
                    launch_errors.push(e);
                }
            }
        }

        let request_ids: Vec<String> = entries.iter().filter_map(|e| e.request_id.clone()).collect();
        if !request_ids.is_empty() {
            let snapshot = match self.wait_for_fulfillment(&request_ids).await {
                Ok(s) => s,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(error = %e, "[Spot] polling failed, releasing requests");
                    let rollback = self.release(&entries).await;
                    return Err(match rollback {
                        Ok(()) => e,
                        Err(r) => OrchestratorError::Aggregate(vec![e, r]),
                    });
                }
            };
            let by_id: BTreeMap<&str, &DescribedSpotRequest> =
                snapshot.iter().map(|r| (r.request_id.as_str(), r)).collect();

            let mut unfulfilled = Vec::new();
            for entry in entries.iter_mut() {
                let Some(request_id) = entry.request_id.clone() else {
                    continue;
                };
                match by_id.get(request_id.as_str()) {
                    Some(r) if r.is_fulfilled() => {
                        entry.provider_id = r.instance_id.clone().map(ProviderInstanceId::from);
                    }
                    other => {
                        let status = other.and_then(|r| r.status_code.clone()).unwrap_or_default();
                        warn!(virtual_id = %entry.virtual_id, request_id = %request_id, status, "[Spot] request not fulfilled");
                        unfulfilled.push(request_id);
                    }
                }
            }
            if let Err(e) = self.cancel_requests(&unfulfilled).await {
                warn!(error = %e, "[Spot] could not cancel unfulfilled requests");
            }
        }

        // Instances do not inherit request tags.
        let mut tagged: Vec<Launched> = Vec::new();
        let mut untagged: Vec<SpotLaunch> = Vec::new();
        for entry in &entries {
            let Some(provider_id) = &entry.provider_id else {
                continue;
            };
            if entry.request_id.is_none() {
                tagged.push(Launched {
                    virtual_id: entry.virtual_id.clone(),
                    provider_id: provider_id.clone(),
                });
                continue;
            }
            let result = self
                .ctx
                .tagger
                .tag(
                    self.ctx.client.as_ref(),
                    provider_id,
                    &entry.virtual_id,
                    template,
                    self.ctx.policy(self.ctx.settings.tagging_timeout),
                    &self.ctx.cancel,
                )
                .await;
            match result {
                Ok(()) => tagged.push(Launched {
                    virtual_id: entry.virtual_id.clone(),
                    provider_id: provider_id.clone(),
                }),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(provider_id = %provider_id, error = %e, "[Spot] tagging failed");
                    untagged.push(entry.clone());
                    launch_errors.push(e);
                }
            }
        }
        if !untagged.is_empty() {
            if let Err(e) = self.release(&untagged).await {
                error!(error = %e, "[Spot] could not release untagged instances");
            }
        }

        let ids: Vec<VirtualInstanceId> = tagged.iter().map(|l| l.virtual_id.clone()).collect();
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
        let (ready, failed) = partition_ready(&tagged, &found);

        if ready.len() < min_count {
            warn!(ready = ready.len(), min_count, "[Spot] below minimum, releasing everything");
            let rollback = self.release(&entries).await;
            return Err(shortfall_error(requested, min_count, ready.len(), launch_errors, rollback));
        }

        if !failed.is_empty() {
            let failed_ids: BTreeSet<&VirtualInstanceId> = failed.iter().map(|l| &l.virtual_id).collect();
            let to_release: Vec<SpotLaunch> = entries
                .iter()
                .filter(|e| failed_ids.contains(&e.virtual_id))
                .cloned()
                .collect();
            self.release(&to_release).await?;
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
        let mut errors = Vec::new();
        let mut request_ids = Vec::new();
        let mut instance_ids: BTreeSet<ProviderInstanceId> = BTreeSet::new();

        let key = self.ctx.tagger.ownership_key().to_string();
        for batch in ids.chunks(self.ctx.settings.tag_filter_batch_size.max(1)) {
            let filter = SpotRequestFilter::TagValues {
                key: key.clone(),
                values: batch.iter().map(|id| id.as_str().to_string()).collect(),
            };
            match self.ctx.client.describe_spot_requests(&filter).await {
                Ok(requests) => {
                    for r in requests {
                        if let Some(instance_id) = &r.instance_id {
                            instance_ids.insert(ProviderInstanceId::from(instance_id.clone()));
                        }
                        if !r.is_finished() {
                            request_ids.push(r.request_id);
                        }
                    }
                }
                Err(e) => errors.push(e.into()),
            }
        }
        if let Err(e) = self.cancel_requests(&request_ids).await {
            errors.push(e);
        }

        match self.ctx.reconciler.find(ids, IdResolution::ByOwnershipTag, template).await {
            Ok(found) => instance_ids.extend(found.live_instances().map(|r| r.provider_id.clone())),
            Err(e) => errors.push(e),
        }
        if !instance_ids.is_empty() {
            let instance_ids: Vec<ProviderInstanceId> = instance_ids.into_iter().collect();
            if let Err(e) = terminate_instances(&self.ctx, &instance_ids).await {
                errors.push(e);
            }
        }
        OrchestratorError::aggregate(errors)
    }
}
