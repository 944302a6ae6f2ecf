//! How capacity is requested from the cloud.
//!
//! One implementation per launch model, picked by a pure function of the
//! template: scaling group first, then spot, then plain on-demand.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skyforge_common::{InstanceRecord, InstanceState, ProviderInstanceId, Template, VirtualInstanceId};
use skyforge_providers::inventory::{BlockDeviceMapping, LaunchRequest};
use skyforge_providers::CloudComputeClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::reconciliation::{IdResolution, InstanceReconciler, Resolution};
use crate::retry::{Cancellation, RetryPolicy};
use crate::settings::Settings;
use crate::tagging::IdentityTagger;
use crate::volumes;

pub mod on_demand;
pub mod scaling_group;
pub mod spot;

pub use on_demand::OnDemandStrategy;
pub use scaling_group::ScalingGroupStrategy;
pub use spot::SpotStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    OnDemand,
    Spot,
    ScalingGroup,
}

impl StrategyKind {
    /// Unknown templates get on-demand semantics.
    pub fn for_template(template: Option<&Template>) -> Self {
        match template {
            Some(t) if t.is_automatic() => StrategyKind::ScalingGroup,
            Some(t) if t.uses_spot() => StrategyKind::Spot,
            _ => StrategyKind::OnDemand,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::OnDemand => "on-demand",
            StrategyKind::Spot => "spot",
            StrategyKind::ScalingGroup => "scaling-group",
        }
    }
}

/// Where data volumes get created for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAttachMode {
    None,
    /// Block-device mappings in the launch call, deleted with the instance.
    AtLaunch,
    /// Created and attached after launch. Needed when volumes carry their
    /// own KMS key and the launch API of the target region cannot express it.
    Separate,
}

impl VolumeAttachMode {
    pub fn for_template(template: &Template) -> Self {
        if template.volumes.is_empty() {
            return VolumeAttachMode::None;
        }
        let keyed = template.volumes.iter().any(|v| v.kms_key_id.is_some());
        if keyed && !template.launch_supports_volume_kms {
            VolumeAttachMode::Separate
        } else {
            VolumeAttachMode::AtLaunch
        }
    }
}

/// Instances a strategy produced for one allocation.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub instances: Vec<InstanceRecord>,
    pub requested: usize,
    pub min_count: usize,
}

#[async_trait]
pub trait AllocationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn id_resolution(&self) -> IdResolution;

    /// Request capacity for `virtual_ids` and return the instances that came
    /// up Running. Fails, after releasing everything it launched, when fewer
    /// than `min_count` did.
    async fn allocate(
        &self,
        template: &Template,
        virtual_ids: &[VirtualInstanceId],
        min_count: usize,
    ) -> Result<Allocation>;

    /// Tear down `ids`. Every id is attempted; errors are aggregated.
    /// Already-absent resources are not an error.
    async fn delete(&self, template: Option<&Template>, ids: &[VirtualInstanceId]) -> Result<()>;
}

/// Shared handles for the strategies and the volume workflow.
#[derive(Clone)]
pub struct StrategyContext {
    pub client: Arc<dyn CloudComputeClient>,
    pub reconciler: Arc<InstanceReconciler>,
    pub tagger: IdentityTagger,
    pub settings: Arc<Settings>,
    pub cancel: Cancellation,
}

impl StrategyContext {
    pub fn new(client: Arc<dyn CloudComputeClient>, settings: Arc<Settings>, cancel: Cancellation) -> Self {
        let tagger = IdentityTagger::new(settings.tag_keys.clone());
        let reconciler = Arc::new(InstanceReconciler::new(
            client.clone(),
            tagger.clone(),
            &settings,
            cancel.clone(),
        ));
        Self {
            client,
            reconciler,
            tagger,
            settings,
            cancel,
        }
    }

    pub fn policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::new(self.settings.retry_backoff, timeout)
    }
}

pub fn build_strategy(kind: StrategyKind, ctx: StrategyContext) -> Box<dyn AllocationStrategy> {
    match kind {
        StrategyKind::OnDemand => Box::new(OnDemandStrategy::new(ctx)),
        StrategyKind::Spot => Box::new(SpotStrategy::new(ctx)),
        StrategyKind::ScalingGroup => Box::new(ScalingGroupStrategy::new(ctx)),
    }
}

/// Launch parameters shared by every strategy. Volumes only appear here
/// when the template routes them through the launch call.
pub(crate) async fn launch_request(
    ctx: &StrategyContext,
    template: &Template,
    tags: BTreeMap<String, String>,
) -> Result<LaunchRequest> {
    let block_device_mappings = match VolumeAttachMode::for_template(template) {
        VolumeAttachMode::AtLaunch => {
            let names = volumes::data_device_names(
                ctx.client.as_ref(),
                template,
                &ctx.settings.device_name_prefix,
            )
            .await?;
            template
                .volumes
                .iter()
                .zip(names)
                .map(|(spec, device_name)| BlockDeviceMapping {
                    device_name,
                    size_gib: spec.size_gib,
                    volume_type: spec.volume_type.clone(),
                    iops: spec.iops,
                    throughput_mibps: spec.throughput_mibps,
                    encrypted: spec.encrypted,
                    kms_key_id: spec.kms_key_id.clone(),
                    delete_on_termination: true,
                })
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(LaunchRequest {
        image_id: template.image_id.clone(),
        instance_type: template.instance_type.clone(),
        subnet_id: template.subnet_id.clone(),
        security_group_ids: template.security_group_ids.clone(),
        key_name: template.key_name.clone(),
        availability_zone: template.availability_zone.clone(),
        client_token: None,
        count: 1,
        tags,
        block_device_mappings,
    })
}

/// A provider instance launched on behalf of a virtual id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Launched {
    pub virtual_id: VirtualInstanceId,
    pub provider_id: ProviderInstanceId,
}

/// Split launched instances into the ones observed Running and the rest.
pub(crate) fn partition_ready(
    launched: &[Launched],
    found: &Resolution,
) -> (Vec<InstanceRecord>, Vec<Launched>) {
    let mut ready = Vec::new();
    let mut failed = Vec::new();
    for l in launched {
        match found.get(&l.virtual_id) {
            Some(rec) if rec.provider_id == l.provider_id && rec.state == InstanceState::Running => {
                ready.push(rec.clone())
            }
            _ => failed.push(l.clone()),
        }
    }
    (ready, failed)
}

/// Error reported when fewer than `min_count` instances survived.
///
/// A quota error seen while launching wins over the generic shortfall so the
/// caller keeps the provider code. A failed rollback is reported alongside.
pub(crate) fn shortfall_error(
    requested: usize,
    min_count: usize,
    acquired: usize,
    launch_errors: Vec<OrchestratorError>,
    rollback: Result<()>,
) -> OrchestratorError {
    let primary = launch_errors
        .into_iter()
        .find(|e| matches!(e, OrchestratorError::ResourceLimitExceeded { .. }))
        .unwrap_or(OrchestratorError::InsufficientCapacity {
            requested,
            min_count,
            acquired,
        });
    match rollback {
        Ok(()) => primary,
        Err(e) => OrchestratorError::Aggregate(vec![primary, e]),
    }
}

/// Terminate instances in id batches. Ids the provider no longer knows are
/// skipped; every batch is attempted.
pub(crate) async fn terminate_instances(ctx: &StrategyContext, ids: &[ProviderInstanceId]) -> Result<()> {
    let mut errors = Vec::new();
    for batch in ids.chunks(ctx.settings.instance_id_batch_size.max(1)) {
        let batch: Vec<String> = batch.iter().map(|id| id.as_str().to_string()).collect();
        match ctx.client.terminate_instances(&batch).await {
            Ok(()) => info!(count = batch.len(), "[Allocation] terminated instances"),
            Err(e) if e.is_not_found() => {
                // One unknown id fails the whole call; fall back to one at a time.
                for id in batch {
                    match ctx.client.terminate_instances(std::slice::from_ref(&id)).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            warn!(provider_id = %id, error = %e, "[Allocation] terminate failed");
                            errors.push(e.into());
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "[Allocation] terminate batch failed");
                errors.push(e.into());
            }
        }
    }
    OrchestratorError::aggregate(errors)
}
