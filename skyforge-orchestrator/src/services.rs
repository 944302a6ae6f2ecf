//! Entry points used by callers: allocate, delete and report on instances
//! of a template.

use serde_json::json;
use skyforge_common::{InstanceRecord, InstanceStatus, Template, VirtualInstanceId};
use skyforge_providers::{ClientConfig, ClientProvider, CloudComputeClient};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::{OrchestratorError, Result};
use crate::logger::ActionLog;
use crate::retry::Cancellation;
use crate::settings::Settings;
use crate::state_machine::portable_status;
use crate::strategy::{build_strategy, StrategyContext, StrategyKind, VolumeAttachMode};
use crate::volumes::EbsVolumeOrchestrator;

pub struct AllocationOrchestrator {
    clients: ClientProvider<dyn CloudComputeClient>,
    config: ClientConfig,
    settings: Arc<Settings>,
    cancel: Cancellation,
}

fn check_ids(ids: &[VirtualInstanceId]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "virtual instance ids must not be empty".to_string(),
            ));
        }
        if !seen.insert(id) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "virtual instance id '{}' requested twice",
                id
            )));
        }
    }
    Ok(())
}

impl AllocationOrchestrator {
    pub fn new(
        clients: ClientProvider<dyn CloudComputeClient>,
        config: ClientConfig,
        settings: Settings,
        cancel: Cancellation,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            clients,
            config,
            settings: Arc::new(settings),
            cancel,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn context(&self) -> Result<StrategyContext> {
        let client = self.clients.get_client(&self.config, true).await?;
        Ok(StrategyContext::new(client, self.settings.clone(), self.cancel.clone()))
    }

    /// Bring up one instance per virtual id and return the ones that made it.
    ///
    /// Fails when fewer than `min_count` instances end up usable; nothing
    /// launched by the call is left behind in that case.
    pub async fn allocate(
        &self,
        template: &Template,
        virtual_ids: &[VirtualInstanceId],
        min_count: usize,
    ) -> Result<Vec<InstanceRecord>> {
        template.validate(&self.settings.tag_keys)?;
        check_ids(virtual_ids)?;
        if min_count > virtual_ids.len() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "min_count {} exceeds the {} instance(s) requested",
                min_count,
                virtual_ids.len()
            )));
        }
        if virtual_ids.is_empty() {
            return Ok(Vec::new());
        }

        let kind = StrategyKind::for_template(Some(template));
        let attach_mode = VolumeAttachMode::for_template(template);
        let log = ActionLog::start(
            "ALLOCATE",
            json!({
                "template": template.name,
                "strategy": kind,
                "count": virtual_ids.len(),
                "min_count": min_count,
                "volumes": template.volumes.len(),
                "separate_volumes": attach_mode == VolumeAttachMode::Separate,
            }),
        );

        let result = self.run_allocate(template, virtual_ids, min_count, kind, attach_mode).await;
        log.finish(&result);
        result
    }

    /// Tear down the instances behind `virtual_ids`. Ids with nothing behind
    /// them are fine. Without a template, on-demand semantics apply.
    pub async fn delete(&self, template: Option<&Template>, virtual_ids: &[VirtualInstanceId]) -> Result<()> {
        if virtual_ids.is_empty() {
            debug!("[Allocation] delete called with no ids");
            return Ok(());
        }
        let kind = StrategyKind::for_template(template);
        let log = ActionLog::start(
            "DELETE",
            json!({
                "template": template.map(|t| t.name.as_str()),
                "strategy": kind,
                "count": virtual_ids.len(),
            }),
        );

        let result = match self.context().await {
            Ok(ctx) => build_strategy(kind, ctx).delete(template, virtual_ids).await,
            Err(e) => Err(e),
        };
        log.finish(&result);
        result
    }

    /// Portable status for every requested id; ids with no instance behind
    /// them are `Unknown`.
    pub async fn get_state(
        &self,
        template: Option<&Template>,
        virtual_ids: &[VirtualInstanceId],
    ) -> Result<BTreeMap<VirtualInstanceId, InstanceStatus>> {
        if virtual_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let kind = StrategyKind::for_template(template);
        let log = ActionLog::start(
            "GET_STATE",
            json!({
                "template": template.map(|t| t.name.as_str()),
                "count": virtual_ids.len(),
            }),
        );

        let result = self.run_get_state(kind, template, virtual_ids).await;
        log.finish(&result);
        result
    }

    async fn run_allocate(
        &self,
        template: &Template,
        virtual_ids: &[VirtualInstanceId],
        min_count: usize,
        kind: StrategyKind,
        attach_mode: VolumeAttachMode,
    ) -> Result<Vec<InstanceRecord>> {
        let ctx = self.context().await?;
        let strategy = build_strategy(kind, ctx.clone());
        let allocation = strategy.allocate(template, virtual_ids, min_count).await?;
        info!(
            template = %template.name,
            strategy = kind.as_str(),
            acquired = allocation.instances.len(),
            requested = allocation.requested,
            "[Allocation] instances acquired"
        );
        if attach_mode != VolumeAttachMode::Separate {
            return Ok(allocation.instances);
        }
        EbsVolumeOrchestrator::new(ctx)
            .allocate_volumes(template, allocation.instances, min_count, strategy.as_ref())
            .await
    }

    async fn run_get_state(
        &self,
        kind: StrategyKind,
        template: Option<&Template>,
        virtual_ids: &[VirtualInstanceId],
    ) -> Result<BTreeMap<VirtualInstanceId, InstanceStatus>> {
        let ctx = self.context().await?;
        let mode = build_strategy(kind, ctx.clone()).id_resolution();
        let found = ctx.reconciler.find(virtual_ids, mode, template).await?;
        Ok(virtual_ids
            .iter()
            .map(|id| {
                let status = found
                    .get(id)
                    .map(|r| portable_status(r.state))
                    .unwrap_or(InstanceStatus::Unknown);
                (id.clone(), status)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_and_blank_ids_are_rejected() {
        assert!(check_ids(&["a".into(), "b".into()]).is_ok());
        assert!(matches!(
            check_ids(&["a".into(), "a".into()]),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert!(matches!(
            check_ids(&["a".into(), " ".into()]),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }
}
