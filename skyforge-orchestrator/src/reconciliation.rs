//! Resolve virtual instance ids to what the provider currently reports.
//!
//! Lookups are batched (separate caps for tag-filter values and for ids),
//! paginated, and sequential. Records are rebuilt from scratch on every
//! call; nothing is cached between calls.

use skyforge_common::{InstanceRecord, InstanceState, ProviderInstanceId, Template, VirtualInstanceId};
use skyforge_providers::inventory::{DescribeInstancesQuery, DescribedInstance, InstanceFilter};
use skyforge_providers::CloudComputeClient;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::retry::{deadline_after, retry_until, Cancellation, RetryError};
use crate::settings::Settings;
use crate::tagging::IdentityTagger;

/// How the ids handed to the reconciler map onto provider instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdResolution {
    /// Ids are virtual ids, found through the ownership tag.
    ByOwnershipTag,
    /// Ids are provider instance ids; the virtual id is the provider id.
    ByProviderId,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub records: BTreeMap<VirtualInstanceId, InstanceRecord>,
    /// Ids for which two live instances were observed.
    pub anomalies: Vec<VirtualInstanceId>,
    /// Records that lost deduplication. Teardown still has to reach them.
    pub shadowed: Vec<InstanceRecord>,
}

impl Resolution {
    pub fn get(&self, id: &VirtualInstanceId) -> Option<&InstanceRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every non-terminal instance observed, including shadowed duplicates.
    pub fn live_instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records
            .values()
            .chain(self.shadowed.iter())
            .filter(|r| !r.is_terminal())
    }

    /// Keep the first record seen for an id unless a live record replaces a
    /// terminal one.
    fn merge(&mut self, id: VirtualInstanceId, incoming: InstanceRecord) {
        let Some(existing) = self.records.get(&id) else {
            self.records.insert(id, incoming);
            return;
        };
        match (existing.is_terminal(), incoming.is_terminal()) {
            (true, false) => {
                debug!(
                    virtual_id = %id,
                    replaced = %existing.provider_id,
                    provider_id = %incoming.provider_id,
                    "[Reconciliation] live instance replaces terminal one"
                );
                if let Some(old) = self.records.insert(id, incoming) {
                    self.shadowed.push(old);
                }
            }
            (false, false) => {
                error!(
                    virtual_id = %id,
                    kept = %existing.provider_id,
                    ignored = %incoming.provider_id,
                    "[Reconciliation] two live instances carry the same id"
                );
                if !self.anomalies.contains(&id) {
                    self.anomalies.push(id);
                }
                self.shadowed.push(incoming);
            }
            _ => self.shadowed.push(incoming),
        }
    }
}

pub fn to_record(instance: &DescribedInstance, virtual_id: VirtualInstanceId) -> InstanceRecord {
    InstanceRecord {
        virtual_id,
        provider_id: ProviderInstanceId::from(instance.instance_id.clone()),
        state: InstanceState::from_provider(&instance.state),
        tags: instance.tags.clone(),
        instance_type: instance.instance_type.clone(),
        image_id: instance.image_id.clone(),
        key_name: instance.key_name.clone(),
        availability_zone: instance.availability_zone.clone(),
        private_ip_address: instance.private_ip_address.clone(),
        launch_time: instance.launch_time,
    }
}

pub struct InstanceReconciler {
    client: Arc<dyn CloudComputeClient>,
    tagger: IdentityTagger,
    tag_filter_batch_size: usize,
    instance_id_batch_size: usize,
    backoff: Duration,
    cancel: Cancellation,
}

impl InstanceReconciler {
    pub fn new(
        client: Arc<dyn CloudComputeClient>,
        tagger: IdentityTagger,
        settings: &Settings,
        cancel: Cancellation,
    ) -> Self {
        Self {
            client,
            tagger,
            tag_filter_batch_size: settings.tag_filter_batch_size.max(1),
            instance_id_batch_size: settings.instance_id_batch_size.max(1),
            backoff: settings.retry_backoff,
            cancel,
        }
    }

    /// Resolve `ids` once. Ids that are not found are simply absent from the
    /// result.
    ///
    /// By ownership tag, a not-found error from the provider is returned as
    /// is (it is retryable). By provider id, a batch that fails with
    /// not-found is re-described one id at a time so the missing ids can be
    /// told apart from the rest.
    pub async fn find(
        &self,
        ids: &[VirtualInstanceId],
        mode: IdResolution,
        template: Option<&Template>,
    ) -> Result<Resolution> {
        let wanted: BTreeSet<&VirtualInstanceId> = ids.iter().filter(|id| !id.is_empty()).collect();
        let mut resolution = Resolution::default();
        if wanted.is_empty() {
            return Ok(resolution);
        }
        let wanted: Vec<&VirtualInstanceId> = wanted.into_iter().collect();

        match mode {
            IdResolution::ByOwnershipTag => {
                let key = self.tagger.ownership_key().to_string();
                for batch in wanted.chunks(self.tag_filter_batch_size) {
                    let filter = InstanceFilter::TagValues {
                        key: key.clone(),
                        values: batch.iter().map(|id| id.as_str().to_string()).collect(),
                    };
                    for instance in self.describe_all(&filter).await? {
                        let virtual_id = self.tagger.resolve_ownership(&instance, template)?;
                        if batch.contains(&&virtual_id) {
                            resolution.merge(virtual_id.clone(), to_record(&instance, virtual_id));
                        }
                    }
                }
            }
            IdResolution::ByProviderId => {
                for batch in wanted.chunks(self.instance_id_batch_size) {
                    let ids: Vec<String> = batch.iter().map(|id| id.as_str().to_string()).collect();
                    for instance in self.describe_ids(ids).await? {
                        let id = VirtualInstanceId::from(instance.instance_id.clone());
                        resolution.merge(id.clone(), to_record(&instance, id));
                    }
                }
            }
        }

        debug!(
            requested = wanted.len(),
            found = resolution.len(),
            mode = ?mode,
            "[Reconciliation] resolved instances"
        );
        Ok(resolution)
    }

    /// Re-run [`find`](Self::find) until every id has a record satisfying
    /// `predicate`, or `timeout` elapses.
    ///
    /// At the deadline the latest snapshot is returned as is, including
    /// records that do not satisfy `predicate`; callers decide what partial
    /// success means. Cancellation is returned as an error.
    pub async fn wait_until_found<P>(
        &self,
        ids: &[VirtualInstanceId],
        mode: IdResolution,
        template: Option<&Template>,
        predicate: P,
        timeout: Duration,
    ) -> Result<Resolution>
    where
        P: Fn(&InstanceRecord) -> bool + Sync,
    {
        let latest = Mutex::new(Resolution::default());

        let outcome = retry_until(
            "wait_until_found",
            deadline_after(timeout),
            self.backoff,
            &self.cancel,
            OrchestratorError::is_retryable,
            |attempt| {
                let latest = &latest;
                let predicate = &predicate;
                async move {
                    let resolution = self.find(ids, mode, template).await?;
                    let pending = ids
                        .iter()
                        .filter(|id| !resolution.get(id).map(predicate).unwrap_or(false))
                        .count();
                    *latest.lock().unwrap_or_else(PoisonError::into_inner) = resolution;
                    if pending == 0 {
                        return Ok(());
                    }
                    debug!(attempt, pending, "[Reconciliation] waiting for instances");
                    Err(OrchestratorError::Transient(format!(
                        "{} of {} instance(s) not ready",
                        pending,
                        ids.len()
                    )))
                }
            },
        )
        .await;

        let latest = latest.into_inner().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) => {
                info!(count = ids.len(), "[Reconciliation] all instances ready");
                Ok(latest)
            }
            Err(RetryError::DeadlineExceeded {
                attempts,
                last_error,
                ..
            }) => {
                warn!(
                    attempts,
                    found = latest.len(),
                    requested = ids.len(),
                    error = %last_error,
                    "[Reconciliation] timed out, returning partial results"
                );
                Ok(latest)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn describe_all(&self, filter: &InstanceFilter) -> Result<Vec<DescribedInstance>> {
        let mut out = Vec::new();
        let mut next_token = None;
        loop {
            let page = self
                .client
                .describe_instances(&DescribeInstancesQuery {
                    filter: filter.clone(),
                    next_token: next_token.take(),
                })
                .await?;
            out.extend(page.items);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(out),
            }
        }
    }

    async fn describe_ids(&self, ids: Vec<String>) -> Result<Vec<DescribedInstance>> {
        match self.describe_all(&InstanceFilter::InstanceIds(ids.clone())).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found() => {
                let mut found = Vec::new();
                for id in ids {
                    match self.describe_all(&InstanceFilter::InstanceIds(vec![id])).await {
                        Ok(items) => found.extend(items),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(found)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(provider_id: &str, state: InstanceState) -> InstanceRecord {
        InstanceRecord {
            virtual_id: VirtualInstanceId::from("vm-1"),
            provider_id: ProviderInstanceId::from(provider_id),
            state,
            tags: BTreeMap::new(),
            instance_type: None,
            image_id: None,
            key_name: None,
            availability_zone: None,
            private_ip_address: None,
            launch_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn running_wins_over_terminated_in_any_order() {
        let id = VirtualInstanceId::from("vm-1");

        let mut a = Resolution::default();
        a.merge(id.clone(), record("i-old", InstanceState::Terminated));
        a.merge(id.clone(), record("i-new", InstanceState::Running));
        assert_eq!(a.get(&id).unwrap().provider_id.as_str(), "i-new");

        let mut b = Resolution::default();
        b.merge(id.clone(), record("i-new", InstanceState::Running));
        b.merge(id.clone(), record("i-old", InstanceState::Terminated));
        assert_eq!(b.get(&id).unwrap().provider_id.as_str(), "i-new");
        assert!(b.anomalies.is_empty());
    }

    #[test]
    fn two_live_records_keep_the_first_and_flag() {
        let id = VirtualInstanceId::from("vm-1");
        let mut r = Resolution::default();
        r.merge(id.clone(), record("i-a", InstanceState::Running));
        r.merge(id.clone(), record("i-b", InstanceState::Pending));
        assert_eq!(r.get(&id).unwrap().provider_id.as_str(), "i-a");
        assert_eq!(r.anomalies, vec![id]);
        assert_eq!(r.live_instances().count(), 2);
    }
}
