//! Data volumes created and attached after launch.
//!
//! For a batch of running instances: create every volume, wait for them to
//! become available, attach and tag them, wait for the attachments, and then
//! (whatever happened before) flag every attached volume delete-on-termination.
//! Instances whose volumes are not all in use have failed. Below `min_count`
//! successes the whole batch is rolled back; otherwise only the failures are.

use serde_json::json;
use skyforge_common::{
    InstanceRecord, ProviderInstanceId, Template, TemplateError, VirtualInstanceId, VolumeRecord,
    VolumeState,
};
use skyforge_providers::inventory::{CreateVolumeRequest, DescribedVolume};
use skyforge_providers::{CloudComputeClient, ProviderError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::logger::ActionLog;
use crate::retry::{retry_until, RetryError};
use crate::state_machine::{is_attached_to, volume_state_for};
use crate::strategy::{shortfall_error, AllocationStrategy, StrategyContext};

/// Data volumes start at `f`; earlier letters are conventionally taken by
/// root and instance-store devices.
const FIRST_DATA_DEVICE_LETTER: u8 = b'f';
const LAST_DATA_DEVICE_LETTER: u8 = b'z';

/// Device letter suffix, so `/dev/sdf` and `/dev/xvdf` compare equal.
fn device_suffix(name: &str) -> &str {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    name.strip_prefix("xvd")
        .or_else(|| name.strip_prefix("sd"))
        .unwrap_or(name)
}

/// `count` device names of the form `<prefix><letter>`, in order, skipping
/// any name in `taken`.
pub fn assign_device_names(prefix: &str, count: usize, taken: &[String]) -> Result<Vec<String>> {
    let taken: BTreeSet<&str> = taken.iter().map(|n| device_suffix(n)).collect();
    let mut names = Vec::with_capacity(count);
    for letter in FIRST_DATA_DEVICE_LETTER..=LAST_DATA_DEVICE_LETTER {
        if names.len() == count {
            break;
        }
        let suffix = (letter as char).to_string();
        if taken.contains(suffix.as_str()) {
            continue;
        }
        names.push(format!("{}{}", prefix, suffix));
    }
    if names.len() < count {
        return Err(TemplateError::InvalidVolume {
            index: names.len(),
            reason: format!("no free device name left after {} volume(s)", names.len()),
        }
        .into());
    }
    Ok(names)
}

/// Device names for the template's data volumes, avoiding the devices the
/// image already maps.
pub async fn data_device_names(
    client: &dyn CloudComputeClient,
    template: &Template,
    prefix: &str,
) -> Result<Vec<String>> {
    if template.volumes.is_empty() {
        return Ok(Vec::new());
    }
    let mut taken = Vec::new();
    if let Some(image) = client.describe_image(&template.image_id).await? {
        taken.extend(image.root_device_name);
        taken.extend(image.block_device_names);
    }
    assign_device_names(prefix, template.volumes.len(), &taken)
}

/// The volumes of one instance and whether the instance already failed.
#[derive(Debug, Clone)]
struct InstanceVolumes {
    instance: InstanceRecord,
    volumes: Vec<VolumeRecord>,
    failed: bool,
}

impl InstanceVolumes {
    fn is_successful(&self) -> bool {
        !self.failed && self.volumes.iter().all(|v| v.state == VolumeState::InUse)
    }

    fn created_volume_ids(&self) -> impl Iterator<Item = &str> {
        self.volumes
            .iter()
            .filter(|v| v.is_created())
            .map(|v| v.volume_id.as_str())
    }

    fn fail(&mut self, reason: &str) {
        if !self.failed {
            warn!(
                virtual_id = %self.instance.virtual_id,
                provider_id = %self.instance.provider_id,
                reason,
                "[EBS] instance failed"
            );
        }
        self.failed = true;
    }
}

/// Tags the provider reserves cannot be written by clients.
fn volume_tags(instance: &InstanceRecord) -> BTreeMap<String, String> {
    instance
        .tags
        .iter()
        .filter(|(k, _)| !k.to_ascii_lowercase().starts_with("aws:"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub struct EbsVolumeOrchestrator {
    ctx: StrategyContext,
}

impl EbsVolumeOrchestrator {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    /// Give every instance in `instances` the template's volumes and return
    /// the instances that ended up with all of them attached.
    ///
    /// Failed instances are torn down through `strategy`, together with
    /// their volumes. If fewer than `min_count` instances succeed, every
    /// instance and every created volume is torn down and the call fails.
    pub async fn allocate_volumes(
        &self,
        template: &Template,
        instances: Vec<InstanceRecord>,
        min_count: usize,
        strategy: &dyn AllocationStrategy,
    ) -> Result<Vec<InstanceRecord>> {
        if instances.is_empty() || template.volumes.is_empty() {
            return Ok(instances);
        }
        let log = ActionLog::start(
            "EBS_ALLOCATE",
            json!({
                "template": template.name,
                "instances": instances.len(),
                "volumes_per_instance": template.volumes.len(),
                "min_count": min_count,
            }),
        );
        let result = self.run(template, instances, min_count, strategy).await;
        log.finish(&result);
        result
    }

    async fn run(
        &self,
        template: &Template,
        instances: Vec<InstanceRecord>,
        min_count: usize,
        strategy: &dyn AllocationStrategy,
    ) -> Result<Vec<InstanceRecord>> {
        let requested = instances.len();

        let devices = match data_device_names(
            self.ctx.client.as_ref(),
            template,
            &self.ctx.settings.device_name_prefix,
        )
        .await
        {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "[EBS] cannot name devices, releasing instances");
                let ids: Vec<VirtualInstanceId> = instances.iter().map(|i| i.virtual_id.clone()).collect();
                let rollback = strategy.delete(Some(template), &ids).await;
                return Err(match rollback {
                    Ok(()) => e,
                    Err(r) => OrchestratorError::Aggregate(vec![e, r]),
                });
            }
        };

        let (mut batch, mut errors) = self.create_volumes(template, instances, &devices).await?;

        let mut steps = self.wait_until_available(&mut batch).await;
        if steps.is_ok() {
            steps = self.attach_and_tag(&mut batch).await;
        }
        if steps.is_ok() {
            steps = self.wait_until_attached(&mut batch).await;
        }

        // Runs whatever the steps above did.
        self.enforce_delete_on_termination(&mut batch).await;

        match steps {
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                error!(error = %e, "[EBS] volume workflow aborted");
                for entry in batch.iter_mut().filter(|entry| !entry.is_successful()) {
                    entry.fail("workflow aborted");
                }
                errors.push(e);
            }
            Ok(()) => {}
        }

        let successful = batch.iter().filter(|e| e.is_successful()).count();
        info!(successful, requested, min_count, "[EBS] volume workflow finished");

        if successful < min_count {
            warn!(successful, min_count, "[EBS] below minimum, rolling back the whole batch");
            let rollback = self.rollback(template, &batch, strategy).await;
            return Err(shortfall_error(requested, min_count, successful, errors, rollback));
        }

        let (kept, failed): (Vec<_>, Vec<_>) = batch.into_iter().partition(|e| e.is_successful());
        if !failed.is_empty() {
            self.rollback(template, &failed, strategy).await?;
        }
        Ok(kept.into_iter().map(|e| e.instance).collect())
    }

    async fn create_volumes(
        &self,
        template: &Template,
        instances: Vec<InstanceRecord>,
        devices: &[String],
    ) -> Result<(Vec<InstanceVolumes>, Vec<OrchestratorError>)> {
        let mut batch = Vec::with_capacity(instances.len());
        let mut errors = Vec::new();

        for instance in instances {
            if self.ctx.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let zone = instance
                .availability_zone
                .clone()
                .or_else(|| template.availability_zone.clone());
            let mut entry = InstanceVolumes {
                volumes: Vec::with_capacity(template.volumes.len()),
                instance,
                failed: false,
            };

            for (spec, device) in template.volumes.iter().zip(devices) {
                let uncreated = VolumeRecord::uncreated(
                    entry.instance.virtual_id.clone(),
                    entry.instance.provider_id.clone(),
                    device.clone(),
                );
                let Some(zone) = zone.clone() else {
                    entry.volumes.push(uncreated);
                    entry.fail("instance has no availability zone");
                    continue;
                };
                let request = CreateVolumeRequest {
                    availability_zone: zone,
                    size_gib: spec.size_gib,
                    volume_type: spec.volume_type.clone(),
                    iops: spec.iops,
                    throughput_mibps: spec.throughput_mibps,
                    encrypted: spec.encrypted,
                    kms_key_id: spec.kms_key_id.clone(),
                    tags: BTreeMap::new(),
                };
                match self.ctx.client.create_volume(&request).await {
                    Ok(volume_id) => {
                        debug!(
                            virtual_id = %entry.instance.virtual_id,
                            volume_id = %volume_id,
                            device = %device,
                            "[EBS] volume created"
                        );
                        entry.volumes.push(VolumeRecord {
                            volume_id,
                            state: VolumeState::Creating,
                            ..uncreated
                        });
                    }
                    Err(e) => {
                        warn!(
                            virtual_id = %entry.instance.virtual_id,
                            device = %device,
                            error = %e,
                            "[EBS] volume create failed"
                        );
                        entry.volumes.push(uncreated);
                        entry.fail("volume create failed");
                        errors.push(e.into());
                    }
                }
            }
            batch.push(entry);
        }
        Ok((batch, errors))
    }

    async fn describe_volume_map(&self, ids: &[String]) -> Result<BTreeMap<String, DescribedVolume>> {
        let mut out = BTreeMap::new();
        for chunk in ids.chunks(self.ctx.settings.volume_id_batch_size.max(1)) {
            for v in self.ctx.client.describe_volumes(chunk).await? {
                out.insert(v.volume_id.clone(), v);
            }
        }
        Ok(out)
    }

    /// Like `describe_volume_map`, but volumes that are gone are left out
    /// instead of failing the call.
    async fn describe_existing_volumes(&self, ids: &[String]) -> BTreeMap<String, DescribedVolume> {
        let mut out = BTreeMap::new();
        for chunk in ids.chunks(self.ctx.settings.volume_id_batch_size.max(1)) {
            match self.ctx.client.describe_volumes(chunk).await {
                Ok(found) => out.extend(found.into_iter().map(|v| (v.volume_id.clone(), v))),
                Err(e) if e.is_not_found() => {
                    for id in chunk {
                        match self.ctx.client.describe_volumes(std::slice::from_ref(id)).await {
                            Ok(found) => out.extend(found.into_iter().map(|v| (v.volume_id.clone(), v))),
                            Err(e) if e.is_not_found() => {}
                            Err(e) => warn!(volume_id = %id, error = %e, "[EBS] describe failed"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "[EBS] describe batch failed"),
            }
        }
        out
    }

    /// Poll `ids` until `settled` holds for every described volume. Returns
    /// the latest snapshot, also when the deadline passed first.
    async fn poll_volumes<F>(
        &self,
        operation: &str,
        ids: &[String],
        timeout: std::time::Duration,
        settled: F,
    ) -> Result<BTreeMap<String, DescribedVolume>>
    where
        F: Fn(&DescribedVolume) -> bool + Sync,
    {
        let latest = Mutex::new(BTreeMap::new());
        let outcome = retry_until(
            operation,
            self.ctx.policy(timeout).deadline(),
            self.ctx.settings.retry_backoff,
            &self.ctx.cancel,
            OrchestratorError::is_retryable,
            |attempt| {
                let latest = &latest;
                let settled = &settled;
                async move {
                    let map = self.describe_volume_map(ids).await?;
                    let pending = ids
                        .iter()
                        .filter(|id| !map.get(*id).map(settled).unwrap_or(false))
                        .count();
                    *latest.lock().unwrap_or_else(PoisonError::into_inner) = map;
                    if pending == 0 {
                        return Ok(());
                    }
                    debug!(operation, attempt, pending, "[EBS] waiting for volumes");
                    Err(OrchestratorError::Transient(format!("{} volume(s) pending", pending)))
                }
            },
        )
        .await;

        let latest = latest.into_inner().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) => Ok(latest),
            Err(RetryError::DeadlineExceeded { attempts, .. }) => {
                warn!(operation, attempts, "[EBS] timed out waiting for volumes");
                Ok(latest)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_until_available(&self, batch: &mut [InstanceVolumes]) -> Result<()> {
        let ids: Vec<String> = batch
            .iter()
            .flat_map(|e| e.created_volume_ids())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let map = self
            .poll_volumes(
                "wait_volumes_available",
                &ids,
                self.ctx.settings.volume_available_timeout,
                |v| VolumeState::from_provider(&v.state) != VolumeState::Creating,
            )
            .await?;

        for entry in batch.iter_mut() {
            let mut not_available = false;
            for volume in entry.volumes.iter_mut().filter(|v| v.is_created()) {
                volume.state = map
                    .get(&volume.volume_id)
                    .map(|v| VolumeState::from_provider(&v.state))
                    .unwrap_or(VolumeState::Unknown);
                if volume.state != VolumeState::Available {
                    not_available = true;
                }
            }
            if not_available {
                entry.fail("volume did not become available");
            }
        }
        Ok(())
    }

    async fn attach_and_tag(&self, batch: &mut [InstanceVolumes]) -> Result<()> {
        for entry in batch.iter_mut().filter(|e| !e.failed) {
            if self.ctx.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let instance_id = entry.instance.provider_id.as_str().to_string();
            let tags = volume_tags(&entry.instance);

            let mut attach_failed = false;
            for volume in entry.volumes.iter_mut() {
                match self
                    .ctx
                    .client
                    .attach_volume(&volume.volume_id, &instance_id, &volume.device_name)
                    .await
                {
                    Ok(()) => {
                        volume.state = VolumeState::Attaching;
                        info!(
                            provider_id = %instance_id,
                            volume_id = %volume.volume_id,
                            device = %volume.device_name,
                            "[EBS] volume attaching"
                        );
                    }
                    Err(e) => {
                        warn!(
                            provider_id = %instance_id,
                            volume_id = %volume.volume_id,
                            error = %e,
                            "[EBS] attach failed"
                        );
                        attach_failed = true;
                        break;
                    }
                }
                if !tags.is_empty() {
                    if let Err(e) = self
                        .ctx
                        .client
                        .create_tags(std::slice::from_ref(&volume.volume_id), &tags)
                        .await
                    {
                        warn!(volume_id = %volume.volume_id, error = %e, "[EBS] tagging volume failed");
                    }
                }
            }
            if attach_failed {
                entry.fail("volume attach failed");
            }
        }
        Ok(())
    }

    async fn wait_until_attached(&self, batch: &mut [InstanceVolumes]) -> Result<()> {
        let owners: BTreeMap<String, String> = batch
            .iter()
            .filter(|e| !e.failed)
            .flat_map(|e| {
                e.volumes
                    .iter()
                    .filter(|v| v.state == VolumeState::Attaching)
                    .map(move |v| (v.volume_id.clone(), e.instance.provider_id.as_str().to_string()))
            })
            .collect();
        if owners.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = owners.keys().cloned().collect();
        let owners_ref = &owners;
        let map = self
            .poll_volumes(
                "wait_volumes_attached",
                &ids,
                self.ctx.settings.volume_attach_timeout,
                |v| {
                    owners_ref
                        .get(&v.volume_id)
                        .map(|instance| volume_state_for(v, instance) == VolumeState::InUse)
                        .unwrap_or(false)
                },
            )
            .await?;

        for entry in batch.iter_mut().filter(|e| !e.failed) {
            let instance_id = entry.instance.provider_id.as_str().to_string();
            let mut incomplete = false;
            for volume in entry.volumes.iter_mut() {
                volume.state = map
                    .get(&volume.volume_id)
                    .map(|v| volume_state_for(v, &instance_id))
                    .unwrap_or(VolumeState::Unknown);
                if volume.state != VolumeState::InUse {
                    incomplete = true;
                }
            }
            if incomplete {
                entry.fail("volume attachment did not complete");
            }
        }
        Ok(())
    }

    /// Flag every volume attached to its instance delete-on-termination,
    /// whatever the outcome of the batch, so a later teardown cannot leak
    /// it. Errors are logged and fail the instance.
    async fn enforce_delete_on_termination(&self, batch: &mut [InstanceVolumes]) {
        let ids: Vec<String> = batch
            .iter()
            .flat_map(|e| e.created_volume_ids())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return;
        }
        let described = self.describe_existing_volumes(&ids).await;

        for entry in batch.iter_mut() {
            let instance_id = entry.instance.provider_id.as_str().to_string();
            let mut dot_failed = false;
            for volume in entry.volumes.iter_mut().filter(|v| v.is_created()) {
                let Some(current) = described.get(&volume.volume_id) else {
                    continue;
                };
                volume.state = volume_state_for(current, &instance_id);
                if !is_attached_to(current, &instance_id, &volume.device_name) {
                    continue;
                }
                match self
                    .ctx
                    .client
                    .set_delete_on_termination(&instance_id, &volume.device_name, true)
                    .await
                {
                    Ok(()) => debug!(
                        provider_id = %instance_id,
                        volume_id = %volume.volume_id,
                        "[EBS] delete-on-termination set"
                    ),
                    Err(e) => {
                        error!(
                            provider_id = %instance_id,
                            volume_id = %volume.volume_id,
                            error = %e,
                            "[EBS] could not set delete-on-termination"
                        );
                        dot_failed = true;
                    }
                }
            }
            if dot_failed {
                entry.fail("delete-on-termination not set");
            }
        }
    }

    /// Tear down `entries`: their instances through the strategy, then every
    /// volume created for them.
    async fn rollback(
        &self,
        template: &Template,
        entries: &[InstanceVolumes],
        strategy: &dyn AllocationStrategy,
    ) -> Result<()> {
        let ids: Vec<VirtualInstanceId> = entries.iter().map(|e| e.instance.virtual_id.clone()).collect();
        let volume_ids: Vec<String> = entries
            .iter()
            .flat_map(|e| e.created_volume_ids())
            .map(str::to_string)
            .collect();
        let providers: Vec<&ProviderInstanceId> = entries.iter().map(|e| &e.instance.provider_id).collect();
        let log = ActionLog::start(
            "ROLLBACK",
            json!({
                "instances": providers.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                "volumes": volume_ids,
            }),
        );

        let mut errors = Vec::new();
        if let Err(e) = strategy.delete(Some(template), &ids).await {
            errors.push(e);
        }
        if let Err(e) = self.delete_volumes(&volume_ids).await {
            errors.push(e);
        }
        let result = OrchestratorError::aggregate(errors);
        log.finish(&result);
        result
    }

    /// Delete volumes one by one. A volume still attached to an instance that
    /// is going away is retried; a volume that is already gone is done.
    pub async fn delete_volumes(&self, volume_ids: &[String]) -> Result<()> {
        let mut errors = Vec::new();
        for volume_id in volume_ids {
            let outcome = retry_until(
                "delete_volume",
                self.ctx.policy(self.ctx.settings.volume_delete_timeout).deadline(),
                self.ctx.settings.retry_backoff,
                &self.ctx.cancel,
                |e: &ProviderError| e.is_volume_in_use() || e.is_incorrect_state(),
                |_| self.ctx.client.delete_volume(volume_id),
            )
            .await;
            match outcome {
                Ok(()) => info!(volume_id = %volume_id, "[EBS] volume deleted"),
                Err(RetryError::Fatal(e)) if e.is_not_found() => {
                    debug!(volume_id = %volume_id, "[EBS] volume already gone")
                }
                Err(RetryError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(e) => {
                    let e = OrchestratorError::from(e);
                    error!(volume_id = %volume_id, error = %e, "[EBS] volume delete failed");
                    errors.push(e);
                }
            }
        }
        OrchestratorError::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_skip_image_mappings() {
        let taken = vec!["/dev/xvda".to_string(), "/dev/sdf".to_string(), "/dev/xvdg".to_string()];
        let names = assign_device_names("/dev/sd", 3, &taken).unwrap();
        assert_eq!(names, vec!["/dev/sdh", "/dev/sdi", "/dev/sdj"]);
    }

    #[test]
    fn device_names_are_deterministic() {
        let a = assign_device_names("/dev/xvd", 2, &[]).unwrap();
        let b = assign_device_names("/dev/xvd", 2, &[]).unwrap();
        assert_eq!(a, vec!["/dev/xvdf", "/dev/xvdg"]);
        assert_eq!(a, b);
    }

    #[test]
    fn running_out_of_letters_is_a_template_error() {
        let err = assign_device_names("/dev/sd", 22, &[]).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTemplate(_)));
    }

    #[test]
    fn provider_tags_are_not_copied_to_volumes() {
        let mut tags = BTreeMap::new();
        tags.insert("aws:autoscaling:groupName".to_string(), "g".to_string());
        tags.insert("team".to_string(), "infra".to_string());
        let record = InstanceRecord {
            virtual_id: VirtualInstanceId::from("vm-1"),
            provider_id: ProviderInstanceId::from("i-1"),
            state: skyforge_common::InstanceState::Running,
            tags,
            instance_type: None,
            image_id: None,
            key_name: None,
            availability_zone: None,
            private_ip_address: None,
            launch_time: None,
        };
        let out = volume_tags(&record);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("team"));
    }
}
