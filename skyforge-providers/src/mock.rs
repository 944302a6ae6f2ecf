//! In-memory cloud used by tests and local runs.
//!
//! Resources go through the same transitions the real control plane shows:
//! instances start `pending`, volumes start `creating`, and both only move on
//! after being observed by a describe call a configurable number of times.
//! Terminated instances stay visible, volumes deleted by the cloud disappear.

use crate::inventory::{
    AttachedDevice, CreateVolumeRequest, DescribeInstancesQuery, DescribedInstance,
    DescribedScalingGroup, DescribedSpotRequest, DescribedVolume, GroupMember, ImageDescription,
    InstanceFilter, LaunchRequest, Page, ScalingGroupRequest, SpotRequest, SpotRequestFilter,
    VolumeAttachment,
};
use crate::{codes, CloudComputeClient, ProviderError, ProviderResult, Verifiable};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

pub mod ops {
    pub const VERIFY_ACCESS: &str = "verify_access";
    pub const RUN_INSTANCES: &str = "run_instances";
    pub const DESCRIBE_INSTANCES: &str = "describe_instances";
    pub const TERMINATE_INSTANCES: &str = "terminate_instances";
    pub const CREATE_TAGS: &str = "create_tags";
    pub const DESCRIBE_IMAGE: &str = "describe_image";
    pub const REQUEST_SPOT_INSTANCE: &str = "request_spot_instance";
    pub const DESCRIBE_SPOT_REQUESTS: &str = "describe_spot_requests";
    pub const CANCEL_SPOT_REQUESTS: &str = "cancel_spot_requests";
    pub const CREATE_SCALING_GROUP: &str = "create_scaling_group";
    pub const DESCRIBE_SCALING_GROUP: &str = "describe_scaling_group";
    pub const SET_SCALING_GROUP_CAPACITY: &str = "set_scaling_group_capacity";
    pub const TERMINATE_IN_SCALING_GROUP: &str = "terminate_in_scaling_group";
    pub const DELETE_SCALING_GROUP: &str = "delete_scaling_group";
    pub const CREATE_VOLUME: &str = "create_volume";
    pub const DESCRIBE_VOLUMES: &str = "describe_volumes";
    pub const ATTACH_VOLUME: &str = "attach_volume";
    pub const DELETE_VOLUME: &str = "delete_volume";
    pub const SET_DELETE_ON_TERMINATION: &str = "set_delete_on_termination";
}

const DEFAULT_ROOT_DEVICE: &str = "/dev/xvda";
const MOCK_ZONE: &str = "mock-zone-a";

struct MockInstance {
    id: String,
    state: String,
    observations: u32,
    tags: BTreeMap<String, String>,
    launch: LaunchRequest,
    private_ip: String,
    launch_time: chrono::DateTime<Utc>,
    devices: Vec<AttachedDevice>,
}

impl MockInstance {
    fn is_live(&self) -> bool {
        !matches!(self.state.as_str(), "shutting-down" | "terminated")
    }

    fn zone(&self) -> String {
        self.launch
            .availability_zone
            .clone()
            .unwrap_or_else(|| MOCK_ZONE.to_string())
    }

    fn describe(&self) -> DescribedInstance {
        DescribedInstance {
            instance_id: self.id.clone(),
            state: self.state.clone(),
            tags: self.tags.clone(),
            instance_type: Some(self.launch.instance_type.clone()),
            image_id: Some(self.launch.image_id.clone()),
            key_name: self.launch.key_name.clone(),
            availability_zone: Some(self.zone()),
            private_ip_address: Some(self.private_ip.clone()),
            launch_time: Some(self.launch_time),
            block_devices: self.devices.clone(),
        }
    }
}

struct MockVolume {
    id: String,
    state: String,
    observations: u32,
    zone: String,
    size_gib: u32,
    tags: BTreeMap<String, String>,
    attachment: Option<VolumeAttachment>,
}

impl MockVolume {
    fn describe(&self) -> DescribedVolume {
        DescribedVolume {
            volume_id: self.id.clone(),
            state: self.state.clone(),
            availability_zone: self.zone.clone(),
            size_gib: self.size_gib,
            tags: self.tags.clone(),
            attachments: self.attachment.iter().cloned().collect(),
        }
    }
}

struct MockSpotRequest {
    id: String,
    state: String,
    status_code: Option<String>,
    instance_id: Option<String>,
    tags: BTreeMap<String, String>,
    launch: LaunchRequest,
}

impl MockSpotRequest {
    fn describe(&self) -> DescribedSpotRequest {
        DescribedSpotRequest {
            request_id: self.id.clone(),
            state: self.state.clone(),
            status_code: self.status_code.clone(),
            instance_id: self.instance_id.clone(),
            tags: self.tags.clone(),
        }
    }
}

struct MockGroup {
    name: String,
    launch: LaunchRequest,
    min_size: u32,
    max_size: u32,
    desired: u32,
    members: Vec<String>,
}

struct MockState {
    next_id: u64,
    instances: BTreeMap<String, MockInstance>,
    volumes: BTreeMap<String, MockVolume>,
    deleted_volumes: BTreeSet<String>,
    spot_requests: BTreeMap<String, MockSpotRequest>,
    groups: BTreeMap<String, MockGroup>,
    images: BTreeMap<String, ImageDescription>,
    calls: BTreeMap<&'static str, usize>,
    injected: BTreeMap<&'static str, VecDeque<(String, String)>>,
    attach_failures: Vec<(String, String)>,
    stuck_pending: Vec<(String, String)>,
    pending_observations: u32,
    page_size: usize,
    instance_limit: Option<usize>,
    spot_capacity: Option<usize>,
    group_capacity: Option<usize>,
    stale_tag_reads: usize,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }

    fn live_instance_count(&self) -> usize {
        self.instances.values().filter(|i| i.is_live()).count()
    }

    fn launch(&mut self, launch: &LaunchRequest, extra_tags: &BTreeMap<String, String>) -> String {
        let id = self.next_id("i");
        let zone = launch
            .availability_zone
            .clone()
            .unwrap_or_else(|| MOCK_ZONE.to_string());
        let mut devices = Vec::new();
        for bdm in &launch.block_device_mappings {
            let vol_id = self.next_id("vol");
            self.volumes.insert(
                vol_id.clone(),
                MockVolume {
                    id: vol_id.clone(),
                    state: "in-use".to_string(),
                    observations: 0,
                    zone: zone.clone(),
                    size_gib: bdm.size_gib,
                    tags: launch.tags.clone(),
                    attachment: Some(VolumeAttachment {
                        instance_id: id.clone(),
                        device_name: bdm.device_name.clone(),
                        state: "attached".to_string(),
                        delete_on_termination: bdm.delete_on_termination,
                    }),
                },
            );
            devices.push(AttachedDevice {
                device_name: bdm.device_name.clone(),
                volume_id: vol_id,
                delete_on_termination: bdm.delete_on_termination,
            });
        }
        let mut tags = launch.tags.clone();
        tags.extend(extra_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        let octet = self.next_id % 250 + 2;
        self.instances.insert(
            id.clone(),
            MockInstance {
                id: id.clone(),
                state: "pending".to_string(),
                observations: 0,
                tags,
                launch: launch.clone(),
                private_ip: format!("10.0.0.{}", octet),
                launch_time: Utc::now(),
                devices,
            },
        );
        id
    }

    fn terminate(&mut self, id: &str) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        if !inst.is_live() {
            return;
        }
        inst.state = "shutting-down".to_string();
        inst.observations = 0;
        let devices = std::mem::take(&mut inst.devices);
        for dev in devices {
            if dev.delete_on_termination {
                self.volumes.remove(&dev.volume_id);
                self.deleted_volumes.insert(dev.volume_id);
            } else if let Some(vol) = self.volumes.get_mut(&dev.volume_id) {
                vol.state = "available".to_string();
                vol.attachment = None;
            }
        }
        for group in self.groups.values_mut() {
            group.members.retain(|m| m != id);
        }
    }

    fn observe_instance(&mut self, id: &str) {
        let threshold = self.pending_observations;
        let stuck = self.stuck_pending.clone();
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        let is_stuck = stuck
            .iter()
            .any(|(k, v)| inst.tags.get(k).map(|t| t == v).unwrap_or(false));
        match inst.state.as_str() {
            "pending" if !is_stuck => {
                if inst.observations >= threshold {
                    inst.state = "running".to_string();
                } else {
                    inst.observations += 1;
                }
            }
            "shutting-down" => {
                if inst.observations >= threshold {
                    inst.state = "terminated".to_string();
                } else {
                    inst.observations += 1;
                }
            }
            _ => {}
        }
    }

    fn observe_volume(&mut self, id: &str) {
        let threshold = self.pending_observations;
        let Some(vol) = self.volumes.get_mut(id) else {
            return;
        };
        let attaching = vol
            .attachment
            .as_ref()
            .map(|a| a.state == "attaching")
            .unwrap_or(false);
        if vol.state == "creating" || attaching {
            if vol.observations >= threshold {
                if vol.state == "creating" {
                    vol.state = "available".to_string();
                }
                if let Some(att) = vol.attachment.as_mut() {
                    att.state = "attached".to_string();
                }
                vol.observations = 0;
            } else {
                vol.observations += 1;
            }
        }
    }

    fn reconcile_group(&mut self, name: &str) {
        let Some(group) = self.groups.get(name) else {
            return;
        };
        let members: Vec<String> = group
            .members
            .iter()
            .filter(|m| self.instances.get(*m).map(|i| i.is_live()).unwrap_or(false))
            .cloned()
            .collect();
        let desired = group.desired as usize;
        let launch = group.launch.clone();
        let capacity = self.group_capacity;

        let mut members = members;
        while members.len() < desired && capacity.map(|c| members.len() < c).unwrap_or(true) {
            let mut tags = BTreeMap::new();
            tags.insert(
                "aws:autoscaling:groupName".to_string(),
                name.to_string(),
            );
            let id = self.launch(&launch, &tags);
            members.push(id);
        }
        while members.len() > desired {
            if let Some(extra) = members.pop() {
                self.terminate(&extra);
            }
        }
        if let Some(group) = self.groups.get_mut(name) {
            group.members = members;
        }
    }
}

fn has_tag(tags: &BTreeMap<String, String>, key: &str, values: &[String]) -> bool {
    tags.get(key).map(|v| values.contains(v)).unwrap_or(false)
}

pub struct MockProvider {
    state: Mutex<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 0,
                instances: BTreeMap::new(),
                volumes: BTreeMap::new(),
                deleted_volumes: BTreeSet::new(),
                spot_requests: BTreeMap::new(),
                groups: BTreeMap::new(),
                images: BTreeMap::new(),
                calls: BTreeMap::new(),
                injected: BTreeMap::new(),
                attach_failures: Vec::new(),
                stuck_pending: Vec::new(),
                pending_observations: 1,
                page_size: 100,
                instance_limit: None,
                spot_capacity: None,
                group_capacity: None,
                stale_tag_reads: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and pop an injected failure for it, if any.
    fn enter(&self, op: &'static str) -> ProviderResult<MutexGuard<'_, MockState>> {
        let mut st = self.state();
        *st.calls.entry(op).or_insert(0) += 1;
        if let Some(queue) = st.injected.get_mut(op) {
            if let Some((code, message)) = queue.pop_front() {
                return Err(ProviderError::api(&code, message));
            }
        }
        Ok(st)
    }

    // --- Knobs ---

    /// Fail the next `times` calls of `op` with `code`.
    pub fn inject_error(&self, op: &'static str, code: &str, times: usize) {
        let mut st = self.state();
        let queue = st.injected.entry(op).or_default();
        for _ in 0..times {
            queue.push_back((code.to_string(), format!("injected failure for {}", op)));
        }
    }

    /// Attaching a volume to an instance carrying this tag fails.
    pub fn fail_attach_for_tag(&self, key: &str, value: &str) {
        self.state()
            .attach_failures
            .push((key.to_string(), value.to_string()));
    }

    /// Instances carrying this tag never leave `pending`.
    pub fn keep_pending_for_tag(&self, key: &str, value: &str) {
        self.state()
            .stuck_pending
            .push((key.to_string(), value.to_string()));
    }

    /// Describe observations a resource spends in a transitional state.
    pub fn set_pending_observations(&self, n: u32) {
        self.state().pending_observations = n;
    }

    /// The next `n` tag-filter describes miss every instance, as a lagging
    /// tag index does right after tagging.
    pub fn stale_tag_filter_reads(&self, n: usize) {
        self.state().stale_tag_reads = n;
    }

    pub fn set_page_size(&self, n: usize) {
        self.state().page_size = n.max(1);
    }

    pub fn set_instance_limit(&self, limit: usize) {
        self.state().instance_limit = Some(limit);
    }

    pub fn set_spot_capacity(&self, capacity: usize) {
        self.state().spot_capacity = Some(capacity);
    }

    pub fn set_group_capacity(&self, capacity: usize) {
        self.state().group_capacity = Some(capacity);
    }

    pub fn register_image(&self, image: ImageDescription) {
        self.state().images.insert(image.image_id.clone(), image);
    }

    /// Seed an instance exactly as given, bypassing launch.
    pub fn insert_instance(&self, described: DescribedInstance) {
        let mut st = self.state();
        let launch = LaunchRequest {
            image_id: described.image_id.clone().unwrap_or_default(),
            instance_type: described.instance_type.clone().unwrap_or_default(),
            key_name: described.key_name.clone(),
            availability_zone: described.availability_zone.clone(),
            count: 1,
            ..LaunchRequest::default()
        };
        st.instances.insert(
            described.instance_id.clone(),
            MockInstance {
                id: described.instance_id.clone(),
                state: described.state.clone(),
                observations: 0,
                tags: described.tags.clone(),
                launch,
                private_ip: described.private_ip_address.clone().unwrap_or_default(),
                launch_time: described.launch_time.unwrap_or_else(Utc::now),
                devices: described.block_devices.clone(),
            },
        );
    }

    // --- Inspection ---

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }

    pub fn instance(&self, id: &str) -> Option<DescribedInstance> {
        self.state().instances.get(id).map(|i| i.describe())
    }

    pub fn instances(&self) -> Vec<DescribedInstance> {
        self.state().instances.values().map(|i| i.describe()).collect()
    }

    pub fn live_instances(&self) -> Vec<DescribedInstance> {
        self.state()
            .instances
            .values()
            .filter(|i| i.is_live())
            .map(|i| i.describe())
            .collect()
    }

    pub fn volumes(&self) -> Vec<DescribedVolume> {
        self.state().volumes.values().map(|v| v.describe()).collect()
    }

    pub fn deleted_volumes(&self) -> Vec<String> {
        self.state().deleted_volumes.iter().cloned().collect()
    }

    pub fn spot_requests(&self) -> Vec<DescribedSpotRequest> {
        self.state()
            .spot_requests
            .values()
            .map(|r| r.describe())
            .collect()
    }

    pub fn scaling_group_exists(&self, name: &str) -> bool {
        self.state().groups.contains_key(name)
    }
}

#[async_trait]
impl Verifiable for MockProvider {
    async fn verify_access(&self) -> ProviderResult<()> {
        self.enter(ops::VERIFY_ACCESS)?;
        Ok(())
    }
}

#[async_trait]
impl CloudComputeClient for MockProvider {
    async fn run_instances(&self, request: &LaunchRequest) -> ProviderResult<Vec<DescribedInstance>> {
        let mut st = self.enter(ops::RUN_INSTANCES)?;

        if let Some(token) = &request.client_token {
            let existing: Vec<DescribedInstance> = st
                .instances
                .values()
                .filter(|i| i.launch.client_token.as_deref() == Some(token.as_str()))
                .map(|i| i.describe())
                .collect();
            if !existing.is_empty() {
                return Ok(existing);
            }
        }

        let count = request.count.max(1) as usize;
        if let Some(limit) = st.instance_limit {
            if st.live_instance_count() + count > limit {
                return Err(ProviderError::api(
                    codes::INSTANCE_LIMIT_EXCEEDED,
                    format!("instance limit of {} reached", limit),
                ));
            }
        }

        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let id = st.launch(request, &BTreeMap::new());
            if let Some(inst) = st.instances.get(&id) {
                out.push(inst.describe());
            }
        }
        Ok(out)
    }

    async fn describe_instances(
        &self,
        query: &DescribeInstancesQuery,
    ) -> ProviderResult<Page<DescribedInstance>> {
        let mut st = self.enter(ops::DESCRIBE_INSTANCES)?;

        let matching: Vec<String> = match &query.filter {
            InstanceFilter::InstanceIds(ids) => {
                if let Some(missing) = ids.iter().find(|id| !st.instances.contains_key(*id)) {
                    return Err(ProviderError::api(
                        codes::INSTANCE_NOT_FOUND,
                        format!("The instance ID '{}' does not exist", missing),
                    ));
                }
                let wanted: BTreeSet<&String> = ids.iter().collect();
                st.instances
                    .keys()
                    .filter(|k| wanted.contains(k))
                    .cloned()
                    .collect()
            }
            InstanceFilter::TagValues { .. } if st.stale_tag_reads > 0 => {
                st.stale_tag_reads -= 1;
                Vec::new()
            }
            InstanceFilter::TagValues { key, values } => st
                .instances
                .values()
                .filter(|i| has_tag(&i.tags, key, values))
                .map(|i| i.id.clone())
                .collect(),
        };

        let start = match &query.next_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                ProviderError::api("InvalidParameterValue", format!("bad next token '{}'", token))
            })?,
            None => 0,
        };
        let end = (start + st.page_size).min(matching.len());
        let page_ids: Vec<String> = matching.get(start..end).map(|s| s.to_vec()).unwrap_or_default();

        let mut items = Vec::with_capacity(page_ids.len());
        for id in &page_ids {
            st.observe_instance(id);
            if let Some(inst) = st.instances.get(id) {
                items.push(inst.describe());
            }
        }
        let next_token = if end < matching.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(Page { items, next_token })
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        let mut st = self.enter(ops::TERMINATE_INSTANCES)?;
        if let Some(missing) = instance_ids.iter().find(|id| !st.instances.contains_key(*id)) {
            return Err(ProviderError::api(
                codes::INSTANCE_NOT_FOUND,
                format!("The instance ID '{}' does not exist", missing),
            ));
        }
        for id in instance_ids {
            st.terminate(id);
        }
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> ProviderResult<()> {
        let mut st = self.enter(ops::CREATE_TAGS)?;
        let new_tags = || tags.iter().map(|(k, v)| (k.clone(), v.clone()));
        for id in resource_ids {
            if let Some(inst) = st.instances.get_mut(id) {
                inst.tags.extend(new_tags());
                continue;
            }
            if let Some(vol) = st.volumes.get_mut(id) {
                vol.tags.extend(new_tags());
                continue;
            }
            if let Some(req) = st.spot_requests.get_mut(id) {
                req.tags.extend(new_tags());
                continue;
            }
            let code = if id.starts_with("vol-") {
                codes::VOLUME_NOT_FOUND
            } else {
                codes::INSTANCE_NOT_FOUND
            };
            return Err(ProviderError::api(
                code,
                format!("The resource ID '{}' does not exist", id),
            ));
        }
        Ok(())
    }

    async fn describe_image(&self, image_id: &str) -> ProviderResult<Option<ImageDescription>> {
        let st = self.enter(ops::DESCRIBE_IMAGE)?;
        Ok(Some(st.images.get(image_id).cloned().unwrap_or_else(|| {
            ImageDescription {
                image_id: image_id.to_string(),
                root_device_name: Some(DEFAULT_ROOT_DEVICE.to_string()),
                block_device_names: vec![DEFAULT_ROOT_DEVICE.to_string()],
            }
        })))
    }

    async fn request_spot_instance(&self, request: &SpotRequest) -> ProviderResult<String> {
        let mut st = self.enter(ops::REQUEST_SPOT_INSTANCE)?;
        let id = st.next_id("sir");
        st.spot_requests.insert(
            id.clone(),
            MockSpotRequest {
                id: id.clone(),
                state: "open".to_string(),
                status_code: Some("pending-evaluation".to_string()),
                instance_id: None,
                tags: request.request_tags.clone(),
                launch: request.launch.clone(),
            },
        );
        Ok(id)
    }

    async fn describe_spot_requests(
        &self,
        filter: &SpotRequestFilter,
    ) -> ProviderResult<Vec<DescribedSpotRequest>> {
        let mut st = self.enter(ops::DESCRIBE_SPOT_REQUESTS)?;

        let ids: Vec<String> = match filter {
            SpotRequestFilter::RequestIds(ids) => {
                if let Some(missing) = ids.iter().find(|id| !st.spot_requests.contains_key(*id)) {
                    return Err(ProviderError::api(
                        codes::SPOT_REQUEST_NOT_FOUND,
                        format!("The spot instance request ID '{}' does not exist", missing),
                    ));
                }
                ids.clone()
            }
            SpotRequestFilter::TagValues { key, values } => st
                .spot_requests
                .values()
                .filter(|r| has_tag(&r.tags, key, values))
                .map(|r| r.id.clone())
                .collect(),
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let fulfilled = st
                .spot_requests
                .values()
                .filter(|r| r.instance_id.is_some())
                .count();
            let can_fulfill = st.spot_capacity.map(|c| fulfilled < c).unwrap_or(true);
            let pending = st
                .spot_requests
                .get(&id)
                .map(|r| r.state == "open")
                .unwrap_or(false);
            if pending {
                if can_fulfill {
                    let launch = st.spot_requests.get(&id).map(|r| r.launch.clone());
                    if let Some(launch) = launch {
                        let instance_id = st.launch(&launch, &BTreeMap::new());
                        if let Some(req) = st.spot_requests.get_mut(&id) {
                            req.state = "active".to_string();
                            req.status_code = Some("fulfilled".to_string());
                            req.instance_id = Some(instance_id);
                        }
                    }
                } else if let Some(req) = st.spot_requests.get_mut(&id) {
                    req.status_code = Some("capacity-not-available".to_string());
                }
            }
            if let Some(req) = st.spot_requests.get(&id) {
                out.push(req.describe());
            }
        }
        Ok(out)
    }

    async fn cancel_spot_requests(&self, request_ids: &[String]) -> ProviderResult<()> {
        let mut st = self.enter(ops::CANCEL_SPOT_REQUESTS)?;
        if let Some(missing) = request_ids
            .iter()
            .find(|id| !st.spot_requests.contains_key(*id))
        {
            return Err(ProviderError::api(
                codes::SPOT_REQUEST_NOT_FOUND,
                format!("The spot instance request ID '{}' does not exist", missing),
            ));
        }
        for id in request_ids {
            if let Some(req) = st.spot_requests.get_mut(id) {
                if !matches!(req.state.as_str(), "closed" | "cancelled" | "failed") {
                    req.state = "cancelled".to_string();
                    req.status_code = Some("request-canceled".to_string());
                }
            }
        }
        Ok(())
    }

    async fn create_scaling_group(&self, request: &ScalingGroupRequest) -> ProviderResult<()> {
        let mut st = self.enter(ops::CREATE_SCALING_GROUP)?;
        if st.groups.contains_key(&request.group_name) {
            return Err(ProviderError::api(
                "AlreadyExists",
                format!("group '{}' already exists", request.group_name),
            ));
        }
        st.groups.insert(
            request.group_name.clone(),
            MockGroup {
                name: request.group_name.clone(),
                launch: request.launch.clone(),
                min_size: request.min_size,
                max_size: request.max_size,
                desired: request.desired_capacity,
                members: Vec::new(),
            },
        );
        Ok(())
    }

    async fn describe_scaling_group(
        &self,
        group_name: &str,
    ) -> ProviderResult<Option<DescribedScalingGroup>> {
        let mut st = self.enter(ops::DESCRIBE_SCALING_GROUP)?;
        if !st.groups.contains_key(group_name) {
            return Ok(None);
        }
        st.reconcile_group(group_name);

        let member_ids: Vec<String> = st
            .groups
            .get(group_name)
            .map(|g| g.members.clone())
            .unwrap_or_default();
        for id in &member_ids {
            st.observe_instance(id);
        }
        let Some(group) = st.groups.get(group_name) else {
            return Ok(None);
        };
        let instances = group
            .members
            .iter()
            .filter_map(|id| st.instances.get(id))
            .map(|i| GroupMember {
                instance_id: i.id.clone(),
                lifecycle_state: match i.state.as_str() {
                    "running" => "InService".to_string(),
                    "pending" => "Pending".to_string(),
                    _ => "Terminating".to_string(),
                },
            })
            .collect();
        Ok(Some(DescribedScalingGroup {
            group_name: group.name.clone(),
            min_size: group.min_size,
            max_size: group.max_size,
            desired_capacity: group.desired,
            instances,
        }))
    }

    async fn set_scaling_group_capacity(
        &self,
        group_name: &str,
        desired_capacity: u32,
        max_size: Option<u32>,
    ) -> ProviderResult<()> {
        let mut st = self.enter(ops::SET_SCALING_GROUP_CAPACITY)?;
        let Some(group) = st.groups.get_mut(group_name) else {
            return Err(ProviderError::api(
                codes::SCALING_GROUP_NOT_FOUND,
                format!("group '{}' not found", group_name),
            ));
        };
        let max_size = max_size.unwrap_or(group.max_size);
        if desired_capacity > max_size || desired_capacity < group.min_size {
            return Err(ProviderError::api(
                codes::VALIDATION_ERROR,
                format!(
                    "desired capacity {} is outside [{}, {}]",
                    desired_capacity, group.min_size, max_size
                ),
            ));
        }
        group.max_size = max_size;
        group.desired = desired_capacity;
        Ok(())
    }

    async fn terminate_in_scaling_group(
        &self,
        instance_id: &str,
        decrement_desired_capacity: bool,
    ) -> ProviderResult<()> {
        let mut st = self.enter(ops::TERMINATE_IN_SCALING_GROUP)?;
        let group_name = st
            .groups
            .values()
            .find(|g| g.members.iter().any(|m| m == instance_id))
            .map(|g| g.name.clone());
        let Some(group_name) = group_name else {
            return Err(ProviderError::api(
                codes::INSTANCE_NOT_FOUND,
                format!("instance '{}' is not part of any group", instance_id),
            ));
        };
        if decrement_desired_capacity {
            if let Some(group) = st.groups.get_mut(&group_name) {
                group.desired = group.desired.saturating_sub(1);
                group.min_size = group.min_size.min(group.desired);
            }
        }
        st.terminate(instance_id);
        Ok(())
    }

    async fn delete_scaling_group(&self, group_name: &str) -> ProviderResult<()> {
        let mut st = self.enter(ops::DELETE_SCALING_GROUP)?;
        let Some(group) = st.groups.remove(group_name) else {
            return Err(ProviderError::api(
                codes::SCALING_GROUP_NOT_FOUND,
                format!("group '{}' not found", group_name),
            ));
        };
        for member in group.members {
            st.terminate(&member);
        }
        Ok(())
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> ProviderResult<String> {
        let mut st = self.enter(ops::CREATE_VOLUME)?;
        let id = st.next_id("vol");
        st.volumes.insert(
            id.clone(),
            MockVolume {
                id: id.clone(),
                state: "creating".to_string(),
                observations: 0,
                zone: request.availability_zone.clone(),
                size_gib: request.size_gib,
                tags: request.tags.clone(),
                attachment: None,
            },
        );
        Ok(id)
    }

    async fn describe_volumes(&self, volume_ids: &[String]) -> ProviderResult<Vec<DescribedVolume>> {
        let mut st = self.enter(ops::DESCRIBE_VOLUMES)?;
        if let Some(missing) = volume_ids.iter().find(|id| !st.volumes.contains_key(*id)) {
            return Err(ProviderError::api(
                codes::VOLUME_NOT_FOUND,
                format!("The volume '{}' does not exist", missing),
            ));
        }
        let mut out = Vec::with_capacity(volume_ids.len());
        for id in volume_ids {
            st.observe_volume(id);
            if let Some(vol) = st.volumes.get(id) {
                out.push(vol.describe());
            }
        }
        Ok(out)
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device_name: &str,
    ) -> ProviderResult<()> {
        let mut st = self.enter(ops::ATTACH_VOLUME)?;

        let Some(inst) = st.instances.get(instance_id) else {
            return Err(ProviderError::api(
                codes::INSTANCE_NOT_FOUND,
                format!("The instance ID '{}' does not exist", instance_id),
            ));
        };
        if !inst.is_live() {
            return Err(ProviderError::api(
                codes::INCORRECT_STATE,
                format!("instance '{}' is {}", instance_id, inst.state),
            ));
        }
        let failing = st
            .attach_failures
            .iter()
            .any(|(k, v)| inst.tags.get(k).map(|t| t == v).unwrap_or(false));
        if failing {
            return Err(ProviderError::api(
                "InternalError",
                format!("attach of {} to {} failed", volume_id, instance_id),
            ));
        }
        if inst.devices.iter().any(|d| d.device_name == device_name) {
            return Err(ProviderError::api(
                "InvalidParameterValue",
                format!("device {} already in use on {}", device_name, instance_id),
            ));
        }

        let Some(vol) = st.volumes.get_mut(volume_id) else {
            return Err(ProviderError::api(
                codes::VOLUME_NOT_FOUND,
                format!("The volume '{}' does not exist", volume_id),
            ));
        };
        if vol.state != "available" {
            return Err(ProviderError::api(
                codes::INCORRECT_STATE,
                format!("volume '{}' is {}", volume_id, vol.state),
            ));
        }
        vol.state = "in-use".to_string();
        vol.observations = 0;
        vol.attachment = Some(VolumeAttachment {
            instance_id: instance_id.to_string(),
            device_name: device_name.to_string(),
            state: "attaching".to_string(),
            delete_on_termination: false,
        });
        if let Some(inst) = st.instances.get_mut(instance_id) {
            inst.devices.push(AttachedDevice {
                device_name: device_name.to_string(),
                volume_id: volume_id.to_string(),
                delete_on_termination: false,
            });
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()> {
        let mut st = self.enter(ops::DELETE_VOLUME)?;
        let Some(vol) = st.volumes.get(volume_id) else {
            return Err(ProviderError::api(
                codes::VOLUME_NOT_FOUND,
                format!("The volume '{}' does not exist", volume_id),
            ));
        };
        if vol.attachment.is_some() {
            return Err(ProviderError::api(
                codes::VOLUME_IN_USE,
                format!("volume '{}' is attached", volume_id),
            ));
        }
        st.volumes.remove(volume_id);
        st.deleted_volumes.insert(volume_id.to_string());
        Ok(())
    }

    async fn set_delete_on_termination(
        &self,
        instance_id: &str,
        device_name: &str,
        delete_on_termination: bool,
    ) -> ProviderResult<()> {
        let mut st = self.enter(ops::SET_DELETE_ON_TERMINATION)?;
        let Some(inst) = st.instances.get_mut(instance_id) else {
            return Err(ProviderError::api(
                codes::INSTANCE_NOT_FOUND,
                format!("The instance ID '{}' does not exist", instance_id),
            ));
        };
        let Some(dev) = inst.devices.iter_mut().find(|d| d.device_name == device_name) else {
            return Err(ProviderError::api(
                "InvalidInstanceAttributeValue",
                format!("no device {} on {}", device_name, instance_id),
            ));
        };
        dev.delete_on_termination = delete_on_termination;
        let volume_id = dev.volume_id.clone();
        if let Some(att) = st
            .volumes
            .get_mut(&volume_id)
            .and_then(|v| v.attachment.as_mut())
        {
            att.delete_on_termination = delete_on_termination;
        }
        Ok(())
    }
}
