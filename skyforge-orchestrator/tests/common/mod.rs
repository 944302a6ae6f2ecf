// Common test fixtures: an in-memory cloud and orchestrators wired to it
#![allow(dead_code)]

use chrono::Utc;
use skyforge_common::{Template, VirtualInstanceId};
use skyforge_orchestrator::{AllocationOrchestrator, Cancellation, Settings, StrategyContext};
use skyforge_providers::inventory::DescribedInstance;
use skyforge_providers::mock::MockProvider;
use skyforge_providers::{ClientConfig, ClientProvider, CloudComputeClient};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Short timeouts so partial-failure paths finish quickly on the paused clock.
pub fn test_settings() -> Settings {
    Settings {
        retry_backoff: Duration::from_secs(1),
        instance_wait_timeout: Duration::from_secs(30),
        tagging_timeout: Duration::from_secs(30),
        volume_available_timeout: Duration::from_secs(30),
        volume_attach_timeout: Duration::from_secs(30),
        volume_delete_timeout: Duration::from_secs(30),
        spot_fulfillment_timeout: Duration::from_secs(30),
        group_wait_timeout: Duration::from_secs(30),
        ..Settings::default()
    }
}

pub fn ownership_key() -> String {
    test_settings().tag_keys.ownership
}

pub fn create_mock() -> Arc<MockProvider> {
    skyforge_orchestrator::logger::init();
    Arc::new(MockProvider::new())
}

pub fn create_orchestrator(mock: &Arc<MockProvider>) -> AllocationOrchestrator {
    create_orchestrator_with(mock, test_settings(), Cancellation::never())
}

pub fn create_orchestrator_with(
    mock: &Arc<MockProvider>,
    settings: Settings,
    cancel: Cancellation,
) -> AllocationOrchestrator {
    let client = mock.clone();
    let clients: ClientProvider<dyn CloudComputeClient> =
        ClientProvider::new("compute", move |_cfg| {
            Ok(client.clone() as Arc<dyn CloudComputeClient>)
        });
    AllocationOrchestrator::new(clients, ClientConfig::default(), settings, cancel)
        .expect("test settings are valid")
}

pub fn create_context(mock: &Arc<MockProvider>) -> StrategyContext {
    StrategyContext::new(mock.clone(), Arc::new(test_settings()), Cancellation::never())
}

pub fn web_template() -> Template {
    Template::new("web", "ami-0123", "m5.large")
        .with_subnet("subnet-a")
        .with_key_name("ops")
        .with_availability_zone("zone-a")
        .with_tag("team", "platform")
}

pub fn virtual_ids(n: usize) -> Vec<VirtualInstanceId> {
    (1..=n)
        .map(|i| VirtualInstanceId::from(format!("vm-{}", i)))
        .collect()
}

/// A described instance as the cloud would report it.
pub fn described(instance_id: &str, state: &str, tags: &[(&str, &str)]) -> DescribedInstance {
    DescribedInstance {
        instance_id: instance_id.to_string(),
        state: state.to_string(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        instance_type: Some("m5.large".to_string()),
        image_id: Some("ami-0123".to_string()),
        key_name: Some("ops".to_string()),
        availability_zone: Some("zone-a".to_string()),
        private_ip_address: Some("10.0.0.10".to_string()),
        launch_time: Some(Utc::now()),
        block_devices: Vec::new(),
    }
}
