// Reconciler batching, deduplication and eventual-consistency retries

mod common;

use common::{create_context, create_mock, described, ownership_key, virtual_ids, web_template};
use skyforge_common::{InstanceState, ProviderInstanceId, VirtualInstanceId};
use skyforge_orchestrator::{IdResolution, OrchestratorError};
use skyforge_providers::codes;
use skyforge_providers::mock::ops;
use skyforge_providers::CloudComputeClient;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_describe_by_id_is_batched() {
    let mock = create_mock();
    mock.set_page_size(1000);
    let ids: Vec<VirtualInstanceId> = (0..450)
        .map(|i| {
            let id = format!("i-{:05}", i);
            mock.insert_instance(described(&id, "running", &[]));
            VirtualInstanceId::from(id)
        })
        .collect();
    let ctx = create_context(&mock);

    let found = ctx
        .reconciler
        .find(&ids, IdResolution::ByProviderId, None)
        .await
        .unwrap();

    assert_eq!(found.len(), 450);
    assert_eq!(mock.calls(ops::DESCRIBE_INSTANCES), 5);
}

#[tokio::test(start_paused = true)]
async fn test_tag_lookup_splits_batches_and_follows_pages() {
    let mock = create_mock();
    mock.set_page_size(2);
    let key = ownership_key();
    let ids = virtual_ids(450);
    for (n, id) in ids.iter().enumerate() {
        mock.insert_instance(described(&format!("i-{:05}", n), "running", &[(key.as_str(), id.as_str())]));
    }
    let ctx = create_context(&mock);

    let found = ctx
        .reconciler
        .find(&ids, IdResolution::ByOwnershipTag, Some(&web_template()))
        .await
        .unwrap();

    assert_eq!(found.len(), 450);
    assert!(ids.iter().all(|id| found.get(id).is_some()));
    // Batches of 200, 200 and 50 values, two instances per page.
    assert_eq!(mock.calls(ops::DESCRIBE_INSTANCES), 100 + 100 + 25);
}

#[tokio::test(start_paused = true)]
async fn test_missing_ids_are_dropped_not_fatal() {
    let mock = create_mock();
    mock.insert_instance(described("i-1", "running", &[]));
    mock.insert_instance(described("i-2", "stopped", &[]));
    let ctx = create_context(&mock);

    let ids = vec![
        VirtualInstanceId::from("i-1"),
        VirtualInstanceId::from("i-gone"),
        VirtualInstanceId::from("i-2"),
    ];
    let found = ctx
        .reconciler
        .find(&ids, IdResolution::ByProviderId, None)
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert!(found.get(&ids[1]).is_none());
    assert_eq!(found.get(&ids[2]).unwrap().state, InstanceState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_running_record_wins_over_terminated() {
    let mock = create_mock();
    let key = ownership_key();
    mock.insert_instance(described("i-old", "terminated", &[(key.as_str(), "vm-1")]));
    mock.insert_instance(described("i-new", "running", &[(key.as_str(), "vm-1")]));
    let ctx = create_context(&mock);

    let found = ctx
        .reconciler
        .find(&virtual_ids(1), IdResolution::ByOwnershipTag, Some(&web_template()))
        .await
        .unwrap();

    let record = found.get(&VirtualInstanceId::from("vm-1")).unwrap();
    assert_eq!(record.provider_id, ProviderInstanceId::from("i-new"));
    assert_eq!(record.state, InstanceState::Running);
    assert!(found.anomalies.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_two_live_instances_are_flagged_and_both_reachable() {
    let mock = create_mock();
    let key = ownership_key();
    mock.insert_instance(described("i-a", "running", &[(key.as_str(), "vm-1")]));
    mock.insert_instance(described("i-b", "running", &[(key.as_str(), "vm-1")]));
    let ctx = create_context(&mock);

    let found = ctx
        .reconciler
        .find(&virtual_ids(1), IdResolution::ByOwnershipTag, None)
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found.anomalies, virtual_ids(1));
    assert_eq!(found.live_instances().count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_retried_until_instances_appear() {
    let mock = create_mock();
    let key = ownership_key();
    let ids = virtual_ids(5);
    for (n, id) in ids.iter().enumerate() {
        mock.insert_instance(described(&format!("i-{}", n), "running", &[(key.as_str(), id.as_str())]));
    }
    mock.inject_error(ops::DESCRIBE_INSTANCES, codes::INSTANCE_NOT_FOUND, 2);
    let ctx = create_context(&mock);

    let found = ctx
        .reconciler
        .wait_until_found(
            &ids,
            IdResolution::ByOwnershipTag,
            None,
            |r| r.state == InstanceState::Running,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    assert_eq!(found.len(), 5);
    assert_eq!(mock.calls(ops::DESCRIBE_INSTANCES), 3);
}

#[tokio::test(start_paused = true)]
async fn test_wait_returns_partial_snapshot_at_deadline() {
    let mock = create_mock();
    let key = ownership_key();
    mock.insert_instance(described("i-1", "running", &[(key.as_str(), "vm-1")]));
    mock.insert_instance(described("i-2", "stopped", &[(key.as_str(), "vm-2")]));
    let ctx = create_context(&mock);

    let found = ctx
        .reconciler
        .wait_until_found(
            &virtual_ids(2),
            IdResolution::ByOwnershipTag,
            None,
            |r| r.state == InstanceState::Running,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(
        found.get(&VirtualInstanceId::from("vm-2")).unwrap().state,
        InstanceState::Stopped
    );
    assert!(mock.calls(ops::DESCRIBE_INSTANCES) > 1);
}

#[tokio::test(start_paused = true)]
async fn test_tag_round_trip() {
    let mock = create_mock();
    let ctx = create_context(&mock);
    let template = web_template();

    for raw in ["vm-1", "a0b1c2d3-e4f5", "worker/eu-west-1/42"] {
        let launched = mock
            .run_instances(&skyforge_providers::inventory::LaunchRequest {
                image_id: template.image_id.clone(),
                instance_type: template.instance_type.clone(),
                key_name: template.key_name.clone(),
                count: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let provider_id = ProviderInstanceId::from(launched[0].instance_id.clone());
        let virtual_id = VirtualInstanceId::from(raw);

        mock.inject_error(ops::CREATE_TAGS, codes::INSTANCE_NOT_FOUND, 2);
        mock.reset_calls();
        ctx.tagger
            .tag(
                mock.as_ref(),
                &provider_id,
                &virtual_id,
                &template,
                ctx.policy(Duration::from_secs(30)),
                &ctx.cancel,
            )
            .await
            .unwrap();
        assert_eq!(mock.calls(ops::CREATE_TAGS), 3);

        let instance = mock.instance(provider_id.as_str()).unwrap();
        let resolved = ctx.tagger.resolve_ownership(&instance, Some(&template)).unwrap();
        assert_eq!(resolved, virtual_id);
    }
}

#[tokio::test(start_paused = true)]
async fn test_untagged_instance_is_an_ownership_violation() {
    let mock = create_mock();
    mock.insert_instance(described("i-stray", "running", &[("Name", "stray")]));
    let ctx = create_context(&mock);

    let instance = mock.instance("i-stray").unwrap();
    let err = ctx.tagger.resolve_ownership(&instance, None).unwrap_err();
    assert!(matches!(err, OrchestratorError::OwnershipViolation { .. }));
}
