// Separately attached data volumes: attach flow, delete-on-termination and rollback

mod common;

use common::{create_mock, create_orchestrator, ownership_key, virtual_ids, web_template};
use skyforge_common::{Template, VolumeSpec};
use skyforge_orchestrator::OrchestratorError;
use skyforge_providers::inventory::ImageDescription;
use skyforge_providers::mock::ops;
use std::collections::BTreeSet;

/// Two keyed volumes on a template whose launch call cannot carry the key,
/// so they are created and attached after launch.
fn keyed_template() -> Template {
    web_template()
        .with_volumes(vec![
            VolumeSpec::new(50, "gp3").with_kms_key("kms-key-1"),
            VolumeSpec::new(100, "gp3").with_kms_key("kms-key-1"),
        ])
        .with_launch_volume_kms(false)
}

#[tokio::test(start_paused = true)]
async fn test_attach_failure_on_one_instance_keeps_the_rest() {
    let mock = create_mock();
    mock.fail_attach_for_tag(&ownership_key(), "vm-3");
    let orchestrator = create_orchestrator(&mock);

    let records = orchestrator
        .allocate(&keyed_template(), &virtual_ids(3), 2)
        .await
        .expect("two instances are enough");

    let kept: Vec<&str> = records.iter().map(|r| r.virtual_id.as_str()).collect();
    assert_eq!(kept, vec!["vm-1", "vm-2"]);
    assert_eq!(mock.live_instances().len(), 2);

    let survivors: BTreeSet<&str> = records.iter().map(|r| r.provider_id.as_str()).collect();
    let volumes = mock.volumes();
    assert_eq!(volumes.len(), 4);
    for v in &volumes {
        assert_eq!(v.state, "in-use");
        assert_eq!(v.attachments.len(), 1);
        let att = &v.attachments[0];
        assert!(survivors.contains(att.instance_id.as_str()));
        assert_eq!(att.state, "attached");
        assert!(att.delete_on_termination);
        let owner = records
            .iter()
            .find(|r| r.provider_id.as_str() == att.instance_id)
            .expect("attached to a survivor");
        assert_eq!(v.tags.get(&ownership_key()), Some(&owner.virtual_id.to_string()));
        assert_eq!(v.tags.get("team").map(String::as_str), Some("platform"));
    }
    // The failed instance's two volumes were deleted with it.
    assert_eq!(mock.deleted_volumes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_below_min_count_rolls_back_instances_and_volumes() {
    let mock = create_mock();
    mock.fail_attach_for_tag(&ownership_key(), "vm-3");
    let orchestrator = create_orchestrator(&mock);

    let err = orchestrator
        .allocate(&keyed_template(), &virtual_ids(3), 3)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::InsufficientCapacity {
            requested: 3,
            min_count: 3,
            acquired: 2
        }
    ));
    assert!(mock.live_instances().is_empty());
    assert!(mock.volumes().is_empty());
    assert_eq!(mock.deleted_volumes().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_devices_skip_names_mapped_by_the_image() {
    let mock = create_mock();
    mock.register_image(ImageDescription {
        image_id: "ami-0123".to_string(),
        root_device_name: Some("/dev/xvda".to_string()),
        block_device_names: vec!["/dev/xvda".to_string(), "/dev/sdf".to_string()],
    });
    let orchestrator = create_orchestrator(&mock);

    orchestrator
        .allocate(&keyed_template(), &virtual_ids(1), 1)
        .await
        .unwrap();

    let devices: BTreeSet<String> = mock
        .volumes()
        .iter()
        .flat_map(|v| v.attachments.iter().map(|a| a.device_name.clone()))
        .collect();
    let expected: BTreeSet<String> = ["/dev/sdg", "/dev/sdh"].iter().map(|s| s.to_string()).collect();
    assert_eq!(devices, expected);
}

#[tokio::test(start_paused = true)]
async fn test_unkeyed_volumes_ride_on_the_launch_call() {
    let mock = create_mock();
    let orchestrator = create_orchestrator(&mock);
    let template = web_template().with_volumes(vec![
        VolumeSpec::new(20, "gp3"),
        VolumeSpec::new(20, "gp3"),
    ]);

    let records = orchestrator.allocate(&template, &virtual_ids(1), 1).await.unwrap();

    assert_eq!(mock.calls(ops::CREATE_VOLUME), 0);
    assert_eq!(mock.calls(ops::ATTACH_VOLUME), 0);
    let instance = mock
        .instance(records[0].provider_id.as_str())
        .expect("instance exists");
    assert_eq!(instance.block_devices.len(), 2);
    assert!(instance.block_devices.iter().all(|d| d.delete_on_termination));
}

#[tokio::test(start_paused = true)]
async fn test_deleting_instances_takes_their_volumes() {
    let mock = create_mock();
    let orchestrator = create_orchestrator(&mock);
    let template = keyed_template();

    orchestrator.allocate(&template, &virtual_ids(2), 2).await.unwrap();
    assert_eq!(mock.volumes().len(), 4);

    orchestrator.delete(Some(&template), &virtual_ids(2)).await.unwrap();
    assert!(mock.volumes().is_empty());
    assert_eq!(mock.deleted_volumes().len(), 4);
}
