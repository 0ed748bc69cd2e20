//! Drive durability across node lifetimes, driven through the public API.

use std::collections::HashMap;
use std::time::Duration;

use spotdrive::test_support::{FAKE_ZONE, FakeProvider, ScriptedRunner};
use spotdrive::{
    Directory, NodeController, NodeRequest, RemoteShell, SshConfig, ToolkitConfig,
};

fn controller(
    provider: &FakeProvider,
    runner: &ScriptedRunner,
) -> NodeController<FakeProvider, ScriptedRunner> {
    let shell =
        RemoteShell::new(SshConfig::default(), runner.clone()).expect("default config is valid");
    let config = ToolkitConfig {
        instance_types: HashMap::from([(String::from("free"), String::from("t2.micro"))]),
        images: HashMap::from([(String::from("free"), String::from("ami-c51e3eb6"))]),
        spot_price: String::from("0.25"),
        ssh_user: String::from("ec2-user"),
        ssh_key_file: None,
        key_name: String::from("key"),
        security_group: String::from("default"),
        region: None,
    };
    NodeController::new(provider.clone(), shell, config)
        .with_poll_interval(Duration::from_millis(1))
}

#[tokio::test]
async fn drive_survives_node_replacement() {
    let provider = FakeProvider::new();
    let runner = ScriptedRunner::new();
    runner.succeed_when_empty();
    let ctrl = controller(&provider, &runner);

    ctrl.create(&NodeRequest::new("node-a").with_drive("data"))
        .await
        .expect("first node initialises the drive");
    assert_eq!(provider.volumes_named("data"), 1);

    ctrl.terminate("node-a", true)
        .await
        .expect("termination saves the drive");
    assert_eq!(
        provider.volumes_named("data"),
        0,
        "termination must delete the volume after snapshotting"
    );

    let saved = Directory::new(&provider)
        .latest_snapshot("data")
        .await
        .expect("fake provider does not fail")
        .expect("termination left a snapshot behind");

    ctrl.create(&NodeRequest::new("node-b").with_drive("data"))
        .await
        .expect("replacement node restores the drive");
    assert_eq!(
        provider.volumes_named("data"),
        1,
        "exactly one volume may carry the name at any time"
    );

    let mutations = provider.mutations();
    assert!(
        mutations
            .iter()
            .any(|entry| entry.starts_with("create-volume") && entry.ends_with(&saved.id)),
        "the replacement volume must come from snapshot {}: {mutations:?}",
        saved.id
    );
}

#[tokio::test]
async fn discarded_drive_leaves_no_history() {
    let provider = FakeProvider::new();
    let runner = ScriptedRunner::new();
    runner.succeed_when_empty();
    let ctrl = controller(&provider, &runner);

    ctrl.create(&NodeRequest::new("scratch-node").with_drive("scratch"))
        .await
        .expect("node with a scratch drive comes up");
    ctrl.terminate("scratch-node", false)
        .await
        .expect("termination discards the drive");

    assert_eq!(provider.volumes_named("scratch"), 0);
    let history = Directory::new(&provider)
        .snapshots("scratch")
        .await
        .expect("fake provider does not fail");
    assert!(history.is_empty(), "discard must not leave snapshots");
}
