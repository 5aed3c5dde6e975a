//! Deploy runs against the in-memory provider.

use std::path::PathBuf;

use fleet_infra::deployer::{Confirm, DeployOptions, FleetDeployer};
use fleet_infra::{Error, Result};
use fleet_infra::store::DesiredStateStore;
use fleet_infra::test_utils::{MockProvider, ScriptedConfirm, live_instance};
use fleet_infra::types::{InstanceId, InstanceState};
use serde_json::{Value, json};
use tempfile::TempDir;

fn store_with(dir: &TempDir, doc: Value) -> DesiredStateStore {
    let path = dir.path().join("fleet.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    DesiredStateStore::new(path, "us-east-1")
}

fn read_doc(store: &DesiredStateStore) -> Value {
    serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap()
}

fn options() -> DeployOptions {
    DeployOptions {
        key_name: Some("deploy".into()),
        security_groups: vec!["web".into()],
        verify_recorded_ids: false,
    }
}

fn development(machines: Value) -> Value {
    json!({ "us-east-1": { "machines": { "development": machines } } })
}

/// Says yes after rewriting the document, like a second operator saving
/// while the deploy is running.
struct EditThenConfirm {
    path: PathBuf,
    edit: fn(&mut Value),
}

impl Confirm for EditThenConfirm {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        let mut doc: Value = serde_json::from_slice(&std::fs::read(&self.path).unwrap()).unwrap();
        (self.edit)(&mut doc);
        std::fs::write(&self.path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
        Ok(true)
    }
}

// ============================================================================
// Provisioning
// ============================================================================

#[tokio::test]
async fn provisions_machines_without_id_and_records_them() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        &dir,
        development(json!({
            "web1": { "image": "ami-42", "size": "m1.large", "placement": "us-east-1a", "server_type": "app" },
            "db1": { "image": "ami-7", "id": "i-77" }
        })),
    );
    let provider = MockProvider::new().with_image("ami-42");
    let confirm = ScriptedConfirm::new(true);

    let report = FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap();

    assert_eq!(report.provisioned, vec![("web1".to_string(), InstanceId::from("i-1"))]);
    assert_eq!(report.skipped, vec!["db1".to_string()]);
    assert_eq!(
        confirm.prompts(),
        vec!["Do you wish to stage development servers with the following names: web1?".to_string()]
    );

    let launches = provider.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].instance_type, "m1.large");
    assert_eq!(launches[0].placement.as_deref(), Some("us-east-1a"));
    assert_eq!(launches[0].key_name.as_deref(), Some("deploy"));

    let tags = provider.tags_for(&InstanceId::from("i-1"));
    assert!(tags.contains(&("Stage".to_string(), "development".to_string())));
    assert!(tags.contains(&("Server Type".to_string(), "app".to_string())));

    let doc = read_doc(&store);
    let machines = &doc["us-east-1"]["machines"]["development"];
    assert_eq!(machines["web1"]["id"], "i-1");
    assert_eq!(machines["db1"]["id"], "i-77");
}

#[tokio::test]
async fn size_and_placement_fall_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, development(json!({ "web1": { "image": "ami-42" } })));
    let provider = MockProvider::new().with_image("ami-42");
    let confirm = ScriptedConfirm::new(true);

    FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap();

    let launches = provider.launches();
    assert_eq!(launches[0].instance_type, "m1.small");
    assert_eq!(launches[0].placement.as_deref(), Some("us-east-1b"));
}

#[tokio::test]
async fn second_deploy_provisions_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        &dir,
        development(json!({
            "web1": { "image": "ami-42" },
            "web2": { "image": "ami-42" }
        })),
    );
    let provider = MockProvider::new().with_image("ami-42");
    let confirm = ScriptedConfirm::new(true);
    let deployer = FleetDeployer::new(&provider, &store, &confirm, options());

    let first = deployer.deploy("development").await.unwrap();
    let after_first = std::fs::read(store.path()).unwrap();
    let second = deployer.deploy("development").await.unwrap();

    assert_eq!(first.provisioned.len(), 2);
    assert!(second.provisioned.is_empty());
    assert_eq!(second.skipped, vec!["web1".to_string(), "web2".to_string()]);
    assert_eq!(provider.launches().len(), 2);
    assert_eq!(confirm.prompts().len(), 1);
    assert_eq!(std::fs::read(store.path()).unwrap(), after_first);
}

// ============================================================================
// Refusals
// ============================================================================

#[tokio::test]
async fn unknown_stage_makes_no_provider_calls() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, development(json!({ "web1": { "image": "ami-42" } })));
    let provider = MockProvider::new().with_image("ami-42");
    let confirm = ScriptedConfirm::new(true);

    let err = FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("production")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound(_)));
    assert!(provider.calls().is_empty());
    assert!(confirm.prompts().is_empty());
}

#[tokio::test]
async fn declined_confirmation_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, development(json!({ "web1": { "image": "ami-42" } })));
    let before = std::fs::read(store.path()).unwrap();
    let provider = MockProvider::new().with_image("ami-42");
    let confirm = ScriptedConfirm::new(false);

    let err = FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AbortedByOperator(_)));
    assert!(provider.launches().is_empty());
    assert_eq!(std::fs::read(store.path()).unwrap(), before);
}

#[tokio::test]
async fn missing_key_name_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, development(json!({ "web1": { "image": "ami-42" } })));
    let provider = MockProvider::new().with_image("ami-42");
    let confirm = ScriptedConfirm::new(true);
    let options = DeployOptions {
        key_name: None,
        ..options()
    };

    let err = FleetDeployer::new(&provider, &store, &confirm, options)
        .deploy("development")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert!(provider.launches().is_empty());
}

#[tokio::test]
async fn unresolvable_image_launches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, development(json!({ "web1": { "image": "ami-missing" } })));
    let before = std::fs::read(store.path()).unwrap();
    let provider = MockProvider::new();
    let confirm = ScriptedConfirm::new(true);

    let err = FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound(_)));
    assert!(provider.launches().is_empty());
    assert_eq!(std::fs::read(store.path()).unwrap(), before);
}

// ============================================================================
// Failures part way and stale ids
// ============================================================================

#[tokio::test]
async fn launch_failure_keeps_ids_obtained_so_far() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        &dir,
        development(json!({
            "web1": { "image": "ami-42" },
            "web2": { "image": "ami-broken" },
            "web3": { "image": "ami-42" }
        })),
    );
    let provider = MockProvider::new().with_image("ami-42").with_image("ami-broken");
    provider.fail_launches_of("ami-broken");
    let confirm = ScriptedConfirm::new(true);

    let err = FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap_err();

    assert_eq!(err.provider_code(), Some("InsufficientInstanceCapacity"));
    assert_eq!(provider.launches().len(), 1);

    let doc = read_doc(&store);
    let machines = &doc["us-east-1"]["machines"]["development"];
    assert_eq!(machines["web1"]["id"], "i-1");
    assert!(machines["web2"].get("id").is_none());
    assert!(machines["web3"].get("id").is_none());
}

#[tokio::test]
async fn stale_ids_are_kept_unless_verification_is_requested() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        &dir,
        development(json!({
            "web1": { "image": "ami-42", "id": "i-gone" },
            "web2": { "image": "ami-42", "id": "i-dead" },
            "web3": { "image": "ami-42", "id": "i-live" }
        })),
    );
    let provider = MockProvider::new().with_image("ami-42");
    provider.add_instance(live_instance("i-dead", InstanceState::Terminated));
    provider.add_instance(live_instance("i-live", InstanceState::Running));
    let confirm = ScriptedConfirm::new(true);

    let plain = FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap();
    assert!(plain.provisioned.is_empty());

    let verifying = DeployOptions {
        verify_recorded_ids: true,
        ..options()
    };
    let report = FleetDeployer::new(&provider, &store, &confirm, verifying)
        .deploy("development")
        .await
        .unwrap();

    let names: Vec<&str> = report.provisioned.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["web1", "web2"]);
    assert_eq!(report.skipped, vec!["web3".to_string()]);

    let doc = read_doc(&store);
    let machines = &doc["us-east-1"]["machines"]["development"];
    assert_eq!(machines["web1"]["id"], "i-1");
    assert_eq!(machines["web2"]["id"], "i-2");
    assert_eq!(machines["web3"]["id"], "i-live");
}

#[tokio::test]
async fn other_regions_and_unknown_fields_survive_a_deploy() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        &dir,
        json!({
            "us-east-1": {
                "key": "deploy",
                "machines": { "development": { "web1": { "image": "ami-42", "owner": "ops" } } }
            },
            "eu-west-1": { "machines": { "production": { "app": { "id": "i-9" } } } }
        }),
    );
    let provider = MockProvider::new().with_image("ami-42");
    let confirm = ScriptedConfirm::new(true);

    FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap();

    let doc = read_doc(&store);
    assert_eq!(doc["us-east-1"]["key"], "deploy");
    assert_eq!(doc["us-east-1"]["machines"]["development"]["web1"]["owner"], "ops");
    assert_eq!(doc["eu-west-1"]["machines"]["production"]["app"]["id"], "i-9");
}

// ============================================================================
// Concurrent edits and tagging failures
// ============================================================================

#[tokio::test]
async fn edit_during_deploy_is_merged_with_the_new_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        &dir,
        development(json!({
            "web1": { "image": "ami-42" },
            "db1": { "image": "ami-7", "id": "i-77" }
        })),
    );
    let provider = MockProvider::new().with_image("ami-42").with_image("ami-7");
    let editor = EditThenConfirm {
        path: store.path().to_path_buf(),
        edit: |doc| {
            let machines = &mut doc["us-east-1"]["machines"]["development"];
            machines["db1"]["owner"] = json!("ops");
            machines["cache1"] = json!({ "image": "ami-7" });
        },
    };

    let report = FleetDeployer::new(&provider, &store, &editor, options())
        .deploy("development")
        .await
        .unwrap();

    assert_eq!(report.provisioned, vec![("web1".to_string(), InstanceId::from("i-1"))]);
    let doc = read_doc(&store);
    let machines = &doc["us-east-1"]["machines"]["development"];
    assert_eq!(machines["web1"]["id"], "i-1");
    assert_eq!(machines["db1"]["owner"], "ops");
    assert_eq!(machines["db1"]["id"], "i-77");
    assert!(machines["cache1"].get("id").is_none());

    // The rerun only picks up the machine added meanwhile.
    let confirm = ScriptedConfirm::new(true);
    let rerun = FleetDeployer::new(&provider, &store, &confirm, options())
        .deploy("development")
        .await
        .unwrap();

    assert_eq!(rerun.provisioned, vec![("cache1".to_string(), InstanceId::from("i-2"))]);
    let launches = provider.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].image_id, "ami-7");
}

#[tokio::test]
async fn id_recorded_by_another_writer_meanwhile_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(&dir, development(json!({ "web1": { "image": "ami-42" } })));
    let provider = MockProvider::new().with_image("ami-42");
    let editor = EditThenConfirm {
        path: store.path().to_path_buf(),
        edit: |doc| doc["us-east-1"]["machines"]["development"]["web1"]["id"] = json!("i-other"),
    };

    FleetDeployer::new(&provider, &store, &editor, options())
        .deploy("development")
        .await
        .unwrap();

    let doc = read_doc(&store);
    assert_eq!(doc["us-east-1"]["machines"]["development"]["web1"]["id"], "i-other");
}

#[tokio::test]
async fn tagging_failure_still_records_the_launched_instance() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        &dir,
        development(json!({
            "web1": { "image": "ami-42" },
            "web2": { "image": "ami-42" }
        })),
    );
    let provider = MockProvider::new().with_image("ami-42");
    provider.fail_next_tagging("RequestLimitExceeded");
    let confirm = ScriptedConfirm::new(true);
    let deployer = FleetDeployer::new(&provider, &store, &confirm, options());

    let err = deployer.deploy("development").await.unwrap_err();

    match &err {
        Error::Untagged { instance, .. } => assert_eq!(instance, &InstanceId::from("i-1")),
        other => panic!("expected Untagged, got {other:?}"),
    }
    assert_eq!(err.provider_code(), Some("RequestLimitExceeded"));
    let doc = read_doc(&store);
    let machines = &doc["us-east-1"]["machines"]["development"];
    assert_eq!(machines["web1"]["id"], "i-1");
    assert!(machines["web2"].get("id").is_none());

    let rerun = deployer.deploy("development").await.unwrap();

    assert_eq!(rerun.provisioned, vec![("web2".to_string(), InstanceId::from("i-2"))]);
    assert_eq!(rerun.skipped, vec!["web1".to_string()]);
    assert_eq!(provider.launches().len(), 2);
}
