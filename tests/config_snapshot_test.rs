use refnet::domain::ports::DocumentStore;
use refnet::utils::validation::Validate;
use refnet::{EngineConfig, ErrorKind, LogNotifier, MemoryStore, NewMember, ReferralEngine, SnapshotFile};
use std::io::Write;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

const CUSTOM_CONFIG: &str = r#"
[referral]
root_code = "${REFNET_TEST_ROOT}"
root_member_id = "founder"
admin_ids = ["founder"]
code_prefix = "TW"
code_length = 5

[progression]
base_role = "starter"

[[progression.tiers]]
name = "bronze"
direct_required = 1
team_required = 1

[[progression.tiers]]
name = "silver"
direct_required = 3
team_required = 5
requires_location = true

[fraud]
enabled = false
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_engine_runs_with_custom_toml_ladder() {
    std::env::set_var("REFNET_TEST_ROOT", "FOUNDER");
    let file = write_config(CUSTOM_CONFIG);

    let config = EngineConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.referral.root_code, "FOUNDER");
    assert_eq!(config.progression.tiers.len(), 2);

    let engine = ReferralEngine::new(Arc::new(MemoryStore::new()), config, Arc::new(LogNotifier));
    engine.bootstrap_root().await.unwrap();

    let outcome = engine
        .register(NewMember {
            id: "alice".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(outcome.referral_code.starts_with("TW"));
    assert_eq!(outcome.referral_code.len(), 7);
    engine.confirm_payment("alice").await.unwrap();

    engine
        .register(NewMember {
            id: "bob".to_string(),
            referral_code: Some(outcome.referral_code.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    let alice = engine.store().member("alice").await.unwrap().unwrap().value;
    assert_eq!(alice.referral_chain, vec!["FOUNDER".to_string()]);
    assert_eq!(alice.role, "bronze");

    let bob = engine.store().member("bob").await.unwrap().unwrap().value;
    assert_eq!(bob.role, "starter");

    // 只有設定檔中的管理員可以執行維護作業
    let err = engine.verify_chains("admin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(engine.verify_chains("founder").await.unwrap().is_consistent());
}

#[test]
fn test_invalid_ladder_is_rejected() {
    let file = write_config(
        r#"
[[progression.tiers]]
name = "bronze"
direct_required = 5
team_required = 5

[[progression.tiers]]
name = "silver"
direct_required = 5
team_required = 10
"#,
    );

    let config = EngineConfig::from_file(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[tokio::test]
async fn test_state_survives_snapshot_round_trip() {
    let dir = TempDir::new().unwrap();
    let file = SnapshotFile::new(dir.path().join("store.json"));

    let first_code = {
        let store = Arc::new(MemoryStore::from_snapshot(file.load().unwrap()));
        let engine = ReferralEngine::new(store.clone(), EngineConfig::default(), Arc::new(LogNotifier));
        engine.bootstrap_root().await.unwrap();
        let outcome = engine
            .register(NewMember {
                id: "a".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        file.save(&store.snapshot().await).unwrap();
        outcome.referral_code
    };

    let store = Arc::new(MemoryStore::from_snapshot(file.load().unwrap()));
    let engine = ReferralEngine::new(store.clone(), EngineConfig::default(), Arc::new(LogNotifier));
    assert!(!engine.bootstrap_root().await.unwrap());

    engine.confirm_payment("a").await.unwrap();
    let a = store.member("a").await.unwrap().unwrap().value;
    assert_eq!(a.referral_code.as_deref(), Some(first_code.as_str()));
    assert_eq!(a.referred_by.as_deref(), Some("ROOT1"));
    assert_eq!(store.member("admin").await.unwrap().unwrap().value.team_size, 1);
}
