use httpmock::prelude::*;
use rand::rngs::mock::StepRng;
use refnet::core::code_registry::CodeRegistry;
use refnet::domain::model::{MemberStatus, ReferralCodeRecord};
use refnet::domain::ports::DocumentStore;
use refnet::{
    BindOutcome, EngineConfig, EngineError, LogNotifier, MemoryStore, NewMember,
    ProvisionalOutcome, ReferralEngine, WebhookNotifier,
};
use std::sync::Arc;
use std::time::Duration;

fn engine_with(config: EngineConfig) -> ReferralEngine<MemoryStore> {
    ReferralEngine::new(Arc::new(MemoryStore::new()), config, Arc::new(LogNotifier))
}

fn new_member(id: &str, code: Option<&str>) -> NewMember {
    NewMember {
        id: id.to_string(),
        referral_code: code.map(str::to_string),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_scenario_a_orphan_binds_to_root_after_payment() {
    let engine = engine_with(EngineConfig::default());
    engine.bootstrap_root().await.unwrap();

    let outcome = engine.register(new_member("A", None)).await.unwrap();
    assert_eq!(
        outcome.provisional,
        Some(ProvisionalOutcome::Fallback { code: "ROOT1".to_string() })
    );

    let a = engine.store().member("A").await.unwrap().unwrap().value;
    assert_eq!(a.provisional_ref.as_deref(), Some("ROOT1"));
    assert_eq!(a.status, MemberStatus::PendingPayment);

    engine.confirm_payment("A").await.unwrap();

    let a = engine.store().member("A").await.unwrap().unwrap().value;
    assert_eq!(a.referred_by.as_deref(), Some("ROOT1"));
    assert_eq!(a.referral_chain, vec!["ROOT1".to_string()]);
    assert!(a.provisional_ref.is_none());

    let root = engine.store().member("admin").await.unwrap().unwrap().value;
    assert_eq!(root.direct_referral_count, 1);
    assert_eq!(root.team_size, 1);
}

#[tokio::test]
async fn test_scenario_b_direct_code_binds_immediately() {
    let engine = engine_with(EngineConfig::default());
    engine.bootstrap_root().await.unwrap();

    let a_code = engine.register(new_member("A", None)).await.unwrap().referral_code;
    engine.confirm_payment("A").await.unwrap();

    let outcome = engine.register(new_member("B", Some(&a_code))).await.unwrap();
    assert_eq!(outcome.provisional, Some(ProvisionalOutcome::Direct { code: a_code.clone() }));
    assert!(matches!(outcome.binding, Some(BindOutcome::Bound { .. })));

    let b = engine.store().member("B").await.unwrap().unwrap().value;
    assert_eq!(b.referral_chain, vec!["ROOT1".to_string(), a_code.clone()]);
    assert!(b.provisional_ref.is_none());

    let a = engine.store().member("A").await.unwrap().unwrap().value;
    assert_eq!(a.team_size, 1);
    let root = engine.store().member("admin").await.unwrap().unwrap().value;
    assert_eq!(root.team_size, 2);
    assert_eq!(root.direct_referral_count, 1);
}

#[tokio::test]
async fn test_scenario_c_exhausted_code_generation_leaves_nothing_behind() {
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig::default();
    let codes = CodeRegistry::new(store.clone(), &config).with_rng(StepRng::new(0, 0));
    assert_eq!(codes.format().alphabet_size(), 31);

    let always_drawn = codes.draw_candidate();
    store
        .create_code_if_absent(ReferralCodeRecord::new(always_drawn.clone(), "someone"))
        .await
        .unwrap();

    let engine = ReferralEngine::with_code_registry(store.clone(), config, Arc::new(LogNotifier), codes);
    let err = engine.register(new_member("A", None)).await.unwrap_err();

    assert!(matches!(err, EngineError::CodeGenerationExhausted { attempts: 10 }));
    assert!(store.member("A").await.unwrap().is_none());
    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.referral_codes.len(), 1);
    assert_eq!(snapshot.referral_codes[&always_drawn].value.owner_id, "someone");
}

#[tokio::test]
async fn test_scenario_d_promotion_jumps_to_highest_satisfied_tier() {
    let engine = engine_with(EngineConfig::default());

    let mut member = refnet::domain::model::Member::new("D", "member");
    member.status = MemberStatus::Active;
    member.membership_paid = true;
    member.location = Some("Taipei".to_string());
    member.direct_referral_count = 20;
    member.team_size = 100;
    engine.store().insert_member(member).await;

    let result = engine.check_and_promote("D").await.unwrap();
    assert!(result.promoted);
    assert_eq!(result.previous_role, "member");
    assert_eq!(result.current_role, "director");

    let stored = engine.store().member("D").await.unwrap().unwrap().value;
    assert_eq!(stored.role_level, 4);
    assert_eq!(stored.role_promotion_history.len(), 1);
    assert_eq!(stored.role_promotion_history[0].from_level, 0);
    assert_eq!(stored.role_promotion_history[0].to_level, 4);
}

#[tokio::test]
async fn test_user_supplied_code_of_unbound_referrer_waits_for_payment() {
    let engine = engine_with(EngineConfig::default());
    engine.bootstrap_root().await.unwrap();

    let a_code = engine.register(new_member("A", None)).await.unwrap().referral_code;
    let outcome = engine.register(new_member("B", Some(&a_code))).await.unwrap();
    assert_eq!(outcome.provisional, Some(ProvisionalOutcome::Pending { code: a_code.clone() }));

    // B 付款時 A 尚未綁定，綁定失敗但付款成功
    let payment = engine.confirm_payment("B").await.unwrap();
    assert_eq!(payment.status, MemberStatus::Active);
    assert!(payment.referral_error.is_some());

    engine.confirm_payment("A").await.unwrap();
    assert!(matches!(engine.bind("B").await.unwrap(), BindOutcome::Bound { .. }));

    let b = engine.store().member("B").await.unwrap().unwrap().value;
    assert_eq!(b.referral_chain, vec!["ROOT1".to_string(), a_code]);
    assert!(!b.assigned_by_system);
}

#[tokio::test]
async fn test_promotion_notification_is_delivered_to_webhook() {
    let server = MockServer::start();
    let hook = server.mock(|when, then| {
        when.method(POST)
            .path("/notify")
            .json_body(serde_json::json!({
                "memberId": "A",
                "kind": {"type": "role_promoted", "from": "member", "to": "promoter"}
            }));
        then.status(200);
    });

    let notifier = WebhookNotifier::new(server.url("/notify"), Duration::from_secs(5));
    let engine = ReferralEngine::new(
        Arc::new(MemoryStore::new()),
        EngineConfig::default(),
        Arc::new(notifier),
    );
    engine.bootstrap_root().await.unwrap();

    let a_code = engine.register(new_member("A", None)).await.unwrap().referral_code;
    engine.confirm_payment("A").await.unwrap();
    for i in 0..5 {
        engine
            .register(new_member(&format!("child{}", i), Some(&a_code)))
            .await
            .unwrap();
    }
    assert_eq!(
        engine.store().member("A").await.unwrap().unwrap().value.role,
        "promoter"
    );

    // 晉升通知在提交後才送出
    hook.assert_hits(0);
    let report = engine.drain_outbox().await.unwrap();
    assert_eq!(report.failed, 0);
    hook.assert_hits(1);
}

#[tokio::test]
async fn test_orphan_sweep_binds_active_members_without_parent() {
    let engine = engine_with(EngineConfig::default());
    engine.bootstrap_root().await.unwrap();

    for id in ["o1", "o2", "o3"] {
        let mut member = refnet::domain::model::Member::new(id, "member");
        member.status = MemberStatus::Active;
        member.membership_paid = true;
        engine.store().insert_member(member).await;
        engine.ensure_code(id).await.unwrap();
    }

    let report = engine.fix_orphans("admin").await.unwrap();
    assert_eq!((report.scanned, report.migrated, report.errors), (3, 3, 0));

    let root = engine.store().member("admin").await.unwrap().unwrap().value;
    assert_eq!(root.direct_referral_count, 3);
    let o1 = engine.store().member("o1").await.unwrap().unwrap().value;
    assert!(o1.assigned_by_system);
    assert_eq!(o1.referred_by.as_deref(), Some("ROOT1"));

    let again = engine.fix_orphans("admin").await.unwrap();
    assert_eq!(again.scanned, 0);
}
