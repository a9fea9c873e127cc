use anyhow::Context;
use clap::Parser;
use refnet::domain::ports::{DocumentStore, Notifier};
use refnet::utils::error::{EngineError, ErrorSeverity};
use refnet::utils::{logger, validation::Validate};
use refnet::{
    CliConfig, Command, EngineConfig, LogNotifier, MemoryStore, NewMember, ReferralEngine,
    SnapshotFile, WebhookNotifier,
};
use serde::Serialize;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliConfig::parse();

    let config = match &cli.config {
        Some(path) => match EngineConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("❌ Failed to load config file '{}': {}", path, e);
                eprintln!("💡 Make sure the file exists and is valid TOML format");
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };

    // 初始化日誌
    if config.json_logs() {
        logger::init_json_logger(config.log_level());
    } else {
        logger::init_cli_logger(cli.verbose);
    }
    tracing::info!("🚀 Starting refnet");
    if cli.verbose {
        tracing::debug!("CLI args: {:?}", cli);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    let snapshot_file = SnapshotFile::new(&cli.store);
    let snapshot = snapshot_file
        .load()
        .with_context(|| format!("loading store snapshot {}", cli.store))?;
    let store = Arc::new(MemoryStore::from_snapshot(snapshot));

    let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_config(&config.notifications) {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(LogNotifier),
    };
    let engine = ReferralEngine::new(store.clone(), config, notifier);

    let result = run(&engine, &cli).await;

    // 無論成功與否都保存已提交的狀態
    snapshot_file
        .save(&store.snapshot().await)
        .with_context(|| format!("saving store snapshot {}", cli.store))?;

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                "❌ Command failed: {} (Kind: {:?}, Severity: {:?})",
                e,
                e.kind(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
    }
}

async fn run(engine: &ReferralEngine<MemoryStore>, cli: &CliConfig) -> Result<String, EngineError> {
    let actor = cli.actor.as_str();
    match &cli.command {
        Command::Bootstrap => render(&engine.bootstrap_root().await?),
        Command::Register {
            id,
            code,
            location,
            device,
        } => {
            let outcome = engine
                .register(NewMember {
                    id: id.clone(),
                    referral_code: code.clone(),
                    location: location.clone(),
                    device_fingerprint: device.clone(),
                })
                .await?;
            render(&outcome)
        }
        Command::Pay { id } => render(&engine.confirm_payment(id).await?),
        Command::Bind { id, code } => match code {
            Some(code) => render(&engine.bind_direct(id, code).await?),
            None => render(&engine.bind(id).await?),
        },
        Command::EnsureCode { id } => render(&engine.ensure_code(id).await?),
        Command::Promote { id } => render(&engine.check_and_promote(id).await?),
        Command::Stats { id, force } => render(&engine.get_statistics(id, *force).await?),
        Command::Progress { id } => render(&engine.progress(id).await?),
        Command::Show { id } => {
            let member = engine
                .store()
                .member(id)
                .await?
                .ok_or_else(|| EngineError::MemberNotFound { member_id: id.clone() })?;
            render(&member.value)
        }
        Command::MigrateOrphans => render(&engine.fix_orphans(actor).await?),
        Command::RecomputeStats => render(&engine.recompute_all_stats(actor).await?),
        Command::MigrateLegacy => render(&engine.migrate_legacy(actor).await?),
        Command::VerifyChains => render(&engine.verify_chains(actor).await?),
        Command::DrainOutbox => render(&engine.drain_outbox().await?),
    }
}

fn render<T: Serialize>(value: &T) -> Result<String, EngineError> {
    Ok(serde_json::to_string_pretty(value)?)
}
