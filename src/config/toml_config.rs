use crate::domain::ports::ConfigProvider;
use crate::utils::error::{EngineError, Result};
use crate::utils::retry::RetryConfig;
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CODE_ALPHABET: &str = "ABCDEFGHJKMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub referral: ReferralConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub progression: ProgressionConfig,
    #[serde(default)]
    pub fraud: FraudConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    /// 孤兒會員的預設上線代碼（管理員根節點）
    pub root_code: String,
    pub root_member_id: String,
    pub admin_ids: Vec<String>,
    pub code_prefix: String,
    pub code_length: usize,
    pub code_alphabet: String,
    pub max_generation_attempts: u32,
    pub max_chain_depth: usize,
    pub page_size: usize,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            root_code: "ROOT1".to_string(),
            root_member_id: "admin".to_string(),
            admin_ids: vec!["admin".to_string()],
            code_prefix: "RF".to_string(),
            code_length: 6,
            code_alphabet: DEFAULT_CODE_ALPHABET.to_string(),
            max_generation_attempts: 10,
            max_chain_depth: 10,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamSizeStrategy {
    ChainMembership,
    TreeWalk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub strategy: TeamSizeStrategy,
    pub tree_walk_max_depth: usize,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            strategy: TeamSizeStrategy::ChainMembership,
            tree_walk_max_depth: 10,
            cache_ttl_seconds: 30,
            cache_max_entries: 10_000,
            batch_size: 50,
            batch_pause_ms: 100,
        }
    }
}

impl StatisticsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub direct_required: u64,
    pub team_required: u64,
    #[serde(default)]
    pub requires_location: bool,
}

impl TierConfig {
    fn new(name: &str, direct_required: u64, team_required: u64, requires_location: bool) -> Self {
        Self {
            name: name.to_string(),
            direct_required,
            team_required,
            requires_location,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressionConfig {
    pub base_role: String,
    pub tiers: Vec<TierConfig>,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            base_role: "member".to_string(),
            tiers: vec![
                TierConfig::new("promoter", 2, 5, false),
                TierConfig::new("leader", 5, 20, false),
                TierConfig::new("manager", 10, 50, false),
                TierConfig::new("director", 20, 100, true),
                TierConfig::new("executive", 50, 500, true),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    pub enabled: bool,
    pub fingerprint_reuse_threshold: u64,
    pub hourly_referral_cap: u64,
    pub daily_referral_cap: u64,
    pub pattern_min_referrals: u64,
    pub pattern_unpaid_ratio: f64,
    pub fraud_score_threshold: u8,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fingerprint_reuse_threshold: 3,
            hourly_referral_cap: 10,
            daily_referral_cap: 50,
            pattern_min_referrals: 10,
            pattern_unpaid_ratio: 0.8,
            fraud_score_threshold: 70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl TransactionConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// 任務失敗幾次後標記為 failed
    pub max_attempts: u32,
    pub batch_size: usize,
    pub delivery_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            batch_size: 100,
            delivery_retries: 3,
            retry_initial_backoff_ms: 200,
            poll_interval_ms: 1_000,
        }
    }
}

impl OutboxConfig {
    pub fn delivery_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.delivery_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: Option<String>,
    pub json: Option<bool>,
}

impl EngineConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EngineError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| EngineError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${ROOT_CODE})
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| EngineError::ConfigError {
            message: format!("Invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        let referral = &self.referral;
        validation::validate_non_empty_string("referral.root_code", &referral.root_code)?;
        validation::validate_non_empty_string("referral.root_member_id", &referral.root_member_id)?;
        validation::validate_non_empty_string("referral.code_prefix", &referral.code_prefix)?;
        if !referral
            .code_prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(EngineError::InvalidConfigValueError {
                field: "referral.code_prefix".to_string(),
                value: referral.code_prefix.clone(),
                reason: "Prefix must be uppercase letters or digits".to_string(),
            });
        }
        validation::validate_range("referral.code_length", referral.code_length, 4, 16)?;
        validation::validate_alphabet("referral.code_alphabet", &referral.code_alphabet)?;
        validation::validate_positive_number(
            "referral.max_generation_attempts",
            referral.max_generation_attempts as usize,
            1,
        )?;
        validation::validate_range("referral.max_chain_depth", referral.max_chain_depth, 1, 64)?;
        validation::validate_positive_number("referral.page_size", referral.page_size, 1)?;

        let stats = &self.statistics;
        validation::validate_range(
            "statistics.tree_walk_max_depth",
            stats.tree_walk_max_depth,
            1,
            64,
        )?;
        validation::validate_positive_number(
            "statistics.cache_max_entries",
            stats.cache_max_entries,
            1,
        )?;
        validation::validate_positive_number("statistics.batch_size", stats.batch_size, 1)?;

        self.validate_ladder()?;

        validation::validate_range(
            "fraud.pattern_unpaid_ratio",
            self.fraud.pattern_unpaid_ratio,
            0.0,
            1.0,
        )?;
        validation::validate_range("fraud.fraud_score_threshold", self.fraud.fraud_score_threshold, 1, 100)?;

        validation::validate_positive_number(
            "transactions.max_attempts",
            self.transactions.max_attempts as usize,
            1,
        )?;
        validation::validate_positive_number(
            "outbox.max_attempts",
            self.outbox.max_attempts as usize,
            1,
        )?;
        validation::validate_positive_number("outbox.batch_size", self.outbox.batch_size, 1)?;

        let notifications = &self.notifications;
        if let Some(timeout) = notifications.timeout_seconds {
            // 只設定 timeout 而沒有 webhook 代表設定不完整
            validation::validate_required_field("notifications.webhook_url", &notifications.webhook_url)?;
            validation::validate_range("notifications.timeout_seconds", timeout, 1, 300)?;
        }
        if let Some(url) = &notifications.webhook_url {
            validation::validate_url("notifications.webhook_url", url)?;
        }

        Ok(())
    }

    /// 驗證晉升階梯：名稱唯一，兩個門檻都必須嚴格遞增
    fn validate_ladder(&self) -> Result<()> {
        let progression = &self.progression;
        validation::validate_non_empty_string("progression.base_role", &progression.base_role)?;
        if progression.tiers.is_empty() {
            return Err(EngineError::ConfigValidationError {
                field: "progression.tiers".to_string(),
                message: "At least one tier is required".to_string(),
            });
        }

        let mut names = HashSet::new();
        names.insert(progression.base_role.as_str());
        names.insert(crate::domain::model::ADMIN_ROLE);
        for tier in &progression.tiers {
            validation::validate_non_empty_string("progression.tiers.name", &tier.name)?;
            if !names.insert(tier.name.as_str()) {
                return Err(EngineError::InvalidConfigValueError {
                    field: "progression.tiers.name".to_string(),
                    value: tier.name.clone(),
                    reason: "Tier names must be unique and differ from the base and admin roles"
                        .to_string(),
                });
            }
        }

        let direct: Vec<u64> = progression.tiers.iter().map(|t| t.direct_required).collect();
        let team: Vec<u64> = progression.tiers.iter().map(|t| t.team_required).collect();
        validation::validate_strictly_increasing("progression.tiers.direct_required", &direct)?;
        validation::validate_strictly_increasing("progression.tiers.team_required", &team)?;

        Ok(())
    }

    pub fn log_level(&self) -> &str {
        self.monitoring
            .as_ref()
            .and_then(|m| m.log_level.as_deref())
            .unwrap_or("info")
    }

    pub fn json_logs(&self) -> bool {
        self.monitoring
            .as_ref()
            .and_then(|m| m.json)
            .unwrap_or(false)
    }
}

impl ConfigProvider for EngineConfig {
    fn fallback_root_code(&self) -> &str {
        &self.referral.root_code
    }

    fn root_member_id(&self) -> &str {
        &self.referral.root_member_id
    }

    fn is_admin(&self, member_id: &str) -> bool {
        self.referral.admin_ids.iter().any(|id| id == member_id)
    }
}

impl Validate for EngineConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
