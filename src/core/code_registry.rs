use crate::config::toml_config::{EngineConfig, ReferralConfig};
use crate::core::transaction::run_transaction;
use crate::domain::model::ReferralCodeRecord;
use crate::domain::ports::DocumentStore;
use crate::utils::error::{EngineError, Result};
use crate::utils::retry::RetryConfig;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::{Arc, Mutex};

/// Structural shape of a referral code: fixed prefix + fixed-length body.
#[derive(Debug, Clone)]
pub struct CodeFormat {
    prefix: String,
    body_length: usize,
    alphabet: Vec<char>,
}

impl CodeFormat {
    pub fn new(prefix: &str, body_length: usize, alphabet: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            body_length,
            alphabet: alphabet.chars().collect(),
        }
    }

    pub fn from_config(config: &ReferralConfig) -> Self {
        Self::new(&config.code_prefix, config.code_length, &config.code_alphabet)
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet.len()
    }

    /// Pure structural check, no store access.
    pub fn is_valid(&self, code: &str) -> bool {
        if code.len() != self.prefix.len() + self.body_length {
            return false;
        }
        match code.strip_prefix(&self.prefix) {
            Some(body) => body.chars().all(|c| self.alphabet.contains(&c)),
            None => false,
        }
    }

    fn draw(&self, rng: &mut dyn RngCore) -> String {
        let mut code = String::with_capacity(self.prefix.len() + self.body_length);
        code.push_str(&self.prefix);
        for _ in 0..self.body_length {
            code.push(self.alphabet[rng.gen_range(0..self.alphabet.len())]);
        }
        code
    }
}

/// Issues and reserves unique referral codes.
pub struct CodeRegistry<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    format: CodeFormat,
    root_code: String,
    max_attempts: u32,
    tx_retry: RetryConfig,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl<S: DocumentStore + ?Sized> CodeRegistry<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            format: CodeFormat::from_config(&config.referral),
            root_code: config.referral.root_code.clone(),
            max_attempts: config.referral.max_generation_attempts.max(1),
            tx_retry: config.transactions.retry_config(),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
        }
    }

    /// Replace the random source, e.g. with a seeded or constant generator.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    pub fn format(&self) -> &CodeFormat {
        &self.format
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_valid_format(&self, code: &str) -> bool {
        self.format.is_valid(code)
    }

    /// The configured root code is accepted even though it may not follow the issued format.
    pub fn is_resolvable(&self, code: &str) -> bool {
        code == self.root_code || self.format.is_valid(code)
    }

    pub fn draw_candidate(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.format.draw(rng.as_mut())
    }

    /// Draw codes until one is reserved through the store's create-if-absent primitive.
    pub async fn generate_unique_code(&self, owner_id: &str) -> Result<String> {
        for attempt in 1..=self.max_attempts {
            let candidate = self.draw_candidate();
            let reserved = self
                .store
                .create_code_if_absent(ReferralCodeRecord::new(candidate.clone(), owner_id))
                .await?;
            if reserved {
                tracing::debug!("🎟️ Reserved code {} for {} (attempt {})", candidate, owner_id, attempt);
                return Ok(candidate);
            }
            tracing::debug!("Code {} already taken (attempt {}/{})", candidate, attempt, self.max_attempts);
        }

        tracing::warn!("⚠️ Code generation exhausted for {}", owner_id);
        Err(EngineError::CodeGenerationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Return the member's code, issuing one if it has none.
    ///
    /// The new index entry and the member's code field are written in one
    /// transaction, so a failure leaves neither behind.
    pub async fn ensure_code(&self, member_id: &str) -> Result<String> {
        for attempt in 1..=self.max_attempts {
            let drawn = self.draw_candidate();
            let candidate: &str = &drawn;
            let result = run_transaction(&self.store, &self.tx_retry, "ensure_code", move |mut tx| {
                async move {
                    let mut member = tx.require_member(member_id).await?;

                    if let Some(existing) = member.referral_code.clone() {
                        match tx.code(&existing).await? {
                            Some(record) if record.owner_id == member.id => {
                                return Ok((tx, existing));
                            }
                            // 舊資料：會員欄位有代碼但索引缺失，補上索引
                            None if self.is_resolvable(&existing) => {
                                tx.put_code(ReferralCodeRecord::new(existing.clone(), member.id.clone()))
                                    .await?;
                                return Ok((tx, existing));
                            }
                            _ => {
                                tracing::warn!(
                                    "⚠️ Member {} carries unusable code {}; issuing a new one",
                                    member.id,
                                    existing
                                );
                            }
                        }
                    }

                    tx.create_code(ReferralCodeRecord::new(candidate, member.id.clone()))
                        .await?;
                    member.referral_code = Some(candidate.to_string());
                    tx.put_member(member).await?;
                    Ok((tx, candidate.to_string()))
                }
            })
            .await;

            match result {
                Err(EngineError::CodeCollision { code }) => {
                    tracing::debug!("Code {} already taken (attempt {}/{})", code, attempt, self.max_attempts);
                }
                other => return other,
            }
        }

        Err(EngineError::CodeGenerationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Format check first, then an index lookup; inactive codes resolve to `None`.
    pub async fn resolve_active(&self, code: &str) -> Result<Option<ReferralCodeRecord>> {
        if !self.is_resolvable(code) {
            return Err(EngineError::InvalidCodeFormat {
                code: code.to_string(),
            });
        }
        Ok(self
            .store
            .code(code)
            .await?
            .map(|doc| doc.value)
            .filter(|record| record.active))
    }

    pub async fn record_click(&self, code: &str) -> Result<()> {
        run_transaction(&self.store, &self.tx_retry, "record_click", move |mut tx| async move {
            let mut record = tx.code(code).await?.ok_or_else(|| EngineError::InvalidReferrerCode {
                code: code.to_string(),
                reason: "unknown code".to_string(),
            })?;
            record.clicks += 1;
            tx.put_code(record).await?;
            Ok((tx, ()))
        })
        .await
    }

    pub async fn deactivate(&self, code: &str) -> Result<()> {
        run_transaction(&self.store, &self.tx_retry, "deactivate_code", move |mut tx| async move {
            let mut record = tx.code(code).await?.ok_or_else(|| EngineError::InvalidReferrerCode {
                code: code.to_string(),
                reason: "unknown code".to_string(),
            })?;
            record.active = false;
            tx.put_code(record).await?;
            Ok((tx, ()))
        })
        .await
    }
}
