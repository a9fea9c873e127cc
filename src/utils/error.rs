use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Member not found: {member_id}")]
    MemberNotFound { member_id: String },

    #[error("Member already exists: {member_id}")]
    MemberAlreadyExists { member_id: String },

    #[error("Invalid member id '{member_id}'")]
    InvalidMemberId { member_id: String },

    #[error("Referrer not found for code {code} (owner {owner_id})")]
    ReferrerNotFound { code: String, owner_id: String },

    #[error("Invalid referrer code {code}: {reason}")]
    InvalidReferrerCode { code: String, reason: String },

    #[error("Malformed referral code: {code}")]
    InvalidCodeFormat { code: String },

    #[error("Binding {member_id} under {code} would create a cycle")]
    CycleDetected { member_id: String, code: String },

    #[error("Referral chain depth {depth} exceeds the maximum of {max_depth}")]
    ChainTooDeep { depth: usize, max_depth: usize },

    #[error("Referrer {code} is not bound to the network yet")]
    ReferrerNotBound { code: String },

    #[error("Referral code {code} is already taken")]
    CodeCollision { code: String },

    #[error("Unable to generate a unique referral code after {attempts} attempts")]
    CodeGenerationExhausted { attempts: u32 },

    #[error("Transaction '{operation}' still conflicting after {attempts} attempts")]
    TransactionConflict { operation: String, attempts: u32 },

    #[error("Write conflict on {document}")]
    Conflict { document: String },

    #[error("Member {member_id} is not allowed to run admin operations")]
    PermissionDenied { member_id: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid configuration value for {field}: '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Store error: {message}")]
    StoreError { message: String },

    #[error("Notification delivery failed: {message}")]
    DeliveryError { message: String },

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Machine-readable error classification shared with callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidInput,
    Exhausted,
    ConfigInvalid,
    Conflict,
    PermissionDenied,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MemberNotFound { .. } | EngineError::ReferrerNotFound { .. } => {
                ErrorKind::NotFound
            }
            EngineError::MemberAlreadyExists { .. } | EngineError::ReferrerNotBound { .. } => {
                ErrorKind::InvalidState
            }
            EngineError::InvalidMemberId { .. }
            | EngineError::InvalidReferrerCode { .. }
            | EngineError::InvalidCodeFormat { .. }
            | EngineError::CycleDetected { .. }
            | EngineError::ChainTooDeep { .. } => ErrorKind::InvalidInput,
            EngineError::CodeCollision { .. } | EngineError::CodeGenerationExhausted { .. } => {
                ErrorKind::Exhausted
            }
            EngineError::TransactionConflict { .. } | EngineError::Conflict { .. } => {
                ErrorKind::Conflict
            }
            EngineError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            EngineError::ConfigError { .. }
            | EngineError::ConfigValidationError { .. }
            | EngineError::InvalidConfigValueError { .. }
            | EngineError::MissingConfigError { .. } => ErrorKind::ConfigInvalid,
            EngineError::StoreError { .. }
            | EngineError::DeliveryError { .. }
            | EngineError::HttpError(_)
            | EngineError::IoError(_)
            | EngineError::SerializationError(_) => ErrorKind::Internal,
        }
    }

    /// 可重試的衝突錯誤
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    pub fn context(&self) -> BTreeMap<&'static str, String> {
        let mut ctx = BTreeMap::new();
        ctx.insert("kind", format!("{:?}", self.kind()));
        match self {
            EngineError::MemberNotFound { member_id }
            | EngineError::MemberAlreadyExists { member_id }
            | EngineError::InvalidMemberId { member_id }
            | EngineError::PermissionDenied { member_id } => {
                ctx.insert("member_id", member_id.clone());
            }
            EngineError::ReferrerNotFound { code, owner_id } => {
                ctx.insert("code", code.clone());
                ctx.insert("owner_id", owner_id.clone());
            }
            EngineError::InvalidReferrerCode { code, reason } => {
                ctx.insert("code", code.clone());
                ctx.insert("reason", reason.clone());
            }
            EngineError::InvalidCodeFormat { code }
            | EngineError::ReferrerNotBound { code }
            | EngineError::CodeCollision { code } => {
                ctx.insert("code", code.clone());
            }
            EngineError::CycleDetected { member_id, code } => {
                ctx.insert("member_id", member_id.clone());
                ctx.insert("code", code.clone());
            }
            EngineError::ChainTooDeep { depth, max_depth } => {
                ctx.insert("depth", depth.to_string());
                ctx.insert("max_depth", max_depth.to_string());
            }
            EngineError::CodeGenerationExhausted { attempts } => {
                ctx.insert("attempts", attempts.to_string());
            }
            EngineError::TransactionConflict {
                operation,
                attempts,
            } => {
                ctx.insert("operation", operation.clone());
                ctx.insert("attempts", attempts.to_string());
            }
            EngineError::Conflict { document } => {
                ctx.insert("document", document.clone());
            }
            EngineError::ConfigValidationError { field, .. }
            | EngineError::MissingConfigError { field } => {
                ctx.insert("field", field.clone());
            }
            EngineError::InvalidConfigValueError { field, value, .. } => {
                ctx.insert("field", field.clone());
                ctx.insert("value", value.clone());
            }
            _ => {}
        }
        ctx
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::InvalidState => ErrorSeverity::Low,
            ErrorKind::Conflict | ErrorKind::Exhausted => ErrorSeverity::Medium,
            ErrorKind::NotFound | ErrorKind::InvalidInput | ErrorKind::PermissionDenied => {
                ErrorSeverity::High
            }
            ErrorKind::ConfigInvalid | ErrorKind::Internal => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "Check the member id or referral code and try again",
            ErrorKind::InvalidState => "The operation was already applied; nothing to do",
            ErrorKind::InvalidInput => "Use an active referral code owned by a bound member",
            ErrorKind::Exhausted => "Retry later or widen the code alphabet / body length",
            ErrorKind::ConfigInvalid => "Fix the configuration file and restart",
            ErrorKind::Conflict => "Concurrent updates collided; rerun the operation",
            ErrorKind::PermissionDenied => "Run admin jobs with an account listed in admin_ids",
            ErrorKind::Internal => "Inspect the logs for the underlying store or IO failure",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.kind() {
            ErrorKind::NotFound => format!("Not found: {}", self),
            ErrorKind::InvalidInput => format!("Invalid input: {}", self),
            ErrorKind::ConfigInvalid => format!("Configuration problem: {}", self),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping_follows_taxonomy() {
        let err = EngineError::CodeGenerationExhausted { attempts: 5 };
        assert_eq!(err.kind(), ErrorKind::Exhausted);
        assert_eq!(err.context().get("attempts").map(String::as_str), Some("5"));

        let err = EngineError::InvalidReferrerCode {
            code: "RFAAAAAA".to_string(),
            reason: "inactive".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.severity(), ErrorSeverity::High);

        let err = EngineError::MissingConfigError {
            field: "referral.root_code".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_only_store_conflicts_are_retryable() {
        assert!(EngineError::Conflict {
            document: "members/a".to_string()
        }
        .is_conflict());
        assert!(!EngineError::TransactionConflict {
            operation: "bind".to_string(),
            attempts: 3
        }
        .is_conflict());
    }
}
