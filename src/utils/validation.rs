use crate::utils::error::{EngineError, Result};
use std::collections::HashSet;
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub fn validate_url(field_name: &str, url_str: &str) -> Result<()> {
    if url_str.is_empty() {
        return Err(EngineError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }

    match Url::parse(url_str) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(EngineError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: url_str.to_string(),
                reason: format!("Unsupported URL scheme: {}", scheme),
            }),
        },
        Err(e) => Err(EngineError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: format!("Invalid URL format: {}", e),
        }),
    }
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(EngineError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be at least {}", min_value),
        });
    }
    Ok(())
}

/// 代碼字母表：不可為空、不可重複、只能是大寫英數字
pub fn validate_alphabet(field_name: &str, alphabet: &str) -> Result<()> {
    if alphabet.len() < 2 {
        return Err(EngineError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: alphabet.to_string(),
            reason: "Alphabet needs at least two characters".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for ch in alphabet.chars() {
        if !(ch.is_ascii_uppercase() || ch.is_ascii_digit()) {
            return Err(EngineError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: alphabet.to_string(),
                reason: format!("Unsupported character '{}'", ch),
            });
        }
        if !seen.insert(ch) {
            return Err(EngineError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: alphabet.to_string(),
                reason: format!("Duplicate character '{}'", ch),
            });
        }
    }

    Ok(())
}

pub fn validate_strictly_increasing(field_name: &str, values: &[u64]) -> Result<()> {
    for pair in values.windows(2) {
        if pair[1] <= pair[0] {
            return Err(EngineError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: format!("{:?}", values),
                reason: format!("{} must be greater than {}", pair[1], pair[0]),
            });
        }
    }
    Ok(())
}

pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| EngineError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(EngineError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be between {} and {}", min, max),
        });
    }
    Ok(())
}
