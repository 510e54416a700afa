//! Input validation for API requests.
//!
//! Each `validate_*` function returns the first problem as a message.
//! Collect several into one `ApiError` with `ValidationErrorBuilder` from
//! the `error` module.

use lazy_static::lazy_static;
use regex::Regex;

use crate::ledger::MAX_CREDIT_AMOUNT;

lazy_static! {
    /// Pragmatic email check: one `@`, no whitespace, a dotted domain
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[^@\s]+@[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)+$"
    ).unwrap();

    /// Setting keys are upper snake case, e.g. IDEOGRAM_API_KEY
    static ref SETTING_KEY_REGEX: Regex = Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap();
}

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is required".to_string());
    }
    if email.len() > 254 {
        return Err("Email is too long (max 254 characters)".to_string());
    }
    if !EMAIL_REGEX.is_match(email) {
        return Err("Invalid email format".to_string());
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(format!(
            "Password is too long (max {} characters)",
            MAX_PASSWORD_LEN
        ));
    }

    let has_letter = password.chars().any(|c| c.is_alphabetic());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Err("Password must contain letters and digits".to_string());
    }

    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Name is required".to_string());
    }
    if trimmed.chars().count() > 100 {
        return Err("Name is too long (max 100 characters)".to_string());
    }
    Ok(())
}

pub fn validate_setting_key(key: &str) -> Result<(), String> {
    if key.len() > 64 {
        return Err("Setting key is too long (max 64 characters)".to_string());
    }
    if !SETTING_KEY_REGEX.is_match(key) {
        return Err("Setting key must be upper snake case (e.g. IDEOGRAM_API_KEY)".to_string());
    }
    Ok(())
}

pub fn validate_payment_request(credits: i64, amount: f64) -> Result<(), String> {
    if credits <= 0 || credits > MAX_CREDIT_AMOUNT {
        return Err(format!(
            "credits_requested must be between 1 and {}",
            MAX_CREDIT_AMOUNT
        ));
    }
    if !amount.is_finite() || amount <= 0.0 {
        return Err("amount must be a positive number".to_string());
    }
    Ok(())
}
