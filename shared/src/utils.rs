use sha2::{Digest, Sha256};

/// Salted hash of an identifier for log output (8 hex chars)
///
/// Email addresses are personal data and never reach the logs in plaintext;
/// the hash still lets operators correlate lines for one user.
pub fn log_safe_id(id: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(id.as_bytes());
    let hash = hasher.finalize();

    hex::encode(&hash[..4])
}

/// Syntax check for a recipient address.
///
/// Deliberately shallow: one `@`, a non-empty local part, a dotted domain,
/// no whitespace. Deliverability is the relay's problem.
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.len() > 254 {
        return Err("Email must not exceed 254 characters".to_string());
    }
    if email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("Email must not contain whitespace".to_string());
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err("Email must contain '@'".to_string());
    };
    if local.is_empty() || domain.contains('@') {
        return Err("Email is malformed".to_string());
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err("Email domain is malformed".to_string());
    }

    Ok(())
}

/// Display names: 1-64 characters, no control characters
pub fn validate_username(username: &str) -> Result<(), String> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err("Username is required".to_string());
    }
    if trimmed.chars().count() > 64 {
        return Err("Username must not exceed 64 characters".to_string());
    }
    if trimmed.chars().any(char::is_control) {
        return Err("Username must not contain control characters".to_string());
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    // Argon2 input stays bounded
    if password.len() > 1024 {
        return Err("Password must not exceed 1024 bytes".to_string());
    }
    Ok(())
}
