use std::env;

use crate::StackResearchError;

const MAX_ERROR_BODY_LEN: usize = 200;

const SECRET_MARKERS: &[&str] = &[
    "api_key",
    "apikey",
    "x-api-key",
    "secret",
    "bearer",
    "sk-ant-",
    "tvly-",
];

/// Wrapper around sensitive values to reduce accidental logging.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***redacted***")
    }
}

/// Require that a given environment variable is set and non-empty.
pub fn require_env(var: &str) -> Result<SecretValue, StackResearchError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value)),
        _ => Err(StackResearchError::MissingSecret(var.to_string())),
    }
}

/// Whether `var` holds a usable (non-blank) value, without exposing it.
pub fn env_present(var: &str) -> bool {
    require_env(var).is_ok()
}

/// Prepare an upstream error body for inclusion in an error message.
///
/// Bodies are truncated, and anything that looks like it echoes credentials is dropped.
pub fn sanitize_error_body(body: &str) -> String {
    let truncated: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
    let lower = truncated.to_lowercase();
    if SECRET_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return "(response details redacted - may contain sensitive data)".to_string();
    }
    truncated
}
