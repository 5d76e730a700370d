use crate::errors::{AppError, AppResult};
use crate::ids;

/// Authentication state and CSRF token of the caller. Token issuance lives behind this trait.
pub trait SessionGate: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn csrf_token(&self) -> Option<String>;
}

/// The local single-user deployment: always signed in, one token per process.
#[derive(Debug, Clone)]
pub struct SingleUserSession {
    csrf_token: String,
}

impl SingleUserSession {
    pub fn new() -> Self {
        Self {
            csrf_token: ids::new_csrf_token(),
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            csrf_token: token.into(),
        }
    }
}

impl Default for SingleUserSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate for SingleUserSession {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn csrf_token(&self) -> Option<String> {
        Some(self.csrf_token.clone())
    }
}

pub fn require_authenticated(gate: &dyn SessionGate) -> AppResult<()> {
    if gate.is_authenticated() {
        Ok(())
    } else {
        Err(AppError::Unauthorized("Sign in required".to_string()))
    }
}

/// Gate for every mutation: authenticated session and a matching CSRF token.
pub fn authorize(gate: &dyn SessionGate, submitted: Option<&str>) -> AppResult<()> {
    require_authenticated(gate)?;
    let expected = gate.csrf_token().unwrap_or_default();
    let submitted = submitted.unwrap_or_default();
    if expected.is_empty() || !constant_time_eq(expected.as_bytes(), submitted.as_bytes()) {
        return Err(AppError::Forbidden("Invalid CSRF token".to_string()));
    }
    Ok(())
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
