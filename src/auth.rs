use crate::config::AuthConfig;
use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};

/// Outcome of validating the caller's credentials.
#[derive(Clone, Debug)]
pub struct AuthResult {
    pub valid: bool,
    /// `Authorization` value to send upstream.
    pub forward_authorization: Option<HeaderValue>,
}

impl AuthResult {
    pub fn rejected() -> Self {
        Self {
            valid: false,
            forward_authorization: None,
        }
    }
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, headers: &HeaderMap) -> AuthResult;
}

/// Accepts bearer tokens of a plausible shape and forwards them, or a
/// configured upstream key in their place.
pub struct TokenFormatValidator {
    required_prefix: Option<String>,
    min_len: usize,
    upstream_authorization: Option<HeaderValue>,
}

impl TokenFormatValidator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let upstream_authorization = config
            .upstream_api_key
            .as_deref()
            .and_then(|key| HeaderValue::from_str(&format!("Bearer {key}")).ok());
        Self {
            required_prefix: config.required_prefix.clone(),
            min_len: config.min_token_len,
            upstream_authorization,
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl TokenValidator for TokenFormatValidator {
    async fn validate(&self, headers: &HeaderMap) -> AuthResult {
        let Some(token) = bearer_token(headers) else {
            return AuthResult::rejected();
        };
        if token.len() < self.min_len {
            return AuthResult::rejected();
        }
        if let Some(prefix) = self.required_prefix.as_deref() {
            if !token.starts_with(prefix) {
                return AuthResult::rejected();
            }
        }
        let forward_authorization = match self.upstream_authorization.as_ref() {
            Some(value) => Some(value.clone()),
            None => headers.get(AUTHORIZATION).cloned(),
        };
        AuthResult {
            valid: true,
            forward_authorization,
        }
    }
}
