use crate::auth::AuthResult;
use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use serde_json::Value;
use std::time::Duration;

/// Produces the text prepended to the first content delta of a stream.
#[async_trait]
pub trait BannerSource: Send + Sync {
    async fn banner(&self, auth: &AuthResult) -> Option<String>;
}

pub struct StaticBanner {
    text: String,
}

impl StaticBanner {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl BannerSource for StaticBanner {
    async fn banner(&self, _auth: &AuthResult) -> Option<String> {
        (!self.text.is_empty()).then(|| self.text.clone())
    }
}

/// Looks up the caller's remaining credits upstream and renders them as a
/// one-line balance notice. Any failure simply means no banner.
pub struct CreditsBanner {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl CreditsBanner {
    pub fn new(http: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { http, url, timeout }
    }

    async fn fetch_remaining(&self, auth: &AuthResult) -> Result<f64, String> {
        let mut req = self.http.get(&self.url).timeout(self.timeout);
        if let Some(value) = auth.forward_authorization.as_ref() {
            req = req.header(AUTHORIZATION, value.clone());
        }
        let resp = req.send().await.map_err(|err| err.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("credits lookup returned {status}"));
        }
        let body: Value = resp.json().await.map_err(|err| err.to_string())?;
        remaining_credits(&body).ok_or_else(|| "credits payload missing totals".to_string())
    }
}

#[async_trait]
impl BannerSource for CreditsBanner {
    async fn banner(&self, auth: &AuthResult) -> Option<String> {
        match self.fetch_remaining(auth).await {
            Ok(remaining) => Some(format_balance(remaining)),
            Err(err) => {
                tracing::warn!("balance banner skipped: {err}");
                None
            }
        }
    }
}

/// `data.total_credits - data.total_usage`.
pub fn remaining_credits(body: &Value) -> Option<f64> {
    let data = body.get("data")?;
    let credits = data.get("total_credits")?.as_f64()?;
    let usage = data.get("total_usage").and_then(|v| v.as_f64()).unwrap_or(0.0);
    Some(credits - usage)
}

pub fn format_balance(remaining: f64) -> String {
    format!("[Balance: ${:.2}]\n\n", remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remaining_is_credits_minus_usage() {
        let body = json!({"data": {"total_credits": 25.5, "total_usage": 5.25}});
        assert_eq!(remaining_credits(&body), Some(20.25));
        assert_eq!(remaining_credits(&json!({"data": {"total_credits": 3}})), Some(3.0));
        assert_eq!(remaining_credits(&json!({"data": {}})), None);
    }

    #[test]
    fn balance_is_rendered_with_cents() {
        assert_eq!(format_balance(20.256), "[Balance: $20.26]\n\n");
        assert_eq!(format_balance(-1.0), "[Balance: $-1.00]\n\n");
    }

    #[tokio::test]
    async fn static_banner_empty_text_is_none() {
        let auth = AuthResult::rejected();
        assert_eq!(StaticBanner::new("").banner(&auth).await, None);
        assert_eq!(
            StaticBanner::new("hi ").banner(&auth).await.as_deref(),
            Some("hi ")
        );
    }

    #[tokio::test]
    async fn unreachable_credits_endpoint_yields_no_banner() {
        let banner = CreditsBanner::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/api/v1/credits".to_string(),
            Duration::from_millis(200),
        );
        assert_eq!(banner.banner(&AuthResult::rejected()).await, None);
    }
}
