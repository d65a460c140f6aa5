// Auth helpers: bearer extraction and JWT access/refresh token issuing.
use crate::core::config::SecurityConfig;
use crate::storage::UserRecord;
use anyhow::{anyhow, Result};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub uid: i64,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    Invalid,
    WrongKind,
}

impl TokenError {
    pub fn message(&self) -> &'static str {
        match self {
            TokenError::Expired => "Token has expired",
            TokenError::Invalid => "Could not validate credentials",
            TokenError::WrongKind => "Invalid token type",
        }
    }
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    access_ttl_s: i64,
    refresh_ttl_s: i64,
}

impl TokenService {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let secret = config.secret_key.trim();
        if secret.is_empty() {
            return Err(anyhow!("security.secret_key is empty"));
        }
        let algorithm = Algorithm::from_str(config.algorithm.trim())
            .map_err(|_| anyhow!("unsupported jwt algorithm: {}", config.algorithm))?;
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(anyhow!("only HMAC jwt algorithms are supported"));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            access_ttl_s: config.access_token_expire_minutes.max(1) * 60,
            refresh_ttl_s: config.refresh_token_expire_days.max(1) * 24 * 3600,
        })
    }

    pub fn access_ttl_s(&self) -> i64 {
        self.access_ttl_s
    }

    pub fn issue_pair(&self, user: &UserRecord) -> Result<TokenPair> {
        let now = chrono::Utc::now().timestamp();
        Ok(TokenPair {
            access_token: self.issue_at(user, TokenKind::Access, now)?,
            refresh_token: self.issue_at(user, TokenKind::Refresh, now)?,
            token_type: "bearer",
            expires_in: self.access_ttl_s,
        })
    }

    pub fn issue_at(&self, user: &UserRecord, kind: TokenKind, now: i64) -> Result<String> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl_s,
            TokenKind::Refresh => self.refresh_ttl_s,
        };
        let claims = Claims {
            sub: user.username.clone(),
            uid: user.id,
            kind,
            iat: now,
            exp: now + ttl,
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|err| anyhow!("encode jwt failed: {err}"))
    }

    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, TokenError> {
        let validation = Validation::new(self.algorithm);
        let data = decode::<Claims>(token.trim(), &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;
        if data.claims.kind != expected {
            return Err(TokenError::WrongKind);
        }
        Ok(data.claims)
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?;
    let text = value.to_str().ok()?.trim();
    if let Some(prefix) = text.get(..7) {
        if prefix.eq_ignore_ascii_case("bearer ") {
            if let Some(raw) = text.get(7..) {
                let cleaned = raw.trim();
                if !cleaned.is_empty() {
                    return Some(cleaned.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn user() -> UserRecord {
        UserRecord {
            id: 7,
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            full_name: None,
            password_hash: String::new(),
            role: "user".to_string(),
            subscription_tier: "free".to_string(),
            subscription_status: "active".to_string(),
            is_active: true,
            is_verified: false,
            created_at: 0.0,
            updated_at: 0.0,
            last_login_at: None,
        }
    }

    fn service() -> TokenService {
        TokenService::new(&SecurityConfig {
            secret_key: "unit-test-secret".to_string(),
            ..SecurityConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc.def "));
        assert_eq!(extract_bearer_token(&headers), Some("abc.def".to_string()));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn access_and_refresh_tokens_are_not_interchangeable() {
        let service = service();
        let pair = service.issue_pair(&user()).unwrap();
        assert_eq!(pair.token_type, "bearer");
        assert_eq!(pair.expires_in, 1440 * 60);

        let claims = service.verify(&pair.access_token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.uid, 7);
        assert_eq!(
            service.verify(&pair.access_token, TokenKind::Refresh).unwrap_err(),
            TokenError::WrongKind
        );
        assert!(service.verify(&pair.refresh_token, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn expired_and_foreign_tokens_are_rejected() {
        let service = service();
        let long_ago = chrono::Utc::now().timestamp() - 10 * 24 * 3600;
        let stale = service.issue_at(&user(), TokenKind::Access, long_ago).unwrap();
        assert_eq!(
            service.verify(&stale, TokenKind::Access).unwrap_err(),
            TokenError::Expired
        );

        let other = TokenService::new(&SecurityConfig {
            secret_key: "another-secret".to_string(),
            ..SecurityConfig::default()
        })
        .unwrap();
        let foreign = other.issue_pair(&user()).unwrap();
        assert_eq!(
            service.verify(&foreign.access_token, TokenKind::Access).unwrap_err(),
            TokenError::Invalid
        );
    }
}
