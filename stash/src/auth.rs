//! Principal resolution for API requests.
//!
//! Login itself happens elsewhere; requests carry an HS256 token whose `sub`
//! claim is the owner id, either as `Authorization: Bearer <token>` or in the
//! `session` cookie.

use common::AuthConfig;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::storage::PrincipalId;

pub const SESSION_COOKIE: &str = "session";
const DEFAULT_SECRET_ENV: &str = "STASH_JWT_SECRET";
const DEV_SECRET: &str = "dev-secret";

/// JWT claims we encode (subject = owner id)
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    exp: usize,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials presented")]
    Missing,
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token keys are not configured")]
    Unconfigured,
}

/// Signing and verification keys for principal tokens.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Read the secret from the env var named in config, falling back to a
    /// development secret.
    pub fn from_config(cfg: &AuthConfig) -> Self {
        let env_name = cfg
            .jwt_secret_env
            .clone()
            .unwrap_or_else(|| DEFAULT_SECRET_ENV.to_string());
        Self::from_env(&env_name)
    }

    pub fn from_env(env_name: &str) -> Self {
        match std::env::var(env_name) {
            Ok(secret) if !secret.is_empty() => Self::from_secret(secret.as_bytes()),
            _ => {
                tracing::warn!("{} not set; using the development token secret", env_name);
                Self::from_secret(DEV_SECRET.as_bytes())
            }
        }
    }

    pub fn issue(&self, owner: PrincipalId, ttl: Duration) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let claims = Claims {
            sub: owner.0,
            exp: (now + ttl).as_secs() as usize,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<PrincipalId, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(PrincipalId(data.claims.sub))
    }
}

/// Request guard yielding the caller's principal.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub PrincipalId);

fn presented_token(req: &Request<'_>) -> Option<String> {
    if let Some(header) = req.headers().get_one("Authorization") {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    req.cookies()
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = AuthError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(keys) = req.rocket().state::<TokenKeys>() else {
            return Outcome::Error((Status::InternalServerError, AuthError::Unconfigured));
        };
        let Some(token) = presented_token(req) else {
            return Outcome::Error((Status::Unauthorized, AuthError::Missing));
        };
        match keys.verify(&token) {
            Ok(owner) => Outcome::Success(AuthUser(owner)),
            Err(e) => {
                tracing::warn!("rejecting request token: {}", e);
                Outcome::Error((Status::Unauthorized, e))
            }
        }
    }
}
