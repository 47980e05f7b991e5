//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs minted by the auth service with the shared
//! `APP_SECRET`; the caller's id travels in the `uid` claim.

use actix_web::{dev::Payload, error, web, FromRequest, HttpRequest, HttpResponse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::{ready, Ready};
use thiserror::Error;

use crate::models::ApiResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub uid: i64,
    /// Expiration (Unix timestamp seconds)
    pub exp: usize,
}

/// The authenticated caller, handed explicitly to every orchestrator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,

    #[error("invalid Authorization format")]
    MalformedHeader,

    #[error("invalid or expired token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token verification is not configured")]
    NotConfigured,
}

pub struct JwtKeys {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(Principal { user_id: data.claims.uid })
    }
}

/// Mint a token the way the auth service does. Only tests issue tokens here.
#[cfg(test)]
pub(crate) fn issue_token(secret: &str, uid: i64, ttl: chrono::Duration) -> String {
    use jsonwebtoken::{EncodingKey, Header};

    let claims = Claims {
        uid,
        exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
    };
    let key = EncodingKey::from_secret(secret.as_bytes());
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key).unwrap()
}

fn authenticate(req: &HttpRequest) -> Result<Principal, AuthError> {
    let keys = req
        .app_data::<web::Data<JwtKeys>>()
        .ok_or(AuthError::NotConfigured)?;

    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingHeader)?;

    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MalformedHeader)?;

    keys.verify(token)
}

impl FromRequest for Principal {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(authenticate(req).map_err(|e| {
            log::debug!("Rejected request to {}: {}", req.path(), e);
            let response = match e {
                AuthError::NotConfigured => HttpResponse::InternalServerError(),
                _ => HttpResponse::Unauthorized(),
            }
            .json(ApiResponse { message: "unauthorized".to_string() });
            error::InternalError::from_response(e, response).into()
        }))
    }
}

/// Which principals hold the admin role.
#[derive(Debug, Clone, Default)]
pub struct AdminDirectory {
    ids: HashSet<i64>,
}

impl AdminDirectory {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self { ids: ids.into_iter().collect() }
    }

    pub fn is_admin(&self, principal: &Principal) -> bool {
        self.ids.contains(&principal.user_id)
    }
}
