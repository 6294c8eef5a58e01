//! Session extraction from identity-provider tokens.
//!
//! Tokens are HS256 JWTs issued elsewhere; this service only verifies them
//! and reads who the caller is.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::api::ApiState;
use crate::errors::{EarnError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    User,
    /// Platform admin; passes every sponsor ownership check.
    God,
}

/// JWT claims issued by the identity provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    #[serde(default)]
    pub sponsor_id: Option<i64>,
    #[serde(default)]
    pub role: Role,
    pub exp: u64,
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: i64,
    pub sponsor_id: Option<i64>,
    pub role: Role,
}

impl Session {
    pub fn from_token(token: &str, key: &DecodingKey) -> Result<Self> {
        let data = decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
            .map_err(|e| EarnError::Unauthorized(e.to_string()))?;
        let user_id = data
            .claims
            .sub
            .parse()
            .map_err(|_| EarnError::Unauthorized("malformed subject".to_string()))?;
        Ok(Session {
            user_id,
            sponsor_id: data.claims.sponsor_id,
            role: data.claims.role,
        })
    }

    /// Fail unless the caller acts for `owner_sponsor_id`.
    pub fn ensure_sponsor_of(&self, owner_sponsor_id: i64) -> Result<()> {
        if self.role == Role::God || self.sponsor_id == Some(owner_sponsor_id) {
            Ok(())
        } else if self.sponsor_id.is_none() {
            Err(EarnError::Forbidden("sponsor access required".to_string()))
        } else {
            Err(EarnError::Forbidden(
                "resource belongs to another sponsor".to_string(),
            ))
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[async_trait]
impl FromRequestParts<Arc<ApiState>> for Session {
    type Rejection = EarnError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<ApiState>) -> Result<Self> {
        let token = bearer_token(parts)
            .ok_or_else(|| EarnError::Unauthorized("missing bearer token".to_string()))?;
        Session::from_token(token, &state.jwt_key)
    }
}

/// Session when the caller sent a valid token, `None` otherwise. Used by
/// public routes that only personalise results.
#[derive(Debug, Clone)]
pub struct MaybeSession(pub Option<Session>);

#[async_trait]
impl FromRequestParts<Arc<ApiState>> for MaybeSession {
    type Rejection = EarnError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<ApiState>) -> Result<Self> {
        Ok(MaybeSession(
            bearer_token(parts).and_then(|t| Session::from_token(t, &state.jwt_key).ok()),
        ))
    }
}
