/*!
 * # Bearer token verification
 *
 * Accounts and token issuance belong to the identity service. This module only
 * verifies HS256 JWTs signed with the shared secret and turns them into an
 * [`AuthUser`] for handlers.
 *
 * - [`AuthUser`] rejects requests without a valid token (401)
 * - [`MaybeAuthUser`] lets guests through but still rejects a bad token
 * - [`VendorUser`] additionally requires the `vendor` role (403)
 */

use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const VENDOR_ROLE: &str = "vendor";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated user data extracted from the JWT token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    /// Check if the user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn is_vendor(&self) -> bool {
        self.has_role(VENDOR_ROLE)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid token")]
    InvalidToken,
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        ServiceError::Unauthorized(err.to_string())
    }
}

/// Verifies bearer tokens with the shared identity-service secret
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    debug!(error = %e, "rejecting bearer token");
                    AuthError::InvalidToken
                }
            })?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;
        Ok(AuthUser {
            user_id,
            name: claims.name,
            email: claims.email,
            roles: claims.roles,
        })
    }

    /// Parses `Authorization: Bearer <token>`; `Ok(None)` when the header is absent.
    pub fn verify_headers(&self, parts: &Parts) -> Result<Option<AuthUser>, AuthError> {
        let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value.to_str().map_err(|_| AuthError::InvalidToken)?;
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::InvalidToken)?;
        self.verify(token).map(Some)
    }
}

/// Signs a token with the same secret. Used by tests and local tooling.
pub fn issue_token(
    secret: &str,
    user_id: Uuid,
    roles: &[&str],
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        name: None,
        email: None,
        roles: roles.iter().map(|r| r.to_string()).collect(),
        jti: Some(Uuid::new_v4().to_string()),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<JwtVerifier>::from_ref(state);
        verifier
            .verify_headers(parts)?
            .ok_or_else(|| AuthError::MissingToken.into())
    }
}

/// Guest-or-user extractor for cart endpoints
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeAuthUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<JwtVerifier>::from_ref(state);
        Ok(MaybeAuthUser(verifier.verify_headers(parts)?))
    }
}

/// Authenticated user holding the vendor role; `vendor_id` is the user id.
#[derive(Debug, Clone)]
pub struct VendorUser {
    pub vendor_id: Uuid,
    pub user: AuthUser,
}

#[async_trait]
impl<S> FromRequestParts<S> for VendorUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_vendor() {
            return Err(ServiceError::Forbidden(
                "vendor role required".to_string(),
            ));
        }
        Ok(VendorUser {
            vendor_id: user.user_id,
            user,
        })
    }
}
