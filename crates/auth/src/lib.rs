//! Bearer-token validation.
//!
//! Tokens are JWTs signed with a symmetric secret. [`AuthValidator`] checks
//! the signature and expiry, then resolves the subject to an active user
//! through the [`UserRepository`] collaborator — that single lookup is its
//! only I/O. The resulting [`Principal`] is bound to the connection for its
//! lifetime.
//!
//! Token issuance happens elsewhere; this crate only verifies.

use std::{collections::HashMap, sync::Arc};

use {
    jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use parley_metrics::{counter, names};

// ── Principal ────────────────────────────────────────────────────────────────

/// The authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub admin: bool,
    pub active: bool,
}

// ── Failure kinds ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("token malformed")]
    TokenMalformed,
    #[error("token expired")]
    TokenExpired,
    #[error("token signature invalid")]
    TokenInvalidSignature,
    #[error("user inactive")]
    UserInactive,
}

impl AuthFailure {
    /// Stable wire/telemetry name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenMalformed => "token_malformed",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalidSignature => "token_invalid_signature",
            Self::UserInactive => "user_inactive",
        }
    }
}

// ── Claims and verification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the opaque user id.
    pub sub: String,
    /// Expiry as unix seconds.
    pub exp: u64,
}

/// Parse a configured algorithm identifier. Only HMAC variants are accepted;
/// the secret is symmetric.
#[must_use]
pub fn parse_algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "HS256" => Some(Algorithm::HS256),
        "HS384" => Some(Algorithm::HS384),
        "HS512" => Some(Algorithm::HS512),
        _ => None,
    }
}

pub struct TokenVerifier {
    secret: Secret<String>,
    algorithm: Algorithm,
}

impl TokenVerifier {
    pub fn new(secret: Secret<String>, algorithm: Algorithm) -> Self {
        Self { secret, algorithm }
    }

    /// Verify signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthFailure> {
        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let validation = Validation::new(self.algorithm);
        decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::TokenExpired,
                ErrorKind::InvalidSignature => AuthFailure::TokenInvalidSignature,
                _ => AuthFailure::TokenMalformed,
            })
    }
}

// ── User repository collaborator ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub is_active: bool,
    pub is_admin: bool,
}

#[async_trait::async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> Option<User>;
}

/// Fixed in-memory repository for tests and single-tenant deployments.
#[derive(Debug, Default)]
pub struct StaticUserRepository {
    users: HashMap<String, User>,
}

impl StaticUserRepository {
    #[must_use]
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }
}

#[async_trait::async_trait]
impl UserRepository for StaticUserRepository {
    async fn find_by_id(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).cloned()
    }
}

// ── Validator ────────────────────────────────────────────────────────────────

pub struct AuthValidator {
    verifier: TokenVerifier,
    users: Arc<dyn UserRepository>,
}

impl AuthValidator {
    pub fn new(verifier: TokenVerifier, users: Arc<dyn UserRepository>) -> Self {
        Self { verifier, users }
    }

    /// Resolve a bearer token to a principal.
    ///
    /// An unknown subject reports as `user_inactive`.
    pub async fn validate(&self, token: &str) -> Result<Principal, AuthFailure> {
        let result = self.validate_inner(token).await;
        match &result {
            Ok(_) => counter!(names::auth::ACCEPTED_TOTAL).increment(1),
            Err(failure) => {
                counter!(names::auth::REJECTED_TOTAL, "reason" => failure.as_str()).increment(1);
            },
        }
        result
    }

    async fn validate_inner(&self, token: &str) -> Result<Principal, AuthFailure> {
        let claims = self.verifier.verify(token)?;
        let user = self
            .users
            .find_by_id(&claims.sub)
            .await
            .ok_or(AuthFailure::UserInactive)?;
        if !user.is_active {
            return Err(AuthFailure::UserInactive);
        }
        Ok(Principal {
            user_id: user.id,
            admin: user.is_admin,
            active: true,
        })
    }
}
