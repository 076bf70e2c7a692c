pub mod jwt;
pub mod middleware;

use crate::db::models::UserId;

/// Errors produced while resolving a credential to an identity.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token subject is not a valid user id")]
    BadSubject,
}

/// External collaborator that maps an opaque bearer credential to a user
/// identity. The session handshake consumes this as a black box; token
/// issuance policy lives with the surrounding system.
pub trait IdentityVerifier: Send + Sync {
    fn verify_identity(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// HS256 JWT verifier over the shared signing secret.
pub struct JwtVerifier {
    secret: Vec<u8>,
}

impl JwtVerifier {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify_identity(&self, credential: &str) -> Result<UserId, AuthError> {
        let claims = jwt::validate_access_token(&self.secret, credential)?;
        claims.sub.parse::<UserId>().map_err(|_| AuthError::BadSubject)
    }
}
