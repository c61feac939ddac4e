//! Session token service.
//!
//! Mints and validates HS256-signed session tokens and keeps a bounded
//! revocation set. Signature and expiry are checked before anything else;
//! revocation is consulted after the token proves authentic.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issuer claim stamped into every token.
pub const ISSUER: &str = "arcs-server";

/// Default cap on the in-memory revocation set.
pub const DEFAULT_REVOCATION_CAP: usize = 4096;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token signing secret must not be empty")]
    EmptySecret,

    #[error("token revoked")]
    Revoked,

    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub iss: String,
    /// Device-id the session belongs to.
    pub sub: String,
    /// Session the token grants access to.
    pub sid: String,
    pub perms: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly minted token with its expiry, for embedding in replies.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

/// Oldest-first bounded set of revoked token strings.
struct RevocationSet {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl RevocationSet {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, token: String) {
        if !self.set.insert(token.clone()) {
            return;
        }
        self.order.push_back(token);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    fn contains(&self, token: &str) -> bool {
        self.set.contains(token)
    }
}

/// HS256 token mint and validator.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    expiry: Duration,
    revoked: Mutex<RevocationSet>,
}

impl TokenService {
    /// Create a service with the given shared secret and expiry in hours.
    pub fn new(secret: &str, expiry_hours: u64) -> Result<Self, TokenError> {
        Self::with_expiry(secret, Duration::from_secs(expiry_hours * 3600))
    }

    pub fn with_expiry(secret: &str, expiry: Duration) -> Result<Self, TokenError> {
        if secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = 0;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            expiry,
            revoked: Mutex::new(RevocationSet::new(DEFAULT_REVOCATION_CAP)),
        })
    }

    /// Mint a token for a device's session.
    pub fn issue(
        &self,
        device_id: &str,
        session_id: &str,
        perms: Vec<String>,
    ) -> Result<IssuedToken, TokenError> {
        let iat = chrono::Utc::now().timestamp();
        let exp = iat + self.expiry.as_secs() as i64;
        let claims = Claims {
            iss: ISSUER.to_string(),
            sub: device_id.to_string(),
            sid: session_id.to_string(),
            perms,
            iat,
            exp,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        Ok(IssuedToken {
            token,
            expires_at: exp,
        })
    }

    /// Validate a token and return its claims.
    ///
    /// Signature, issuer, and expiry are enforced by the decoder; a token
    /// that passes but sits in the revocation set is still rejected.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        if self.revoked.lock().contains(token) {
            return Err(TokenError::Revoked);
        }
        Ok(data.claims)
    }

    /// Add a token to the revocation set.
    pub fn revoke(&self, token: &str) {
        self.revoked.lock().insert(token.to_string());
    }
}
