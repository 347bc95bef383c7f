//! # Token Verification
//!
//! The gateway only needs a verified claim set from a bearer token; how the
//! token is checked is behind [`ClaimVerifier`]. [`JwtClaimVerifier`] checks
//! signature, expiry and the configured issuer/audience with a static key.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::str::FromStr;
use thiserror::Error;

use crate::auth::claims::ClaimSet;
use crate::core::config::JwtConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Why a token was refused. Every variant maps to a 401.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Token is malformed: {0}")]
    Malformed(String),

    #[error("Token has expired")]
    Expired,

    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token rejected: {0}")]
    Rejected(String),
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::Malformed(err.to_string()),
            _ => Self::Rejected(err.to_string()),
        }
    }
}

/// Turns a raw bearer token into a verified claim set
#[async_trait]
pub trait ClaimVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<ClaimSet, VerifyError>;
}

pub struct JwtClaimVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtClaimVerifier {
    pub fn new(key: DecodingKey, validation: Validation) -> Self {
        Self { key, validation }
    }

    /// HMAC verifier with default validation, mostly for tests and local setups
    pub fn hs256(secret: &[u8]) -> Self {
        Self::new(DecodingKey::from_secret(secret), Validation::new(Algorithm::HS256))
    }

    pub fn from_config(config: &JwtConfig) -> GatewayResult<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|_| {
            GatewayError::config(format!("Unsupported JWT algorithm: {}", config.algorithm))
        })?;

        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                DecodingKey::from_secret(config.secret.as_bytes())
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(config.secret.as_bytes())
                .map_err(|e| GatewayError::config(format!("Invalid RSA public key: {}", e)))?,
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(config.secret.as_bytes())
                .map_err(|e| GatewayError::config(format!("Invalid EC public key: {}", e)))?,
            Algorithm::EdDSA => DecodingKey::from_ed_pem(config.secret.as_bytes())
                .map_err(|e| GatewayError::config(format!("Invalid Ed25519 public key: {}", e)))?,
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway.as_secs();
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self::new(key, validation))
    }
}

#[async_trait]
impl ClaimVerifier for JwtClaimVerifier {
    async fn verify(&self, token: &str) -> Result<ClaimSet, VerifyError> {
        let data = decode::<ClaimSet>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}
