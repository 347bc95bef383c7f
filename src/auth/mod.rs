//! # Authentication and Authorization
//!
//! Claim-to-authority extraction, the path policy table and the token
//! verification seam.

pub mod claims;
pub mod policy;
pub mod verifier;

pub use claims::{extract_authorities, principal_from_claims, ClaimSet, ClaimShape};
pub use policy::{Access, AccessConfig, PolicyDecision, PolicyRule, PolicyRuleConfig, PolicyTable};
pub use verifier::{ClaimVerifier, JwtClaimVerifier, VerifyError};
