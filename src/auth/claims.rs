//! # Claim Authority Extraction
//!
//! Turns a verified token payload into the principal's role authorities.
//!
//! Realm roles become `ROLE_<ROLE>` and client roles found under
//! `resource_access.<client>.roles` become `ROLE_<CLIENT>_<ROLE>`, both
//! uppercased. Tokens come from an identity provider this gateway does not
//! control, so extraction never fails: a branch with an unexpected shape
//! contributes nothing and the other branch is still read.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

use crate::core::types::Principal;

pub const ROLE_PREFIX: &str = "ROLE_";

/// A verified claim set, as handed over by the token verifier.
///
/// The claims the gateway reads are explicit optional fields. Their values
/// stay as raw JSON because the identity provider decides their shape;
/// `ClaimShape` classifies them before use. Any other claim lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClaimSet {
    #[serde(default)]
    pub sub: Option<Value>,
    #[serde(default)]
    pub preferred_username: Option<Value>,
    /// Expected shape: `{"roles": [..]}`
    #[serde(default)]
    pub realm_access: Option<Value>,
    /// Expected shape: `{"<client>": {"roles": [..]}, ..}`
    #[serde(default)]
    pub resource_access: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClaimSet {
    /// Build from any JSON value; non-object payloads give an empty claim set
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// The `sub` claim, when it is a string
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_ref().and_then(Value::as_str)
    }

    /// The `preferred_username` claim, when it is a string
    pub fn preferred_username(&self) -> Option<&str> {
        self.preferred_username.as_ref().and_then(Value::as_str)
    }
}

/// What was found at a place in the claim tree where a role list is expected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimShape<'a> {
    /// Nothing there
    Missing,
    /// Something there, but not the expected kind of value
    WrongType,
    /// A sequence; non-string entries are dropped
    List(Vec<&'a str>),
    /// A mapping (only meaningful for `resource_access`)
    Mapping(&'a Map<String, Value>),
}

impl<'a> ClaimShape<'a> {
    /// Classify `container.roles`
    pub fn roles_of(container: Option<&'a Value>) -> Self {
        let map = match container {
            None | Some(Value::Null) => return Self::Missing,
            Some(Value::Object(map)) => map,
            Some(_) => return Self::WrongType,
        };
        match map.get("roles") {
            None | Some(Value::Null) => Self::Missing,
            Some(Value::Array(items)) => Self::List(items.iter().filter_map(Value::as_str).collect()),
            Some(_) => Self::WrongType,
        }
    }

    /// Classify a value that should be a mapping
    pub fn mapping_of(value: Option<&'a Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Missing,
            Some(Value::Object(map)) => Self::Mapping(map),
            Some(_) => Self::WrongType,
        }
    }
}

fn authority(parts: &[&str]) -> String {
    let mut authority = String::from(ROLE_PREFIX);
    authority.push_str(&parts.join("_").to_uppercase());
    authority
}

/// Derive the authority set for a claim set. Never fails.
pub fn extract_authorities(claims: &ClaimSet) -> BTreeSet<String> {
    let mut authorities = BTreeSet::new();

    match ClaimShape::roles_of(claims.realm_access.as_ref()) {
        ClaimShape::List(roles) => {
            authorities.extend(roles.into_iter().map(|role| authority(&[role])));
        }
        ClaimShape::WrongType => debug!("realm_access has an unexpected shape, skipping realm roles"),
        _ => {}
    }

    match ClaimShape::mapping_of(claims.resource_access.as_ref()) {
        ClaimShape::Mapping(clients) => {
            for (client_id, client_claims) in clients {
                match ClaimShape::roles_of(Some(client_claims)) {
                    ClaimShape::List(roles) => {
                        authorities
                            .extend(roles.into_iter().map(|role| authority(&[client_id.as_str(), role])));
                    }
                    ClaimShape::WrongType => {
                        debug!(client = %client_id, "Client access entry has an unexpected shape, skipping")
                    }
                    _ => {}
                }
            }
        }
        ClaimShape::WrongType => debug!("resource_access is not a mapping, skipping client roles"),
        _ => {}
    }

    authorities
}

/// Build the request's principal from its verified claims
pub fn principal_from_claims(claims: &ClaimSet) -> Principal {
    let subject_id = claims.subject().unwrap_or_default().to_string();
    let username = claims
        .preferred_username()
        .map(str::to_string)
        .unwrap_or_else(|| subject_id.clone());

    Principal {
        subject_id,
        username,
        authorities: extract_authorities(claims),
    }
}
