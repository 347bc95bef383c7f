//! # Authorization Policy Table
//!
//! An ordered set of path-prefix rules loaded once at startup. Lookup picks
//! the most specific rule: rules are sorted by decreasing prefix length, ties
//! broken by declaration order, and the first rule whose prefix covers the
//! path and whose method set admits the method wins.
//!
//! Prefixes match on whole path segments, so `/api/admin` covers
//! `/api/admin` and `/api/admin/users` but not `/api/administrator`.
//! A trailing `/**` is accepted and means the same as the bare prefix.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::auth::claims::ROLE_PREFIX;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Principal;

/// Method filter of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSet {
    Any,
    Only(BTreeSet<String>),
}

impl MethodSet {
    /// Parse a configured method list; empty or containing `ANY` means any method
    pub fn parse(methods: &[String]) -> GatewayResult<Self> {
        let mut only = BTreeSet::new();
        for method in methods {
            let upper = method.trim().to_ascii_uppercase();
            if upper == "ANY" || upper == "*" {
                return Ok(Self::Any);
            }
            Method::from_str(&upper)
                .map_err(|_| GatewayError::config(format!("Invalid HTTP method in policy: {}", method)))?;
            only.insert(upper);
        }
        if only.is_empty() {
            Ok(Self::Any)
        } else {
            Ok(Self::Only(only))
        }
    }

    pub fn contains(&self, method: &Method) -> bool {
        match self {
            Self::Any => true,
            Self::Only(methods) => methods.contains(method.as_str()),
        }
    }
}

/// Access requirement of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// No authentication at all
    Public,
    /// Any verified principal; equivalent to `requiresAnyOf({})`
    Authenticated,
    /// The principal must hold at least one of these authorities
    AnyOf(BTreeSet<String>),
    /// Always refused
    Deny,
}

/// Access as written in configuration: a keyword (`permit_all`,
/// `authenticated`, `deny_all`) or a one-key mapping such as
/// `{has_any_role: [driver]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AccessRepr", into = "AccessRepr")]
pub enum AccessConfig {
    PermitAll,
    #[default]
    Authenticated,
    DenyAll,
    /// Role names; each becomes `ROLE_` + uppercase
    HasAnyRole(Vec<String>),
    /// Exact authority strings
    HasAnyAuthority(Vec<String>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AccessKeyword {
    PermitAll,
    Authenticated,
    DenyAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AccessRepr {
    Keyword(AccessKeyword),
    HasAnyRole { has_any_role: Vec<String> },
    HasAnyAuthority { has_any_authority: Vec<String> },
}

impl From<AccessRepr> for AccessConfig {
    fn from(repr: AccessRepr) -> Self {
        match repr {
            AccessRepr::Keyword(AccessKeyword::PermitAll) => Self::PermitAll,
            AccessRepr::Keyword(AccessKeyword::Authenticated) => Self::Authenticated,
            AccessRepr::Keyword(AccessKeyword::DenyAll) => Self::DenyAll,
            AccessRepr::HasAnyRole { has_any_role } => Self::HasAnyRole(has_any_role),
            AccessRepr::HasAnyAuthority { has_any_authority } => {
                Self::HasAnyAuthority(has_any_authority)
            }
        }
    }
}

impl From<AccessConfig> for AccessRepr {
    fn from(access: AccessConfig) -> Self {
        match access {
            AccessConfig::PermitAll => Self::Keyword(AccessKeyword::PermitAll),
            AccessConfig::Authenticated => Self::Keyword(AccessKeyword::Authenticated),
            AccessConfig::DenyAll => Self::Keyword(AccessKeyword::DenyAll),
            AccessConfig::HasAnyRole(has_any_role) => Self::HasAnyRole { has_any_role },
            AccessConfig::HasAnyAuthority(has_any_authority) => {
                Self::HasAnyAuthority { has_any_authority }
            }
        }
    }
}

impl AccessConfig {
    pub fn resolve(&self) -> Access {
        match self {
            Self::PermitAll => Access::Public,
            Self::Authenticated => Access::Authenticated,
            Self::DenyAll => Access::Deny,
            Self::HasAnyRole(roles) => Access::from_authorities(
                roles
                    .iter()
                    .map(|role| format!("{}{}", ROLE_PREFIX, role.trim().to_uppercase())),
            ),
            Self::HasAnyAuthority(authorities) => {
                Access::from_authorities(authorities.iter().cloned())
            }
        }
    }
}

impl Access {
    /// An empty authority set means the rule is public
    pub fn from_authorities<I: IntoIterator<Item = String>>(authorities: I) -> Self {
        let authorities: BTreeSet<String> = authorities.into_iter().collect();
        if authorities.is_empty() {
            Self::Public
        } else {
            Self::AnyOf(authorities)
        }
    }
}

/// One rule of the policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub path_prefix: String,
    pub methods: MethodSet,
    pub access: Access,
    /// Declaration index, the tie-break between equally long prefixes
    pub order: usize,
}

impl PolicyRule {
    pub fn new(path_prefix: &str, methods: MethodSet, access: Access, order: usize) -> Self {
        Self {
            path_prefix: normalize_prefix(path_prefix),
            methods,
            access,
            order,
        }
    }

    pub fn from_config(config: &PolicyRuleConfig, order: usize) -> GatewayResult<Self> {
        if !config.path.starts_with('/') {
            return Err(GatewayError::config(format!(
                "Policy path must start with '/': {}",
                config.path
            )));
        }
        Ok(Self::new(
            &config.path,
            MethodSet::parse(&config.methods)?,
            config.access.resolve(),
            order,
        ))
    }

    pub fn covers(&self, path: &str, method: &Method) -> bool {
        self.methods.contains(method) && prefix_matches(&self.path_prefix, path)
    }
}

/// Outcome of a policy lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Public,
    /// Any authority in the set suffices; an empty set admits any verified principal
    RequiresAnyOf(BTreeSet<String>),
    Deny,
}

impl PolicyDecision {
    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public)
    }

    /// Whether `principal` satisfies this decision
    pub fn permits(&self, principal: &Principal) -> bool {
        match self {
            Self::Public => true,
            Self::RequiresAnyOf(required) => {
                required.is_empty() || principal.has_any_authority(required)
            }
            Self::Deny => false,
        }
    }
}

impl From<&Access> for PolicyDecision {
    fn from(access: &Access) -> Self {
        match access {
            Access::Public => Self::Public,
            Access::Authenticated => Self::RequiresAnyOf(BTreeSet::new()),
            Access::AnyOf(authorities) => Self::RequiresAnyOf(authorities.clone()),
            Access::Deny => Self::Deny,
        }
    }
}

/// Read-only after construction; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    pub fn new(mut rules: Vec<PolicyRule>) -> Self {
        rules.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then(a.order.cmp(&b.order))
        });
        Self { rules }
    }

    pub fn from_config(configs: &[PolicyRuleConfig]) -> GatewayResult<Self> {
        let rules = configs
            .iter()
            .enumerate()
            .map(|(order, config)| PolicyRule::from_config(config, order))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// Find the governing rule for a request, if any
    pub fn rule_for(&self, path: &str, method: &Method) -> Option<&PolicyRule> {
        self.rules.iter().find(|rule| rule.covers(path, method))
    }

    /// Decide how a request must be authorized. Unmatched requests need any
    /// verified principal.
    pub fn decide(&self, path: &str, method: &Method) -> PolicyDecision {
        self.rule_for(path, method)
            .map(|rule| PolicyDecision::from(&rule.access))
            .unwrap_or_else(|| PolicyDecision::RequiresAnyOf(BTreeSet::new()))
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Strip an Ant-style `/**` suffix and a trailing slash
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim();
    let trimmed = trimmed.strip_suffix("/**").unwrap_or(trimmed);
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Segment-aware prefix test against a normalized prefix
pub(crate) fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
