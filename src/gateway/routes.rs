//! # Route Table
//!
//! Maps path prefixes to upstream services. Matching reuses the policy
//! table's segment-aware prefix rule and picks the longest prefix.

use url::Url;

use crate::auth::policy::{normalize_prefix, prefix_matches};
use crate::core::config::RouteDefinition;
use crate::core::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Route id, also the key of the route's circuit breaker
    pub id: String,
    pub path_prefix: String,
    pub upstream: Url,
    /// Leading path segments removed before forwarding
    pub strip_prefix: usize,
}

impl Route {
    pub fn from_definition(definition: &RouteDefinition) -> GatewayResult<Self> {
        let upstream = Url::parse(&definition.upstream).map_err(|e| {
            GatewayError::config(format!(
                "Invalid upstream URL for route '{}': {}",
                definition.id, e
            ))
        })?;
        Ok(Self {
            id: definition.id.clone(),
            path_prefix: normalize_prefix(&definition.path),
            upstream,
            strip_prefix: definition.strip_prefix,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        prefix_matches(&self.path_prefix, path)
    }

    /// Path sent upstream after stripping `strip_prefix` leading segments
    pub fn upstream_path(&self, path: &str) -> String {
        if self.strip_prefix == 0 {
            return path.to_string();
        }
        let remaining: Vec<&str> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .skip(self.strip_prefix)
            .collect();
        let mut stripped = format!("/{}", remaining.join("/"));
        if path.ends_with('/') && !remaining.is_empty() {
            stripped.push('/');
        }
        stripped
    }

    /// Full upstream URL for a request path and optional query
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let base = self.upstream.as_str().trim_end_matches('/');
        let mut url = format!("{}{}", base, self.upstream_path(path));
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Route>) -> Self {
        // Stable sort keeps declaration order among equal prefixes
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self { routes }
    }

    pub fn from_definitions(definitions: &[RouteDefinition]) -> GatewayResult<Self> {
        let routes = definitions
            .iter()
            .map(Route::from_definition)
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self::new(routes))
    }

    /// Most specific route serving `path`
    pub fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str, path: &str, upstream: &str, strip_prefix: usize) -> RouteDefinition {
        RouteDefinition {
            id: id.to_string(),
            path: path.to_string(),
            upstream: upstream.to_string(),
            strip_prefix,
            circuit_breaker: None,
        }
    }

    fn table() -> RouteTable {
        RouteTable::from_definitions(&[
            definition("api", "/api/**", "http://api:8000", 0),
            definition("parcel-service", "/api/parcel/**", "http://parcel:8081/", 0),
            definition("eta-service", "/api/eta", "http://eta:8086/v1", 2),
        ])
        .unwrap()
    }

    #[test]
    fn test_longest_prefix_match() {
        let table = table();
        assert_eq!(table.match_route("/api/parcel/42").unwrap().id, "parcel-service");
        assert_eq!(table.match_route("/api/parcels").unwrap().id, "api");
        assert_eq!(table.match_route("/api").unwrap().id, "api");
        assert!(table.match_route("/other").is_none());
    }

    #[test]
    fn test_upstream_url_keeps_path_and_query() {
        let table = table();
        let route = table.match_route("/api/parcel/42").unwrap();
        assert_eq!(
            route.upstream_url("/api/parcel/42", Some("expand=true")),
            "http://parcel:8081/api/parcel/42?expand=true"
        );
        assert_eq!(route.upstream_url("/api/parcel/42", Some("")), "http://parcel:8081/api/parcel/42");
    }

    #[test]
    fn test_strip_prefix() {
        let table = table();
        let route = table.match_route("/api/eta/route/7").unwrap();
        assert_eq!(route.upstream_path("/api/eta/route/7"), "/route/7");
        assert_eq!(route.upstream_path("/api/eta"), "/");
        assert_eq!(route.upstream_url("/api/eta/route/7", None), "http://eta:8086/v1/route/7");
    }

    #[test]
    fn test_invalid_upstream() {
        assert!(RouteTable::from_definitions(&[definition("x", "/x", "::nope", 0)]).is_err());
    }
}
