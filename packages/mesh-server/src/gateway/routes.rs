//! Route table: `(method, path-pattern)` bindings to target services.
//!
//! Patterns are compiled to anchored regexes when the route is registered.
//! `:name` matches one path segment and captures it; `*` matches any
//! remaining suffix.

use std::collections::{BTreeMap, HashMap, HashSet};

use meshkit_core::{route_key, RouteMethod, ServiceRoute};
use parking_lot::RwLock;
use regex::Regex;
use tracing::info;

use crate::error::MeshError;

/// A resolved route plus what the pattern captured from the request path.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub route: ServiceRoute,
    pub params: BTreeMap<String, String>,
    /// Path forwarded to the service, after prefix stripping.
    pub forward_path: String,
}

#[derive(Debug)]
struct CompiledRoute {
    route: ServiceRoute,
    matcher: Regex,
    param_names: Vec<String>,
    literal_prefix: String,
}

impl CompiledRoute {
    fn compile(route: ServiceRoute) -> Result<Self, MeshError> {
        let pattern = route.path.as_str();
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(MeshError::invalid_pattern(pattern, "must start with '/'"));
        };

        let mut source = String::from("^");
        let mut param_names = Vec::new();
        let mut seen = HashSet::new();
        let mut literal = Vec::new();
        let mut dynamic = false;

        for segment in rest.split('/') {
            source.push('/');
            if let Some(name) = segment.strip_prefix(':') {
                if !is_identifier(name) {
                    return Err(MeshError::invalid_pattern(
                        pattern,
                        format!("parameter name {name:?} is not an identifier"),
                    ));
                }
                if !seen.insert(name.to_string()) {
                    return Err(MeshError::invalid_pattern(
                        pattern,
                        format!("duplicate parameter {name:?}"),
                    ));
                }
                source.push_str(&format!("(?P<{name}>[^/]+)"));
                param_names.push(name.to_string());
                dynamic = true;
            } else if let Some(star) = segment.find('*') {
                if star != segment.len() - 1 {
                    return Err(MeshError::invalid_pattern(
                        pattern,
                        "'*' must end its segment",
                    ));
                }
                source.push_str(&regex::escape(&segment[..star]));
                source.push_str(".*");
                dynamic = true;
            } else {
                source.push_str(&regex::escape(segment));
                if !dynamic {
                    literal.push(segment);
                }
            }
        }
        source.push('$');

        let matcher = Regex::new(&source)
            .map_err(|e| MeshError::invalid_pattern(pattern, e.to_string()))?;
        let literal_prefix = literal
            .iter()
            .filter(|s| !s.is_empty())
            .fold(String::new(), |mut acc, s| {
                acc.push('/');
                acc.push_str(s);
                acc
            });

        Ok(Self {
            route,
            matcher,
            param_names,
            literal_prefix,
        })
    }

    fn try_match(&self, path: &str) -> Option<RouteMatch> {
        let captures = self.matcher.captures(path)?;
        let params = self
            .param_names
            .iter()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();
        Some(RouteMatch {
            route: self.route.clone(),
            params,
            forward_path: self.forward_path(path),
        })
    }

    fn forward_path(&self, path: &str) -> String {
        if !self.route.strip_prefix {
            return path.to_string();
        }
        match path.strip_prefix(self.literal_prefix.as_str()) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) => format!("/{rest}"),
            None => path.to_string(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Default)]
struct Table {
    /// `METHOD:path` -> position in `routes`.
    index: HashMap<String, usize>,
    /// Registration order.
    routes: Vec<CompiledRoute>,
}

impl Table {
    fn reindex(&mut self) {
        self.index = self
            .routes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.route.key(), i))
            .collect();
    }
}

/// Registered routes, keyed by `METHOD:path` and kept in registration order.
#[derive(Debug, Default)]
pub struct RouteTable {
    table: RwLock<Table>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route, replacing any route with the same `METHOD:path` key in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidRoutePattern`] if the path pattern is
    /// malformed.
    pub fn register(&self, route: ServiceRoute) -> Result<(), MeshError> {
        let compiled = CompiledRoute::compile(route)?;
        let key = compiled.route.key();
        info!(
            route = %key,
            service = %compiled.route.service_name,
            "route registered"
        );

        let mut table = self.table.write();
        if let Some(&i) = table.index.get(&key) {
            table.routes[i] = compiled;
        } else {
            let i = table.routes.len();
            table.routes.push(compiled);
            table.index.insert(key, i);
        }
        Ok(())
    }

    /// Removes the route registered under `method` and `path`.
    pub fn remove(&self, method: RouteMethod, path: &str) -> bool {
        let key = route_key(method.as_str(), path);
        let mut table = self.table.write();
        let Some(i) = table.index.remove(&key) else {
            return false;
        };
        table.routes.remove(i);
        table.reindex();
        info!(route = %key, "route removed");
        true
    }

    /// Resolves a request: exact `METHOD:path`, then `ALL:path`, then the
    /// first pattern in registration order whose method accepts `method`.
    #[must_use]
    pub fn resolve(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let table = self.table.read();
        for key in [route_key(method, path), route_key(RouteMethod::All.as_str(), path)] {
            if let Some(&i) = table.index.get(&key) {
                let compiled = &table.routes[i];
                return Some(compiled.try_match(path).unwrap_or_else(|| RouteMatch {
                    route: compiled.route.clone(),
                    params: BTreeMap::new(),
                    forward_path: compiled.forward_path(path),
                }));
            }
        }
        table
            .routes
            .iter()
            .filter(|c| c.route.method.accepts(method))
            .find_map(|c| c.try_match(path))
    }

    /// The route that would serve `method` and `path`.
    #[must_use]
    pub fn get(&self, method: &str, path: &str) -> Option<ServiceRoute> {
        self.resolve(method, path).map(|m| m.route)
    }

    /// All routes in registration order.
    #[must_use]
    pub fn all(&self) -> Vec<ServiceRoute> {
        self.table
            .read()
            .routes
            .iter()
            .map(|c| c.route.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn table(routes: Vec<ServiceRoute>) -> RouteTable {
        let t = RouteTable::new();
        for r in routes {
            t.register(r).unwrap();
        }
        t
    }

    #[test]
    fn exact_match_beats_all_and_patterns() {
        let t = table(vec![
            ServiceRoute::new(RouteMethod::All, "/api/*", "wild"),
            ServiceRoute::new(RouteMethod::All, "/api/users", "all-users"),
            ServiceRoute::new(RouteMethod::Get, "/api/users", "get-users"),
        ]);
        assert_eq!(t.get("GET", "/api/users").unwrap().service_name, "get-users");
        assert_eq!(t.get("POST", "/api/users").unwrap().service_name, "all-users");
        assert_eq!(t.get("GET", "/api/other").unwrap().service_name, "wild");
    }

    #[test]
    fn method_is_case_insensitive() {
        let t = table(vec![ServiceRoute::new(RouteMethod::Get, "/a", "a")]);
        assert!(t.get("get", "/a").is_some());
        assert!(t.get("POST", "/a").is_none());
    }

    #[test]
    fn registration_order_breaks_ties() {
        let t = table(vec![
            ServiceRoute::new(RouteMethod::All, "/api/:svc/items", "first"),
            ServiceRoute::new(RouteMethod::All, "/api/*", "second"),
        ]);
        let m = t.resolve("GET", "/api/billing/items").unwrap();
        assert_eq!(m.route.service_name, "first");
        assert_eq!(m.params.get("svc").map(String::as_str), Some("billing"));
        assert_eq!(t.get("GET", "/api/billing/other").unwrap().service_name, "second");
    }

    #[test]
    fn param_matches_single_segment() {
        let t = table(vec![ServiceRoute::new(
            RouteMethod::Get,
            "/users/:id/orders/:order_id",
            "users",
        )]);
        let m = t.resolve("GET", "/users/42/orders/7").unwrap();
        assert_eq!(m.params["id"], "42");
        assert_eq!(m.params["order_id"], "7");
        assert!(t.resolve("GET", "/users/42/x/orders/7").is_none());
        assert!(t.resolve("GET", "/users//orders/7").is_none());
    }

    #[test]
    fn star_matches_any_suffix() {
        let t = table(vec![ServiceRoute::new(RouteMethod::All, "/api/billing/*", "billing")]);
        assert!(t.resolve("GET", "/api/billing/").is_some());
        assert!(t.resolve("GET", "/api/billing/a/b/c").is_some());
        assert!(t.resolve("GET", "/api/billingx").is_none());
        assert!(t.resolve("GET", "/other/api/billing/a").is_none());
    }

    #[test]
    fn literal_characters_are_escaped() {
        let t = table(vec![ServiceRoute::new(RouteMethod::Get, "/v1.0/status", "s")]);
        assert!(t.resolve("GET", "/v1.0/status").is_some());
        assert!(t.resolve("GET", "/v1x0/status").is_none());
    }

    #[test]
    fn strip_prefix_removes_literal_prefix() {
        let t = table(vec![
            ServiceRoute::new(RouteMethod::All, "/api/billing/*", "billing").with_strip_prefix(true),
            ServiceRoute::new(RouteMethod::All, "/api/hr/*", "hr"),
        ]);
        assert_eq!(
            t.resolve("GET", "/api/billing/invoices/9").unwrap().forward_path,
            "/invoices/9"
        );
        assert_eq!(t.resolve("GET", "/api/billing/").unwrap().forward_path, "/");
        assert_eq!(
            t.resolve("GET", "/api/hr/people").unwrap().forward_path,
            "/api/hr/people"
        );
    }

    #[test]
    fn reregister_replaces_in_place() {
        let t = table(vec![
            ServiceRoute::new(RouteMethod::Get, "/a", "one"),
            ServiceRoute::new(RouteMethod::Get, "/b", "two"),
        ]);
        t.register(ServiceRoute::new(RouteMethod::Get, "/a", "three")).unwrap();
        let names: Vec<_> = t.all().into_iter().map(|r| r.service_name).collect();
        assert_eq!(names, vec!["three", "two"]);
    }

    #[test]
    fn remove_reindexes() {
        let t = table(vec![
            ServiceRoute::new(RouteMethod::Get, "/a", "a"),
            ServiceRoute::new(RouteMethod::Get, "/b", "b"),
        ]);
        assert!(t.remove(RouteMethod::Get, "/a"));
        assert!(!t.remove(RouteMethod::Get, "/a"));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("GET", "/b").unwrap().service_name, "b");
        assert!(t.get("GET", "/a").is_none());
    }

    #[test]
    fn invalid_patterns_rejected() {
        let t = RouteTable::new();
        for bad in ["api/x", "/users/:", "/users/:1id", "/a/*b", "/a/:x/:x"] {
            let err = t
                .register(ServiceRoute::new(RouteMethod::Get, bad, "s"))
                .unwrap_err();
            assert!(matches!(err, MeshError::InvalidRoutePattern { .. }), "{bad}");
        }
        assert!(t.is_empty());
    }

    proptest! {
        #[test]
        fn param_captures_any_segment(seg in "[A-Za-z0-9_.~-]{1,16}") {
            let t = table(vec![ServiceRoute::new(RouteMethod::Get, "/items/:id", "items")]);
            let path = format!("/items/{seg}");
            let m = t.resolve("GET", &path).unwrap();
            prop_assert_eq!(&m.params["id"], &seg);
        }

        #[test]
        fn star_accepts_any_suffix(suffix in "[a-z0-9/]{0,24}") {
            let t = table(vec![ServiceRoute::new(RouteMethod::All, "/api/*", "api")]);
            let path = format!("/api/{suffix}");
            prop_assert!(t.resolve("DELETE", &path).is_some());
        }
    }
}
