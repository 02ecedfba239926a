//! Route selection for destinations with no egress plan of their own.

use ferry_core::config::RouteConfig;
use ferry_core::MetaEid;

pub trait Router: Send + Sync {
    /// Neighbor EID to forward toward, skipping any neighbor `snubbed`
    /// reports true for.
    fn route(&self, destination: &MetaEid, snubbed: &dyn Fn(&str) -> bool) -> Option<String>;

    /// Every neighbor that could carry bundles for `destination`, best
    /// first. Minimum-latency bundles are sent on all of them.
    fn candidates(&self, destination: &MetaEid) -> Vec<String> {
        self.route(destination, &|_| false).into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    /// Matches every EID starting with the prefix.
    Prefix(String),
}

impl Pattern {
    fn parse(text: &str) -> Self {
        match text.strip_suffix('*').or_else(|| text.strip_suffix('~')) {
            Some(prefix) => Pattern::Prefix(prefix.to_string()),
            None => Pattern::Exact(text.to_string()),
        }
    }

    fn matches(&self, eid: &str) -> bool {
        match self {
            Pattern::Exact(e) => e == eid,
            Pattern::Prefix(p) => eid.starts_with(p.as_str()),
        }
    }

    /// Exact patterns first, then longer prefixes.
    fn rank(&self) -> (u8, usize) {
        match self {
            Pattern::Exact(_) => (0, 0),
            Pattern::Prefix(p) => (1, usize::MAX - p.len()),
        }
    }
}

/// Fixed routes from configuration, most specific first.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    routes: Vec<(Pattern, String)>,
}

impl StaticRouter {
    pub fn new(routes: &[RouteConfig]) -> Self {
        let mut routes: Vec<(Pattern, String)> = routes
            .iter()
            .map(|r| (Pattern::parse(&r.destination), r.via.clone()))
            .collect();
        routes.sort_by_key(|(pattern, _)| pattern.rank());
        Self { routes }
    }
}

impl Router for StaticRouter {
    fn route(&self, destination: &MetaEid, snubbed: &dyn Fn(&str) -> bool) -> Option<String> {
        let eid = destination.to_string();
        self.routes
            .iter()
            .filter(|(pattern, _)| pattern.matches(&eid))
            .map(|(_, via)| via)
            .find(|via| !snubbed(via))
            .cloned()
    }

    fn candidates(&self, destination: &MetaEid) -> Vec<String> {
        let eid = destination.to_string();
        let mut out: Vec<String> = Vec::new();
        for (pattern, via) in &self.routes {
            if pattern.matches(&eid) && !out.contains(via) {
                out.push(via.clone());
            }
        }
        out
    }
}
