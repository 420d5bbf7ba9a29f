//! Pattern-based route resolution.
//!
//! Routes are either exact keys (stored in a `DashMap` for constant-time
//! lookup) or glob patterns compiled once at registration. Resolution rules:
//!
//! - An exact route always wins over any pattern route in [`PatternRouter::find_route`].
//! - Among patterns, higher priority wins; equal priorities keep registration order.
//! - [`PatternRouter::find_all_routes`] returns every match ordered by priority,
//!   exact first among equals.
//!
//! Resolutions are cached per key. Each cache entry records the router
//! generation observed before the tables were read, and every mutation bumps
//! the generation, so an entry computed against superseded tables is never
//! served even if it was inserted after the mutation cleared the cache.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use relaybus_types::error::BusError;
use relaybus_types::route::Route;
use tracing::debug;

use crate::pattern::GlobPattern;

/// Cache entries beyond this count trigger a full cache reset.
const ROUTE_CACHE_LIMIT: usize = 10_000;

/// A pattern route with its matcher, built once at registration.
#[derive(Debug)]
struct CompiledRoute {
    route: Route,
    matcher: GlobPattern,
}

#[derive(Debug, Clone)]
struct Cached<T> {
    generation: u64,
    value: T,
}

/// Resolves routing keys to destination endpoints.
pub struct PatternRouter {
    exact_routes: DashMap<String, Route>,
    /// Sorted by priority descending, then registration sequence ascending.
    pattern_routes: RwLock<Vec<CompiledRoute>>,
    best_cache: DashMap<String, Cached<Route>>,
    fanout_cache: DashMap<String, Cached<Vec<Route>>>,
    generation: AtomicU64,
    next_sequence: AtomicU64,
}

impl PatternRouter {
    pub fn new() -> Self {
        Self {
            exact_routes: DashMap::new(),
            pattern_routes: RwLock::new(Vec::new()),
            best_cache: DashMap::new(),
            fanout_cache: DashMap::new(),
            generation: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Register a route from `pattern` to `endpoint_id`.
    ///
    /// Patterns containing `*`, `?` or `[` are compiled to anchored matchers;
    /// anything else is an exact key. Only one exact route may exist per key,
    /// and the same glob may not be registered twice for the same endpoint.
    pub fn register_route(
        &self,
        pattern: &str,
        endpoint_id: impl Into<String>,
        priority: i32,
    ) -> Result<Route, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern {
                pattern: String::new(),
                reason: "pattern cannot be empty".to_string(),
            });
        }

        let endpoint_id = endpoint_id.into();
        let mut route = Route {
            pattern: pattern.to_string(),
            endpoint_id,
            priority,
            registered_at: Utc::now(),
            sequence: 0,
        };

        if GlobPattern::is_glob(pattern) {
            let matcher = GlobPattern::compile(pattern)?;

            let mut routes = self.pattern_routes.write();
            if routes
                .iter()
                .any(|c| c.route.pattern == route.pattern && c.route.endpoint_id == route.endpoint_id)
            {
                return Err(BusError::RouteAlreadyExists(format!(
                    "{} -> {}",
                    route.pattern, route.endpoint_id
                )));
            }

            route.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            // Insert after every route of equal or higher priority so ties
            // keep registration order.
            let index = routes.partition_point(|c| c.route.priority >= priority);
            routes.insert(
                index,
                CompiledRoute {
                    route: route.clone(),
                    matcher,
                },
            );
        } else {
            match self.exact_routes.entry(pattern.to_string()) {
                Entry::Occupied(_) => {
                    return Err(BusError::RouteAlreadyExists(pattern.to_string()));
                }
                Entry::Vacant(slot) => {
                    route.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                    slot.insert(route.clone());
                }
            }
        }

        self.invalidate();
        debug!(
            pattern = %route.pattern,
            endpoint_id = %route.endpoint_id,
            priority,
            "registered route"
        );
        Ok(route)
    }

    /// Remove every route registered under `pattern`.
    ///
    /// Returns the number of routes removed.
    pub fn deregister_route(&self, pattern: &str) -> Result<usize, BusError> {
        let mut removed = usize::from(self.exact_routes.remove(pattern).is_some());

        {
            let mut routes = self.pattern_routes.write();
            let before = routes.len();
            routes.retain(|c| c.route.pattern != pattern);
            removed += before - routes.len();
        }

        if removed == 0 {
            return Err(BusError::RouteNotFound(pattern.to_string()));
        }

        self.invalidate();
        debug!(%pattern, removed, "deregistered route");
        Ok(removed)
    }

    /// Find the single best route for `key`.
    pub fn find_route(&self, key: &str) -> Option<Route> {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(hit) = self.best_cache.get(key) {
            if hit.generation == generation {
                return Some(hit.value.clone());
            }
        }

        let resolved = self.resolve_best(key)?;
        self.cache_insert(&self.best_cache, key, generation, resolved.clone());
        Some(resolved)
    }

    /// Find every route matching `key`, highest priority first.
    pub fn find_all_routes(&self, key: &str) -> Vec<Route> {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(hit) = self.fanout_cache.get(key) {
            if hit.generation == generation {
                return hit.value.clone();
            }
        }

        let resolved = self.resolve_all(key);
        if !resolved.is_empty() {
            self.cache_insert(&self.fanout_cache, key, generation, resolved.clone());
        }
        resolved
    }

    /// Total number of registered routes (exact + pattern).
    pub fn route_count(&self) -> usize {
        self.exact_routes.len() + self.pattern_routes.read().len()
    }

    /// All registered routes in registration order.
    pub fn routes(&self) -> Vec<Route> {
        let mut all: Vec<Route> = self
            .exact_routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.extend(self.pattern_routes.read().iter().map(|c| c.route.clone()));
        all.sort_by_key(|r| r.sequence);
        all
    }

    /// Drop all cached resolutions.
    pub fn clear_cache(&self) {
        self.best_cache.clear();
        self.fanout_cache.clear();
    }

    fn resolve_best(&self, key: &str) -> Option<Route> {
        if let Some(route) = self.exact_routes.get(key) {
            return Some(route.value().clone());
        }

        self.pattern_routes
            .read()
            .iter()
            .find(|c| c.matcher.is_match(key))
            .map(|c| c.route.clone())
    }

    fn resolve_all(&self, key: &str) -> Vec<Route> {
        let mut matches: Vec<Route> = self
            .exact_routes
            .get(key)
            .map(|r| r.value().clone())
            .into_iter()
            .collect();

        matches.extend(
            self.pattern_routes
                .read()
                .iter()
                .filter(|c| c.matcher.is_match(key))
                .map(|c| c.route.clone()),
        );

        // Stable: the exact route stays ahead of equal-priority patterns.
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        matches
    }

    fn cache_insert<T>(
        &self,
        cache: &DashMap<String, Cached<T>>,
        key: &str,
        generation: u64,
        value: T,
    ) {
        if cache.len() >= ROUTE_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(key.to_string(), Cached { generation, value });
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.clear_cache();
    }
}

impl Default for PatternRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PatternRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRouter")
            .field("exact_routes", &self.exact_routes.len())
            .field("pattern_routes", &self.pattern_routes.read().len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
