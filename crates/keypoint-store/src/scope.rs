//! Scope definitions and the inheritance graph.
//!
//! An edge `parent → child` means that anyone granted `parent` implicitly
//! holds `child` and everything reachable from it. Edges are added
//! independently, so the graph may contain cycles; every traversal here is a
//! breadth-first walk guarded by a visited set.
//!
//! The registry is backed by two [`DashMap`]s and is cheaply cloneable, so a
//! single instance can be shared by the validator, the rules and the policy
//! engine.
//!
//! # Example
//!
//! ```rust
//! # use keypoint_store::scope::ScopeRegistry;
//! let registry = ScopeRegistry::with_defaults();
//! assert!(registry.has_scope(["admin"], "write"));
//! assert!(!registry.has_scope(["write"], "admin"));
//! ```

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Scope that satisfies every requirement when granted (or inherited).
pub const WILDCARD: &str = "*";

/// Built-in read scope.
pub const SCOPE_READ: &str = "read";

/// Built-in write scope.
pub const SCOPE_WRITE: &str = "write";

/// Built-in admin scope; inherits `read`, `write` and `*`.
pub const SCOPE_ADMIN: &str = "admin";

/// Match a scope name against a simple wildcard pattern.
///
/// Only the first `*` is special and stands for any (possibly empty) run of
/// characters; the pattern is anchored at both ends. Any later `*` is taken
/// literally. A pattern without `*` matches only itself.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            candidate.len() >= prefix.len() + suffix.len()
                && candidate.starts_with(prefix)
                && candidate.ends_with(suffix)
        }
        None => pattern == candidate,
    }
}

/// A named permission known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Scope definitions plus the directed inheritance graph.
#[derive(Clone)]
pub struct ScopeRegistry {
    scopes: Arc<DashMap<String, ScopeDefinition>>,
    inheritance: Arc<DashMap<String, BTreeSet<String>>>,
}

impl ScopeRegistry {
    /// Create a registry with no scopes and no edges.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: Arc::new(DashMap::new()),
            inheritance: Arc::new(DashMap::new()),
        }
    }

    /// Create a registry pre-populated with `read`, `write`, `admin` and `*`,
    /// where `admin → read, write, *`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.define_scope(SCOPE_READ, "Read access", None);
        registry.define_scope(SCOPE_WRITE, "Write access", None);
        registry.define_scope(SCOPE_ADMIN, "Administrative access", None);
        registry.define_scope(WILDCARD, "All scopes", None);
        registry.add_inheritance(SCOPE_ADMIN, [SCOPE_READ, SCOPE_WRITE, WILDCARD]);
        registry
    }

    /// Define (or redefine) a scope.
    ///
    /// Redefinition replaces description and metadata but leaves existing
    /// inheritance edges untouched.
    pub fn define_scope(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let name = name.into();
        tracing::debug!(scope = %name, "scope defined");
        self.scopes.insert(
            name.clone(),
            ScopeDefinition {
                name,
                description: description.into(),
                metadata: metadata.unwrap_or_default(),
            },
        );
    }

    /// Add `parent → child` edges. Existing children are kept.
    pub fn add_inheritance<I, S>(&self, parent: impl Into<String>, children: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parent = parent.into();
        let mut entry = self.inheritance.entry(parent.clone()).or_default();
        for child in children {
            let child = child.into();
            tracing::trace!(parent = %parent, child = %child, "scope inheritance added");
            entry.insert(child);
        }
    }

    /// Direct children of `parent`.
    pub fn children(&self, parent: &str) -> BTreeSet<String> {
        self.inheritance
            .get(parent)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Every scope reachable from `scope`.
    ///
    /// `scope` itself is only included when it sits on a cycle.
    pub fn inherited_scopes(&self, scope: &str) -> BTreeSet<String> {
        let mut reached = BTreeSet::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([scope.to_string()]);

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.clone()) {
                continue;
            }
            // Clone the children so no shard guard is held across lookups.
            for child in self.children(&node) {
                reached.insert(child.clone());
                if !visited.contains(&child) {
                    queue.push_back(child);
                }
            }
        }

        reached
    }

    /// Whether the granted scopes satisfy `required`.
    ///
    /// True when `available` holds `*` or `required` directly, or when
    /// `required` is reachable from any granted scope. An inherited `*` is
    /// an ordinary node and does not act as a wildcard.
    pub fn has_scope<I, S>(&self, available: I, required: &str) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let available: Vec<S> = available.into_iter().collect();

        if available
            .iter()
            .any(|s| s.as_ref() == WILDCARD || s.as_ref() == required)
        {
            return true;
        }

        available
            .iter()
            .any(|granted| self.inherited_scopes(granted.as_ref()).contains(required))
    }

    /// Whether at least one of `required` is satisfied.
    pub fn has_any_scope<S: AsRef<str>>(&self, available: &[S], required: &[S]) -> bool {
        required
            .iter()
            .any(|r| {
                let granted = available.iter().map(|s| AsRef::<str>::as_ref(s));
                self.has_scope(granted, r.as_ref())
            })
    }

    /// Whether every one of `required` is satisfied.
    pub fn has_all_scopes<S: AsRef<str>>(&self, available: &[S], required: &[S]) -> bool {
        required
            .iter()
            .all(|r| {
                let granted = available.iter().map(|s| AsRef::<str>::as_ref(s));
                self.has_scope(granted, r.as_ref())
            })
    }

    /// Each scope plus its full inherited closure.
    pub fn expand_scopes<I, S>(&self, scopes: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut expanded = BTreeSet::new();
        for scope in scopes {
            let scope = scope.as_ref();
            expanded.insert(scope.to_string());
            expanded.extend(self.inherited_scopes(scope));
        }
        expanded
    }

    /// Drop every scope already implied by another scope in the same set.
    ///
    /// When two scopes imply each other (a cycle) the lexicographically
    /// smaller one is kept.
    pub fn reduce_scopes<I, S>(&self, scopes: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let input: BTreeSet<String> = scopes.into_iter().map(|s| s.as_ref().to_string()).collect();
        let closures: Vec<(&String, BTreeSet<String>)> = input
            .iter()
            .map(|s| (s, self.inherited_scopes(s)))
            .collect();

        input
            .iter()
            .filter(|scope| {
                !closures.iter().any(|(other, closure)| {
                    if *other == *scope || !closure.contains(*scope) {
                        return false;
                    }
                    let mutual = closures
                        .iter()
                        .any(|(s, c)| *s == *scope && c.contains(*other));
                    !mutual || *other < *scope
                })
            })
            .cloned()
            .collect()
    }

    /// Look up a scope definition.
    pub fn get_scope(&self, name: &str) -> Option<ScopeDefinition> {
        self.scopes.get(name).map(|entry| entry.value().clone())
    }

    /// All defined scopes, sorted by name.
    pub fn list_scopes(&self) -> Vec<ScopeDefinition> {
        let mut scopes: Vec<ScopeDefinition> =
            self.scopes.iter().map(|e| e.value().clone()).collect();
        scopes.sort_by(|a, b| a.name.cmp(&b.name));
        scopes
    }

    /// Defined scope names matching a wildcard pattern, sorted.
    pub fn find_matching(&self, pattern: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .scopes
            .iter()
            .filter(|e| pattern_matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Whether `name` is a defined scope, or a pattern matching at least one.
    pub fn validate_scope(&self, name: &str) -> bool {
        if self.scopes.contains_key(name) {
            return true;
        }
        name.contains('*') && !self.find_matching(name).is_empty()
    }

    /// Reject any unknown scope names.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] listing every unknown name.
    pub fn validate_scopes<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unknown: Vec<String> = names
            .into_iter()
            .filter(|n| !self.validate_scope(n.as_ref()))
            .map(|n| n.as_ref().to_string())
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(StoreError::validation(format!(
                "unknown scopes: {}",
                unknown.join(", ")
            )))
        }
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("scopes", &self.scopes.len())
            .field("edges", &self.inheritance.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_hierarchy() {
        let registry = ScopeRegistry::with_defaults();
        assert!(registry.has_scope(["admin"], "write"));
        assert!(registry.has_scope(["admin"], "read"));
        assert!(!registry.has_scope(["write"], "admin"));
        assert!(!registry.has_scope(["read"], "write"));
    }

    #[test]
    fn inherited_wildcard_is_not_a_grant() {
        let registry = ScopeRegistry::with_defaults();
        assert!(!registry.has_scope(["admin"], "nonexistent-leaf-scope"));
        assert!(!registry.has_scope(["admin"], "billing:export"));
        assert!(registry.has_scope(["*"], "billing:export"));
    }

    #[test]
    fn granted_wildcard_satisfies_everything() {
        let registry = ScopeRegistry::new();
        assert!(registry.has_scope(["*"], "anything"));
    }

    #[test]
    fn direct_grant_on_empty_registry() {
        let registry = ScopeRegistry::new();
        assert!(registry.has_scope(["files:read"], "files:read"));
        assert!(!registry.has_scope(["files:read"], "files:write"));
    }

    #[test]
    fn inherited_closure_of_chain() {
        let registry = ScopeRegistry::new();
        registry.add_inheritance("a", ["b"]);
        registry.add_inheritance("b", ["c", "d"]);
        registry.add_inheritance("d", ["e"]);

        assert_eq!(registry.inherited_scopes("a"), set(&["b", "c", "d", "e"]));
        assert_eq!(registry.inherited_scopes("d"), set(&["e"]));
        assert!(registry.inherited_scopes("e").is_empty());
    }

    #[test]
    fn cycle_terminates_and_includes_start() {
        let registry = ScopeRegistry::new();
        registry.add_inheritance("a", ["b"]);
        registry.add_inheritance("b", ["c"]);
        registry.add_inheritance("c", ["a"]);
        registry.add_inheritance("x", ["a"]);

        assert_eq!(registry.inherited_scopes("a"), set(&["a", "b", "c"]));
        // "x" reaches the cycle but is not on it.
        assert_eq!(registry.inherited_scopes("x"), set(&["a", "b", "c"]));
    }

    #[test]
    fn self_loop() {
        let registry = ScopeRegistry::new();
        registry.add_inheritance("loop", ["loop"]);
        assert_eq!(registry.inherited_scopes("loop"), set(&["loop"]));
    }

    #[test]
    fn add_inheritance_is_a_union() {
        let registry = ScopeRegistry::new();
        registry.add_inheritance("p", ["a"]);
        registry.add_inheritance("p", ["b"]);
        assert_eq!(registry.children("p"), set(&["a", "b"]));
    }

    #[test]
    fn redefine_keeps_edges() {
        let registry = ScopeRegistry::with_defaults();
        registry.define_scope("admin", "Superuser", None);

        assert_eq!(registry.get_scope("admin").unwrap().description, "Superuser");
        assert!(registry.has_scope(["admin"], "write"));
    }

    #[test]
    fn any_and_all() {
        let registry = ScopeRegistry::with_defaults();
        assert!(registry.has_any_scope(&["read"], &["write", "read"]));
        assert!(!registry.has_all_scopes(&["read"], &["write", "read"]));
        assert!(registry.has_all_scopes(&["admin"], &["write", "read"]));
    }

    #[test]
    fn expand_admin_is_superset_of_read() {
        let registry = ScopeRegistry::with_defaults();
        let admin = registry.expand_scopes(["admin"]);
        let read = registry.expand_scopes(["read"]);
        assert!(admin.is_superset(&read));
        assert_eq!(admin, set(&["*", "admin", "read", "write"]));
    }

    #[test]
    fn reduce_drops_implied_scopes() {
        let registry = ScopeRegistry::with_defaults();
        assert_eq!(
            registry.reduce_scopes(["admin", "read", "write"]),
            set(&["admin"])
        );
        assert_eq!(registry.reduce_scopes(["read", "write"]), set(&["read", "write"]));
    }

    #[test]
    fn reduce_keeps_one_side_of_a_cycle() {
        let registry = ScopeRegistry::new();
        registry.add_inheritance("a", ["b"]);
        registry.add_inheritance("b", ["a"]);
        assert_eq!(registry.reduce_scopes(["a", "b"]), set(&["a"]));
    }

    #[test]
    fn pattern_matching() {
        assert!(pattern_matches("files:*", "files:read"));
        assert!(pattern_matches("*:read", "files:read"));
        assert!(pattern_matches("files:*", "files:"));
        assert!(!pattern_matches("files:*", "users:read"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("a*a", "a"));
        // Only the first star is a wildcard.
        assert!(pattern_matches("a*b*", "axxb*"));
        assert!(!pattern_matches("a*b*", "axxbyy"));
    }

    #[test]
    fn find_and_validate() {
        let registry = ScopeRegistry::with_defaults();
        registry.define_scope("files:read", "Read files", None);
        registry.define_scope("files:write", "Write files", None);

        assert_eq!(
            registry.find_matching("files:*"),
            vec!["files:read".to_string(), "files:write".to_string()]
        );
        assert!(registry.validate_scope("files:read"));
        assert!(registry.validate_scope("files:*"));
        assert!(!registry.validate_scope("nope"));
        assert!(!registry.validate_scope("nope:*"));

        assert!(registry.validate_scopes(["read", "files:write"]).is_ok());
        let err = registry.validate_scopes(["read", "ghost", "phantom"]).unwrap_err();
        assert_eq!(err.to_string(), "validation failed: unknown scopes: ghost, phantom");
    }

    #[test]
    fn list_scopes_sorted() {
        let registry = ScopeRegistry::with_defaults();
        let names: Vec<String> = registry.list_scopes().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["*", "admin", "read", "write"]);
    }

    #[test]
    fn clones_share_state() {
        let registry = ScopeRegistry::new();
        let clone = registry.clone();
        clone.add_inheritance("ops", ["deploy"]);
        assert!(registry.has_scope(["ops"], "deploy"));
    }
}
