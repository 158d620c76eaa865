//! Layered environment variables with deferred `$VAR` expansion.
//!
//! A map may have a parent scope. Values are stored raw and expanded on
//! read: a reference resolves against the nearest scope that defines the
//! name, starting at the scope holding the value being expanded. A value
//! that refers to its own name reads the definition from the parent scope,
//! which is how `PATH=$PATH:/opt/bin` layering works.
//!
//! Missing references and reference cycles expand to the empty string.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// One scope of environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvMap {
    vars: BTreeMap<String, String>,
    parent: Option<Arc<EnvMap>>,
}

/// Names currently being expanded, keyed by scope depth.
type Visiting = HashSet<(usize, String)>;

impl EnvMap {
    /// Creates an empty root scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty scope layered on top of `self`.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Self {
        Self {
            vars: BTreeMap::new(),
            parent: Some(Arc::clone(self)),
        }
    }

    /// Defines `key` in this scope with an unexpanded value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.vars.insert(key.into(), value.into());
    }

    /// Returns true if `key` is defined in this scope or any parent.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Returns the fully expanded value of `key`, or `""` if undefined.
    #[must_use]
    pub fn get(&self, key: &str) -> String {
        let mut visiting = Visiting::new();
        self.resolve(key, &mut visiting)
    }

    /// Returns every visible variable, expanded.
    #[must_use]
    pub fn map(&self) -> BTreeMap<String, String> {
        self.keys()
            .into_iter()
            .map(|key| {
                let value = self.get(&key);
                (key, value)
            })
            .collect()
    }

    /// Returns every visible variable as sorted `KEY=VALUE` strings.
    #[must_use]
    pub fn strings(&self) -> Vec<String> {
        self.map()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    fn keys(&self) -> BTreeSet<String> {
        let mut keys = self
            .parent
            .as_ref()
            .map_or_else(BTreeSet::new, |parent| parent.keys());
        keys.extend(self.vars.keys().cloned());
        keys
    }

    fn depth(&self) -> usize {
        self.parent.as_ref().map_or(0, |parent| parent.depth() + 1)
    }

    fn lookup(&self, key: &str) -> Option<(&Self, &str)> {
        match self.vars.get(key) {
            Some(value) => Some((self, value.as_str())),
            None => self.parent.as_ref().and_then(|parent| parent.lookup(key)),
        }
    }

    fn resolve(&self, key: &str, visiting: &mut Visiting) -> String {
        let Some((scope, raw)) = self.lookup(key) else {
            return String::new();
        };
        let mark = (scope.depth(), key.to_string());
        if !visiting.insert(mark.clone()) {
            return String::new();
        }
        let value = scope.expand(key, raw, visiting);
        let _ = visiting.remove(&mark);
        value
    }

    fn expand(&self, key: &str, raw: &str, visiting: &mut Visiting) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let Some((name, consumed)) = parse_reference(after) else {
                out.push('$');
                rest = after;
                continue;
            };
            let value = if name == key {
                self.parent
                    .as_ref()
                    .map(|parent| parent.resolve(name, visiting))
                    .unwrap_or_default()
            } else {
                self.resolve(name, visiting)
            };
            out.push_str(&value);
            rest = &after[consumed..];
        }
        out.push_str(rest);
        out
    }
}

/// Parses `NAME` or `{NAME}` at the start of `s`, returning the name and the
/// number of bytes consumed.
fn parse_reference(s: &str) -> Option<(&str, usize)> {
    let is_name = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let valid = |name: &str| {
        name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') && name.chars().all(is_name)
    };
    if let Some(braced) = s.strip_prefix('{') {
        let end = braced.find('}')?;
        let name = &braced[..end];
        return valid(name).then_some((name, end + 2));
    }
    let end = s.find(|c: char| !is_name(c)).unwrap_or(s.len());
    let name = &s[..end];
    valid(name).then_some((name, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_round_trip() {
        let mut env = EnvMap::new();
        env.set("HOME", "/");
        assert_eq!(env.get("HOME"), "/");
        assert_eq!(env.get("MISSING"), "");
    }

    #[test]
    fn references_expand_in_both_syntaxes() {
        let mut env = EnvMap::new();
        env.set("A", "a");
        env.set("B", "$A-${A}x");
        assert_eq!(env.get("B"), "a-ax");
    }

    #[test]
    fn self_reference_resolves_to_empty() {
        let mut env = EnvMap::new();
        env.set("A", "$A");
        assert_eq!(env.get("A"), "");
    }

    #[test]
    fn two_variable_cycle_resolves_to_empty() {
        let mut env = EnvMap::new();
        env.set("A", "$B");
        env.set("B", "$A");
        let map = env.map();
        assert_eq!(map.get("A").map(String::as_str), Some(""));
        assert_eq!(map.get("B").map(String::as_str), Some(""));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn repeated_reference_is_not_mistaken_for_cycle() {
        let mut env = EnvMap::new();
        env.set("B", "x");
        env.set("A", "$B$B");
        assert_eq!(env.get("A"), "xx");
    }

    #[test]
    fn child_reference_to_own_name_reads_parent() {
        let mut parent = EnvMap::new();
        parent.set("X", "parent");
        let parent = Arc::new(parent);
        let mut child = parent.child();
        child.set("X", "child:$X");
        assert_eq!(child.get("X"), "child:parent");
        assert_eq!(parent.get("X"), "parent");
    }

    #[test]
    fn child_sees_parent_variables() {
        let mut parent = EnvMap::new();
        parent.set("TMPDIR", "/tmp");
        let parent = Arc::new(parent);
        let mut child = parent.child();
        child.set("CACHE", "$TMPDIR/cache");
        assert_eq!(
            child.strings(),
            vec!["CACHE=/tmp/cache".to_string(), "TMPDIR=/tmp".to_string()]
        );
    }

    #[test]
    fn lone_dollar_signs_are_literal() {
        let mut env = EnvMap::new();
        env.set("PRICE", "$5 and $ and ${unterminated");
        assert_eq!(env.get("PRICE"), "$5 and $ and ${unterminated");
    }
}
