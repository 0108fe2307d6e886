//! Hierarchical name resolution and remapping (component A).
//!
//! Names are `/`-separated paths. A name starting with `~` is private (resolved against the
//! node's own fully qualified name); a name starting with `/` is already global; anything else
//! is relative to a namespace. See `original_source/core/roscpp/include/ros/names.h` for the
//! signatures this module mirrors.

use std::collections::BTreeMap;

use axon_common::{Error, Result};

/// Collapses runs of `/` and trims a trailing `/`, except when the name is the root `/`.
pub fn clean(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(name.len());
    let mut last_was_slash = false;
    for c in name.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Concatenates two name segments with exactly one `/` between them.
pub fn append(left: &str, right: &str) -> String {
    let left = left.trim_end_matches('/');
    let right = right.trim_start_matches('/');
    if left.is_empty() {
        format!("/{right}")
    } else {
        format!("{left}/{right}")
    }
}

/// Returns true if `name` is already a syntactically valid, global (non-relative) name.
pub fn is_global(name: &str) -> bool {
    name.starts_with('/')
}

/// Returns true if `name` is a private name (resolved against the node's own fully qualified
/// name rather than the namespace).
pub fn is_private(name: &str) -> bool {
    name.starts_with('~')
}

/// Validates that a cleaned name contains no illegal characters.
///
/// ROS-style names allow alphanumerics, `_`, and `/` as a separator; anything else (most
/// commonly stray whitespace or shell metacharacters that leaked through unescaped) is rejected.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name is empty".to_string()));
    }
    let body = name.trim_start_matches(['/', '~']);
    for segment in body.split('/') {
        if segment.is_empty() {
            continue;
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::InvalidName(format!(
                "name {name:?} contains an invalid segment {segment:?}"
            )));
        }
    }
    Ok(())
}

/// An ordered set of (matched-name -> substituted-name) pairs, applied by exact match after a
/// name has been canonicalized to its global form.
#[derive(Clone, Debug, Default)]
pub struct Remappings {
    pairs: Vec<(String, String)>,
}

impl Remappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            pairs: pairs.into_iter().collect(),
        }
    }

    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self {
            pairs: map.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.pairs.push((from.into(), to.into()));
    }

    /// Exact-match lookup; returns the first match in insertion order.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(from, _)| from == name)
            .map(|(_, to)| to.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }
}

/// Resolves a node's name, against its namespace and remap table.
///
/// This is the runtime-side counterpart to the free `names::resolve` in the original source,
/// bundled with the frozen `namespace`/`fully_qualified_name`/remap table a node carries after
/// `init()`.
#[derive(Clone, Debug)]
pub struct Resolver {
    namespace: String,
    fully_qualified_name: String,
    remappings: Remappings,
}

impl Resolver {
    pub fn new(namespace: impl Into<String>, node_name: impl Into<String>) -> Self {
        let namespace = clean(&namespace.into());
        let namespace = if namespace.is_empty() {
            "/".to_string()
        } else {
            namespace
        };
        let fully_qualified_name = clean(&append(&namespace, &node_name.into()));
        Self {
            namespace,
            fully_qualified_name,
            remappings: Remappings::new(),
        }
    }

    pub fn with_remappings(mut self, remappings: Remappings) -> Self {
        self.remappings = remappings;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn fully_qualified_name(&self) -> &str {
        &self.fully_qualified_name
    }

    pub fn remappings(&self) -> &Remappings {
        &self.remappings
    }

    /// Resolves `name` against this node's namespace, optionally applying the remap table.
    ///
    /// Idempotent: `resolve(resolve(name)) == resolve(name)`, because a name produced by
    /// resolution is always already global and a remap target is matched only at the top level.
    pub fn resolve(&self, name: &str, apply_remap: bool) -> Result<String> {
        validate(name)?;
        let global = if is_private(name) {
            append(&self.fully_qualified_name, &name[1..])
        } else if is_global(name) {
            name.to_string()
        } else {
            append(&self.namespace, name)
        };
        let cleaned = clean(&global);
        if apply_remap {
            if let Some(mapped) = self.remappings.lookup(&cleaned) {
                return Ok(clean(mapped));
            }
        }
        Ok(cleaned)
    }
}

/// The special `__`-prefixed remap keys consumed at init time rather than used for per-name
/// remapping. See spec §4.A.
#[derive(Clone, Debug, Default)]
pub struct SpecialArgs {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub master_uri: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub log_path: Option<String>,
}

impl SpecialArgs {
    /// Consumes a single `__key:=value` remap pair if `key` is one of the recognized special
    /// keys. Returns true if it was consumed.
    pub fn consume(&mut self, key: &str, value: &str) -> bool {
        match key {
            "__name" => self.name = Some(value.to_string()),
            "__ns" => self.namespace = Some(value.to_string()),
            "__master" => self.master_uri = Some(value.to_string()),
            "__ip" => self.ip = Some(value.to_string()),
            "__hostname" => self.hostname = Some(value.to_string()),
            "__log" => self.log_path = Some(value.to_string()),
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses_slashes() {
        assert_eq!(clean("//a///b//"), "/a/b");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean(""), "");
    }

    #[test]
    fn append_single_slash() {
        assert_eq!(append("/a", "b"), "/a/b");
        assert_eq!(append("/a/", "/b"), "/a/b");
        assert_eq!(append("", "b"), "/b");
    }

    #[test]
    fn resolve_relative_private_and_global() {
        let r = Resolver::new("/a", "talker");
        assert_eq!(r.resolve("unrelated", true).unwrap(), "/a/unrelated");
        assert_eq!(r.resolve("~baz", true).unwrap(), "/a/talker/baz");
        assert_eq!(r.resolve("/qux", true).unwrap(), "/qux");
    }

    #[test]
    fn resolve_is_idempotent() {
        let r = Resolver::new("/a", "talker");
        for name in ["foo", "~bar", "/baz"] {
            let once = r.resolve(name, true).unwrap();
            let twice = r.resolve(&once, true).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn remap_applies_exact_match_after_resolution() {
        let mut remaps = Remappings::new();
        remaps.insert("/a/bar", "/a/baz");
        let r = Resolver::new("/a", "talker").with_remappings(remaps);
        assert_eq!(r.resolve("bar", true).unwrap(), "/a/baz");
        // Without remap application, the unmapped resolution is returned.
        assert_eq!(r.resolve("bar", false).unwrap(), "/a/bar");
    }

    /// S1 from the spec: `my_node foo:=bar ~baz:=/qux __name:=talker __ns:=/a`.
    #[test]
    fn scenario_s1_remapping() {
        let mut remaps = Remappings::new();
        // foo:=bar resolves the *unmapped* side against the namespace first, matching the
        // original source's approach of resolving both sides of a `:=` pair before inserting.
        let pre = Resolver::new("/a", "talker");
        remaps.insert(
            pre.resolve("foo", false).unwrap(),
            pre.resolve("bar", false).unwrap(),
        );
        remaps.insert(
            pre.resolve("~baz", false).unwrap(),
            pre.resolve("/qux", false).unwrap(),
        );
        let r = Resolver::new("/a", "talker").with_remappings(remaps);
        assert_eq!(r.fully_qualified_name(), "/a/talker");
        assert_eq!(r.resolve("foo", true).unwrap(), "/a/bar");
        assert_eq!(r.resolve("~baz", true).unwrap(), "/qux");
        assert_eq!(r.resolve("unrelated", true).unwrap(), "/a/unrelated");
    }

    #[test]
    fn invalid_name_rejected() {
        assert!(validate("bad name").is_err());
        assert!(validate("ok_name/sub1").is_ok());
    }
}
