//! Host and path mapping.
//!
//! A [`Mapper`] resolves `(host, path)` to a context and a wrapper target in
//! three steps:
//!
//! 1. host: exact name, then alias, then wildcard (`*.example.com`), then the
//!    default host
//! 2. context: longest registered path prefix ending on a segment boundary,
//!    with the root context `/` as the last resort
//! 3. wrapper: exact pattern, then longest extension pattern (`*.jsp`), then
//!    longest prefix pattern (`/api/*`), then the default pattern (`/`)
//!
//! The lookup tables live in an immutable snapshot. Every registration
//! change builds a new snapshot and swaps it in, so a resolve never sees a
//! half-applied update.

use crate::error::CoreError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Which wrapper rule produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Extension,
    Prefix,
    Default,
}

/// Path decomposition of a resolved request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedPath {
    /// Path of the matched context, empty for the root context.
    pub context_path: String,
    /// Part of the context-relative path matched by the wrapper pattern.
    pub wrapper_path: String,
    /// Remainder after a prefix match.
    pub path_info: Option<String>,
    pub match_kind: Option<MatchKind>,
    /// `;name=value` parameters stripped from the path segments.
    pub path_parameters: Vec<(String, String)>,
}

impl MappedPath {
    /// Context-relative path (`wrapper_path` + `path_info`).
    pub fn relative_path(&self) -> String {
        match &self.path_info {
            Some(info) => format!("{}{}", self.wrapper_path, info),
            None => self.wrapper_path.clone(),
        }
    }

    pub fn path_parameter(&self, name: &str) -> Option<&str> {
        self.path_parameters
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of [`Mapper::resolve`].
///
/// Not finding a target is a normal outcome: `wrapper` is `None` and the
/// caller answers with a not-found response.
#[derive(Debug, Clone)]
pub struct MappingData<C, W> {
    /// Name of the matched host entry.
    pub host: Option<String>,
    pub context: Option<C>,
    pub wrapper: Option<W>,
    pub path: MappedPath,
    /// Set when the request named a context root without its trailing
    /// slash; the caller should redirect there.
    pub redirect_to: Option<String>,
}

impl<C, W> MappingData<C, W> {
    fn empty(path_parameters: Vec<(String, String)>) -> Self {
        Self {
            host: None,
            context: None,
            wrapper: None,
            path: MappedPath {
                path_parameters,
                ..Default::default()
            },
            redirect_to: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.wrapper.is_some()
    }
}

#[derive(Debug, Clone)]
struct MappedContext<C, W> {
    /// "" for the root context, otherwise "/name" without trailing slash.
    path: String,
    object: C,
    exact: HashMap<String, W>,
    extensions: HashMap<String, W>,
    /// Sorted by descending prefix length.
    prefixes: Vec<(String, W)>,
    default: Option<W>,
}

impl<C, W: Clone> MappedContext<C, W> {
    fn new(path: String, object: C) -> Self {
        Self {
            path,
            object,
            exact: HashMap::new(),
            extensions: HashMap::new(),
            prefixes: Vec::new(),
            default: None,
        }
    }

    fn matches(&self, path: &str) -> bool {
        self.path.is_empty() || segment_prefix(path, &self.path)
    }

    fn insert(&mut self, pattern: &Pattern, target: W) {
        match pattern {
            Pattern::Exact(p) => {
                self.exact.insert(p.clone(), target);
            }
            Pattern::Extension(ext) => {
                self.extensions.insert(ext.clone(), target);
            }
            Pattern::Prefix(p) => {
                self.prefixes.retain(|(existing, _)| existing != p);
                self.prefixes.push((p.clone(), target));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            Pattern::Default => self.default = Some(target),
        }
    }

    fn remove(&mut self, pattern: &Pattern) -> bool {
        match pattern {
            Pattern::Exact(p) => self.exact.remove(p).is_some(),
            Pattern::Extension(ext) => self.extensions.remove(ext).is_some(),
            Pattern::Prefix(p) => {
                let before = self.prefixes.len();
                self.prefixes.retain(|(existing, _)| existing != p);
                before != self.prefixes.len()
            }
            Pattern::Default => self.default.take().is_some(),
        }
    }

    /// Matches a context-relative path (starting with `/`).
    fn match_wrapper(&self, relative: &str) -> Option<(W, MatchKind, String, Option<String>)> {
        if let Some(target) = self.exact.get(relative) {
            return Some((target.clone(), MatchKind::Exact, relative.to_string(), None));
        }

        if !self.extensions.is_empty() {
            let last = relative.rsplit('/').next().unwrap_or(relative);
            // Longest extension first: "a.tar.gz" tries "tar.gz" before "gz".
            for (i, _) in last.match_indices('.') {
                if let Some(target) = self.extensions.get(&last[i + 1..]) {
                    return Some((
                        target.clone(),
                        MatchKind::Extension,
                        relative.to_string(),
                        None,
                    ));
                }
            }
        }

        for (prefix, target) in &self.prefixes {
            if prefix.is_empty() || segment_prefix(relative, prefix) {
                let info = &relative[prefix.len()..];
                let info = (!info.is_empty()).then(|| info.to_string());
                return Some((target.clone(), MatchKind::Prefix, prefix.clone(), info));
            }
        }

        self.default
            .as_ref()
            .map(|target| (target.clone(), MatchKind::Default, relative.to_string(), None))
    }

    /// Matches the bare context root (`/shop` without a trailing slash).
    /// Only a catch-all prefix pattern (`/*`) applies here.
    fn match_root(&self) -> Option<W> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| prefix.is_empty())
            .map(|(_, target)| target.clone())
    }
}

#[derive(Debug, Clone)]
struct MappedHost<C, W> {
    name: String,
    /// Sorted by descending path length, so the root context is last.
    contexts: Vec<MappedContext<C, W>>,
}

#[derive(Debug, Clone)]
struct Snapshot<C, W> {
    hosts: HashMap<String, MappedHost<C, W>>,
    /// alias -> host name
    aliases: HashMap<String, String>,
    default_host: Option<String>,
}

impl<C, W> Default for Snapshot<C, W> {
    fn default() -> Self {
        Self {
            hosts: HashMap::new(),
            aliases: HashMap::new(),
            default_host: None,
        }
    }
}

impl<C, W> Snapshot<C, W> {
    fn find_host(&self, name: Option<&str>) -> Option<&MappedHost<C, W>> {
        if let Some(name) = name {
            let name = name.to_ascii_lowercase();
            if let Some(host) = self.hosts.get(&name) {
                return Some(host);
            }
            if let Some(host) = self.aliases.get(&name).and_then(|h| self.hosts.get(h)) {
                return Some(host);
            }
            // A wildcard entry "*.example.com" covers any deeper name.
            let mut rest = name.as_str();
            while let Some(dot) = rest.find('.') {
                rest = &rest[dot + 1..];
                if let Some(host) = self.hosts.get(&format!("*.{}", rest)) {
                    return Some(host);
                }
            }
        }
        self.default_host.as_ref().and_then(|h| self.hosts.get(h))
    }

    fn host_mut(&mut self, name: &str) -> Result<&mut MappedHost<C, W>, CoreError> {
        let key = name.to_ascii_lowercase();
        let key = self.aliases.get(&key).cloned().unwrap_or(key);
        self.hosts.get_mut(&key).ok_or_else(|| CoreError::HostNotFound {
            host: name.to_string(),
        })
    }
}

enum Pattern {
    Exact(String),
    Extension(String),
    /// Prefix without the trailing "/*"; "" for "/*".
    Prefix(String),
    Default,
}

impl Pattern {
    fn parse(pattern: &str) -> Result<Self, CoreError> {
        if pattern == "/" {
            return Ok(Pattern::Default);
        }
        if let Some(ext) = pattern.strip_prefix("*.") {
            if ext.is_empty() || ext.contains('/') {
                return Err(CoreError::pattern(pattern, "malformed extension pattern"));
            }
            return Ok(Pattern::Extension(ext.to_string()));
        }
        if !pattern.starts_with('/') {
            return Err(CoreError::pattern(pattern, "must start with '/' or '*.'"));
        }
        if pattern == "/*" {
            return Ok(Pattern::Prefix(String::new()));
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            if prefix.contains('*') {
                return Err(CoreError::pattern(pattern, "wildcard only allowed at the end"));
            }
            return Ok(Pattern::Prefix(prefix.to_string()));
        }
        if pattern.contains('*') {
            return Err(CoreError::pattern(pattern, "wildcard only allowed at the end"));
        }
        Ok(Pattern::Exact(pattern.to_string()))
    }
}

/// Routing table from `(host, path)` to a context object `C` and a wrapper
/// target `W`.
#[derive(Debug)]
pub struct Mapper<C, W> {
    snapshot: RwLock<Arc<Snapshot<C, W>>>,
}

impl<C: Clone, W: Clone> Default for Mapper<C, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone, W: Clone> Mapper<C, W> {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    fn load(&self) -> Arc<Snapshot<C, W>> {
        Arc::clone(&self.snapshot.read())
    }

    /// Applies `f` to a copy of the current snapshot and publishes the copy
    /// if `f` succeeds.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Snapshot<C, W>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut guard = self.snapshot.write();
        let mut next = Snapshot::clone(&guard);
        let result = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(result)
    }

    pub fn set_default_host(&self, name: Option<&str>) {
        let name = name.map(str::to_ascii_lowercase);
        let _ = self.update(|s| {
            s.default_host = name;
            Ok(())
        });
    }

    pub fn default_host(&self) -> Option<String> {
        self.load().default_host.clone()
    }

    /// Registers a host. `name` may be a wildcard such as `*.example.com`.
    pub fn add_host(&self, name: &str) -> Result<(), CoreError> {
        let key = name.to_ascii_lowercase();
        if key.is_empty() || (key.contains('*') && !key.starts_with("*.")) {
            return Err(CoreError::pattern(name, "invalid host name"));
        }
        self.update(|s| {
            if s.hosts.contains_key(&key) || s.aliases.contains_key(&key) {
                return Err(CoreError::HostExists {
                    host: name.to_string(),
                });
            }
            s.hosts.insert(
                key.clone(),
                MappedHost {
                    name: key,
                    contexts: Vec::new(),
                },
            );
            Ok(())
        })
    }

    /// Removes a host, its aliases and all of its contexts.
    pub fn remove_host(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.update(|s| {
            let removed = s.hosts.remove(&key).is_some();
            s.aliases.retain(|_, host| *host != key);
            Ok(removed)
        })
        .unwrap_or(false)
    }

    pub fn add_host_alias(&self, host: &str, alias: &str) -> Result<(), CoreError> {
        let host_key = host.to_ascii_lowercase();
        let alias_key = alias.to_ascii_lowercase();
        self.update(|s| {
            if !s.hosts.contains_key(&host_key) {
                return Err(CoreError::HostNotFound {
                    host: host.to_string(),
                });
            }
            if s.hosts.contains_key(&alias_key) || s.aliases.contains_key(&alias_key) {
                return Err(CoreError::HostExists {
                    host: alias.to_string(),
                });
            }
            s.aliases.insert(alias_key, host_key);
            Ok(())
        })
    }

    pub fn remove_host_alias(&self, alias: &str) -> bool {
        let key = alias.to_ascii_lowercase();
        self.update(|s| Ok(s.aliases.remove(&key).is_some()))
            .unwrap_or(false)
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.load().hosts.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Registers a context under `host` at `path` (`/` or `""` for root).
    pub fn add_context(&self, host: &str, path: &str, object: C) -> Result<(), CoreError> {
        let path = normalize_context_path(path)?;
        self.update(|s| {
            let mapped = s.host_mut(host)?;
            if mapped.contexts.iter().any(|c| c.path == path) {
                return Err(CoreError::ContextExists {
                    host: host.to_string(),
                    path: display_path(&path).to_string(),
                });
            }
            mapped.contexts.push(MappedContext::new(path, object));
            mapped
                .contexts
                .sort_by(|a, b| b.path.len().cmp(&a.path.len()));
            Ok(())
        })
    }

    /// Removes a context and all of its wrappers.
    pub fn remove_context(&self, host: &str, path: &str) -> bool {
        let Ok(path) = normalize_context_path(path) else {
            return false;
        };
        self.update(|s| {
            let mapped = s.host_mut(host)?;
            let before = mapped.contexts.len();
            mapped.contexts.retain(|c| c.path != path);
            Ok(before != mapped.contexts.len())
        })
        .unwrap_or(false)
    }

    /// Registers `target` for `pattern` inside a context, replacing any
    /// target already registered for the same pattern.
    pub fn add_wrapper(
        &self,
        host: &str,
        context_path: &str,
        pattern: &str,
        target: W,
    ) -> Result<(), CoreError> {
        let path = normalize_context_path(context_path)?;
        let pattern = Pattern::parse(pattern)?;
        self.update(|s| {
            let context = context_mut(s, host, &path)?;
            context.insert(&pattern, target);
            Ok(())
        })
    }

    pub fn remove_wrapper(&self, host: &str, context_path: &str, pattern: &str) -> bool {
        let (Ok(path), Ok(pattern)) = (normalize_context_path(context_path), Pattern::parse(pattern))
        else {
            return false;
        };
        self.update(|s| {
            let context = context_mut(s, host, &path)?;
            Ok(context.remove(&pattern))
        })
        .unwrap_or(false)
    }

    /// Resolves a request. `path` is the request path without query string.
    pub fn resolve(&self, host: Option<&str>, path: &str) -> MappingData<C, W> {
        let (clean, parameters) = strip_path_parameters(path);
        let snapshot = self.load();

        let mut data = MappingData::empty(parameters);
        let Some(mapped_host) = snapshot.find_host(host) else {
            return data;
        };
        data.host = Some(mapped_host.name.clone());

        let Some(context) = mapped_host.contexts.iter().find(|c| c.matches(&clean)) else {
            return data;
        };
        data.context = Some(context.object.clone());
        data.path.context_path = context.path.clone();

        let relative = &clean[context.path.len()..];
        if relative.is_empty() {
            match context.match_root() {
                Some(target) => {
                    data.wrapper = Some(target);
                    data.path.match_kind = Some(MatchKind::Prefix);
                }
                None => data.redirect_to = Some(format!("{}/", context.path)),
            }
            return data;
        }

        if let Some((target, kind, wrapper_path, info)) = context.match_wrapper(relative) {
            data.wrapper = Some(target);
            data.path.match_kind = Some(kind);
            data.path.wrapper_path = wrapper_path;
            data.path.path_info = info;
        }
        data
    }
}

fn context_mut<'a, C, W>(
    s: &'a mut Snapshot<C, W>,
    host: &str,
    path: &str,
) -> Result<&'a mut MappedContext<C, W>, CoreError> {
    let mapped = s.host_mut(host)?;
    mapped
        .contexts
        .iter_mut()
        .find(|c| c.path == path)
        .ok_or_else(|| CoreError::ContextNotFound {
            host: host.to_string(),
            path: display_path(path).to_string(),
        })
}

fn normalize_context_path(path: &str) -> Result<String, CoreError> {
    if path.is_empty() || path == "/" {
        return Ok(String::new());
    }
    if !path.starts_with('/') {
        return Err(CoreError::pattern(path, "context path must start with '/'"));
    }
    if path.contains(['*', ';', '?']) {
        return Err(CoreError::pattern(path, "context path may not contain '*', ';' or '?'"));
    }
    Ok(path.trim_end_matches('/').to_string())
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Whether `prefix` matches `path` up to a segment boundary.
fn segment_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Removes `;name=value` parameters from every segment.
fn strip_path_parameters(path: &str) -> (String, Vec<(String, String)>) {
    if !path.contains(';') {
        return (path.to_string(), Vec::new());
    }
    let mut clean = String::with_capacity(path.len());
    let mut parameters = Vec::new();
    for (i, segment) in path.split('/').enumerate() {
        if i > 0 {
            clean.push('/');
        }
        let mut parts = segment.split(';');
        clean.push_str(parts.next().unwrap_or_default());
        for param in parts.filter(|p| !p.is_empty()) {
            let (name, value) = param.split_once('=').unwrap_or((param, ""));
            parameters.push((name.to_string(), value.to_string()));
        }
    }
    (clean, parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type TestMapper = Mapper<&'static str, &'static str>;

    fn mapper() -> TestMapper {
        let m = TestMapper::new();
        m.add_host("localhost").unwrap();
        m.set_default_host(Some("localhost"));
        m.add_context("localhost", "/", "root").unwrap();
        m.add_context("localhost", "/shop", "shop").unwrap();
        m.add_wrapper("localhost", "/", "/", "root-default").unwrap();
        m.add_wrapper("localhost", "/shop", "/", "shop-default").unwrap();
        m
    }

    #[test]
    fn test_longest_context_wins() {
        let m = mapper();
        let data = m.resolve(Some("localhost"), "/shop/cart");
        assert_eq!(data.context, Some("shop"));
        assert_eq!(data.path.context_path, "/shop");
        assert_eq!(data.wrapper, Some("shop-default"));

        let data = m.resolve(Some("localhost"), "/other");
        assert_eq!(data.context, Some("root"));
        assert_eq!(data.path.context_path, "");
    }

    #[test]
    fn test_context_boundary_is_a_segment() {
        let m = mapper();
        let data = m.resolve(Some("localhost"), "/shopping");
        assert_eq!(data.context, Some("root"));
    }

    #[test]
    fn test_wrapper_precedence() {
        let m = mapper();
        m.add_wrapper("localhost", "/shop", "/cart/view", "exact").unwrap();
        m.add_wrapper("localhost", "/shop", "*.jsp", "jsp").unwrap();
        m.add_wrapper("localhost", "/shop", "/cart/*", "cart").unwrap();
        m.add_wrapper("localhost", "/shop", "/cart/items/*", "items").unwrap();

        let data = m.resolve(None, "/shop/cart/view");
        assert_eq!(data.wrapper, Some("exact"));
        assert_eq!(data.path.match_kind, Some(MatchKind::Exact));

        // Extension beats prefix.
        let data = m.resolve(None, "/shop/cart/page.jsp");
        assert_eq!(data.wrapper, Some("jsp"));
        assert_eq!(data.path.match_kind, Some(MatchKind::Extension));

        let data = m.resolve(None, "/shop/cart/items/42");
        assert_eq!(data.wrapper, Some("items"));
        assert_eq!(data.path.wrapper_path, "/cart/items");
        assert_eq!(data.path.path_info.as_deref(), Some("/42"));

        let data = m.resolve(None, "/shop/cart");
        assert_eq!(data.wrapper, Some("cart"));
        assert_eq!(data.path.path_info, None);

        let data = m.resolve(None, "/shop/checkout");
        assert_eq!(data.wrapper, Some("shop-default"));
        assert_eq!(data.path.match_kind, Some(MatchKind::Default));
        assert_eq!(data.path.relative_path(), "/checkout");
    }

    #[test]
    fn test_longest_extension() {
        let m = mapper();
        m.add_wrapper("localhost", "/", "*.gz", "gz").unwrap();
        m.add_wrapper("localhost", "/", "*.tar.gz", "tarball").unwrap();
        assert_eq!(m.resolve(None, "/dl/a.tar.gz").wrapper, Some("tarball"));
        assert_eq!(m.resolve(None, "/dl/a.gz").wrapper, Some("gz"));
        assert_eq!(m.resolve(None, "/dl.gz/a").wrapper, Some("root-default"));
    }

    #[test]
    fn test_host_resolution_order() {
        let m = mapper();
        m.add_host("example.com").unwrap();
        m.add_host("*.apps.example.com").unwrap();
        m.add_host_alias("example.com", "www.example.com").unwrap();
        m.add_context("example.com", "/", "example").unwrap();
        m.add_context("*.apps.example.com", "/", "apps").unwrap();
        m.add_wrapper("example.com", "/", "/", "ex").unwrap();
        m.add_wrapper("*.apps.example.com", "/", "/", "app").unwrap();

        assert_eq!(m.resolve(Some("EXAMPLE.com"), "/").context, Some("example"));
        assert_eq!(m.resolve(Some("www.example.com"), "/").context, Some("example"));
        assert_eq!(m.resolve(Some("a.b.apps.example.com"), "/").context, Some("apps"));
        assert_eq!(m.resolve(Some("unknown.org"), "/").context, Some("root"));
        assert_eq!(m.resolve(None, "/x").host.as_deref(), Some("localhost"));

        m.set_default_host(None);
        let data = m.resolve(Some("unknown.org"), "/");
        assert!(!data.is_found());
        assert!(data.context.is_none());
    }

    #[test]
    fn test_context_root_redirect_hint() {
        let m = mapper();
        let data = m.resolve(None, "/shop");
        assert!(!data.is_found());
        assert_eq!(data.redirect_to.as_deref(), Some("/shop/"));

        m.add_wrapper("localhost", "/shop", "/*", "all").unwrap();
        let data = m.resolve(None, "/shop");
        assert_eq!(data.wrapper, Some("all"));
        assert!(data.redirect_to.is_none());
    }

    #[test]
    fn test_not_found_without_default() {
        let m = TestMapper::new();
        m.add_host("h").unwrap();
        m.add_context("h", "/api", "api").unwrap();
        m.add_wrapper("h", "/api", "/v1/*", "v1").unwrap();
        let data = m.resolve(Some("h"), "/api/v2/x");
        assert_eq!(data.context, Some("api"));
        assert!(data.wrapper.is_none());
        assert!(!data.is_found());

        let data = m.resolve(Some("h"), "/elsewhere");
        assert!(data.context.is_none());
    }

    #[test]
    fn test_path_parameters_stripped() {
        let m = mapper();
        m.add_wrapper("localhost", "/shop", "/cart/*", "cart").unwrap();
        let data = m.resolve(None, "/shop;sessionid=abc/cart;v=2/items");
        assert_eq!(data.wrapper, Some("cart"));
        assert_eq!(data.path.path_info.as_deref(), Some("/items"));
        assert_eq!(data.path.path_parameter("SessionId"), Some("abc"));
        assert_eq!(data.path.path_parameter("v"), Some("2"));
    }

    #[test]
    fn test_remove_leaves_no_stale_entries() {
        let m = mapper();
        m.add_wrapper("localhost", "/shop", "/cart/*", "cart").unwrap();
        assert!(m.remove_wrapper("localhost", "/shop", "/cart/*"));
        assert!(!m.remove_wrapper("localhost", "/shop", "/cart/*"));
        assert_eq!(m.resolve(None, "/shop/cart").wrapper, Some("shop-default"));

        assert!(m.remove_context("localhost", "/shop"));
        assert_eq!(m.resolve(None, "/shop/cart").context, Some("root"));

        m.add_host_alias("localhost", "alias").unwrap();
        assert!(m.remove_host("localhost"));
        assert!(m.resolve(Some("alias"), "/").context.is_none());
        assert!(m.hosts().is_empty());
    }

    #[test]
    fn test_registration_errors() {
        let m = mapper();
        assert!(matches!(m.add_host("LOCALHOST"), Err(CoreError::HostExists { .. })));
        assert!(matches!(
            m.add_context("nowhere", "/x", "x"),
            Err(CoreError::HostNotFound { .. })
        ));
        assert!(matches!(
            m.add_context("localhost", "/shop/", "again"),
            Err(CoreError::ContextExists { .. })
        ));
        assert!(matches!(
            m.add_wrapper("localhost", "/missing", "/", "x"),
            Err(CoreError::ContextNotFound { .. })
        ));
        assert!(m.add_wrapper("localhost", "/", "/a/*/b", "x").is_err());
        assert!(m.add_wrapper("localhost", "/", "noslash", "x").is_err());
        assert!(m.add_context("localhost", "relative", "x").is_err());
    }

    #[test]
    fn test_reader_keeps_old_snapshot() {
        let m = mapper();
        let before = m.load();
        m.add_context("localhost", "/new", "new").unwrap();
        let host = before.hosts.get("localhost").unwrap();
        assert_eq!(host.contexts.len(), 2);
        assert_eq!(m.resolve(None, "/new/x").context, Some("new"));
    }

    proptest! {
        #[test]
        fn test_deepest_registered_context_selected(depth in 1usize..6, extra in 0usize..4) {
            let m = TestMapper::new();
            m.add_host("h").unwrap();
            m.add_context("h", "/", "root").unwrap();
            let segments: Vec<String> = (0..depth).map(|i| format!("s{}", i)).collect();
            let mut path = String::new();
            let mut names = Vec::new();
            for segment in &segments {
                path.push('/');
                path.push_str(segment);
                names.push(path.clone());
            }
            for name in &names {
                let leaked: &'static str = Box::leak(name.clone().into_boxed_str());
                m.add_context("h", name, leaked).unwrap();
            }
            let mut request = path.clone();
            for i in 0..extra {
                request.push_str(&format!("/x{}", i));
            }
            let data = m.resolve(Some("h"), &request);
            prop_assert_eq!(data.path.context_path, path);
        }
    }
}
