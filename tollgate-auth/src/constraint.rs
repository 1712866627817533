//! Security constraints.
//!
//! A constraint binds URL patterns (and optionally methods) to required
//! roles and a transport guarantee. For a request path the best matching
//! pattern is chosen by kind: exact first, then longest path prefix
//! (`/admin/*`), then extension (`*.pdf`), then the default pattern `/`.
//! Every constraint that names that same best pattern and applies to the
//! method is merged into one [`ResolvedConstraint`].

use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use tollgate_protocol::Method;

/// Role name meaning "any authenticated user".
pub const ANY_ROLE: &str = "*";

/// Required transport protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportGuarantee {
    #[default]
    None,
    Confidential,
}

/// A declarative access rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConstraint {
    pub patterns: Vec<String>,
    /// Methods the constraint applies to; empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// When false the constraint only enforces its transport guarantee.
    #[serde(default = "default_authenticate")]
    pub authenticate: bool,
    #[serde(default)]
    pub transport: TransportGuarantee,
}

fn default_authenticate() -> bool {
    true
}

impl SecurityConstraint {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            methods: Vec::new(),
            roles: Vec::new(),
            authenticate: true,
            transport: TransportGuarantee::None,
        }
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = methods.iter().map(|m| m.as_str().to_string()).collect();
        self
    }

    pub fn transport(mut self, transport: TransportGuarantee) -> Self {
        self.transport = transport;
        self
    }

    /// Makes the constraint enforce transport only.
    pub fn without_authentication(mut self) -> Self {
        self.authenticate = false;
        self
    }

    fn applies_to(&self, method: Method) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    fn validate(&self) -> Result<(), AuthError> {
        if self.patterns.is_empty() {
            return Err(AuthError::InvalidConstraint(
                "constraint has no URL patterns".into(),
            ));
        }
        for pattern in &self.patterns {
            if classify(pattern).is_none() {
                return Err(AuthError::InvalidConstraint(format!(
                    "invalid URL pattern: {:?}",
                    pattern
                )));
            }
        }
        for method in &self.methods {
            if Method::from_token(&method.to_ascii_uppercase()).is_none() {
                return Err(AuthError::InvalidConstraint(format!(
                    "unknown method: {:?}",
                    method
                )));
            }
        }
        Ok(())
    }
}

/// The merged requirements for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConstraint {
    /// Pattern that selected the constraints.
    pub pattern: String,
    /// Union of required roles, sorted. Empty when any authenticated user
    /// is allowed.
    pub roles: Vec<String>,
    pub authenticate: bool,
    pub transport: TransportGuarantee,
}

impl ResolvedConstraint {
    pub fn requires_roles(&self) -> bool {
        !self.roles.is_empty()
    }
}

/// Pattern kinds ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Default,
    Extension,
    Prefix,
    Exact,
}

fn classify(pattern: &str) -> Option<Kind> {
    if pattern == "/" {
        Some(Kind::Default)
    } else if pattern.starts_with("*.") && pattern.len() > 2 && !pattern[2..].contains('/') {
        Some(Kind::Extension)
    } else if pattern == "/*" || (pattern.starts_with('/') && pattern.ends_with("/*")) {
        Some(Kind::Prefix)
    } else if pattern.starts_with('/') && !pattern.contains('*') {
        Some(Kind::Exact)
    } else {
        None
    }
}

/// Ranks how well `pattern` matches `path`; higher is better.
fn rank(pattern: &str, path: &str) -> Option<(Kind, usize)> {
    match classify(pattern)? {
        Kind::Exact => (pattern == path).then_some((Kind::Exact, pattern.len())),
        Kind::Prefix => {
            let prefix = &pattern[..pattern.len() - 2];
            let matches = path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
            matches.then_some((Kind::Prefix, prefix.len()))
        }
        Kind::Extension => {
            let last = path.rsplit('/').next().unwrap_or(path);
            let ext = &pattern[2..];
            last.strip_suffix(ext)
                .is_some_and(|stem| stem.ends_with('.'))
                .then_some((Kind::Extension, ext.len()))
        }
        Kind::Default => Some((Kind::Default, 0)),
    }
}

/// The constraints of one context.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    constraints: Vec<SecurityConstraint>,
}

impl ConstraintSet {
    pub fn new(constraints: Vec<SecurityConstraint>) -> Result<Self, AuthError> {
        for constraint in &constraints {
            constraint.validate()?;
        }
        Ok(Self { constraints })
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Finds and merges the constraints governing `path` for `method`.
    pub fn find(&self, path: &str, method: Method) -> Option<ResolvedConstraint> {
        let mut best: Option<((Kind, usize), &str)> = None;
        for constraint in self.constraints.iter().filter(|c| c.applies_to(method)) {
            for pattern in &constraint.patterns {
                if let Some(score) = rank(pattern, path) {
                    if best.map_or(true, |(s, _)| score > s) {
                        best = Some((score, pattern.as_str()));
                    }
                }
            }
        }
        let (_, pattern) = best?;

        let mut resolved = ResolvedConstraint {
            pattern: pattern.to_string(),
            roles: Vec::new(),
            authenticate: false,
            transport: TransportGuarantee::None,
        };
        let mut any_role = false;
        for constraint in self
            .constraints
            .iter()
            .filter(|c| c.applies_to(method) && c.patterns.iter().any(|p| p == pattern))
        {
            resolved.transport = resolved.transport.max(constraint.transport);
            if constraint.authenticate {
                resolved.authenticate = true;
                if constraint.roles.is_empty() || constraint.roles.iter().any(|r| r == ANY_ROLE) {
                    any_role = true;
                }
                resolved.roles.extend(constraint.roles.iter().cloned());
            }
        }
        if any_role {
            resolved.roles.clear();
        } else {
            resolved.roles.sort();
            resolved.roles.dedup();
        }
        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(constraints: Vec<SecurityConstraint>) -> ConstraintSet {
        ConstraintSet::new(constraints).unwrap()
    }

    #[test]
    fn test_no_match() {
        let constraints = set(vec![SecurityConstraint::new(["/admin/*"]).roles(["admin"])]);
        assert!(constraints.find("/public", Method::Get).is_none());
        assert!(constraints.find("/administrator", Method::Get).is_none());
    }

    #[test]
    fn test_precedence() {
        let constraints = set(vec![
            SecurityConstraint::new(["/"]).roles(["user"]),
            SecurityConstraint::new(["*.pdf"]).roles(["reader"]),
            SecurityConstraint::new(["/docs/*"]).roles(["staff"]),
            SecurityConstraint::new(["/docs/public.pdf"]).without_authentication(),
        ]);
        assert_eq!(constraints.find("/x", Method::Get).unwrap().roles, vec!["user"]);
        assert_eq!(constraints.find("/a.pdf", Method::Get).unwrap().roles, vec!["reader"]);
        // Prefix beats extension.
        assert_eq!(constraints.find("/docs/a.pdf", Method::Get).unwrap().roles, vec!["staff"]);
        let exact = constraints.find("/docs/public.pdf", Method::Get).unwrap();
        assert!(!exact.authenticate);
    }

    #[test]
    fn test_longest_prefix() {
        let constraints = set(vec![
            SecurityConstraint::new(["/admin/*"]).roles(["admin"]),
            SecurityConstraint::new(["/admin/reports/*"]).roles(["auditor"]),
        ]);
        let resolved = constraints.find("/admin/reports/q1", Method::Get).unwrap();
        assert_eq!(resolved.pattern, "/admin/reports/*");
        assert_eq!(resolved.roles, vec!["auditor"]);
        assert_eq!(constraints.find("/admin", Method::Get).unwrap().pattern, "/admin/*");
    }

    #[test]
    fn test_merge_same_pattern() {
        let constraints = set(vec![
            SecurityConstraint::new(["/admin/*"]).roles(["admin"]),
            SecurityConstraint::new(["/admin/*"])
                .roles(["ops", "admin"])
                .transport(TransportGuarantee::Confidential),
            SecurityConstraint::new(["/admin/*"])
                .methods(&[Method::Delete])
                .roles(["root"]),
        ]);
        let get = constraints.find("/admin/x", Method::Get).unwrap();
        assert_eq!(get.roles, vec!["admin", "ops"]);
        assert_eq!(get.transport, TransportGuarantee::Confidential);

        let delete = constraints.find("/admin/x", Method::Delete).unwrap();
        assert_eq!(delete.roles, vec!["admin", "ops", "root"]);
    }

    #[test]
    fn test_method_scoped_constraint() {
        let constraints = set(vec![SecurityConstraint::new(["/api/*"])
            .methods(&[Method::Post, Method::Put])
            .roles(["writer"])]);
        assert!(constraints.find("/api/items", Method::Get).is_none());
        assert!(constraints.find("/api/items", Method::Post).is_some());
    }

    #[test]
    fn test_any_authenticated_role() {
        let constraints = set(vec![
            SecurityConstraint::new(["/members/*"]).roles(["*"]),
            SecurityConstraint::new(["/members/*"]).roles(["gold"]),
        ]);
        let resolved = constraints.find("/members/home", Method::Get).unwrap();
        assert!(resolved.authenticate);
        assert!(!resolved.requires_roles());
    }

    #[test]
    fn test_transport_only() {
        let constraints =
            set(vec![SecurityConstraint::new(["/checkout/*"])
                .without_authentication()
                .transport(TransportGuarantee::Confidential)]);
        let resolved = constraints.find("/checkout/pay", Method::Post).unwrap();
        assert!(!resolved.authenticate);
        assert_eq!(resolved.transport, TransportGuarantee::Confidential);
    }

    #[test]
    fn test_invalid_constraints() {
        assert!(ConstraintSet::new(vec![SecurityConstraint::new(Vec::<String>::new())]).is_err());
        assert!(ConstraintSet::new(vec![SecurityConstraint::new(["admin"])]).is_err());
        assert!(ConstraintSet::new(vec![SecurityConstraint::new(["/a/*/b"])]).is_err());
        let mut bad_method = SecurityConstraint::new(["/"]);
        bad_method.methods = vec!["BREW".into()];
        assert!(ConstraintSet::new(vec![bad_method]).is_err());
    }
}
