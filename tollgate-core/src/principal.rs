//! Authenticated identities.

use serde_json::Value;
use std::collections::BTreeMap;

/// An authenticated identity and its roles.
///
/// Roles are kept sorted and deduplicated. A principal is immutable once
/// built; the `with_*` methods consume and return it during construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    name: String,
    roles: Vec<String>,
    auth_method: Option<String>,
    credential: Option<String>,
    attributes: BTreeMap<String, Value>,
}

impl Principal {
    pub fn new<I, S>(name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut roles: Vec<String> = roles.into_iter().map(Into::into).collect();
        roles.sort();
        roles.dedup();
        Self {
            name: name.into(),
            roles,
            auth_method: None,
            credential: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Records the login method that produced this principal.
    pub fn with_auth_method(mut self, method: impl Into<String>) -> Self {
        self.auth_method = Some(method.into());
        self
    }

    /// Attaches a delegated credential handle (for example a bearer token id).
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sorted, deduplicated role names.
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn auth_method(&self) -> Option<&str> {
        self.auth_method.as_deref()
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles
            .binary_search_by(|r| r.as_str().cmp(role))
            .is_ok()
    }

    /// Returns whether the principal holds at least one of `roles`.
    /// An empty `roles` slice yields `false`.
    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|r| self.has_role(r.as_ref()))
    }
}
