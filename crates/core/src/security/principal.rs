use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Role carried by the authenticated principal.
///
/// Parsed once from the identity provider's role string so that the
/// admin-class capability is answered in a single place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    SuperAdmin,
    Admin,
    Manager,
    Operator,
    Viewer,
    Other(String),
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect();
        match normalized.as_str() {
            "superadmin" => Self::SuperAdmin,
            "admin" => Self::Admin,
            "manager" => Self::Manager,
            "operator" => Self::Operator,
            "viewer" => Self::Viewer,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    /// Admin-class roles see every document of their tenant.
    pub fn has_full_tenant_access(&self) -> bool {
        matches!(self, Self::SuperAdmin | Self::Admin)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::SuperAdmin => "super-admin",
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The actor on whose behalf every query runs. Immutable per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub tenant_id: String,
    pub role: Role,
    #[serde(default)]
    pub accessible_field_ids: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, S>(tenant_id: impl Into<String>, role: Role, accessible_field_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenant_id: tenant_id.into(),
            role,
            accessible_field_ids: accessible_field_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.role.has_full_tenant_access()
    }

    pub fn can_access_field(&self, field_id: &str) -> bool {
        self.is_unrestricted() || self.accessible_field_ids.contains(field_id)
    }

    /// Narrows `field_ids` to what this principal may see.
    pub fn restrict_fields(&self, field_ids: &BTreeSet<String>) -> BTreeSet<String> {
        if self.is_unrestricted() {
            return field_ids.clone();
        }
        field_ids
            .intersection(&self.accessible_field_ids)
            .cloned()
            .collect()
    }
}

/// Supplies the current session's principal, if anyone is signed in.
pub trait PrincipalProvider: Send + Sync {
    fn current_principal(&self) -> Option<Principal>;
}

/// Provider backed by a fixed value; hosts swap it on sign-in / sign-out.
#[derive(Debug, Default)]
pub struct StaticPrincipalProvider {
    principal: std::sync::RwLock<Option<Principal>>,
}

impl StaticPrincipalProvider {
    pub fn new(principal: Option<Principal>) -> Self {
        Self {
            principal: std::sync::RwLock::new(principal),
        }
    }

    pub fn set(&self, principal: Option<Principal>) {
        if let Ok(mut guard) = self.principal.write() {
            *guard = principal;
        }
    }
}

impl PrincipalProvider for StaticPrincipalProvider {
    fn current_principal(&self) -> Option<Principal> {
        self.principal.read().ok().and_then(|guard| guard.clone())
    }
}
