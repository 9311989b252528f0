use super::Principal;
use crate::store::{CollectionPath, Predicate, Query};

/// Document field every tenant-scoped collection carries.
pub const TENANT_FIELD: &str = "tenantId";

/// Outcome of composing security predicates for one query.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopedPredicates {
    /// Run the query with these predicates (tenant equality first).
    Query(Vec<Predicate>),
    /// The principal can see no rows; skip the query and treat it as empty.
    NoAccess,
}

impl ScopedPredicates {
    pub fn into_query(self, collection: CollectionPath) -> Option<Query> {
        match self {
            Self::Query(predicates) => Some(Query::new(collection, predicates)),
            Self::NoAccess => None,
        }
    }

    pub fn is_no_access(&self) -> bool {
        matches!(self, Self::NoAccess)
    }
}

/// Composes mandatory tenant isolation with optional field-access
/// restriction. Rebuilt per query; never cached across principals.
///
/// Does not chunk: when the accessible set can exceed the backend's
/// inclusion ceiling the caller splits the query itself.
#[derive(Debug, Clone)]
pub struct SecurityScopeBuilder<'a> {
    principal: &'a Principal,
    field_access: Option<String>,
}

impl<'a> SecurityScopeBuilder<'a> {
    pub fn for_principal(principal: &'a Principal) -> Self {
        Self {
            principal,
            field_access: None,
        }
    }

    /// Restricts rows by `field_path` for roles without full tenant access.
    pub fn with_field_access(mut self, field_path: impl Into<String>) -> Self {
        self.field_access = Some(field_path.into());
        self
    }

    pub fn tenant_predicate(&self) -> Predicate {
        Predicate::eq(TENANT_FIELD, self.principal.tenant_id.as_str())
    }

    /// Tenant-wide query; field access is not applied.
    pub fn tenant_query(&self, collection: CollectionPath) -> Query {
        Query::new(collection, vec![self.tenant_predicate()])
    }

    pub fn build(&self) -> ScopedPredicates {
        let mut predicates = vec![self.tenant_predicate()];

        let Some(field_path) = self.field_access.as_deref() else {
            return ScopedPredicates::Query(predicates);
        };
        if self.principal.is_unrestricted() {
            return ScopedPredicates::Query(predicates);
        }
        if self.principal.accessible_field_ids.is_empty() {
            return ScopedPredicates::NoAccess;
        }

        predicates.push(Predicate::in_values(
            field_path,
            self.principal.accessible_field_ids.iter().cloned(),
        ));
        ScopedPredicates::Query(predicates)
    }

    /// Convenience for the common case of a scoped query on one collection.
    pub fn query(&self, collection: CollectionPath) -> Option<Query> {
        self.build().into_query(collection)
    }
}
