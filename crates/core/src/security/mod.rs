//! Principal model and tenant / field-access query scoping.

mod principal;
mod scope_builder;

pub use principal::{Principal, PrincipalProvider, Role, StaticPrincipalProvider};
pub use scope_builder::{ScopedPredicates, SecurityScopeBuilder, TENANT_FIELD};
