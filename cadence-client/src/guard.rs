//! Role guard contract consulted before prefetching.
//!
//! Authorization belongs to the caller. The cache layer only asks the guard
//! and refuses to issue requests it rejects.

use cadence_core::QueryKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::operations::OperationCatalog;

/// Portal a request is made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Listener,
    Artist,
    Moderator,
    Admin,
}

impl Role {
    pub const ALL: &'static [Role] = &[Role::Listener, Role::Artist, Role::Moderator, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Listener => "listener",
            Role::Artist => "artist",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "listener" => Ok(Role::Listener),
            "artist" => Ok(Role::Artist),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Decides whether `role` may request `key`.
pub trait RoleGuard: Send + Sync {
    fn permits(&self, role: Role, key: &QueryKey) -> bool;
}

/// Guard backed by the roles listed in the operation catalogue.
///
/// Unknown operations are refused.
#[derive(Debug, Clone)]
pub struct CatalogGuard {
    catalog: Arc<OperationCatalog>,
}

impl CatalogGuard {
    pub fn new(catalog: Arc<OperationCatalog>) -> Self {
        Self { catalog }
    }
}

impl RoleGuard for CatalogGuard {
    fn permits(&self, role: Role, key: &QueryKey) -> bool {
        self.catalog
            .query(key.entity())
            .is_some_and(|operation| operation.roles.contains(&role))
    }
}

/// Guard that permits everything, for trusted server-side jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RoleGuard for AllowAll {
    fn permits(&self, _role: Role, _key: &QueryKey) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_roundtrip() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), *role);
        }
        assert!("curator".parse::<Role>().is_err());
    }

    #[test]
    fn test_catalog_guard_uses_operation_roles() {
        let guard = CatalogGuard::new(Arc::new(OperationCatalog::platform()));
        let payouts = QueryKey::new("adminPayouts").unwrap();
        assert!(guard.permits(Role::Admin, &payouts));
        assert!(!guard.permits(Role::Listener, &payouts));

        let track = QueryKey::new("track").unwrap().arg("42");
        assert!(guard.permits(Role::Listener, &track));
        assert!(!guard.permits(Role::Admin, &QueryKey::new("unknownThing").unwrap()));
    }
}
