//! Core multi-tenant types for DogRS.
//!
//! A tenant is an organization plus the user acting inside it. Both ids are
//! opaque strings: DogRS never interprets their format, it only refuses
//! empty values where an operation needs a complete identity.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifier of the acting user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UserId(pub String);

/// Identifier of the organization the user acts for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrganizationId(pub String);

macro_rules! opaque_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new<S: Into<String>>(id: S) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $ty {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $ty {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

opaque_id!(UserId);
opaque_id!(OrganizationId);

/// Which part of a [`TenantIdentity`] is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingIdentity {
    User,
    Organization,
}

impl MissingIdentity {
    pub fn field(&self) -> &'static str {
        match self {
            MissingIdentity::User => "user_id",
            MissingIdentity::Organization => "organization_id",
        }
    }
}

/// The identity a unit of database work runs as.
///
/// Immutable once built; pass it by reference into tenant-scoped operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TenantIdentity {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
}

impl TenantIdentity {
    pub fn new(user_id: impl Into<UserId>, organization_id: impl Into<OrganizationId>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
        }
    }

    /// Returns the first empty field, if any. Format is not checked.
    pub fn missing(&self) -> Option<MissingIdentity> {
        if self.user_id.is_empty() {
            Some(MissingIdentity::User)
        } else if self.organization_id.is_empty() {
            Some(MissingIdentity::Organization)
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_none()
    }
}

impl fmt::Display for TenantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user={} org={}", self.user_id, self.organization_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_identity_has_nothing_missing() {
        let id = TenantIdentity::new("u1", "o1");
        assert!(id.is_complete());
        assert_eq!(id.missing(), None);
        assert_eq!(id.to_string(), "user=u1 org=o1");
    }

    #[test]
    fn empty_fields_are_reported_user_first() {
        assert_eq!(
            TenantIdentity::new("", "").missing(),
            Some(MissingIdentity::User)
        );
        let id = TenantIdentity::new("u1", "");
        assert_eq!(id.missing(), Some(MissingIdentity::Organization));
        assert_eq!(id.missing().unwrap().field(), "organization_id");
    }

    #[test]
    fn whitespace_is_not_validated() {
        // format belongs to the caller; only emptiness is rejected
        assert!(TenantIdentity::new(" ", "o'; DROP TABLE x; --").is_complete());
    }
}
