//! Core domain types for the scan engine.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Tracking code classification
//! - Scan sessions and the batch consistency guard
//! - Supervisor authorization gate (typestate machine)
//! - Package typestate machine and transition policy
//! - Scan events and daily statistics

pub mod authorization;
pub mod package;
pub mod scan;
pub mod session;
pub mod stats;
pub mod tracking;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub ::uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(::uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Display only first 8 characters for readability in logs
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }

        impl From<::uuid::Uuid> for $name {
            fn from(uuid: ::uuid::Uuid) -> Self {
                $name(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = ::uuid::Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                $name(id)
            }
        }
    };
}

pub(crate) use uuid_id;

uuid_id!(
    /// Unique identifier for a shipment record.
    PackageId
);
uuid_id!(
    /// Unique identifier for an appended scan event.
    ScanEventId
);
uuid_id!(
    /// Unique identifier for a supervisor grant.
    AuthorizationId
);

numeric_id!(
    /// Branch (sucursal) identifier from the branch directory.
    BranchId
);
numeric_id!(
    /// Warehouse operator identifier from the branch directory.
    OperatorId
);
numeric_id!(
    /// Supervisor identifier from the branch roster.
    SupervisorId
);
numeric_id!(
    /// Client that owns a pre-registered shipment.
    ClientId
);

#[cfg(test)]
mod tests {
    use super::session::SessionId;
    use super::*;

    #[test]
    fn test_ids_declared_outside_this_module_serialize_as_uuid() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
        assert_eq!(serde_json::from_str::<SessionId>(&json).unwrap(), id);
        assert_eq!(id.to_string().len(), 8);
    }

    #[test]
    fn test_numeric_ids_are_transparent() {
        assert_eq!(serde_json::to_string(&BranchId(7)).unwrap(), "7");
        assert_eq!(PackageId::from(uuid::Uuid::nil()).0, uuid::Uuid::nil());
    }
}
