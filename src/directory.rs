//! Branch directory: which operator works where, and who can authorize.
//!
//! The engine only ever asks two questions of the directory, so it is abstracted
//! behind [`BranchDirectory`]. [`StaticDirectory`] answers them from the
//! `[directory]` section of the service configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::domain::{BranchId, OperatorId, SupervisorId};
use crate::error::{Result, ScanError};

/// Read-only view of branches, operators and supervisor rosters.
#[async_trait]
pub trait BranchDirectory: Send + Sync {
    /// Branch the operator is assigned to, or `None` for an unknown operator.
    async fn branch_of(&self, operator_id: OperatorId) -> Result<Option<BranchId>>;

    /// Match a PIN against the elevated staff of `branch_id`.
    ///
    /// Returns the supervisor the PIN belongs to. Staff of other branches never
    /// match.
    async fn verify_supervisor_pin(
        &self,
        branch_id: BranchId,
        pin: &str,
    ) -> Result<Option<SupervisorId>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Operator,
    Supervisor,
    Manager,
}

impl StaffRole {
    /// Roles allowed to open the authorization gate.
    pub fn is_elevated(self) -> bool {
        matches!(self, StaffRole::Supervisor | StaffRole::Manager)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorEntry {
    pub id: OperatorId,
    pub branch_id: BranchId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorEntry {
    pub id: SupervisorId,
    pub branch_id: BranchId,
    pub role: StaffRole,
    /// Hex-encoded SHA-256 of the PIN
    pub pin_sha256: String,
}

/// `[directory]` configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub operators: Vec<OperatorEntry>,
    #[serde(default)]
    pub supervisors: Vec<SupervisorEntry>,
}

struct RosterEntry {
    id: SupervisorId,
    role: StaffRole,
    digest: [u8; 32],
}

/// Directory loaded once from configuration.
pub struct StaticDirectory {
    operators: HashMap<OperatorId, BranchId>,
    rosters: HashMap<BranchId, Vec<RosterEntry>>,
}

impl StaticDirectory {
    pub fn from_config(config: &DirectoryConfig) -> Result<Self> {
        let operators = config
            .operators
            .iter()
            .map(|o| (o.id, o.branch_id))
            .collect();

        let mut rosters: HashMap<BranchId, Vec<RosterEntry>> = HashMap::new();
        for entry in &config.supervisors {
            let bytes = hex::decode(entry.pin_sha256.trim()).map_err(|e| {
                ScanError::ValidationError(format!(
                    "supervisor {} has a malformed pin_sha256: {}",
                    entry.id, e
                ))
            })?;
            let digest: [u8; 32] = bytes.try_into().map_err(|_| {
                ScanError::ValidationError(format!(
                    "supervisor {} pin_sha256 must be 32 bytes",
                    entry.id
                ))
            })?;
            rosters.entry(entry.branch_id).or_default().push(RosterEntry {
                id: entry.id,
                role: entry.role,
                digest,
            });
        }

        tracing::debug!(
            operators = config.operators.len(),
            supervisors = config.supervisors.len(),
            "Loaded static branch directory"
        );

        Ok(StaticDirectory { operators, rosters })
    }

    /// Hex SHA-256 of a PIN, in the form stored in configuration.
    pub fn hash_pin(pin: &str) -> String {
        hex::encode(Sha256::digest(pin.as_bytes()))
    }
}

#[async_trait]
impl BranchDirectory for StaticDirectory {
    async fn branch_of(&self, operator_id: OperatorId) -> Result<Option<BranchId>> {
        Ok(self.operators.get(&operator_id).copied())
    }

    async fn verify_supervisor_pin(
        &self,
        branch_id: BranchId,
        pin: &str,
    ) -> Result<Option<SupervisorId>> {
        let digest = Sha256::digest(pin.as_bytes());
        let Some(roster) = self.rosters.get(&branch_id) else {
            return Ok(None);
        };
        // Every entry is compared, match or not.
        let mut matched = None;
        for entry in roster {
            let equal: bool = entry.digest.as_slice().ct_eq(digest.as_slice()).into();
            if equal && entry.role.is_elevated() && matched.is_none() {
                matched = Some(entry.id);
            }
        }
        Ok(matched)
    }
}
