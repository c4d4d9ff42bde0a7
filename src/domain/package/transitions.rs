//! Intake and dispatch transitions for packages.
//!
//! ```text
//! Created ───┐
//! InTransit ─┼──receive()──> AtBranch ──dispatch()──> InTransit
//! Returned ──┤
//! AtBranch ──┘ (another branch)
//! ```
//!
//! Which `(mode, status)` pairs are legal belongs to the shipment registry, so it
//! is asked through [`TransitionPolicy`]. Duplicate detection is not negotiable:
//! receiving a package already held at this branch, or dispatching one this branch
//! already sent out, is always a `DuplicateScan`.
//!
//! Transitions are pure; the write (and the re-check of the precondition inside the
//! same transaction) happens in [`crate::manager::Storage::commit_scan`].

use chrono::{DateTime, Utc};

use super::state::{
    AnyPackage, AtBranch, Created, InTransit, LastScan, Package, PackageData, PackageStatus,
};
use crate::domain::{BranchId, PackageId};
use crate::domain::session::ScanMode;
use crate::domain::tracking::TrackingCode;
use crate::error::{Result, ScanError};

/// Answers "is (mode, current status) a legal pair?" for the shipment registry.
pub trait TransitionPolicy: Send + Sync {
    fn allows(&self, mode: ScanMode, status: PackageStatus) -> bool;
}

/// Intake from anything but `Delivered`; dispatch only from `AtBranch`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransitionPolicy;

impl TransitionPolicy for DefaultTransitionPolicy {
    fn allows(&self, mode: ScanMode, status: PackageStatus) -> bool {
        match (mode, status) {
            (ScanMode::Intake, PackageStatus::Delivered) => false,
            (ScanMode::Intake, _) => true,
            (ScanMode::Dispatch, PackageStatus::AtBranch) => true,
            (ScanMode::Dispatch, _) => false,
        }
    }
}

impl Package<Created> {
    /// Register a shipment on first contact (external express is not pre-registered).
    pub fn first_contact(code: &TrackingCode, service_type: &str, now: DateTime<Utc>) -> Self {
        Package {
            data: PackageData {
                id: PackageId::new(),
                tracking_number: code.as_str().to_string(),
                family: code.family(),
                client_id: None,
                service_type: service_type.to_string(),
                registered_at: now,
                last_scan: None,
            },
            state: Created { since: now },
        }
    }
}

impl Package<AtBranch> {
    /// Leave the branch.
    pub fn depart(mut self, at: DateTime<Utc>) -> Package<InTransit> {
        self.data.last_scan = Some(LastScan {
            scan_type: ScanMode::Dispatch,
            branch_id: self.state.branch_id,
            at,
        });
        Package {
            data: self.data,
            state: InTransit { since: at },
        }
    }
}

impl AnyPackage {
    /// Intake at `branch_id`.
    pub fn receive(
        self,
        branch_id: BranchId,
        at: DateTime<Utc>,
        policy: &dyn TransitionPolicy,
    ) -> Result<Package<AtBranch>> {
        if self.current_branch_id() == Some(branch_id) {
            return Err(ScanError::DuplicateScan(self.data().tracking_number.clone()));
        }
        let status = self.status();
        if !policy.allows(ScanMode::Intake, status) {
            return Err(ScanError::InvalidTransition {
                tracking_number: self.data().tracking_number.clone(),
                mode: ScanMode::Intake,
                status,
            });
        }

        let mut data = self.into_data();
        data.last_scan = Some(LastScan {
            scan_type: ScanMode::Intake,
            branch_id,
            at,
        });
        Ok(Package {
            data,
            state: AtBranch {
                branch_id,
                since: at,
            },
        })
    }

    /// Dispatch from `branch_id`.
    pub fn dispatch(
        self,
        branch_id: BranchId,
        at: DateTime<Utc>,
        policy: &dyn TransitionPolicy,
    ) -> Result<Package<InTransit>> {
        let status = self.status();
        let tracking_number = self.data().tracking_number.clone();

        if self.already_dispatched_from(branch_id) {
            return Err(ScanError::DuplicateScan(tracking_number));
        }

        match self {
            AnyPackage::AtBranch(p) if p.state.branch_id != branch_id => {
                Err(ScanError::NotAtBranch {
                    tracking_number,
                    branch_id,
                })
            }
            _ if !policy.allows(ScanMode::Dispatch, status) => {
                if status == PackageStatus::AtBranch {
                    Err(ScanError::InvalidTransition {
                        tracking_number,
                        mode: ScanMode::Dispatch,
                        status,
                    })
                } else {
                    Err(ScanError::NotAtBranch {
                        tracking_number,
                        branch_id,
                    })
                }
            }
            AnyPackage::AtBranch(p) => Ok(p.depart(at)),
            other => {
                let mut data = other.into_data();
                data.last_scan = Some(LastScan {
                    scan_type: ScanMode::Dispatch,
                    branch_id,
                    at,
                });
                Ok(Package {
                    data,
                    state: InTransit { since: at },
                })
            }
        }
    }

    fn already_dispatched_from(&self, branch_id: BranchId) -> bool {
        self.status() == PackageStatus::InTransit
            && matches!(
                self.data().last_scan,
                Some(LastScan { scan_type: ScanMode::Dispatch, branch_id: b, .. }) if b == branch_id
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ClientId;
    use crate::domain::package::state::Delivered;

    fn data(tracking: &str) -> PackageData {
        let code = TrackingCode::parse(tracking);
        PackageData {
            id: PackageId::new(),
            tracking_number: code.as_str().to_string(),
            family: code.family(),
            client_id: Some(ClientId(501)),
            service_type: "AEREO".to_string(),
            registered_at: Utc::now(),
            last_scan: None,
        }
    }

    fn created(tracking: &str) -> AnyPackage {
        AnyPackage::from(Package {
            data: data(tracking),
            state: Created { since: Utc::now() },
        })
    }

    #[test]
    fn test_receive_then_dispatch() {
        let policy = DefaultTransitionPolicy;
        let now = Utc::now();

        let at_branch = created("AIR-2201")
            .receive(BranchId(7), now, &policy)
            .expect("intake of created package");
        assert_eq!(at_branch.state.branch_id, BranchId(7));
        let last = at_branch.data.last_scan.expect("last scan recorded");
        assert_eq!(last.scan_type, ScanMode::Intake);

        let in_transit = AnyPackage::from(at_branch)
            .dispatch(BranchId(7), now, &policy)
            .expect("dispatch from holding branch");
        let any = AnyPackage::from(in_transit);
        assert_eq!(any.status(), PackageStatus::InTransit);
        assert_eq!(any.current_branch_id(), None);
    }

    #[test]
    fn test_double_intake_is_duplicate() {
        let policy = DefaultTransitionPolicy;
        let now = Utc::now();
        let at_branch = created("AIR-1").receive(BranchId(7), now, &policy).unwrap();

        let again = AnyPackage::from(at_branch.clone()).receive(BranchId(7), now, &policy);
        assert!(matches!(again, Err(ScanError::DuplicateScan(_))));

        // A different branch may receive it (transfer).
        let elsewhere = AnyPackage::from(at_branch).receive(BranchId(9), now, &policy);
        assert_eq!(elsewhere.unwrap().state.branch_id, BranchId(9));
    }

    #[test]
    fn test_dispatch_requires_at_branch() {
        let policy = DefaultTransitionPolicy;
        let result = created("US-5001").dispatch(BranchId(7), Utc::now(), &policy);
        assert!(matches!(result, Err(ScanError::NotAtBranch { .. })));
    }

    #[test]
    fn test_dispatch_from_other_branch_rejected() {
        let policy = DefaultTransitionPolicy;
        let now = Utc::now();
        let at_branch = created("LOG-900").receive(BranchId(3), now, &policy).unwrap();
        let result = AnyPackage::from(at_branch).dispatch(BranchId(7), now, &policy);
        match result {
            Err(ScanError::NotAtBranch { branch_id, .. }) => assert_eq!(branch_id, BranchId(7)),
            other => panic!("expected NotAtBranch, got {:?}", other),
        }
    }

    #[test]
    fn test_double_dispatch_is_duplicate() {
        let policy = DefaultTransitionPolicy;
        let now = Utc::now();
        let sent = AnyPackage::from(created("LOG-900").receive(BranchId(7), now, &policy).unwrap())
            .dispatch(BranchId(7), now, &policy)
            .unwrap();

        let again = AnyPackage::from(sent).dispatch(BranchId(7), now, &policy);
        assert!(matches!(again, Err(ScanError::DuplicateScan(_))));
    }

    #[test]
    fn test_delivered_package_cannot_be_received() {
        let policy = DefaultTransitionPolicy;
        let delivered = AnyPackage::from(Package {
            data: data("AIR-7"),
            state: Delivered { since: Utc::now() },
        });
        let result = delivered.receive(BranchId(7), Utc::now(), &policy);
        assert!(matches!(
            result,
            Err(ScanError::InvalidTransition {
                status: PackageStatus::Delivered,
                ..
            })
        ));
    }

    #[test]
    fn test_custom_policy_is_consulted() {
        struct FrozenRegistry;
        impl TransitionPolicy for FrozenRegistry {
            fn allows(&self, _mode: ScanMode, _status: PackageStatus) -> bool {
                false
            }
        }

        let result = created("AIR-5").receive(BranchId(7), Utc::now(), &FrozenRegistry);
        assert!(matches!(result, Err(ScanError::InvalidTransition { .. })));
    }

    #[test]
    fn test_first_contact_uses_processing_family() {
        let code = TrackingCode::parse("9988776655");
        let package = Package::first_contact(&code, "EXPRESS", Utc::now());
        assert_eq!(package.data.tracking_number, "9988776655");
        assert_eq!(package.data.client_id, None);
        assert_eq!(package.data.service_type, "EXPRESS");
    }
}
