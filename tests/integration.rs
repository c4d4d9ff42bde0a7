use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scan_engine::directory::{OperatorEntry, StaffRole, SupervisorEntry};
use scan_engine::domain::authorization::AnyGate;
use scan_engine::domain::package::{AnyPackage, Package, PackageStatus};
use scan_engine::domain::{BranchId, ClientId, OperatorId, SupervisorId};
use scan_engine::manager::Storage;
use scan_engine::{
    AuthorizeRequest, DirectoryConfig, EngineConfig, ErrorKind, ExpressIntakeDetails,
    InMemoryStorage, MockLabelPrinter, OpenSessionRequest, ScanEngine, ScanError, ScanMode,
    ScanRequest, SessionId, StaticDirectory, TrackingCode, TrackingFamily,
};

type Engine = ScanEngine<InMemoryStorage, StaticDirectory, MockLabelPrinter>;

const BRANCH: BranchId = BranchId(7);
const OPERATOR: OperatorId = OperatorId(11);
const SECOND_OPERATOR: OperatorId = OperatorId(12);
const SUPERVISOR_PIN: &str = "4821";

struct Harness {
    engine: Arc<Engine>,
    storage: Arc<InMemoryStorage>,
    printer: MockLabelPrinter,
}

fn directory() -> StaticDirectory {
    StaticDirectory::from_config(&DirectoryConfig {
        operators: vec![
            OperatorEntry {
                id: OPERATOR,
                branch_id: BRANCH,
            },
            OperatorEntry {
                id: SECOND_OPERATOR,
                branch_id: BRANCH,
            },
            OperatorEntry {
                id: OperatorId(21),
                branch_id: BranchId(9),
            },
        ],
        supervisors: vec![SupervisorEntry {
            id: SupervisorId(3),
            branch_id: BRANCH,
            role: StaffRole::Supervisor,
            pin_sha256: StaticDirectory::hash_pin(SUPERVISOR_PIN),
        }],
    })
    .unwrap()
}

fn harness_with(config: EngineConfig) -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let printer = MockLabelPrinter::new();
    let engine = Arc::new(ScanEngine::new(
        storage.clone(),
        Arc::new(directory()),
        printer.clone(),
        config,
    ));
    Harness {
        engine,
        storage,
        printer,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig {
        stats_rebuild_interval_ms: None,
        ..Default::default()
    })
}

/// Pre-register a locally generated shipment.
async fn register(storage: &InMemoryStorage, tracking: &str, service_type: &str) -> AnyPackage {
    let mut package = Package::first_contact(&TrackingCode::parse(tracking), service_type, Utc::now());
    package.data.client_id = Some(ClientId(501));
    let package = AnyPackage::from(package);
    storage.register_package(&package).await.unwrap();
    package
}

async fn open(engine: &Engine, operator_id: OperatorId, mode: ScanMode) -> SessionId {
    engine
        .open_session(OpenSessionRequest {
            terminal_id: format!("T-{}", operator_id),
            operator_id,
            branch_id: BRANCH,
            mode,
        })
        .await
        .unwrap()
        .id
}

fn scan_request(session_id: SessionId, code: &str, scan_type: ScanMode) -> ScanRequest {
    ScanRequest {
        session_id,
        tracking_code: code.to_string(),
        scan_type,
        branch_id: BRANCH,
        operator_id: OPERATOR,
        notes: None,
        express_details: None,
    }
}

fn express_details() -> ExpressIntakeDetails {
    ExpressIntakeDetails {
        weight_kg: 2.5,
        piece_count: 1,
        consignee_name: "Marta Quiroga".to_string(),
        consignee_phone: "+591 7123 4567".to_string(),
        description: "Spare parts".to_string(),
    }
}

fn authorize_request(session_id: SessionId, code: &str, pin: &str) -> AuthorizeRequest {
    AuthorizeRequest {
        session_id,
        pin: pin.to_string(),
        branch_id: BRANCH,
        operator_id: OPERATOR,
        tracking_code: code.to_string(),
    }
}

#[test_log::test(tokio::test)]
async fn test_express_scan_without_authorization_is_rejected() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    let err = h
        .engine
        .scan(scan_request(session, "4412345678", ScanMode::Intake))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::AuthorizationRequired(_)));
    assert_eq!(err.kind(), ErrorKind::Authorization);

    // No package was created and nothing was counted
    let found = h
        .storage
        .find_package(TrackingFamily::ExternalExpress, "4412345678")
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(h.storage.scan_event_count(), 0);
    assert_eq!(h.engine.daily_stats(BRANCH, None).await.unwrap().total(), 0);

    // The terminal is now waiting for a supervisor PIN for that code
    let session = h.engine.session(session).await.unwrap();
    match &session.gate {
        AnyGate::AwaitingPin(g) => assert_eq!(g.state.tracking_number, "4412345678"),
        other => panic!("expected AwaitingPin, got {}", other.variant()),
    }
    assert_eq!(session.open_family, None);
}

#[test_log::test(tokio::test)]
async fn test_family_mismatch_leaves_first_scan_intact() {
    let h = harness();
    register(&h.storage, "AIR-2201", "AIR").await;
    let sea = register(&h.storage, "LOG-900", "SEA").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    let receipt = h
        .engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap();
    assert_eq!(receipt.package.status, PackageStatus::AtBranch);
    assert_eq!(receipt.package.current_branch_id, Some(BRANCH));
    assert!(receipt.label.is_none());

    let err = h
        .engine
        .scan(scan_request(session, "LOG-900", ScanMode::Intake))
        .await
        .unwrap_err();
    match err {
        ScanError::FamilyMismatch { open, scanned } => {
            assert_eq!(open, TrackingFamily::AirFreight);
            assert_eq!(scanned, TrackingFamily::SeaFreight);
        }
        other => panic!("expected family mismatch, got {:?}", other),
    }

    assert_eq!(h.storage.scan_event_count(), 1);
    let stats = h.engine.daily_stats(BRANCH, None).await.unwrap();
    assert_eq!(stats.intake, 1);
    let untouched = h.storage.get_package(sea.id()).await.unwrap();
    assert_eq!(untouched.status(), PackageStatus::Created);

    // After a reset the other family is accepted
    h.engine.reset_batch(session).await.unwrap();
    h.engine
        .scan(scan_request(session, "LOG-900", ScanMode::Intake))
        .await
        .unwrap();
    assert_eq!(
        h.engine.session(session).await.unwrap().open_family,
        Some(TrackingFamily::SeaFreight)
    );
}

#[test_log::test(tokio::test)]
async fn test_internal_codes_batch_with_air_freight() {
    let h = harness();
    register(&h.storage, "AIR-2201", "AIR").await;
    register(&h.storage, "TRK-77", "AIR").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    h.engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap();
    let receipt = h
        .engine
        .scan(scan_request(session, "trk-77", ScanMode::Intake))
        .await
        .unwrap();
    assert_eq!(receipt.event.family, TrackingFamily::AirFreight);
    assert_eq!(receipt.event.tracking_number, "TRK-77");
}

#[test_log::test(tokio::test)]
async fn test_dispatch_of_package_not_at_branch_is_rejected() {
    let h = harness();
    register(&h.storage, "US-5001", "DOMESTIC").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Dispatch).await;

    let err = h
        .engine
        .scan(scan_request(session, "US-5001", ScanMode::Dispatch))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NotAtBranch { .. }));
    assert_eq!(err.kind(), ErrorKind::Transition);
    assert_eq!(h.storage.scan_event_count(), 0);
    assert_eq!(h.engine.session(session).await.unwrap().open_family, None);
}

#[test_log::test(tokio::test)]
async fn test_unregistered_local_code_has_no_matching_shipment() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    let err = h
        .engine
        .scan(scan_request(session, "AIR-404", ScanMode::Intake))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NoMatchingShipment(_)));

    let err = h
        .engine
        .scan(scan_request(session, "PKG-1", ScanMode::Intake))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::UnrecognizedFormat(_)));
    assert_eq!(h.storage.scan_event_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_supervisor_grant_is_consumed_exactly_once() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    let grant = h
        .engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();
    assert_eq!(grant.tracking_number, "9988776655");
    assert_eq!(grant.branch_id, BRANCH);
    assert!(matches!(
        h.engine.session(session).await.unwrap().gate,
        AnyGate::Authorized(_)
    ));

    let mut request = scan_request(session, "9988776655", ScanMode::Intake);
    request.express_details = Some(express_details());
    let receipt = h.engine.scan(request.clone()).await.unwrap();

    assert_eq!(receipt.event.authorization_id, Some(grant.id));
    assert_eq!(receipt.event.family, TrackingFamily::ExternalExpress);
    assert_eq!(receipt.package.status, PackageStatus::AtBranch);
    assert_eq!(receipt.event.express_details, Some(express_details()));

    let (stored, revoked) = h.storage.authorization(grant.id).unwrap();
    assert!(stored.consumed_at.is_some());
    assert!(!revoked);
    assert!(matches!(
        h.engine.session(session).await.unwrap().gate,
        AnyGate::PendingScan(_)
    ));

    // Relabel produced with a rendered document
    let label = receipt.label.expect("express intake produces a label");
    assert!(label.reference.as_str().starts_with("LBL-9988776655-"));
    assert!(label.url.is_some());
    assert_eq!(h.printer.call_count(), 1);

    // Repeating the intake is a duplicate, and nothing else is written
    let err = h.engine.scan(request).await.unwrap_err();
    assert!(matches!(err, ScanError::DuplicateScan(_)));
    assert_eq!(h.storage.scan_event_count(), 1);
    assert_eq!(h.engine.daily_stats(BRANCH, None).await.unwrap().intake, 1);
}

#[test_log::test(tokio::test)]
async fn test_express_dispatch_needs_fresh_grant() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    h.engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();
    let mut request = scan_request(session, "9988776655", ScanMode::Intake);
    request.express_details = Some(express_details());
    h.engine.scan(request).await.unwrap();
    h.engine
        .switch_mode(session, ScanMode::Dispatch)
        .await
        .unwrap();

    let err = h
        .engine
        .scan(scan_request(session, "9988776655", ScanMode::Dispatch))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::AuthorizationRequired(_)));

    h.engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();
    let receipt = h
        .engine
        .scan(scan_request(session, "9988776655", ScanMode::Dispatch))
        .await
        .unwrap();
    assert_eq!(receipt.package.status, PackageStatus::InTransit);
    // Only intake relabels
    assert!(receipt.label.is_none());
    assert_eq!(h.printer.call_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_express_intake_requires_details_and_keeps_grant() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    let grant = h
        .engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();

    let err = h
        .engine
        .scan(scan_request(session, "9988776655", ScanMode::Intake))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut request = scan_request(session, "9988776655", ScanMode::Intake);
    let mut details = express_details();
    details.weight_kg = 0.0;
    request.express_details = Some(details);
    assert!(matches!(
        h.engine.scan(request).await,
        Err(ScanError::ValidationError(_))
    ));

    let (stored, _) = h.storage.authorization(grant.id).unwrap();
    assert!(stored.consumed_at.is_none());

    let mut request = scan_request(session, "9988776655", ScanMode::Intake);
    request.express_details = Some(express_details());
    let receipt = h.engine.scan(request).await.unwrap();
    assert_eq!(receipt.event.authorization_id, Some(grant.id));
}

#[test_log::test(tokio::test)]
async fn test_grant_is_bound_to_its_code() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    h.engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();

    let mut request = scan_request(session, "1122334455", ScanMode::Intake);
    request.express_details = Some(express_details());
    let err = h.engine.scan(request).await.unwrap_err();
    assert!(matches!(err, ScanError::AuthorizationRequired(_)));
    assert_eq!(h.storage.scan_event_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_wrong_pins_are_throttled_per_branch() {
    let h = harness_with(EngineConfig {
        pin_max_failures: 2,
        stats_rebuild_interval_ms: None,
        ..Default::default()
    });
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    for attempt in 1..=2u32 {
        let err = h
            .engine
            .authorize(authorize_request(session, "9988776655", "0000"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::IncorrectCredential));
        match h.engine.session(session).await.unwrap().gate {
            AnyGate::AwaitingPin(g) => assert_eq!(g.state.failed_attempts, attempt),
            other => panic!("expected AwaitingPin, got {}", other.variant()),
        }
    }

    // Even the right PIN is refused until the window passes
    let err = h
        .engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap_err();
    match err {
        ScanError::AuthorizationThrottled {
            branch_id,
            retry_after_secs,
        } => {
            assert_eq!(branch_id, BRANCH);
            assert!(retry_after_secs >= 1);
        }
        other => panic!("expected throttled, got {:?}", other),
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_wrong_pins_stay_within_budget() {
    let h = harness_with(EngineConfig {
        pin_max_failures: 3,
        stats_rebuild_interval_ms: None,
        ..Default::default()
    });
    let mut sessions = Vec::new();
    for _ in 0..10 {
        sessions.push(open(&h.engine, OPERATOR, ScanMode::Intake).await);
    }

    let tasks: Vec<_> = sessions
        .into_iter()
        .map(|session| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .authorize(authorize_request(session, "9988776655", "0000"))
                    .await
            })
        })
        .collect();
    let mut incorrect = 0;
    let mut throttled = 0;
    for task in tasks {
        match task.await.unwrap() {
            Err(ScanError::IncorrectCredential) => incorrect += 1,
            Err(ScanError::AuthorizationThrottled { .. }) => throttled += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(incorrect, 3);
    assert_eq!(throttled, 7);
}

#[test_log::test(tokio::test)]
async fn test_rejected_scans_leave_session_and_grant_alone() {
    let h = harness();
    register(&h.storage, "AIR-2201", "AIR").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    let grant = h
        .engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();

    // Express code the grant was not issued for
    let mut request = scan_request(session, "1122334455", ScanMode::Intake);
    request.express_details = Some(express_details());
    let err = h.engine.scan(request).await.unwrap_err();
    assert!(matches!(err, ScanError::AuthorizationRequired(_)));

    h.engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap();

    // Opposite direction with a junk code
    let err = h
        .engine
        .scan(scan_request(session, "PKG-1", ScanMode::Dispatch))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ScanError::ModeMismatch {
            session: ScanMode::Intake,
            scanned: ScanMode::Dispatch
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Session);

    let state = h.engine.session(session).await.unwrap();
    assert_eq!(state.mode, ScanMode::Intake);
    assert_eq!(state.open_family, Some(TrackingFamily::AirFreight));
    match &state.gate {
        AnyGate::Authorized(g) => assert_eq!(g.state.grant.id, grant.id),
        other => panic!("expected Authorized, got {}", other.variant()),
    }
    let (stored, revoked) = h.storage.authorization(grant.id).unwrap();
    assert!(!revoked);
    assert!(stored.consumed_at.is_none());
    assert_eq!(h.storage.scan_event_count(), 1);

    // The grant still authorizes its own code
    h.engine.reset_batch(session).await.unwrap();
    let mut request = scan_request(session, "9988776655", ScanMode::Intake);
    request.express_details = Some(express_details());
    let receipt = h.engine.scan(request).await.unwrap();
    assert_eq!(receipt.event.authorization_id, Some(grant.id));
}

#[test_log::test(tokio::test)]
async fn test_authorization_only_for_external_express() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    let err = h
        .engine
        .authorize(authorize_request(session, "AIR-2201", SUPERVISOR_PIN))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::ValidationError(_)));
}

#[test_log::test(tokio::test)]
async fn test_mode_switch_and_cancel_revoke_grants() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    let first = h
        .engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();
    h.engine
        .switch_mode(session, ScanMode::Dispatch)
        .await
        .unwrap();
    assert!(h.storage.authorization(first.id).unwrap().1);

    let second = h
        .engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();
    h.engine.cancel_authorization(session).await.unwrap();
    assert!(h.storage.authorization(second.id).unwrap().1);
    assert!(matches!(
        h.engine.session(session).await.unwrap().gate,
        AnyGate::PendingScan(_)
    ));
}

#[test_log::test(tokio::test)]
async fn test_double_scan_counts_once() {
    let h = harness();
    register(&h.storage, "AIR-2201", "AIR").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    h.engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap();
    let err = h
        .engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::DuplicateScan(_)));

    assert_eq!(h.storage.scan_event_count(), 1);
    assert_eq!(h.engine.daily_stats(BRANCH, None).await.unwrap().total(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_scans_from_two_terminals_accept_one() {
    let h = harness();
    register(&h.storage, "AIR-2201", "AIR").await;
    let first = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    let second = open(&h.engine, SECOND_OPERATOR, ScanMode::Intake).await;

    let mut other = scan_request(second, "AIR-2201", ScanMode::Intake);
    other.operator_id = SECOND_OPERATOR;

    let a = tokio::spawn({
        let engine = h.engine.clone();
        async move {
            engine
                .scan(scan_request(first, "AIR-2201", ScanMode::Intake))
                .await
        }
    });
    let b = tokio::spawn({
        let engine = h.engine.clone();
        async move { engine.scan(other).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(ScanError::DuplicateScan(_))))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 1);
    assert_eq!(h.storage.scan_event_count(), 1);
    assert_eq!(h.engine.daily_stats(BRANCH, None).await.unwrap().intake, 1);
}

#[test_log::test(tokio::test)]
async fn test_intake_then_dispatch_round_trip() {
    let h = harness();
    register(&h.storage, "AIR-2201", "AIR").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    h.engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap();
    h.engine
        .switch_mode(session, ScanMode::Dispatch)
        .await
        .unwrap();
    let receipt = h
        .engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Dispatch))
        .await
        .unwrap();
    assert_eq!(receipt.package.status, PackageStatus::InTransit);
    assert_eq!(receipt.package.current_branch_id, None);
    assert_eq!(h.engine.session(session).await.unwrap().mode, ScanMode::Dispatch);

    let stats = h.engine.daily_stats(BRANCH, None).await.unwrap();
    assert_eq!(stats.intake, 1);
    assert_eq!(stats.dispatch, 1);
    assert_eq!(stats.by_service.len(), 1);
    assert_eq!(stats.by_service[0].service_type, "AIR");
    assert_eq!(stats.by_service[0].intake, 1);
    assert_eq!(stats.by_service[0].dispatch, 1);

    let events = h.engine.scan_events(BRANCH, None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].scan_type, ScanMode::Intake);
    assert_eq!(events[1].scan_type, ScanMode::Dispatch);

    // Dispatching again from the same branch is a duplicate
    let err = h
        .engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Dispatch))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::DuplicateScan(_)));

    // Rebuilding from the log agrees with the live counters
    let rebuilt = h.engine.stats().rebuild(BRANCH, stats.date).await.unwrap();
    assert_eq!(rebuilt, stats);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_stats_rebuild_during_scanning_keeps_every_increment() {
    let h = harness();
    let codes: Vec<String> = (0..40).map(|n| format!("AIR-{}", 3000 + n)).collect();
    for code in &codes {
        register(&h.storage, code, "AIR").await;
    }
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    let today = h.engine.stats().today();

    let scanner = tokio::spawn({
        let engine = h.engine.clone();
        async move {
            for code in codes {
                engine
                    .scan(scan_request(session, &code, ScanMode::Intake))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }
    });
    let rebuilder = tokio::spawn({
        let engine = h.engine.clone();
        async move {
            for _ in 0..40 {
                engine.stats().rebuild_day(today).await.unwrap();
                tokio::task::yield_now().await;
            }
        }
    });
    scanner.await.unwrap();
    rebuilder.await.unwrap();

    // Live counters, no final rebuild
    let stats = h.engine.daily_stats(BRANCH, None).await.unwrap();
    assert_eq!(stats.intake, 40);
    assert_eq!(h.storage.scan_event_count(), 40);
}

#[test_log::test(tokio::test)]
async fn test_storage_failure_changes_nothing() {
    let h = harness();
    register(&h.storage, "AIR-2201", "AIR").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;

    h.storage.inject_commit_failure();
    let err = h
        .engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert!(!err.is_rejection());
    assert_eq!(h.storage.scan_event_count(), 0);
    assert_eq!(h.engine.session(session).await.unwrap().open_family, None);

    // Rescan goes through once storage is back
    h.engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap();
    assert_eq!(h.storage.scan_event_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_label_failure_does_not_undo_scan() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    h.engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();

    h.printer.fail_next("printer offline");
    let mut request = scan_request(session, "9988776655", ScanMode::Intake);
    request.express_details = Some(express_details());
    let receipt = h.engine.scan(request).await.unwrap();

    let label = receipt.label.expect("label reference issued");
    assert!(label.url.is_none());
    assert_eq!(h.storage.scan_event_count(), 1);

    let document = h.engine.reprint_label(receipt.package.id).await.unwrap();
    assert_eq!(document.reference, label.reference);
    assert_eq!(h.printer.call_count(), 2);
}

#[test_log::test(tokio::test)]
async fn test_reprint_refused_for_packages_without_label() {
    let h = harness();
    let package = register(&h.storage, "AIR-2201", "AIR").await;
    let err = h.engine.reprint_label(package.id()).await.unwrap_err();
    assert!(matches!(err, ScanError::ValidationError(_)));
}

#[test_log::test(tokio::test)]
async fn test_operator_must_belong_to_branch() {
    let h = harness();
    let err = h
        .engine
        .open_session(OpenSessionRequest {
            terminal_id: "T-21".to_string(),
            operator_id: OperatorId(21),
            branch_id: BRANCH,
            mode: ScanMode::Intake,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::OperatorNotAtBranch { .. }));

    // A session cannot be used by another operator
    register(&h.storage, "AIR-2201", "AIR").await;
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    let mut request = scan_request(session, "AIR-2201", ScanMode::Intake);
    request.operator_id = SECOND_OPERATOR;
    let err = h.engine.scan(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Session);
}

#[test_log::test(tokio::test)]
async fn test_idle_sessions_are_purged() {
    let h = harness_with(EngineConfig {
        session_idle_timeout_secs: 0,
        stats_rebuild_interval_ms: None,
        ..Default::default()
    });
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    let grant = h
        .engine
        .authorize(authorize_request(session, "9988776655", SUPERVISOR_PIN))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.engine.purge_idle_sessions().await, 1);
    assert!(h.storage.authorization(grant.id).unwrap().1);

    let err = h
        .engine
        .scan(scan_request(session, "AIR-2201", ScanMode::Intake))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::SessionNotFound(_)));
}

#[test_log::test(tokio::test)]
async fn test_close_session() {
    let h = harness();
    let session = open(&h.engine, OPERATOR, ScanMode::Intake).await;
    h.engine.close_session(session).await.unwrap();
    assert!(matches!(
        h.engine.close_session(session).await,
        Err(ScanError::SessionNotFound(_))
    ));
}
