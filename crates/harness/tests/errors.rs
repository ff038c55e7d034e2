use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_core::{ChangeStatus, ErrorSignature, Fault, SessionId};
use tandem_engine::error_routing::FAULT_UNAUTHORIZED;
use tandem_engine::{EngineError, ErrorChannel, ErrorRouterConfig, RoutingDecision};
use tandem_harness::{FaultPoint, TestSession, init_test_logging};
use tandem_storage::SqliteStorage;

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(String, RoutingDecision)>>>);

impl ErrorChannel for Recorder {
    fn report(&mut self, _session_id: SessionId, _signature: &ErrorSignature, fault: &Fault, decision: RoutingDecision) {
        self.0.lock().unwrap().push((fault.to_string(), decision));
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[test]
fn error_flood_stops_the_session() -> Result<(), Box<dyn std::error::Error>> {
    init_test_logging();
    let mut config = TestSession::config();
    config.error_routers = vec![ErrorRouterConfig {
        signature: ErrorSignature::one_level("Network", ""),
        max_occurrence: Some(3),
    }];
    let mut session = TestSession::with_config(config)?;
    for _ in 0..4 {
        session
            .left
            .fail_next(FaultPoint::Enumerate, Fault::new("Network", "connection refused"));
    }

    for _ in 0..3 {
        let report = session.poll()?;
        assert_eq!(report.faults_routed, 1);
    }
    assert!(matches!(session.poll(), Err(EngineError::SessionStopped { .. })));
    assert!(matches!(session.poll(), Err(EngineError::SessionStopped { .. })));
    assert!(session.worker.state()?.stopped.is_some());
    Ok(())
}

#[test]
fn stopped_session_is_resumable_after_restart() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.db").to_string_lossy().into_owned();
    let mut session = TestSession::open(TestSession::config(), &path)?;
    session.left.add("cs-1", "/A/a.txt", "a");
    for _ in 0..2 {
        session
            .right
            .fail_next(FaultPoint::Apply, Fault::new(FAULT_UNAUTHORIZED, "token expired"));
    }

    session.poll()?;
    assert!(matches!(session.poll(), Err(EngineError::SessionStopped { .. })));
    let state = session.worker.state()?;
    assert_eq!(state.count(ChangeStatus::InProgress), 0);
    assert_eq!(state.count(ChangeStatus::Pending), 1);

    let mut session = session.reopen(&path)?;
    let report = session.poll()?;
    assert_eq!(report.migrated, 1);
    assert_eq!(session.right.file("/A/a.txt").as_deref(), Some("a"));
    Ok(())
}

// ============================================================================
// Channels
// ============================================================================

#[test]
fn routed_faults_reach_every_channel() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = TestSession::new()?;
    let recorder = Recorder::default();
    session.worker.errors_mut().add_channel(Box::new(recorder.clone()));
    session.left.add("cs-1", "/A/a.txt", "a");
    session
        .left
        .fail_next(FaultPoint::Download, Fault::new("Timeout", "read stalled"));

    let report = session.poll()?;
    assert_eq!(report.faults_routed, 1);
    assert_eq!(session.worker.state()?.count(ChangeStatus::Backlogged), 1);
    {
        let reports = recorder.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, RoutingDecision::Routed);
    }

    let report = session.poll()?;
    assert_eq!(report.migrated, 1);
    Ok(())
}

#[test]
fn wrapped_fault_matches_two_level_signature() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = TestSession::config();
    config.error_routers = vec![ErrorRouterConfig {
        signature: ErrorSignature::two_level(
            tandem_core::SignatureLevel::new("Adapter", ""),
            tandem_core::SignatureLevel::new("Io", "disk"),
        ),
        max_occurrence: Some(1),
    }];
    let mut session = TestSession::with_config(config)?;
    let wrapped = || Fault::new("Adapter", "write failed").with_inner(Fault::new("Io", "disk full"));
    session.left.add("cs-1", "/A/a.txt", "a");
    session.right.fail_next(FaultPoint::Apply, wrapped());
    session.right.fail_next(FaultPoint::Apply, wrapped());

    assert_eq!(session.poll()?.faults_routed, 1);
    assert!(matches!(session.poll(), Err(EngineError::SessionStopped { .. })));
    Ok(())
}

// ============================================================================
// Store contention
// ============================================================================

#[test]
fn busy_store_after_a_write_does_not_repeat_it() -> Result<(), Box<dyn std::error::Error>> {
    init_test_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.db").to_string_lossy().into_owned();
    let mut store = SqliteStorage::open(&path)?;
    store.set_busy_timeout(Duration::from_millis(50))?;
    let mut session = TestSession::with_store(TestSession::config(), store)?;
    session.left.add("cs-1", "/A/a.txt", "a");

    let holder: Arc<Mutex<Option<rusqlite::Connection>>> = Arc::default();
    let lock = holder.clone();
    let db = path.clone();
    session.right.on_next_apply(move || {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        *lock.lock().unwrap() = Some(conn);
    });

    let report = session.poll()?;
    assert!(report.faults_routed >= 1);
    assert_eq!(report.migrated, 0);
    assert_eq!(session.right.applied(), vec!["cs-1".to_string()]);
    assert!(holder.lock().unwrap().is_some());

    drop(holder.lock().unwrap().take());
    let report = session.poll()?;
    assert_eq!(report.migrated, 1);
    session.poll()?;

    assert_eq!(session.right.applied(), vec!["cs-1".to_string()]);
    assert_eq!(session.right.file("/A/a.txt").as_deref(), Some("a"));
    let state = session.worker.state()?;
    assert_eq!(state.count(ChangeStatus::Complete), 1);
    assert_eq!(state.count(ChangeStatus::InProgress), 0);
    Ok(())
}
