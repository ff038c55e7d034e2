use tandem_core::{ActionKind, ChangeStatus};
use tandem_engine::worker::DELTA_MARK;
use tandem_engine::{DetectedAction, HighWaterMark, SessionConfig};
use tandem_harness::{CONTENT_TYPE_MISMATCH, ContentTypeMismatch, TestSession, TestSessionGroup, init_test_logging};
use tandem_storage::SqliteStorage;

// ============================================================================
// Idempotence and checkpoints
// ============================================================================

#[test]
fn replayed_change_is_not_migrated_twice() -> Result<(), Box<dyn std::error::Error>> {
    init_test_logging();
    let mut session = TestSession::new()?;
    session.left.add("cs-1", "/A/a.txt", "one");
    session.poll()?;
    assert_eq!(session.right.applied(), vec!["cs-1".to_string()]);

    // An administrative reset makes the source report everything again.
    let mut mark = HighWaterMark::<i64>::new(session.session_id(), session.left_id(), DELTA_MARK);
    mark.reset(session.worker.store_mut(), 0)?;
    session.poll()?;
    session.poll()?;

    assert_eq!(session.left.enumerations().get(1), Some(&0));
    assert_eq!(session.right.applied().len(), 1);
    assert_eq!(session.worker.state()?.count(ChangeStatus::Complete), 1);
    Ok(())
}

#[test]
fn delta_checkpoint_only_moves_forward() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = TestSession::new()?;
    let left = session.left_id();
    let mut seen = Vec::new();
    for round in 0..4 {
        if round % 2 == 0 {
            session.left.add(&format!("cs-{round}"), &format!("/A/{round}.txt"), "x");
        }
        session.poll()?;
        seen.push(session.worker.delta_checkpoint(left)?);
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "checkpoints went backwards: {seen:?}");
    assert_eq!(seen.last(), Some(&2));
    let enumerations = session.left.enumerations();
    assert!(enumerations.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

// ============================================================================
// Backlog
// ============================================================================

#[test]
fn backlogged_edit_still_advances_the_checkpoint() -> Result<(), Box<dyn std::error::Error>> {
    init_test_logging();
    let mut session = TestSession::new()?;
    session
        .worker
        .conflicts_mut()
        .register_conflict_type(Box::new(ContentTypeMismatch::accepting(["text"])));
    session.right.seed("/A/b.txt", "old");
    session.left.push(
        DetectedAction::new("cs-1", ActionKind::Edit, "/A/b.txt").with_content_type("binary"),
        Some("\u{1}\u{2}"),
    );

    let report = session.poll()?;
    assert_eq!(report.groups_detected, 1);
    assert_eq!(report.backlogged, 1);
    assert_eq!(session.worker.delta_checkpoint(session.left_id())?, 1);

    let state = session.worker.state()?;
    assert_eq!(state.count(ChangeStatus::Pending), 1);
    assert_eq!(state.unresolved_conflicts, 1);
    let conflicts = session.worker.conflicts().unresolved_conflicts(session.worker.store())?;
    assert_eq!(conflicts[0].conflict_type, CONTENT_TYPE_MISMATCH);
    assert_eq!(conflicts[0].scope_hint, "/A/b.txt");
    assert!(session.right.applied().is_empty());

    // Re-analysis reuses the open conflict instead of raising a second one.
    let report = session.poll()?;
    assert_eq!(report.groups_detected, 0);
    assert_eq!(report.backlogged, 1);
    assert_eq!(session.worker.state()?.unresolved_conflicts, 1);
    Ok(())
}

// ============================================================================
// Grouping and direction
// ============================================================================

#[test]
fn change_touching_a_path_twice_is_split() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = TestSession::new()?;
    session.left.add("cs-1", "/A/a.txt", "first");
    session.left.edit("cs-1", "/A/a.txt", "second");

    let report = session.poll()?;
    assert_eq!(report.groups_detected, 2);
    let applied = session.right.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0], "cs-1");
    assert!(applied[1].starts_with("cs-1#"));
    assert_eq!(session.right.file("/A/a.txt").as_deref(), Some("second"));
    Ok(())
}

#[test]
fn bidirectional_changes_do_not_echo() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = TestSession::new()?;
    session.left.add("cs-1", "/A/l.txt", "left");
    session.right.add("r-1", "/B/r.txt", "right");

    for _ in 0..3 {
        session.poll()?;
    }

    assert_eq!(session.right.file("/A/l.txt").as_deref(), Some("left"));
    assert_eq!(session.left.file("/B/r.txt").as_deref(), Some("right"));
    assert_eq!(session.right.applied(), vec!["cs-1".to_string()]);
    assert_eq!(session.left.applied(), vec!["r-1".to_string()]);
    assert_eq!(session.worker.state()?.count(ChangeStatus::Complete), 2);
    Ok(())
}

// ============================================================================
// Restart and shared store
// ============================================================================

#[test]
fn restart_resumes_from_durable_state() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.db").to_string_lossy().into_owned();
    let mut session = TestSession::open(TestSession::config(), &path)?;
    session.left.add("cs-1", "/A/a.txt", "a");
    session
        .right
        .fail_next(tandem_harness::FaultPoint::Apply, tandem_core::Fault::new("Network", "reset"));

    let report = session.poll()?;
    assert_eq!(report.faults_routed, 1);
    assert_eq!(session.worker.state()?.count(ChangeStatus::Backlogged), 1);

    let mut session = session.reopen(&path)?;
    let report = session.poll()?;
    assert_eq!(report.groups_detected, 0);
    assert_eq!(report.migrated, 1);
    assert_eq!(session.left.enumerations().last(), Some(&1));
    Ok(())
}

#[test]
fn sessions_share_a_store_and_read_each_others_marks() -> Result<(), Box<dyn std::error::Error>> {
    init_test_logging();
    let mut group = TestSessionGroup::new(3)?;
    for index in 0..3 {
        let session = group.session(index);
        for n in 0..4 {
            session.left.add(&format!("s{index}-cs-{n}"), &format!("/S{index}/{n}.txt"), "x");
        }
    }

    for result in group.run(2) {
        result?;
    }

    let reader = SqliteStorage::open(&group.db_path())?;
    for index in 0..3 {
        let session = group.session(index);
        assert_eq!(session.right.applied().len(), 4);
        let mut peer_mark = HighWaterMark::<i64>::new(session.session_id(), session.left_id(), DELTA_MARK);
        assert_eq!(peer_mark.value(&reader)?, 4);
    }
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn yaml_config_drives_mappings_and_rules() -> Result<(), Box<dyn std::error::Error>> {
    let yaml = r#"
session_id: 0190a5b4-7c1e-7000-8000-0000000000a1
left_source: 0190a5b4-7c1e-7000-8000-0000000000a2
right_source: 0190a5b4-7c1e-7000-8000-0000000000a3
left_adapter: fake
right_adapter: fake
direction: left_to_right
path_mappings:
  - { left: /Main, right: /Mirror }
resolution_rules:
  - conflict_type: path-not-mapped
    scope: /Scratch
    action: skip-action
"#;
    let config = SessionConfig::from_yaml_str(yaml)?;
    let mut session = TestSession::with_config(config)?;
    session.left.add("cs-1", "/Main/a.txt", "a");
    session.left.add("cs-2", "/Scratch/tmp.txt", "t");

    let report = session.poll()?;
    assert_eq!(report.migrated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(session.right.file("/Mirror/a.txt").as_deref(), Some("a"));
    assert_eq!(session.right.file("/Scratch/tmp.txt"), None);
    assert_eq!(session.worker.state()?.unresolved_conflicts, 0);
    Ok(())
}
