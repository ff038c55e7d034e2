use tandem_core::{ArtifactLink, Fault, LinkActionKind, LinkChangeAction, LinkGroupStatus, LinkTargetKind};
use tandem_engine::PathMapping;
use tandem_harness::{FaultPoint, TestSession, init_test_logging};

fn related(source: &str, target: &str) -> ArtifactLink {
    ArtifactLink::new(source, target, "related").with_target_kind(LinkTargetKind::VersionControl)
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn link_waits_for_its_target_to_be_created() -> Result<(), Box<dyn std::error::Error>> {
    init_test_logging();
    let mut session = TestSession::new()?;
    session.left.add("cs-1", "/A/t.txt", "target");
    session.left.link_change(
        "l-1",
        vec![LinkChangeAction::new(LinkActionKind::Add, related("/A/s.txt", "/A/t.txt"))],
    );
    session.right.fail_next(FaultPoint::Apply, Fault::new("Network", "reset"));

    let report = session.poll()?;
    assert_eq!(report.link_groups_detected, 1);
    assert_eq!(report.links_migrated, 0);
    assert!(session.right.links().is_empty());
    let state = session.worker.state()?;
    assert_eq!(state.link_count(LinkGroupStatus::ReadyForMigration), 0);
    assert_eq!(state.link_count(LinkGroupStatus::InAnalysisDeferred), 1);

    let report = session.poll()?;
    assert_eq!(report.migrated, 1);
    assert_eq!(report.links_migrated, 1);
    let links = session.right.links();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].0, LinkActionKind::Add);
    assert_eq!(links[0].1.target_uri, "/A/t.txt");
    Ok(())
}

// ============================================================================
// Supersession and deletes
// ============================================================================

#[test]
fn add_then_delete_before_migration_never_reaches_the_peer() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = TestSession::new()?;
    let link = ArtifactLink::new("wi/1", "wi/2", "parent");
    session
        .left
        .link_change("l-1", vec![LinkChangeAction::new(LinkActionKind::Add, link.clone())]);
    session
        .left
        .link_change("l-2", vec![LinkChangeAction::new(LinkActionKind::Delete, link)]);

    session.poll()?;

    assert!(session.right.links().is_empty());
    let state = session.worker.state()?;
    assert_eq!(state.link_count(LinkGroupStatus::Completed), 2);
    assert_eq!(state.unresolved_conflicts, 0);
    Ok(())
}

#[test]
fn delete_of_a_migrated_link_reaches_the_peer() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = TestSession::new()?;
    let link = ArtifactLink::new("wi/1", "wi/2", "parent");
    session
        .left
        .link_change("l-1", vec![LinkChangeAction::new(LinkActionKind::Add, link.clone())]);
    session.poll()?;

    session
        .left
        .link_change("l-2", vec![LinkChangeAction::new(LinkActionKind::Delete, link)]);
    let report = session.poll()?;
    assert_eq!(report.links_migrated, 1);

    let kinds: Vec<LinkActionKind> = session.right.links().into_iter().map(|(kind, _)| kind).collect();
    assert_eq!(kinds, vec![LinkActionKind::Add, LinkActionKind::Delete]);
    // The peer's own record of those writes is not sent back.
    session.poll()?;
    assert!(session.left.links().is_empty());
    Ok(())
}

// ============================================================================
// Scope and peer refusals
// ============================================================================

#[test]
fn link_outside_the_mapped_scope_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = TestSession::config();
    config.path_mappings = vec![PathMapping {
        left: "/A".into(),
        right: "/M".into(),
    }];
    let mut session = TestSession::with_config(config)?;
    session.left.link_change(
        "l-1",
        vec![LinkChangeAction::new(LinkActionKind::Add, related("/Z/x.txt", "/Z/y.txt"))],
    );

    session.poll()?;

    assert!(session.right.links().is_empty());
    assert_eq!(session.worker.state()?.link_count(LinkGroupStatus::Completed), 1);
    Ok(())
}

#[test]
fn refused_link_blocks_its_group() -> Result<(), Box<dyn std::error::Error>> {
    let mut session = TestSession::new()?;
    session.right.reject_links("parent", "link-locked");
    session.left.link_change(
        "l-1",
        vec![LinkChangeAction::new(
            LinkActionKind::Add,
            ArtifactLink::new("wi/1", "wi/2", "parent"),
        )],
    );

    let report = session.poll()?;
    assert_eq!(report.links_migrated, 0);
    let report = session.poll()?;
    assert_eq!(report.links_blocked, 1);

    assert!(session.right.links().is_empty());
    let state = session.worker.state()?;
    assert_eq!(state.unresolved_conflicts, 1);
    assert_eq!(state.link_count(LinkGroupStatus::ReadyForMigration), 1);
    Ok(())
}
