use tandem_core::{
    ActionKind, ChangeGroup, DetectionPoint, MigrationAction, MigrationConflict, SessionId, SourceId,
};
use tandem_storage::Storage;

use crate::error::EngineError;

pub const PATH_NOT_MAPPED: &str = "path-not-mapped";
pub const EDIT_EDIT: &str = "edit-edit";
pub const CONTENT_MISMATCH: &str = "content-mismatch";
pub const LINK_TARGET_PENDING: &str = "link-target-pending";
pub const ITEM_MISSING_ON_PEER: &str = "item-missing-on-peer";

/// Read-only view handed to conflict detection.
pub struct DetectionContext<'a> {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub peer_source_id: SourceId,
    pub point: DetectionPoint,
    pub group: &'a ChangeGroup,
    /// Peer-side path of the action; `None` when translation failed or has
    /// not run yet.
    pub translated_path: Option<&'a str>,
    /// Post-migration content comparison, when one was made.
    pub content_differs: Option<bool>,
    /// Whether the peer has the item at `translated_path`, when it was asked.
    pub peer_has_item: Option<bool>,
    pub store: &'a dyn Storage,
}

impl<'a> DetectionContext<'a> {
    pub fn new(
        point: DetectionPoint,
        group: &'a ChangeGroup,
        peer_source_id: SourceId,
        store: &'a dyn Storage,
    ) -> Self {
        Self {
            session_id: group.session_id,
            source_id: group.source_id,
            peer_source_id,
            point,
            group,
            translated_path: None,
            content_differs: None,
            peer_has_item: None,
            store,
        }
    }

    pub fn with_translated_path(mut self, path: Option<&'a str>) -> Self {
        self.translated_path = path;
        self
    }

    pub fn with_content_differs(mut self, differs: bool) -> Self {
        self.content_differs = Some(differs);
        self
    }

    pub fn with_peer_has_item(mut self, exists: bool) -> Self {
        self.peer_has_item = Some(exists);
        self
    }

    pub fn conflict_for(&self, conflict_type: &str, action: &MigrationAction) -> MigrationConflict {
        MigrationConflict::for_action(self.session_id, self.source_id, conflict_type, action)
    }
}

/// A kind of disagreement between the two sides. Detection only reads; any
/// change to the pipeline happens through resolution.
pub trait ConflictType: Send + Sync {
    fn reference_name(&self) -> &str;

    fn friendly_name(&self) -> &str;

    fn detection_points(&self) -> &[DetectionPoint];

    /// Reference names of the resolution actions rules may use.
    fn supported_actions(&self) -> &[&'static str];

    fn supports_multiple_retry(&self) -> bool {
        false
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
    ) -> Result<Option<MigrationConflict>, EngineError>;
}

/// Raised before migration when an action's path has no peer equivalent.
pub struct PathNotMapped;

impl ConflictType for PathNotMapped {
    fn reference_name(&self) -> &str {
        PATH_NOT_MAPPED
    }

    fn friendly_name(&self) -> &str {
        "Path is not mapped"
    }

    fn detection_points(&self) -> &[DetectionPoint] {
        &[DetectionPoint::PreMigration]
    }

    fn supported_actions(&self) -> &[&'static str] {
        &["skip-action", "skip-group", "update-path", "change-mapping", "schedule-retry"]
    }

    fn supports_multiple_retry(&self) -> bool {
        true
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        if ctx.translated_path.is_some() {
            return Ok(None);
        }
        Ok(Some(
            ctx.conflict_for(PATH_NOT_MAPPED, action)
                .with_details(format!("no mapping covers {}", action.path)),
        ))
    }
}

/// The peer has an unfinished change to the same artifact.
pub struct EditEdit;

impl ConflictType for EditEdit {
    fn reference_name(&self) -> &str {
        EDIT_EDIT
    }

    fn friendly_name(&self) -> &str {
        "Both sides changed the same item"
    }

    fn detection_points(&self) -> &[DetectionPoint] {
        &[DetectionPoint::PreMigration]
    }

    fn supported_actions(&self) -> &[&'static str] {
        &["auto-resolve", "skip-action", "skip-group", "schedule-retry"]
    }

    fn supports_multiple_retry(&self) -> bool {
        true
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        if !matches!(
            action.kind,
            ActionKind::Edit | ActionKind::Delete | ActionKind::Rename | ActionKind::Merge
        ) {
            return Ok(None);
        }
        let Some(peer_path) = ctx.translated_path else {
            return Ok(None);
        };
        let peers = ctx
            .store
            .groups_touching_path(ctx.session_id, ctx.peer_source_id, peer_path)?;
        if peers.is_empty() {
            return Ok(None);
        }
        let ids: Vec<String> = peers.iter().map(|id| id.to_string()).collect();
        Ok(Some(ctx.conflict_for(EDIT_EDIT, action).with_details(format!(
            "{} {} on both sides; peer groups {}",
            action.kind.as_str(),
            action.path,
            ids.join(",")
        ))))
    }
}

/// Post-migration verification found different content on the peer.
pub struct ContentMismatch;

impl ConflictType for ContentMismatch {
    fn reference_name(&self) -> &str {
        CONTENT_MISMATCH
    }

    fn friendly_name(&self) -> &str {
        "Migrated content differs"
    }

    fn detection_points(&self) -> &[DetectionPoint] {
        &[DetectionPoint::PostMigration]
    }

    fn supported_actions(&self) -> &[&'static str] {
        &["auto-resolve", "skip-action"]
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        if ctx.content_differs != Some(true) {
            return Ok(None);
        }
        Ok(Some(
            ctx.conflict_for(CONTENT_MISMATCH, action)
                .with_details(format!("peer content for {} does not match the source", action.path)),
        ))
    }
}

/// An edit of an item the peer does not have and no earlier change will
/// create there.
pub struct ItemMissingOnPeer;

impl ConflictType for ItemMissingOnPeer {
    fn reference_name(&self) -> &str {
        ITEM_MISSING_ON_PEER
    }

    fn friendly_name(&self) -> &str {
        "Edited item does not exist on the peer"
    }

    fn detection_points(&self) -> &[DetectionPoint] {
        &[DetectionPoint::PreMigration]
    }

    fn supported_actions(&self) -> &[&'static str] {
        &["edit-to-add", "skip-action", "skip-group", "schedule-retry"]
    }

    fn supports_multiple_retry(&self) -> bool {
        true
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        if action.kind != ActionKind::Edit || ctx.peer_has_item != Some(false) {
            return Ok(None);
        }
        if ctx.store.has_pending_create(ctx.session_id, &action.path)? {
            return Ok(None);
        }
        let peer_path = ctx.translated_path.unwrap_or(&action.path);
        Ok(Some(
            ctx.conflict_for(ITEM_MISSING_ON_PEER, action)
                .with_details(format!("peer has no {peer_path} to edit")),
        ))
    }
}

/// A link whose endpoint still has an unmigrated create after the deferral
/// schedule ran out. Raised by the link pipeline, never by action detection.
pub struct LinkTargetPending;

impl ConflictType for LinkTargetPending {
    fn reference_name(&self) -> &str {
        LINK_TARGET_PENDING
    }

    fn friendly_name(&self) -> &str {
        "Link endpoint not migrated yet"
    }

    fn detection_points(&self) -> &[DetectionPoint] {
        &[]
    }

    fn supported_actions(&self) -> &[&'static str] {
        &["skip-action", "auto-resolve", "schedule-retry"]
    }

    fn supports_multiple_retry(&self) -> bool {
        true
    }

    fn detect(
        &self,
        _ctx: &DetectionContext<'_>,
        _action: &MigrationAction,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        Ok(None)
    }
}

pub fn builtin_conflict_types() -> Vec<Box<dyn ConflictType>> {
    vec![
        Box::new(PathNotMapped),
        Box::new(EditEdit),
        Box::new(ContentMismatch),
        Box::new(ItemMissingOnPeer),
        Box::new(LinkTargetPending),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::ActionId;
    use tandem_storage::SqliteStorage;

    fn group_with(session: SessionId, source: SourceId, kind: ActionKind, path: &str) -> ChangeGroup {
        let mut g = ChangeGroup::new(session, source, "cs-1");
        g.add_action(MigrationAction::new(kind, path));
        g
    }

    #[test]
    fn unmapped_path_raised_only_without_translation() -> Result<(), EngineError> {
        let store = SqliteStorage::open_in_memory()?;
        let group = group_with(SessionId::new(), SourceId::new(), ActionKind::Add, "/X/a.txt");
        let ctx = DetectionContext::new(DetectionPoint::PreMigration, &group, SourceId::new(), &store);
        let conflict = PathNotMapped.detect(&ctx, &group.actions[0])?.unwrap();
        assert_eq!(conflict.conflict_type, PATH_NOT_MAPPED);
        assert_eq!(conflict.scope_hint, "/X/a.txt");

        let ctx = ctx.with_translated_path(Some("/Y/a.txt"));
        assert!(PathNotMapped.detect(&ctx, &group.actions[0])?.is_none());
        Ok(())
    }

    #[test]
    fn edit_edit_needs_an_open_peer_group() -> Result<(), EngineError> {
        let mut store = SqliteStorage::open_in_memory()?;
        let (session, left, right) = (SessionId::new(), SourceId::new(), SourceId::new());

        let mut mine = group_with(session, left, ActionKind::Edit, "/A/b.txt");
        store.create_change_group(&mut mine)?;
        let ctx = DetectionContext::new(DetectionPoint::PreMigration, &mine, right, &store)
            .with_translated_path(Some("/A/b.txt"));
        assert!(EditEdit.detect(&ctx, &mine.actions[0])?.is_none());

        let mut theirs = group_with(session, right, ActionKind::Edit, "/a/B.txt");
        store.create_change_group(&mut theirs)?;
        store.transition_groups(session, Some(right), tandem_core::ChangeStatus::Delta, tandem_core::ChangeStatus::Pending)?;

        let ctx = DetectionContext::new(DetectionPoint::PreMigration, &mine, right, &store)
            .with_translated_path(Some("/A/b.txt"));
        let conflict = EditEdit.detect(&ctx, &mine.actions[0])?.unwrap();
        assert_eq!(conflict.group_id, Some(mine.group_id));
        assert_ne!(conflict.target, tandem_core::ConflictTarget::Action(ActionId::UNSAVED));

        let add = MigrationAction::new(ActionKind::Add, "/A/b.txt");
        assert!(EditEdit.detect(&ctx, &add)?.is_none());
        Ok(())
    }

    #[test]
    fn missing_item_needs_a_peer_answer_and_no_pending_create() -> Result<(), EngineError> {
        let mut store = SqliteStorage::open_in_memory()?;
        let (session, left) = (SessionId::new(), SourceId::new());
        let mut mine = group_with(session, left, ActionKind::Edit, "/A/b.txt");
        store.create_change_group(&mut mine)?;
        let edit = mine.actions[0].clone();

        let ctx = DetectionContext::new(DetectionPoint::PreMigration, &mine, SourceId::new(), &store)
            .with_translated_path(Some("/M/b.txt"));
        assert!(ItemMissingOnPeer.detect(&ctx, &edit)?.is_none());
        let ctx = ctx.with_peer_has_item(true);
        assert!(ItemMissingOnPeer.detect(&ctx, &edit)?.is_none());
        let ctx = ctx.with_peer_has_item(false);
        let conflict = ItemMissingOnPeer.detect(&ctx, &edit)?.unwrap();
        assert_eq!(conflict.conflict_type, ITEM_MISSING_ON_PEER);
        assert!(conflict.details.contains("/M/b.txt"));
        let add = MigrationAction::new(ActionKind::Add, "/A/b.txt");
        assert!(ItemMissingOnPeer.detect(&ctx, &add)?.is_none());

        let mut creating = group_with(session, left, ActionKind::Add, "/A/b.txt");
        creating.status = tandem_core::ChangeStatus::Pending;
        store.create_change_group(&mut creating)?;
        let ctx = DetectionContext::new(DetectionPoint::PreMigration, &mine, SourceId::new(), &store)
            .with_translated_path(Some("/M/b.txt"))
            .with_peer_has_item(false);
        assert!(ItemMissingOnPeer.detect(&ctx, &edit)?.is_none());
        Ok(())
    }

    #[test]
    fn content_mismatch_only_when_verified_different() -> Result<(), EngineError> {
        let store = SqliteStorage::open_in_memory()?;
        let group = group_with(SessionId::new(), SourceId::new(), ActionKind::Edit, "/a");
        let ctx = DetectionContext::new(DetectionPoint::PostMigration, &group, SourceId::new(), &store);
        assert!(ContentMismatch.detect(&ctx, &group.actions[0])?.is_none());
        let ctx = ctx.with_content_differs(true);
        assert!(ContentMismatch.detect(&ctx, &group.actions[0])?.is_some());
        Ok(())
    }
}
