use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::*;

/// Lifecycle of a change group. Stored as text; do not rename the variants'
/// string forms between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeStatus {
    Delta,
    Pending,
    InAnalysis,
    ReadyForMigration,
    InProgress,
    Complete,
    Backlogged,
    Skipped,
    DeltaCompleted,
    Obsolete,
}

impl ChangeStatus {
    pub const ALL: [ChangeStatus; 10] = [
        Self::Delta,
        Self::Pending,
        Self::InAnalysis,
        Self::ReadyForMigration,
        Self::InProgress,
        Self::Complete,
        Self::Backlogged,
        Self::Skipped,
        Self::DeltaCompleted,
        Self::Obsolete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::Pending => "pending",
            Self::InAnalysis => "in_analysis",
            Self::ReadyForMigration => "ready_for_migration",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Backlogged => "backlogged",
            Self::Skipped => "skipped",
            Self::DeltaCompleted => "delta_completed",
            Self::Obsolete => "obsolete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidStatus(format!("unknown change status: {s}")))
    }

    /// Terminal groups are never touched by a later pass.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Skipped | Self::DeltaCompleted | Self::Obsolete
        )
    }

    /// Forward-only state machine plus the explicit abort/retry edges.
    pub fn can_transition_to(&self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        if *self == next {
            return true;
        }
        match (*self, next) {
            (Delta, Pending)
            | (Pending, InAnalysis)
            | (InAnalysis, ReadyForMigration)
            | (InAnalysis, Pending)
            | (ReadyForMigration, InProgress)
            | (InProgress, Complete)
            | (InProgress, Pending)
            | (Backlogged, Pending) => true,
            (Delta | Pending | DeltaCompleted, DeltaCompleted) => true,
            (from, Backlogged) => !from.is_terminal() && from != Delta,
            (from, Skipped) | (from, Obsolete) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Add,
    Edit,
    Delete,
    Rename,
    Branch,
    Merge,
    Undelete,
    Label,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Branch => "branch",
            Self::Merge => "merge",
            Self::Undelete => "undelete",
            Self::Label => "label",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "add" => Ok(Self::Add),
            "edit" => Ok(Self::Edit),
            "delete" => Ok(Self::Delete),
            "rename" => Ok(Self::Rename),
            "branch" => Ok(Self::Branch),
            "merge" => Ok(Self::Merge),
            "undelete" => Ok(Self::Undelete),
            "label" => Ok(Self::Label),
            _ => Err(CoreError::InvalidStatus(format!("unknown action kind: {s}"))),
        }
    }

    /// Kinds that bring an artifact into existence on the peer.
    pub fn creates_artifact(&self) -> bool {
        matches!(self, Self::Add | Self::Branch | Self::Undelete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionStatus {
    Pending,
    Backlogged,
    Skipped,
    Complete,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Backlogged => "backlogged",
            Self::Skipped => "skipped",
            Self::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "backlogged" => Ok(Self::Backlogged),
            "skipped" => Ok(Self::Skipped),
            "complete" => Ok(Self::Complete),
            _ => Err(CoreError::InvalidStatus(format!("unknown action status: {s}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Complete)
    }
}

/// One operation inside a change group. `item` is the adapter's serialized
/// source item reference and is handed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationAction {
    pub action_id: ActionId,
    pub group_id: ChangeGroupId,
    pub order: u32,
    pub kind: ActionKind,
    pub path: String,
    pub from_path: Option<String>,
    pub content_type: String,
    pub item: String,
    pub version: Option<String>,
    pub translated_path: Option<String>,
    pub status: ActionStatus,
    pub conflicted: bool,
}

impl MigrationAction {
    pub fn new(kind: ActionKind, path: impl Into<String>) -> Self {
        Self {
            action_id: ActionId::UNSAVED,
            group_id: ChangeGroupId::UNSAVED,
            order: 0,
            kind,
            path: path.into(),
            from_path: None,
            content_type: String::new(),
            item: String::new(),
            version: None,
            translated_path: None,
            status: ActionStatus::Pending,
            conflicted: false,
        }
    }

    pub fn with_from_path(mut self, from_path: impl Into<String>) -> Self {
        self.from_path = Some(from_path.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = item.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Hash of everything that affects what gets written on the peer.
    /// Status, ids and translation results are excluded.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        for part in [
            self.kind.as_str(),
            self.path.as_str(),
            self.from_path.as_deref().unwrap_or(""),
            self.content_type.as_str(),
            self.item.as_str(),
            self.version.as_deref().unwrap_or(""),
        ] {
            hasher.update(&(part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Fingerprint::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Eligible for migration: not blocked and not already finished.
    pub fn is_migratable(&self) -> bool {
        self.status == ActionStatus::Pending && !self.conflicted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeGroup {
    pub group_id: ChangeGroupId,
    pub session_id: SessionId,
    pub source_id: SourceId,
    /// Source-side change identifier; the idempotence key.
    pub name: String,
    pub owner: Option<String>,
    pub comment: String,
    pub change_time: DateTime<Utc>,
    /// Assigned by the store at creation, unique per session.
    pub execution_order: i64,
    pub status: ChangeStatus,
    pub contains_backlogged: bool,
    pub actions: Vec<MigrationAction>,
}

impl ChangeGroup {
    pub fn new(session_id: SessionId, source_id: SourceId, name: impl Into<String>) -> Self {
        Self {
            group_id: ChangeGroupId::UNSAVED,
            session_id,
            source_id,
            name: name.into(),
            owner: None,
            comment: String::new(),
            change_time: Utc::now(),
            execution_order: 0,
            status: ChangeStatus::Delta,
            contains_backlogged: false,
            actions: Vec::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_change_time(mut self, change_time: DateTime<Utc>) -> Self {
        self.change_time = change_time;
        self
    }

    /// Append an action; its order is its position in the group.
    pub fn add_action(&mut self, mut action: MigrationAction) -> &mut MigrationAction {
        action.order = self.actions.len() as u32;
        action.group_id = self.group_id;
        self.actions.push(action);
        let last = self.actions.len() - 1;
        &mut self.actions[last]
    }

    pub fn transition(&mut self, next: ChangeStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status.as_str().into(),
                to: next.as_str().into(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Every path the group writes or reads from.
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.actions.iter().flat_map(|a| {
            std::iter::once(a.path.as_str()).chain(a.from_path.as_deref())
        })
    }

    pub fn action(&self, action_id: ActionId) -> Option<&MigrationAction> {
        self.actions.iter().find(|a| a.action_id == action_id)
    }

    pub fn action_mut(&mut self, action_id: ActionId) -> Option<&mut MigrationAction> {
        self.actions.iter_mut().find(|a| a.action_id == action_id)
    }

    /// Ready only when each action is migratable or explicitly finished.
    pub fn is_ready_for_migration(&self) -> bool {
        self.actions
            .iter()
            .all(|a| a.is_migratable() || a.status.is_terminal())
    }

    pub fn has_backlogged_actions(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.status == ActionStatus::Backlogged || a.conflicted)
    }

    /// Recompute the backlog flag from the actions.
    pub fn refresh_backlog_flag(&mut self) {
        self.contains_backlogged = self.has_backlogged_actions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> ChangeGroup {
        ChangeGroup::new(SessionId::new(), SourceId::new(), "cs-1")
    }

    #[test]
    fn forward_path_is_allowed() {
        let mut g = group();
        for next in [
            ChangeStatus::Pending,
            ChangeStatus::InAnalysis,
            ChangeStatus::ReadyForMigration,
            ChangeStatus::InProgress,
            ChangeStatus::Complete,
        ] {
            g.transition(next).unwrap();
        }
        assert_eq!(g.status, ChangeStatus::Complete);
    }

    #[test]
    fn backwards_transition_rejected() {
        let mut g = group();
        g.transition(ChangeStatus::Pending).unwrap();
        g.transition(ChangeStatus::InAnalysis).unwrap();
        g.transition(ChangeStatus::ReadyForMigration).unwrap();
        let err = g.transition(ChangeStatus::Delta).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(g.status, ChangeStatus::ReadyForMigration);
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [
            ChangeStatus::Complete,
            ChangeStatus::Skipped,
            ChangeStatus::Obsolete,
        ] {
            assert!(!terminal.can_transition_to(ChangeStatus::Pending));
            assert!(!terminal.can_transition_to(ChangeStatus::Backlogged));
        }
    }

    #[test]
    fn backlog_and_retry_edges() {
        assert!(ChangeStatus::InProgress.can_transition_to(ChangeStatus::Backlogged));
        assert!(ChangeStatus::Backlogged.can_transition_to(ChangeStatus::Pending));
        assert!(ChangeStatus::InProgress.can_transition_to(ChangeStatus::Pending));
        assert!(!ChangeStatus::Delta.can_transition_to(ChangeStatus::Backlogged));
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in ChangeStatus::ALL {
            assert_eq!(ChangeStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ChangeStatus::parse("bogus").is_err());
    }

    #[test]
    fn fingerprint_ignores_status_but_not_content() {
        let a = MigrationAction::new(ActionKind::Edit, "/A/b.txt").with_item("v1");
        let mut b = a.clone();
        b.status = ActionStatus::Backlogged;
        b.conflicted = true;
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = MigrationAction::new(ActionKind::Edit, "/A/b.txt").with_item("v2");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn fingerprint_separates_fields() {
        let a = MigrationAction::new(ActionKind::Rename, "/ab").with_from_path("/c");
        let b = MigrationAction::new(ActionKind::Rename, "/a").with_from_path("b/c");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn readiness_requires_unblocked_actions() {
        let mut g = group();
        g.add_action(MigrationAction::new(ActionKind::Add, "/A/x"));
        g.add_action(MigrationAction::new(ActionKind::Edit, "/A/y"));
        assert!(g.is_ready_for_migration());

        g.actions[1].status = ActionStatus::Backlogged;
        g.actions[1].conflicted = true;
        assert!(!g.is_ready_for_migration());
        g.refresh_backlog_flag();
        assert!(g.contains_backlogged);

        g.actions[1].status = ActionStatus::Skipped;
        g.actions[1].conflicted = false;
        assert!(g.is_ready_for_migration());
    }

    #[test]
    fn touched_paths_include_from_path() {
        let mut g = group();
        g.add_action(MigrationAction::new(ActionKind::Rename, "/new").with_from_path("/old"));
        let paths: Vec<&str> = g.touched_paths().collect();
        assert_eq!(paths, vec!["/new", "/old"]);
        assert_eq!(g.actions[0].order, 0);
    }
}
