use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkTargetKind {
    WorkItem,
    VersionControl,
}

impl LinkTargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkItem => "work_item",
            Self::VersionControl => "version_control",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "work_item" => Ok(Self::WorkItem),
            "version_control" => Ok(Self::VersionControl),
            _ => Err(CoreError::InvalidStatus(format!("unknown link target kind: {s}"))),
        }
    }
}

/// A relationship between two artifacts. Artifacts are addressed by the
/// same paths/uris used by migration actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLink {
    pub source_artifact_id: String,
    pub source_uri: String,
    pub target_uri: String,
    pub link_type: String,
    pub comment: String,
    pub is_locked: bool,
    pub target_kind: LinkTargetKind,
}

impl ArtifactLink {
    pub fn new(
        source_uri: impl Into<String>,
        target_uri: impl Into<String>,
        link_type: impl Into<String>,
    ) -> Self {
        let source_uri = source_uri.into();
        Self {
            source_artifact_id: source_uri.clone(),
            source_uri,
            target_uri: target_uri.into(),
            link_type: link_type.into(),
            comment: String::new(),
            is_locked: false,
            target_kind: LinkTargetKind::WorkItem,
        }
    }

    pub fn with_target_kind(mut self, target_kind: LinkTargetKind) -> Self {
        self.target_kind = target_kind;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Identity of the relationship regardless of direction of change.
    pub fn same_link(&self, other: &ArtifactLink) -> bool {
        self.source_uri.eq_ignore_ascii_case(&other.source_uri)
            && self.target_uri.eq_ignore_ascii_case(&other.target_uri)
            && self.link_type.eq_ignore_ascii_case(&other.link_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkActionKind {
    Add,
    Delete,
}

impl LinkActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "add" => Ok(Self::Add),
            "delete" => Ok(Self::Delete),
            _ => Err(CoreError::InvalidStatus(format!("unknown link action kind: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkActionStatus {
    Created,
    Translated,
    ReadyForMigration,
    Completed,
    DeltaCompleted,
    Skipped,
    /// An Add made redundant by a later Delete of the same link.
    Superseded,
    SkipScopedOutVCLinks,
    SkipScopedOutWILinks,
}

impl LinkActionStatus {
    pub const ALL: [LinkActionStatus; 9] = [
        Self::Created,
        Self::Translated,
        Self::ReadyForMigration,
        Self::Completed,
        Self::DeltaCompleted,
        Self::Skipped,
        Self::Superseded,
        Self::SkipScopedOutVCLinks,
        Self::SkipScopedOutWILinks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Translated => "translated",
            Self::ReadyForMigration => "ready_for_migration",
            Self::Completed => "completed",
            Self::DeltaCompleted => "delta_completed",
            Self::Skipped => "skipped",
            Self::Superseded => "superseded",
            Self::SkipScopedOutVCLinks => "skip_scoped_out_vc_links",
            Self::SkipScopedOutWILinks => "skip_scoped_out_wi_links",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidStatus(format!("unknown link action status: {s}")))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::Created | Self::Translated | Self::ReadyForMigration
        )
    }

    pub fn is_special_skip(&self) -> bool {
        matches!(self, Self::SkipScopedOutVCLinks | Self::SkipScopedOutWILinks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkGroupStatus {
    Created,
    InAnalysis,
    InAnalysisDeferred,
    InAnalysisTranslated,
    ReadyForMigration,
    Completed,
}

impl LinkGroupStatus {
    pub const ALL: [LinkGroupStatus; 6] = [
        Self::Created,
        Self::InAnalysis,
        Self::InAnalysisDeferred,
        Self::InAnalysisTranslated,
        Self::ReadyForMigration,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InAnalysis => "in_analysis",
            Self::InAnalysisDeferred => "in_analysis_deferred",
            Self::InAnalysisTranslated => "in_analysis_translated",
            Self::ReadyForMigration => "ready_for_migration",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidStatus(format!("unknown link group status: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChangeAction {
    pub action_id: LinkActionId,
    pub group_id: LinkGroupId,
    pub kind: LinkActionKind,
    pub link: ArtifactLink,
    pub status: LinkActionStatus,
    pub conflicted: bool,
    /// Set when the peer reported this change as written by the sync process.
    pub server_link_change_id: Option<String>,
}

impl LinkChangeAction {
    pub fn new(kind: LinkActionKind, link: ArtifactLink) -> Self {
        Self {
            action_id: LinkActionId::UNSAVED,
            group_id: LinkGroupId::UNSAVED,
            kind,
            link,
            status: LinkActionStatus::Created,
            conflicted: false,
            server_link_change_id: None,
        }
    }

    pub fn with_server_link_change_id(mut self, id: impl Into<String>) -> Self {
        self.server_link_change_id = Some(id.into());
        self
    }

    /// Same relationship, same direction of change.
    pub fn is_duplicate_of(&self, other: &LinkChangeAction) -> bool {
        self.kind == other.kind && self.link.same_link(&other.link)
    }

    /// Endpoints the link cannot be written before they exist.
    pub fn endpoints(&self) -> [&str; 2] {
        [self.link.source_uri.as_str(), self.link.target_uri.as_str()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChangeGroup {
    pub group_id: LinkGroupId,
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub name: String,
    pub status: LinkGroupStatus,
    pub contains_conflicted: bool,
    /// Deferral age; indexes the retry schedule.
    pub age: u32,
    pub retries_at_age: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub actions: Vec<LinkChangeAction>,
}

impl LinkChangeGroup {
    pub fn new(session_id: SessionId, source_id: SourceId, name: impl Into<String>) -> Self {
        Self {
            group_id: LinkGroupId::UNSAVED,
            session_id,
            source_id,
            name: name.into(),
            status: LinkGroupStatus::Created,
            contains_conflicted: false,
            age: 0,
            retries_at_age: 0,
            next_attempt_at: None,
            actions: Vec::new(),
        }
    }

    pub fn add_action(&mut self, mut action: LinkChangeAction) {
        action.group_id = self.group_id;
        self.actions.push(action);
    }

    /// Every action finished without needing migration.
    pub fn is_completed(&self) -> bool {
        self.actions.iter().all(|a| {
            matches!(
                a.status,
                LinkActionStatus::Skipped
                    | LinkActionStatus::Completed
                    | LinkActionStatus::DeltaCompleted
                    | LinkActionStatus::Superseded
            ) || a.status.is_special_skip()
        })
    }

    /// True when there is at least one ReadyForMigration action and every
    /// such action is conflicted. Skipped actions do not count either way.
    pub fn all_ready_actions_conflicted(&self) -> bool {
        let mut ready = self
            .actions
            .iter()
            .filter(|a| a.status == LinkActionStatus::ReadyForMigration)
            .peekable();
        ready.peek().is_some() && ready.all(|a| a.conflicted)
    }

    /// A non-terminal action that is not conflicted keeps the group open.
    pub fn has_blocking_actions(&self) -> bool {
        self.actions
            .iter()
            .any(|a| !a.status.is_terminal() && !a.conflicted)
    }

    pub fn refresh_conflict_flag(&mut self) {
        self.contains_conflicted = self.actions.iter().any(|a| a.conflicted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(kind: LinkActionKind, status: LinkActionStatus, conflicted: bool) -> LinkChangeAction {
        let mut a = LinkChangeAction::new(kind, ArtifactLink::new("wi/1", "wi/2", "parent"));
        a.status = status;
        a.conflicted = conflicted;
        a
    }

    fn group(actions: Vec<LinkChangeAction>) -> LinkChangeGroup {
        let mut g = LinkChangeGroup::new(SessionId::new(), SourceId::new(), "links-1");
        for a in actions {
            g.add_action(a);
        }
        g
    }

    #[test]
    fn all_conflicted_needs_at_least_one_ready_action() {
        assert!(!group(vec![]).all_ready_actions_conflicted());
        let g = group(vec![
            action(LinkActionKind::Add, LinkActionStatus::ReadyForMigration, true),
            action(LinkActionKind::Add, LinkActionStatus::Skipped, false),
        ]);
        assert!(g.all_ready_actions_conflicted());
        let g = group(vec![
            action(LinkActionKind::Add, LinkActionStatus::ReadyForMigration, true),
            action(LinkActionKind::Delete, LinkActionStatus::ReadyForMigration, false),
        ]);
        assert!(!g.all_ready_actions_conflicted());
    }

    #[test]
    fn completion_ignores_skips_and_supersedes() {
        let g = group(vec![
            action(LinkActionKind::Add, LinkActionStatus::Superseded, false),
            action(LinkActionKind::Delete, LinkActionStatus::Skipped, false),
            action(LinkActionKind::Add, LinkActionStatus::SkipScopedOutVCLinks, false),
        ]);
        assert!(g.is_completed());
        assert!(!g.has_blocking_actions());
    }

    #[test]
    fn mixed_skip_and_conflict_does_not_block() {
        let g = group(vec![
            action(LinkActionKind::Add, LinkActionStatus::Skipped, false),
            action(LinkActionKind::Add, LinkActionStatus::ReadyForMigration, true),
        ]);
        assert!(!g.has_blocking_actions());
        assert!(!g.is_completed());
    }

    #[test]
    fn same_link_ignores_case_and_kind() {
        let a = ArtifactLink::new("WI/1", "wi/2", "Parent");
        let b = ArtifactLink::new("wi/1", "WI/2", "parent");
        assert!(a.same_link(&b));
        let add = LinkChangeAction::new(LinkActionKind::Add, a);
        let del = LinkChangeAction::new(LinkActionKind::Delete, b);
        assert!(!add.is_duplicate_of(&del));
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in LinkActionStatus::ALL {
            assert_eq!(LinkActionStatus::parse(s.as_str()).unwrap(), s);
        }
        for s in LinkGroupStatus::ALL {
            assert_eq!(LinkGroupStatus::parse(s.as_str()).unwrap(), s);
        }
    }
}
