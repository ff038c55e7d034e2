use tandem_core::{
    change_group::{ChangeGroup, ChangeStatus},
    conflict::{ConflictResolutionRule, ConflictStatus, ConflictTarget, MigrationConflict},
    ids::*,
    link::{ArtifactLink, LinkActionKind, LinkActionStatus, LinkChangeAction, LinkChangeGroup, LinkGroupStatus},
};

use crate::error::StorageError;

/// Selects change groups for paged loading.
#[derive(Debug, Clone)]
pub struct GroupQuery {
    pub session_id: SessionId,
    pub source_id: Option<SourceId>,
    pub statuses: Vec<ChangeStatus>,
    /// Skip groups flagged as holding backlogged actions.
    pub exclude_backlogged: bool,
}

impl GroupQuery {
    pub fn session(session_id: SessionId) -> Self {
        Self {
            session_id,
            source_id: None,
            statuses: Vec::new(),
            exclude_backlogged: false,
        }
    }

    pub fn source(mut self, source_id: SourceId) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn status(mut self, status: ChangeStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn statuses(mut self, statuses: &[ChangeStatus]) -> Self {
        self.statuses.extend_from_slice(statuses);
        self
    }

    pub fn without_backlog(mut self) -> Self {
        self.exclude_backlogged = true;
        self
    }
}

/// Keyset page over execution order (or row id for link groups).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub after: i64,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { after: 0, limit }
    }

    pub fn after(after: i64, limit: usize) -> Self {
        Self { after, limit }
    }
}

/// Durable store for the migration pipeline. Every mutating call is a single
/// transaction.
pub trait Storage {
    // -- change groups --

    /// Persist new groups and their actions atomically, assigning row ids and
    /// session-unique, increasing execution orders.
    fn create_change_groups(&mut self, groups: &mut [ChangeGroup]) -> Result<(), StorageError>;

    fn create_change_group(&mut self, group: &mut ChangeGroup) -> Result<(), StorageError> {
        self.create_change_groups(std::slice::from_mut(group))
    }

    /// Atomic status + action update. New actions are inserted and get ids.
    fn save_change_group(&mut self, group: &mut ChangeGroup) -> Result<(), StorageError>;

    fn load_change_group(&self, group_id: ChangeGroupId) -> Result<Option<ChangeGroup>, StorageError>;

    fn load_change_groups(&self, query: &GroupQuery, page: Page) -> Result<Vec<ChangeGroup>, StorageError>;

    fn count_change_groups(&self, query: &GroupQuery) -> Result<u64, StorageError>;

    /// Move every matching group from `from` to `to` in one transaction.
    fn transition_groups(
        &mut self,
        session_id: SessionId,
        source_id: Option<SourceId>,
        from: ChangeStatus,
        to: ChangeStatus,
    ) -> Result<usize, StorageError>;

    /// Any group with this name that is not Obsolete.
    fn find_live_group_by_name(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
    ) -> Result<Option<ChangeGroupId>, StorageError>;

    fn has_completed_group(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
    ) -> Result<bool, StorageError>;

    /// Non-terminal groups of `source_id` with an action reading or writing `path`.
    fn groups_touching_path(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        path: &str,
    ) -> Result<Vec<ChangeGroupId>, StorageError>;

    /// An artifact-creating action on `path` that has not completed yet.
    fn has_pending_create(&self, session_id: SessionId, path: &str) -> Result<bool, StorageError>;

    fn is_path_backlogged(&self, session_id: SessionId, path: &str) -> Result<bool, StorageError>;

    fn group_status_counts(&self, session_id: SessionId) -> Result<Vec<(ChangeStatus, u64)>, StorageError>;

    /// Remember which peer-side change a migrated group became.
    fn record_conversion(
        &mut self,
        session_id: SessionId,
        source_id: SourceId,
        source_change: &str,
        peer_source_id: SourceId,
        peer_change: &str,
    ) -> Result<(), StorageError>;

    fn peer_change_id(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        source_change: &str,
    ) -> Result<Option<String>, StorageError>;

    /// The change named `change_name` on `source_id` was written by the sync.
    fn is_sync_generated(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        change_name: &str,
    ) -> Result<bool, StorageError>;

    // -- conflicts and rules --

    fn insert_conflict(&mut self, conflict: &mut MigrationConflict) -> Result<(), StorageError>;

    fn update_conflict(&mut self, conflict: &MigrationConflict) -> Result<(), StorageError>;

    fn get_conflict(&self, conflict_id: ConflictId) -> Result<Option<MigrationConflict>, StorageError>;

    fn conflicts_for_target(&self, target: ConflictTarget) -> Result<Vec<MigrationConflict>, StorageError>;

    fn conflicts_with_status(
        &self,
        session_id: SessionId,
        status: ConflictStatus,
    ) -> Result<Vec<MigrationConflict>, StorageError>;

    fn conflicts_for_group(&self, group_id: ChangeGroupId) -> Result<Vec<MigrationConflict>, StorageError>;

    /// A resolved conflict of this type exists for the target's current content.
    fn has_resolved_conflict(
        &self,
        target: ConflictTarget,
        conflict_type: &str,
        fingerprint: Option<Fingerprint>,
    ) -> Result<bool, StorageError>;

    fn insert_rule(&mut self, rule: &mut ConflictResolutionRule) -> Result<(), StorageError>;

    fn get_rule(&self, rule_id: RuleId) -> Result<Option<ConflictResolutionRule>, StorageError>;

    fn rules_for_type(
        &self,
        session_id: SessionId,
        conflict_type: &str,
    ) -> Result<Vec<ConflictResolutionRule>, StorageError>;

    // -- checkpoints --

    fn read_checkpoint(
        &self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
    ) -> Result<Option<String>, StorageError>;

    fn write_checkpoint(
        &mut self,
        session_id: SessionId,
        source_id: SourceId,
        name: &str,
        value: &str,
    ) -> Result<(), StorageError>;

    // -- links --

    fn create_link_group(&mut self, group: &mut LinkChangeGroup) -> Result<(), StorageError>;

    fn save_link_group(&mut self, group: &mut LinkChangeGroup) -> Result<(), StorageError>;

    fn load_link_group(&self, group_id: LinkGroupId) -> Result<Option<LinkChangeGroup>, StorageError>;

    fn load_link_groups(
        &self,
        session_id: SessionId,
        statuses: &[LinkGroupStatus],
        page: Page,
    ) -> Result<Vec<LinkChangeGroup>, StorageError>;

    fn load_link_action(&self, action_id: LinkActionId) -> Result<Option<LinkChangeAction>, StorageError>;

    /// Actions on the same link, oldest first.
    fn find_link_actions(
        &self,
        session_id: SessionId,
        link: &ArtifactLink,
        kind: Option<LinkActionKind>,
        statuses: &[LinkActionStatus],
    ) -> Result<Vec<LinkChangeAction>, StorageError>;

    fn update_link_action_status(
        &mut self,
        action_id: LinkActionId,
        status: LinkActionStatus,
    ) -> Result<(), StorageError>;

    /// A completed action whose peer-side change id is `server_change_id`.
    fn is_link_change_from_sync(
        &self,
        session_id: SessionId,
        server_change_id: &str,
    ) -> Result<bool, StorageError>;

    fn link_group_status_counts(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<(LinkGroupStatus, u64)>, StorageError>;
}
