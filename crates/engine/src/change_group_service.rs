use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use tandem_core::{
    ActionId, ActionStatus, ChangeGroup, ChangeGroupId, ChangeStatus, ConflictResolutionResult, MigrationAction,
    ResolutionCategory, SessionId, SourceId,
};
use tandem_storage::{GroupQuery, Page, Storage};

use crate::adapter::{DetectedAction, map_prefix};
use crate::config::SessionConfig;
use crate::context::RunContext;
use crate::error::EngineError;

/// Folds a flat stream of detected actions into change groups.
///
/// A new group starts when the change name differs, when a path or
/// from-path would be touched twice, when owner or comment differ, or when
/// the gap between action times exceeds the span. A change split this way
/// gets `#n` suffixed names so every group keeps a distinct idempotence key.
pub struct DeltaTableBuilder {
    session_id: SessionId,
    source_id: SourceId,
    max_span_secs: i64,
    groups: Vec<ChangeGroup>,
    current_change: Option<String>,
    current_paths: HashSet<String>,
    last_time: Option<DateTime<Utc>>,
    splits: HashMap<String, u32>,
}

impl DeltaTableBuilder {
    pub fn new(session_id: SessionId, source_id: SourceId, max_span_secs: u64) -> Self {
        Self {
            session_id,
            source_id,
            max_span_secs: i64::try_from(max_span_secs).unwrap_or(i64::MAX),
            groups: Vec::new(),
            current_change: None,
            current_paths: HashSet::new(),
            last_time: None,
            splits: HashMap::new(),
        }
    }

    pub fn push(&mut self, detected: DetectedAction) {
        if self.needs_new_group(&detected) {
            self.start_group(&detected);
        }
        self.current_paths.insert(detected.path.to_lowercase());
        if let Some(from) = &detected.from_path {
            self.current_paths.insert(from.to_lowercase());
        }
        self.last_time = Some(detected.change_time);

        let mut action = MigrationAction::new(detected.kind, detected.path)
            .with_item(detected.item)
            .with_content_type(detected.content_type);
        action.from_path = detected.from_path;
        action.version = detected.version;
        if let Some(group) = self.groups.last_mut() {
            group.add_action(action);
        }
    }

    pub fn finish(self) -> Vec<ChangeGroup> {
        self.groups
    }

    fn needs_new_group(&self, detected: &DetectedAction) -> bool {
        let Some(group) = self.groups.last() else {
            return true;
        };
        if self.current_change.as_deref() != Some(detected.change_name.as_str()) {
            return true;
        }
        if self.current_paths.contains(&detected.path.to_lowercase()) {
            return true;
        }
        if let Some(from) = &detected.from_path {
            if self.current_paths.contains(&from.to_lowercase()) {
                return true;
            }
        }
        if group.owner != detected.owner || group.comment != detected.comment {
            return true;
        }
        match self.last_time {
            Some(last) => (detected.change_time - last).num_seconds().abs() > self.max_span_secs,
            None => false,
        }
    }

    fn start_group(&mut self, detected: &DetectedAction) {
        let seen = self.splits.entry(detected.change_name.clone()).or_insert(0);
        let name = if *seen == 0 {
            detected.change_name.clone()
        } else {
            format!("{}#{}", detected.change_name, seen)
        };
        *seen += 1;

        let mut group = ChangeGroup::new(self.session_id, self.source_id, name)
            .with_comment(detected.comment.clone())
            .with_change_time(detected.change_time);
        group.owner = detected.owner.clone();
        self.groups.push(group);
        self.current_change = Some(detected.change_name.clone());
        self.current_paths.clear();
        self.last_time = None;
    }
}

/// Builds, persists and advances change groups. Groups are plain data; the
/// service only holds the session-wide settings and takes the store per call.
#[derive(Debug, Clone)]
pub struct ChangeGroupService {
    session_id: SessionId,
    page_size: usize,
    max_group_span_secs: u64,
}

impl ChangeGroupService {
    pub fn new(session_id: SessionId, page_size: usize, max_group_span_secs: u64) -> Self {
        Self {
            session_id,
            page_size: page_size.max(1),
            max_group_span_secs,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.session_id(), config.page_size, config.max_group_span_secs)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn build_delta_table(&self, source_id: SourceId, actions: Vec<DetectedAction>) -> Vec<ChangeGroup> {
        let mut builder = DeltaTableBuilder::new(self.session_id, source_id, self.max_group_span_secs);
        for action in actions {
            builder.push(action);
        }
        builder.finish()
    }

    /// Persist the delta table for one pass in a single transaction. Changes
    /// already recorded under the same name, and changes the sync itself
    /// wrote on this source, are dropped.
    pub fn create_delta_groups(
        &self,
        store: &mut dyn Storage,
        source_id: SourceId,
        actions: Vec<DetectedAction>,
    ) -> Result<Vec<ChangeGroup>, EngineError> {
        let mut groups = Vec::new();
        for group in self.build_delta_table(source_id, actions) {
            if group.actions.is_empty() {
                continue;
            }
            if store
                .find_live_group_by_name(self.session_id, source_id, &group.name)?
                .is_some()
            {
                tracing::debug!(session = %self.session_id, group = %group.name, "change already recorded");
                continue;
            }
            if store.is_sync_generated(self.session_id, source_id, &group.name)? {
                tracing::debug!(session = %self.session_id, group = %group.name, "skipping change written by sync");
                continue;
            }
            groups.push(group);
        }
        if !groups.is_empty() {
            store.create_change_groups(&mut groups)?;
            tracing::info!(
                session = %self.session_id,
                source = %source_id,
                count = groups.len(),
                "delta groups created"
            );
        }
        Ok(groups)
    }

    /// Delta -> Pending for everything one source produced in a pass.
    pub fn promote_delta_to_pending(&self, store: &mut dyn Storage, source_id: SourceId) -> Result<usize, EngineError> {
        Ok(store.transition_groups(self.session_id, Some(source_id), ChangeStatus::Delta, ChangeStatus::Pending)?)
    }

    /// Groups left in Delta by a pass that never promoted them.
    pub fn remove_incomplete_change_groups(&self, store: &mut dyn Storage) -> Result<usize, EngineError> {
        let removed = store.transition_groups(self.session_id, None, ChangeStatus::Delta, ChangeStatus::Obsolete)?;
        if removed > 0 {
            tracing::warn!(session = %self.session_id, removed, "obsoleted groups from an unfinished delta pass");
        }
        Ok(removed)
    }

    pub fn demote_in_progress_to_pending(&self, store: &mut dyn Storage) -> Result<usize, EngineError> {
        let demoted = store.transition_groups(self.session_id, None, ChangeStatus::InProgress, ChangeStatus::Pending)?;
        if demoted > 0 {
            tracing::warn!(session = %self.session_id, demoted, "re-queued groups interrupted mid-migration");
        }
        Ok(demoted)
    }

    pub fn requeue_backlogged(&self, store: &mut dyn Storage) -> Result<usize, EngineError> {
        Ok(store.transition_groups(self.session_id, None, ChangeStatus::Backlogged, ChangeStatus::Pending)?)
    }

    /// One page of groups in `statuses`, in execution order after `after`.
    pub fn next_page(
        &self,
        store: &dyn Storage,
        statuses: &[ChangeStatus],
        after: i64,
    ) -> Result<Vec<ChangeGroup>, EngineError> {
        let query = GroupQuery::session(self.session_id).statuses(statuses);
        Ok(store.load_change_groups(&query, Page::after(after, self.page_size))?)
    }

    pub fn next_delta_page(
        &self,
        store: &dyn Storage,
        source_id: SourceId,
        after: i64,
    ) -> Result<Vec<ChangeGroup>, EngineError> {
        let query = GroupQuery::session(self.session_id)
            .source(source_id)
            .status(ChangeStatus::Delta);
        Ok(store.load_change_groups(&query, Page::after(after, self.page_size))?)
    }

    /// Groups detected but not yet analysed.
    pub fn num_delta_entries(&self, store: &dyn Storage, source_id: Option<SourceId>) -> Result<u64, EngineError> {
        let mut query = GroupQuery::session(self.session_id).statuses(&[ChangeStatus::Delta, ChangeStatus::Pending]);
        if let Some(source_id) = source_id {
            query = query.source(source_id);
        }
        Ok(store.count_change_groups(&query)?)
    }

    pub fn load(&self, store: &dyn Storage, group_id: ChangeGroupId) -> Result<ChangeGroup, EngineError> {
        store
            .load_change_group(group_id)?
            .ok_or_else(|| EngineError::GroupNotFound(group_id.to_string()))
    }

    /// Validate the edge, then persist status and actions together.
    pub fn advance(
        &self,
        store: &mut dyn Storage,
        group: &mut ChangeGroup,
        next: ChangeStatus,
    ) -> Result<(), EngineError> {
        let from = group.status;
        group.transition(next)?;
        group.refresh_backlog_flag();
        store.save_change_group(group)?;
        if from != next {
            tracing::debug!(
                session = %self.session_id,
                group = %group.group_id,
                from = from.as_str(),
                to = next.as_str(),
                "group transition"
            );
        }
        Ok(())
    }

    pub fn is_change_completed(
        &self,
        store: &dyn Storage,
        source_id: SourceId,
        name: &str,
    ) -> Result<bool, EngineError> {
        Ok(store.has_completed_group(self.session_id, source_id, name)?)
    }

    /// Mark the group Complete and remember which peer change it became.
    pub fn complete(
        &self,
        store: &mut dyn Storage,
        group: &mut ChangeGroup,
        peer_source: SourceId,
        peer_change: &str,
    ) -> Result<(), EngineError> {
        for action in group.actions.iter_mut().filter(|a| a.is_migratable()) {
            action.status = ActionStatus::Complete;
        }
        self.advance(store, group, ChangeStatus::Complete)?;
        store.record_conversion(self.session_id, group.source_id, &group.name, peer_source, peer_change)?;
        tracing::info!(
            session = %self.session_id,
            group = %group.group_id,
            name = %group.name,
            peer_change,
            "group migrated"
        );
        Ok(())
    }

    /// Apply one resolution outcome to an action of `group`. Call with
    /// resolved outcomes first; an unresolved outcome backlogs the action
    /// unless an earlier outcome already finished it.
    pub fn apply_resolution(
        &self,
        group: &mut ChangeGroup,
        action_id: ActionId,
        result: &ConflictResolutionResult,
        ctx: &mut RunContext,
    ) -> Result<(), EngineError> {
        let source_id = group.source_id;
        let group_id = group.group_id;
        let mut suppress_group = false;
        let mut added = Vec::new();
        {
            let action = group.action_mut(action_id).ok_or_else(|| {
                EngineError::InvariantViolation(format!("action {action_id} is not in group {group_id}"))
            })?;

            if !result.resolved {
                if !action.status.is_terminal() {
                    action.status = ActionStatus::Backlogged;
                    action.conflicted = true;
                }
                group.contains_backlogged = true;
                return Ok(());
            }

            match result.category {
                ResolutionCategory::UpdateAction => {
                    if let Some(path) = &result.translated_path {
                        action.translated_path = Some(path.clone());
                    }
                    release(action);
                }
                ResolutionCategory::CreateNewActions => {
                    action.status = ActionStatus::Skipped;
                    action.conflicted = false;
                    added = result.new_actions.clone();
                }
                ResolutionCategory::SuppressAction => {
                    action.status = ActionStatus::Skipped;
                    action.conflicted = false;
                }
                ResolutionCategory::SuppressGroup => {
                    suppress_group = true;
                }
                ResolutionCategory::ChangeConfigMapping => {
                    if let Some((from, to)) = &result.mapping_override {
                        ctx.add_mapping_override(source_id, from, to);
                        if let Some(mapped) = map_prefix(&action.path, from, to) {
                            action.translated_path = Some(mapped);
                        }
                    }
                    release(action);
                }
                ResolutionCategory::ScheduleForRetry => {
                    action.status = ActionStatus::Backlogged;
                    action.conflicted = false;
                }
                ResolutionCategory::AutoResolve | ResolutionCategory::Other => {
                    release(action);
                }
            }
        }

        for new_action in added {
            group.add_action(new_action);
        }
        if suppress_group {
            for action in group.actions.iter_mut() {
                if !action.status.is_terminal() {
                    action.status = ActionStatus::Skipped;
                }
                action.conflicted = false;
            }
            group.transition(ChangeStatus::Skipped)?;
        }
        group.refresh_backlog_flag();
        tracing::debug!(
            session = %self.session_id,
            group = %group.group_id,
            action = %action_id,
            category = result.category.as_str(),
            "resolution applied"
        );
        Ok(())
    }
}

fn release(action: &mut MigrationAction) {
    if action.status != ActionStatus::Skipped {
        action.status = ActionStatus::Pending;
    }
    action.conflicted = false;
}
