use chrono::{DateTime, Duration, Utc};

use tandem_core::{
    ArtifactLink, ConflictResolutionResult, ConflictTarget, LinkActionId, LinkActionKind,
    LinkActionStatus, LinkChangeAction, LinkChangeGroup, LinkGroupStatus, LinkTargetKind,
    MigrationConflict, ResolutionCategory, ResolvedBy, SessionId, SourceId,
};
use tandem_storage::{Page, Storage};

use crate::adapter::{Adapter, LinkApplyOutcome, TranslationService};
use crate::config::{AgeStep, SessionConfig};
use crate::conflict_manager::ConflictManager;
use crate::conflict_types::LINK_TARGET_PENDING;
use crate::context::RunContext;
use crate::error::EngineError;

const ACTIVE: [LinkActionStatus; 3] = [
    LinkActionStatus::Created,
    LinkActionStatus::Translated,
    LinkActionStatus::ReadyForMigration,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMigrationOutcome {
    /// Every action reached a terminal status.
    Completed,
    /// Some actions were written; others wait on conflicts.
    Partial,
    /// Every ready action is conflicted; nothing was written.
    Blocked,
}

/// Apply a resolution outcome to one action of a link group.
pub fn apply_link_resolution(
    group: &mut LinkChangeGroup,
    action_id: LinkActionId,
    result: &ConflictResolutionResult,
) -> Result<(), EngineError> {
    let group_id = group.group_id;
    let index = group
        .actions
        .iter()
        .position(|a| a.action_id == action_id)
        .ok_or_else(|| {
            EngineError::InvariantViolation(format!("link action {action_id} is not in link group {group_id}"))
        })?;

    if !result.resolved {
        group.actions[index].conflicted = true;
        group.refresh_conflict_flag();
        return Ok(());
    }
    match result.category {
        ResolutionCategory::SuppressAction => {
            let action = &mut group.actions[index];
            action.status = LinkActionStatus::Skipped;
            action.conflicted = false;
        }
        ResolutionCategory::SuppressGroup => {
            for action in group.actions.iter_mut() {
                if !action.status.is_terminal() {
                    action.status = LinkActionStatus::Skipped;
                }
                action.conflicted = false;
            }
        }
        ResolutionCategory::CreateNewActions => {
            let action = &mut group.actions[index];
            action.status = LinkActionStatus::Skipped;
            action.conflicted = false;
            for new_action in result.new_link_actions.clone() {
                group.add_action(new_action);
            }
        }
        ResolutionCategory::ScheduleForRetry => {
            group.actions[index].conflicted = true;
        }
        ResolutionCategory::UpdateAction
        | ResolutionCategory::ChangeConfigMapping
        | ResolutionCategory::AutoResolve
        | ResolutionCategory::Other => {
            group.actions[index].conflicted = false;
        }
    }
    group.refresh_conflict_flag();
    Ok(())
}

/// The link pipeline: ingestion, analysis with deferral, and migration of
/// link change groups.
#[derive(Debug, Clone)]
pub struct LinkService {
    session_id: SessionId,
    page_size: usize,
    schedule: Vec<AgeStep>,
}

impl LinkService {
    pub fn new(session_id: SessionId, page_size: usize, schedule: Vec<AgeStep>) -> Self {
        let schedule = if schedule.is_empty() {
            vec![AgeStep { interval_secs: 0, retries: 1 }]
        } else {
            schedule
        };
        Self {
            session_id,
            page_size: page_size.max(1),
            schedule,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.session_id(), config.page_size, config.link_age_schedule.clone())
    }

    /// Persist a detected link change. Actions written by the sync itself
    /// and duplicates of still-active actions are dropped; a delete
    /// supersedes the active add of the same link. Returns `None` when
    /// nothing is left to migrate.
    pub fn add_link_change_group(
        &self,
        store: &mut dyn Storage,
        source_id: SourceId,
        name: &str,
        actions: Vec<LinkChangeAction>,
    ) -> Result<Option<LinkChangeGroup>, EngineError> {
        let mut group = LinkChangeGroup::new(self.session_id, source_id, name);
        for action in actions {
            if let Some(server_id) = &action.server_link_change_id {
                if store.is_link_change_from_sync(self.session_id, server_id)? {
                    tracing::debug!(session = %self.session_id, server_id = %server_id, "dropping link change written by sync");
                    continue;
                }
            }
            if group.actions.iter().any(|a| !a.status.is_terminal() && a.is_duplicate_of(&action)) {
                continue;
            }
            let stored = store.find_link_actions(self.session_id, &action.link, Some(action.kind), &ACTIVE)?;
            if !stored.is_empty() {
                tracing::debug!(session = %self.session_id, link = %action.link.source_uri, "duplicate link action");
                continue;
            }
            if action.kind == LinkActionKind::Delete {
                let pending_add = group.actions.iter_mut().rev().find(|a| {
                    a.kind == LinkActionKind::Add && a.status == LinkActionStatus::Created && a.link.same_link(&action.link)
                });
                match pending_add {
                    Some(add) => add.status = LinkActionStatus::Superseded,
                    None => {
                        self.try_deprecate_active_add_action(store, &action.link)?;
                    }
                }
            }
            group.add_action(action);
        }
        if group.actions.iter().all(|a| a.status.is_terminal()) {
            return Ok(None);
        }
        store.create_link_group(&mut group)?;
        tracing::debug!(
            session = %self.session_id,
            group = %group.group_id,
            actions = group.actions.len(),
            "link change group created"
        );
        Ok(Some(group))
    }

    /// Mark the latest active add of `link` superseded.
    pub fn try_deprecate_active_add_action(
        &self,
        store: &mut dyn Storage,
        link: &ArtifactLink,
    ) -> Result<Option<LinkActionId>, EngineError> {
        let adds = store.find_link_actions(self.session_id, link, Some(LinkActionKind::Add), &ACTIVE)?;
        let Some(add) = adds.last() else {
            return Ok(None);
        };
        store.update_link_action_status(add.action_id, LinkActionStatus::Superseded)?;
        tracing::info!(
            session = %self.session_id,
            action = %add.action_id,
            link_type = %link.link_type,
            "add link superseded by delete"
        );
        Ok(Some(add.action_id))
    }

    pub fn try_find_last_delete_action(
        &self,
        store: &dyn Storage,
        link: &ArtifactLink,
    ) -> Result<Option<LinkChangeAction>, EngineError> {
        Ok(store
            .find_link_actions(self.session_id, link, Some(LinkActionKind::Delete), &[])?
            .pop())
    }

    /// The link exists on the peer: the last completed action for it is an add.
    pub fn is_link_migrated_before(&self, store: &dyn Storage, link: &ArtifactLink) -> Result<bool, EngineError> {
        let completed = store.find_link_actions(self.session_id, link, None, &[LinkActionStatus::Completed])?;
        Ok(completed.last().is_some_and(|a| a.kind == LinkActionKind::Add))
    }

    pub fn contains_special_skip_actions(&self, group: &LinkChangeGroup) -> bool {
        group.actions.iter().any(|a| a.status.is_special_skip())
    }

    pub fn load_single_link_change_action(
        &self,
        store: &dyn Storage,
        action_id: LinkActionId,
    ) -> Result<Option<LinkChangeAction>, EngineError> {
        Ok(store.load_link_action(action_id)?)
    }

    pub fn load_groups(
        &self,
        store: &dyn Storage,
        status: LinkGroupStatus,
        after: i64,
    ) -> Result<Vec<LinkChangeGroup>, EngineError> {
        Ok(store.load_link_groups(self.session_id, &[status], Page::after(after, self.page_size))?)
    }

    pub fn promote_created_to_in_analysis(&self, store: &mut dyn Storage) -> Result<usize, EngineError> {
        self.move_all(store, LinkGroupStatus::Created, LinkGroupStatus::InAnalysis)
    }

    /// Deferred groups whose wait is over go back to analysis, advancing
    /// along the age schedule.
    pub fn promote_deferred_to_in_analysis(
        &self,
        store: &mut dyn Storage,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let mut promoted = 0;
        let mut after = 0;
        loop {
            let page = self.load_groups(store, LinkGroupStatus::InAnalysisDeferred, after)?;
            let Some(last) = page.last() else { break };
            after = last.group_id.raw();
            for mut group in page {
                if group.next_attempt_at.is_some_and(|at| at > now) {
                    continue;
                }
                group.retries_at_age += 1;
                let step = self.step(group.age);
                if group.retries_at_age >= step.retries && (group.age as usize) + 1 < self.schedule.len() {
                    group.age += 1;
                    group.retries_at_age = 0;
                }
                group.status = LinkGroupStatus::InAnalysis;
                store.save_link_group(&mut group)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Analyse every InAnalysis group: defer while an endpoint is still
    /// waiting to be created, scope out untranslatable links, translate the
    /// rest.
    pub fn analyze(
        &self,
        store: &mut dyn Storage,
        conflicts: &ConflictManager,
        translator: &dyn TranslationService,
        ctx: &mut RunContext,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let mut analysed = 0;
        let mut after = 0;
        loop {
            let page = self.load_groups(store, LinkGroupStatus::InAnalysis, after)?;
            let Some(last) = page.last() else { break };
            after = last.group_id.raw();
            for mut group in page {
                self.analyze_group(store, conflicts, translator, ctx, &mut group, now)?;
                analysed += 1;
            }
        }
        Ok(analysed)
    }

    fn analyze_group(
        &self,
        store: &mut dyn Storage,
        conflicts: &ConflictManager,
        translator: &dyn TranslationService,
        ctx: &mut RunContext,
        group: &mut LinkChangeGroup,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut waiting = Vec::new();
        for action in group.actions.iter().filter(|a| a.status == LinkActionStatus::Created) {
            if self.has_pending_endpoint(store, action)? {
                waiting.push(action.action_id);
            }
        }

        if !waiting.is_empty() && !self.is_exhausted(group) {
            group.status = LinkGroupStatus::InAnalysisDeferred;
            let step = self.step(group.age);
            group.next_attempt_at = Some(now + Duration::seconds(step.interval_secs as i64));
            store.save_link_group(group)?;
            tracing::debug!(session = %self.session_id, group = %group.group_id, age = group.age, "link group deferred");
            return Ok(());
        }

        for action_id in &waiting {
            let conflict = MigrationConflict::new(
                self.session_id,
                group.source_id,
                LINK_TARGET_PENDING,
                ConflictTarget::LinkAction(*action_id),
                endpoint_hint(group, *action_id),
            )
            .with_details("link endpoint still has an unmigrated create");
            let (_, result) = conflicts.resolve(store, conflict, None)?;
            apply_link_resolution(group, *action_id, &result)?;
        }

        // Waiting actions are translated too; promotion re-checks their endpoints.
        let source_id = group.source_id;
        for action in group.actions.iter_mut() {
            if action.status != LinkActionStatus::Created {
                continue;
            }
            let translated = action
                .endpoints()
                .iter()
                .all(|uri| ctx.translate(translator, source_id, uri).is_some());
            action.status = if translated {
                LinkActionStatus::Translated
            } else {
                match action.link.target_kind {
                    LinkTargetKind::VersionControl => LinkActionStatus::SkipScopedOutVCLinks,
                    LinkTargetKind::WorkItem => LinkActionStatus::SkipScopedOutWILinks,
                }
            };
        }

        group.status = LinkGroupStatus::InAnalysisTranslated;
        group.refresh_conflict_flag();
        store.save_link_group(group)?;
        Ok(())
    }

    /// Translated, unconflicted actions whose endpoints exist become ready.
    /// An endpoint still waiting on its create keeps the action back.
    pub fn promote_translated_to_ready(&self, store: &mut dyn Storage) -> Result<usize, EngineError> {
        let mut promoted = 0;
        for status in [LinkGroupStatus::InAnalysisTranslated, LinkGroupStatus::ReadyForMigration] {
            let mut after = 0;
            loop {
                let page = self.load_groups(store, status, after)?;
                let Some(last) = page.last() else { break };
                after = last.group_id.raw();
                for mut group in page {
                    let mut changed = status != LinkGroupStatus::ReadyForMigration;
                    for i in 0..group.actions.len() {
                        let action = &group.actions[i];
                        if action.status != LinkActionStatus::Translated || action.conflicted {
                            continue;
                        }
                        if self.has_pending_endpoint(store, action)? {
                            continue;
                        }
                        group.actions[i].status = LinkActionStatus::ReadyForMigration;
                        promoted += 1;
                        changed = true;
                    }
                    if !changed {
                        continue;
                    }
                    group.status = if group.is_completed() {
                        LinkGroupStatus::Completed
                    } else {
                        LinkGroupStatus::ReadyForMigration
                    };
                    store.save_link_group(&mut group)?;
                }
            }
        }
        Ok(promoted)
    }

    /// Re-check conflicted actions: a pending-endpoint conflict whose
    /// endpoint now exists is closed, other conflicts are run through the
    /// rules again.
    pub fn retry_conflicted_actions(
        &self,
        store: &mut dyn Storage,
        conflicts: &ConflictManager,
    ) -> Result<usize, EngineError> {
        let mut released = 0;
        for status in [LinkGroupStatus::InAnalysisTranslated, LinkGroupStatus::ReadyForMigration] {
            let mut after = 0;
            loop {
                let page = self.load_groups(store, status, after)?;
                let Some(last) = page.last() else { break };
                after = last.group_id.raw();
                for mut group in page.into_iter().filter(|g| g.contains_conflicted) {
                    let ids: Vec<LinkActionId> = group
                        .actions
                        .iter()
                        .filter(|a| a.conflicted && !a.status.is_terminal())
                        .map(|a| a.action_id)
                        .collect();
                    for action_id in ids {
                        let target = ConflictTarget::LinkAction(action_id);
                        let open: Vec<MigrationConflict> = store
                            .conflicts_for_target(target)?
                            .into_iter()
                            .filter(|c| c.is_open())
                            .collect();
                        let mut still_blocked = false;
                        for mut conflict in open {
                            let pending = match group.actions.iter().find(|a| a.action_id == action_id) {
                                Some(action) => self.has_pending_endpoint(store, action)?,
                                None => false,
                            };
                            if conflict.conflict_type == LINK_TARGET_PENDING && !pending {
                                conflict.close(ResolvedBy::EndpointCreated);
                                store.update_conflict(&conflict)?;
                                continue;
                            }
                            let (conflict, result) = conflicts.resolve(store, conflict, None)?;
                            apply_link_resolution(&mut group, action_id, &result)?;
                            if conflict.is_open() {
                                still_blocked = true;
                            }
                        }
                        if !still_blocked {
                            if let Some(action) = group.actions.iter_mut().find(|a| a.action_id == action_id) {
                                if action.conflicted {
                                    action.conflicted = false;
                                    released += 1;
                                }
                            }
                        }
                    }
                    group.refresh_conflict_flag();
                    store.save_link_group(&mut group)?;
                }
            }
        }
        Ok(released)
    }

    /// Write the ready actions of one group on the peer. A delete of a link
    /// the peer never received is skipped. Adapter faults are returned as
    /// `EngineError::Adapter` after the group's progress is saved.
    pub fn migrate(
        &self,
        store: &mut dyn Storage,
        conflicts: &ConflictManager,
        translator: &dyn TranslationService,
        ctx: &mut RunContext,
        peer: &mut dyn Adapter,
        group: &mut LinkChangeGroup,
    ) -> Result<LinkMigrationOutcome, EngineError> {
        if group.all_ready_actions_conflicted() && !group.has_blocking_actions() {
            tracing::warn!(session = %self.session_id, group = %group.group_id, "link group fully blocked by conflicts");
            return Ok(LinkMigrationOutcome::Blocked);
        }

        for i in 0..group.actions.len() {
            let action = group.actions[i].clone();
            if action.status != LinkActionStatus::ReadyForMigration || action.conflicted {
                continue;
            }
            if action.kind == LinkActionKind::Delete && !self.is_link_migrated_before(store, &action.link)? {
                group.actions[i].status = LinkActionStatus::Skipped;
                tracing::debug!(session = %self.session_id, action = %action.action_id, "delete of never-migrated link skipped");
                continue;
            }

            let mut outbound = action.clone();
            outbound.link.source_uri = ctx
                .translate(translator, group.source_id, &action.link.source_uri)
                .unwrap_or_else(|| action.link.source_uri.clone());
            outbound.link.target_uri = ctx
                .translate(translator, group.source_id, &action.link.target_uri)
                .unwrap_or_else(|| action.link.target_uri.clone());

            match peer.apply_link(&outbound) {
                Ok(LinkApplyOutcome::Applied { server_change_id }) => {
                    let stored = &mut group.actions[i];
                    stored.status = LinkActionStatus::Completed;
                    stored.server_link_change_id = Some(server_change_id);
                }
                Ok(LinkApplyOutcome::Conflict { conflict_type, details }) => {
                    let conflict = MigrationConflict::new(
                        self.session_id,
                        group.source_id,
                        conflict_type,
                        ConflictTarget::LinkAction(action.action_id),
                        action.link.source_uri.clone(),
                    )
                    .with_details(details);
                    let (_, result) = conflicts.resolve(store, conflict, None)?;
                    apply_link_resolution(group, action.action_id, &result)?;
                }
                Err(fault) => {
                    group.refresh_conflict_flag();
                    store.save_link_group(group)?;
                    return Err(EngineError::Adapter(fault));
                }
            }
        }

        group.refresh_conflict_flag();
        let outcome = if group.is_completed() {
            group.status = LinkGroupStatus::Completed;
            LinkMigrationOutcome::Completed
        } else {
            LinkMigrationOutcome::Partial
        };
        store.save_link_group(group)?;
        Ok(outcome)
    }

    fn move_all(
        &self,
        store: &mut dyn Storage,
        from: LinkGroupStatus,
        to: LinkGroupStatus,
    ) -> Result<usize, EngineError> {
        let mut moved = 0;
        loop {
            // Moved groups leave the status, so always read the first page.
            let page = self.load_groups(store, from, 0)?;
            if page.is_empty() {
                break;
            }
            for mut group in page {
                group.status = to;
                store.save_link_group(&mut group)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn has_pending_endpoint(&self, store: &dyn Storage, action: &LinkChangeAction) -> Result<bool, EngineError> {
        for uri in action.endpoints() {
            if store.has_pending_create(self.session_id, uri)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn step(&self, age: u32) -> AgeStep {
        let index = (age as usize).min(self.schedule.len() - 1);
        self.schedule[index]
    }

    fn is_exhausted(&self, group: &LinkChangeGroup) -> bool {
        (group.age as usize) + 1 >= self.schedule.len() && group.retries_at_age >= self.step(group.age).retries
    }
}

fn endpoint_hint(group: &LinkChangeGroup, action_id: LinkActionId) -> String {
    group
        .actions
        .iter()
        .find(|a| a.action_id == action_id)
        .map(|a| a.link.target_uri.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use tandem_core::{ActionId, ActionKind, ChangeGroup, Fault, MigrationAction};
    use tandem_storage::SqliteStorage;

    use crate::adapter::{ChangeBatch, MigrationResult, PathMappingTranslator};

    #[derive(Default)]
    struct LinkSink {
        written: Vec<(LinkActionKind, String, String)>,
        reject: Option<String>,
    }

    impl Adapter for LinkSink {
        fn reference_name(&self) -> &str {
            "link-sink"
        }

        fn enumerate_changes(&mut self, since: i64) -> Result<ChangeBatch, Fault> {
            Ok(ChangeBatch { actions: Vec::new(), checkpoint: since })
        }

        fn download(&mut self, _item: &str) -> Result<Vec<u8>, Fault> {
            Ok(Vec::new())
        }

        fn diff(&mut self, _item: &str, _other_item: &str) -> Result<bool, Fault> {
            Ok(false)
        }

        fn apply(
            &mut self,
            _group: &ChangeGroup,
            _contents: &BTreeMap<ActionId, Vec<u8>>,
        ) -> Result<MigrationResult, Fault> {
            Err(Fault::new("Unsupported", "links only"))
        }

        fn apply_link(&mut self, action: &LinkChangeAction) -> Result<LinkApplyOutcome, Fault> {
            if let Some(conflict_type) = &self.reject {
                return Ok(LinkApplyOutcome::Conflict {
                    conflict_type: conflict_type.clone(),
                    details: "locked".into(),
                });
            }
            self.written
                .push((action.kind, action.link.source_uri.clone(), action.link.target_uri.clone()));
            Ok(LinkApplyOutcome::Applied {
                server_change_id: format!("srv-{}", self.written.len()),
            })
        }
    }

    struct Fixture {
        store: SqliteStorage,
        links: LinkService,
        conflicts: ConflictManager,
        translator: PathMappingTranslator,
        ctx: RunContext,
        source: SourceId,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Result<Self, EngineError> {
            let session = SessionId::new();
            let (source, peer) = (SourceId::new(), SourceId::new());
            Ok(Self {
                store: SqliteStorage::open_in_memory()?,
                links: LinkService::new(
                    session,
                    50,
                    vec![AgeStep { interval_secs: 60, retries: 2 }],
                ),
                conflicts: ConflictManager::with_builtins(session, 3),
                translator: PathMappingTranslator::new(source, peer, Vec::new()),
                ctx: RunContext::new(),
                source,
                now: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
            })
        }

        fn session(&self) -> SessionId {
            self.conflicts.session_id()
        }

        fn analyse(&mut self) -> Result<(), EngineError> {
            self.links.promote_deferred_to_in_analysis(&mut self.store, self.now)?;
            self.links.promote_created_to_in_analysis(&mut self.store)?;
            self.links
                .analyze(&mut self.store, &self.conflicts, &self.translator, &mut self.ctx, self.now)?;
            self.links.retry_conflicted_actions(&mut self.store, &self.conflicts)?;
            self.links.promote_translated_to_ready(&mut self.store)?;
            Ok(())
        }

        fn migrate_all(&mut self, peer: &mut LinkSink) -> Result<Vec<LinkMigrationOutcome>, EngineError> {
            let mut outcomes = Vec::new();
            for mut group in self.links.load_groups(&self.store, LinkGroupStatus::ReadyForMigration, 0)? {
                outcomes.push(self.links.migrate(
                    &mut self.store,
                    &self.conflicts,
                    &self.translator,
                    &mut self.ctx,
                    peer,
                    &mut group,
                )?);
            }
            Ok(outcomes)
        }
    }

    fn add(source: &str, target: &str) -> LinkChangeAction {
        LinkChangeAction::new(LinkActionKind::Add, ArtifactLink::new(source, target, "related"))
    }

    fn delete(source: &str, target: &str) -> LinkChangeAction {
        LinkChangeAction::new(LinkActionKind::Delete, ArtifactLink::new(source, target, "related"))
    }

    #[test]
    fn delete_in_same_batch_supersedes_add_and_skips() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        let group = fx
            .links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![add("wi/1", "wi/2"), delete("wi/1", "wi/2")])?
            .unwrap();
        assert_eq!(group.actions[0].status, LinkActionStatus::Superseded);

        fx.analyse()?;
        let mut peer = LinkSink::default();
        assert_eq!(fx.migrate_all(&mut peer)?, vec![LinkMigrationOutcome::Completed]);
        assert!(peer.written.is_empty());

        let stored = fx.store.load_link_group(group.group_id)?.unwrap();
        assert_eq!(stored.status, LinkGroupStatus::Completed);
        assert_eq!(stored.actions[1].status, LinkActionStatus::Skipped);
        Ok(())
    }

    #[test]
    fn later_delete_supersedes_stored_add() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        let first = fx
            .links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![add("wi/1", "wi/2")])?
            .unwrap();
        fx.links
            .add_link_change_group(&mut fx.store, fx.source, "l-2", vec![delete("WI/1", "wi/2")])?
            .unwrap();

        let add_id = first.actions[0].action_id;
        let stored = fx.links.load_single_link_change_action(&fx.store, add_id)?.unwrap();
        assert_eq!(stored.status, LinkActionStatus::Superseded);
        assert!(fx.links.try_find_last_delete_action(&fx.store, &stored.link)?.is_some());
        Ok(())
    }

    #[test]
    fn migrated_link_is_deleted_on_peer() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        let mut peer = LinkSink::default();
        fx.links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![add("wi/1", "wi/2")])?;
        fx.analyse()?;
        fx.migrate_all(&mut peer)?;
        let link = ArtifactLink::new("wi/1", "wi/2", "related");
        assert!(fx.links.is_link_migrated_before(&fx.store, &link)?);

        fx.links
            .add_link_change_group(&mut fx.store, fx.source, "l-2", vec![delete("wi/1", "wi/2")])?;
        fx.analyse()?;
        fx.migrate_all(&mut peer)?;
        assert_eq!(peer.written.len(), 2);
        assert_eq!(peer.written[1].0, LinkActionKind::Delete);
        assert!(!fx.links.is_link_migrated_before(&fx.store, &link)?);
        Ok(())
    }

    #[test]
    fn changes_written_by_sync_are_dropped() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        let mut peer = LinkSink::default();
        fx.links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![add("wi/1", "wi/2")])?;
        fx.analyse()?;
        fx.migrate_all(&mut peer)?;

        let echoed = add("wi/1", "wi/2").with_server_link_change_id("srv-1");
        let group = fx.links.add_link_change_group(&mut fx.store, fx.source, "l-echo", vec![echoed])?;
        assert!(group.is_none());
        Ok(())
    }

    #[test]
    fn link_waits_for_pending_create_of_its_target() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        let session = fx.session();
        let mut creating = ChangeGroup::new(session, fx.source, "cs-1");
        creating.add_action(MigrationAction::new(ActionKind::Add, "wi/2"));
        fx.store.create_change_group(&mut creating)?;

        let group = fx
            .links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![add("wi/1", "wi/2")])?
            .unwrap();
        fx.analyse()?;
        let stored = fx.store.load_link_group(group.group_id)?.unwrap();
        assert_eq!(stored.status, LinkGroupStatus::InAnalysisDeferred);
        assert_eq!(stored.actions[0].status, LinkActionStatus::Created);

        creating.actions[0].status = tandem_core::ActionStatus::Complete;
        creating.status = tandem_core::ChangeStatus::Complete;
        fx.store.save_change_group(&mut creating)?;

        fx.now += Duration::seconds(61);
        fx.analyse()?;
        let mut peer = LinkSink::default();
        assert_eq!(fx.migrate_all(&mut peer)?, vec![LinkMigrationOutcome::Completed]);
        assert_eq!(peer.written.len(), 1);
        Ok(())
    }

    #[test]
    fn exhausted_deferral_raises_link_conflict() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        let session = fx.session();
        let mut creating = ChangeGroup::new(session, fx.source, "cs-1");
        creating.add_action(MigrationAction::new(ActionKind::Add, "wi/2"));
        fx.store.create_change_group(&mut creating)?;
        fx.links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![add("wi/1", "wi/2")])?;

        for _ in 0..4 {
            fx.analyse()?;
            fx.now += Duration::seconds(61);
        }
        let open = fx.conflicts.unresolved_conflicts(&fx.store)?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].conflict_type, LINK_TARGET_PENDING);

        let mut peer = LinkSink::default();
        assert!(fx.migrate_all(&mut peer)?.iter().all(|o| *o != LinkMigrationOutcome::Completed));
        assert!(peer.written.is_empty());

        creating.actions[0].status = tandem_core::ActionStatus::Complete;
        creating.status = tandem_core::ChangeStatus::Complete;
        fx.store.save_change_group(&mut creating)?;
        fx.analyse()?;
        fx.migrate_all(&mut peer)?;
        assert_eq!(peer.written.len(), 1);
        assert!(fx.conflicts.unresolved_conflicts(&fx.store)?.is_empty());
        let closed = fx.store.get_conflict(open[0].conflict_id)?.unwrap();
        assert_eq!(closed.resolved_by, Some(ResolvedBy::EndpointCreated));
        assert_eq!(closed.resolved_by_rule, None);
        Ok(())
    }

    struct LinkLocked;

    impl crate::conflict_types::ConflictType for LinkLocked {
        fn reference_name(&self) -> &str {
            "link-locked"
        }

        fn friendly_name(&self) -> &str {
            "Peer refused a locked link"
        }

        fn detection_points(&self) -> &[tandem_core::DetectionPoint] {
            &[]
        }

        fn supported_actions(&self) -> &[&'static str] {
            &["skip-action"]
        }

        fn detect(
            &self,
            _ctx: &crate::conflict_types::DetectionContext<'_>,
            _action: &MigrationAction,
        ) -> Result<Option<MigrationConflict>, EngineError> {
            Ok(None)
        }
    }

    #[test]
    fn peer_rejection_blocks_until_resolved() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        fx.conflicts.register_conflict_type(Box::new(LinkLocked));
        let mut peer = LinkSink {
            reject: Some("link-locked".into()),
            ..LinkSink::default()
        };
        fx.links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![add("wi/1", "wi/2")])?;
        fx.analyse()?;
        assert_eq!(fx.migrate_all(&mut peer)?, vec![LinkMigrationOutcome::Partial]);
        assert_eq!(fx.migrate_all(&mut peer)?, vec![LinkMigrationOutcome::Blocked]);

        let rule = tandem_core::ConflictResolutionRule::new(fx.session(), "link-locked", "/", "skip-action");
        fx.conflicts.add_rule(&mut fx.store, rule)?;
        fx.analyse()?;
        assert_eq!(fx.migrate_all(&mut peer)?, vec![LinkMigrationOutcome::Completed]);
        Ok(())
    }

    #[test]
    fn unmapped_endpoint_is_scoped_out() -> Result<(), EngineError> {
        let mut fx = Fixture::new()?;
        fx.translator = PathMappingTranslator::new(
            fx.source,
            SourceId::new(),
            vec![crate::config::PathMapping { left: "/in".into(), right: "/out".into() }],
        );
        let link = ArtifactLink::new("/in/a", "/elsewhere/b", "related").with_target_kind(LinkTargetKind::VersionControl);
        let group = fx
            .links
            .add_link_change_group(&mut fx.store, fx.source, "l-1", vec![LinkChangeAction::new(LinkActionKind::Add, link)])?
            .unwrap();
        fx.analyse()?;
        let stored = fx.store.load_link_group(group.group_id)?.unwrap();
        assert_eq!(stored.actions[0].status, LinkActionStatus::SkipScopedOutVCLinks);
        assert!(fx.links.contains_special_skip_actions(&stored));
        assert_eq!(stored.status, LinkGroupStatus::Completed);
        Ok(())
    }
}
