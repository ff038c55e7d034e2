use std::collections::BTreeMap;

use chrono::Utc;

use tandem_core::{
    ActionId, ActionKind, ActionStatus, ChangeGroup, ChangeStatus, ConflictId, ConflictResolutionResult,
    ConflictResolutionRule, ConflictTarget, DetectionPoint, Fault, LinkGroupStatus, MigrationAction,
    MigrationConflict, RuleId, SessionId, SourceId,
};
use tandem_storage::{SqliteStorage, Storage};

use crate::adapter::{Adapter, AdapterRegistry, MigrationResult, PathMappingTranslator, TranslationService};
use crate::change_group_service::ChangeGroupService;
use crate::config::{SessionConfig, SyncDirection};
use crate::conflict_manager::ConflictManager;
use crate::conflict_types::{DetectionContext, PATH_NOT_MAPPED};
use crate::context::RunContext;
use crate::error::EngineError;
use crate::error_routing::{ErrorManager, FAULT_STORAGE_BUSY, RoutingDecision};
use crate::highwater::HighWaterMark;
use crate::link_service::{LinkMigrationOutcome, LinkService};

pub const DELTA_MARK: &str = "delta";
pub const LINK_DELTA_MARK: &str = "link-delta";

/// What one call to [`SessionWorker::poll`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub groups_detected: usize,
    pub link_groups_detected: usize,
    pub analysed: usize,
    pub ready: usize,
    pub backlogged: usize,
    pub skipped: usize,
    pub migrated: usize,
    /// Ready groups held back by an earlier group on the same paths.
    pub blocked: usize,
    pub links_migrated: usize,
    pub links_blocked: usize,
    pub faults_routed: usize,
}

/// Counts an external scheduler can poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub groups: Vec<(ChangeStatus, u64)>,
    pub link_groups: Vec<(LinkGroupStatus, u64)>,
    pub unresolved_conflicts: usize,
    pub stopped: Option<String>,
}

impl SessionState {
    pub fn count(&self, status: ChangeStatus) -> u64 {
        self.groups
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }

    pub fn link_count(&self, status: LinkGroupStatus) -> u64 {
        self.link_groups
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }
}

struct Held {
    source_id: SourceId,
    execution_order: i64,
    scope: String,
}

/// A group the peer accepted whose completion could not be stored.
struct Unrecorded {
    group: ChangeGroup,
    peer: SourceId,
    result: MigrationResult,
}

/// Drives one session: owns the store handle, both adapters and the
/// pipeline services, and runs a full batch per `poll`.
pub struct SessionWorker {
    config: SessionConfig,
    session_id: SessionId,
    store: SqliteStorage,
    adapters: BTreeMap<SourceId, Box<dyn Adapter>>,
    translator: Box<dyn TranslationService>,
    groups: ChangeGroupService,
    links: LinkService,
    conflicts: ConflictManager,
    errors: ErrorManager,
    ctx: RunContext,
    delta_marks: BTreeMap<SourceId, HighWaterMark<i64>>,
    link_marks: BTreeMap<SourceId, HighWaterMark<i64>>,
    unrecorded: Vec<Unrecorded>,
    stopped: Option<String>,
    recovered: bool,
}

impl SessionWorker {
    pub fn new(
        config: SessionConfig,
        store: SqliteStorage,
        left: Box<dyn Adapter>,
        right: Box<dyn Adapter>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let session_id = config.session_id();
        let (left_id, right_id) = (config.left_source(), config.right_source());

        let mut adapters: BTreeMap<SourceId, Box<dyn Adapter>> = BTreeMap::new();
        adapters.insert(left_id, left);
        adapters.insert(right_id, right);

        let mut delta_marks = BTreeMap::new();
        let mut link_marks = BTreeMap::new();
        for source in [left_id, right_id] {
            delta_marks.insert(source, HighWaterMark::new(session_id, source, DELTA_MARK));
            link_marks.insert(source, HighWaterMark::new(session_id, source, LINK_DELTA_MARK));
        }

        Ok(Self {
            translator: Box::new(PathMappingTranslator::from_config(&config)),
            groups: ChangeGroupService::from_config(&config),
            links: LinkService::from_config(&config),
            conflicts: ConflictManager::with_builtins(session_id, config.max_retry_count),
            errors: ErrorManager::from_config(session_id, &config.error_routers),
            ctx: RunContext::new(),
            session_id,
            store,
            adapters,
            delta_marks,
            link_marks,
            unrecorded: Vec::new(),
            stopped: None,
            recovered: false,
            config,
        })
    }

    /// Build both adapters from the registry by their configured names.
    pub fn from_registry(
        config: SessionConfig,
        store: SqliteStorage,
        registry: &AdapterRegistry,
    ) -> Result<Self, EngineError> {
        let left = registry.create(&config.left_adapter, &config, config.left_source())?;
        let right = registry.create(&config.right_adapter, &config, config.right_source())?;
        Self::new(config, store, left, right)
    }

    pub fn with_translator(mut self, translator: Box<dyn TranslationService>) -> Self {
        self.translator = translator;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStorage {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqliteStorage {
        &mut self.store
    }

    pub fn groups(&self) -> &ChangeGroupService {
        &self.groups
    }

    pub fn links(&self) -> &LinkService {
        &self.links
    }

    pub fn conflicts(&self) -> &ConflictManager {
        &self.conflicts
    }

    /// Register extra conflict types or resolution actions before the
    /// first poll.
    pub fn conflicts_mut(&mut self) -> &mut ConflictManager {
        &mut self.conflicts
    }

    pub fn errors_mut(&mut self) -> &mut ErrorManager {
        &mut self.errors
    }

    pub fn context_mut(&mut self) -> &mut RunContext {
        &mut self.ctx
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn add_rule(&mut self, rule: ConflictResolutionRule) -> Result<ConflictResolutionRule, EngineError> {
        self.conflicts.add_rule(&mut self.store, rule)
    }

    /// Last durable delta checkpoint for `source`.
    pub fn delta_checkpoint(&mut self, source: SourceId) -> Result<i64, EngineError> {
        mark_for(&mut self.delta_marks, source)?.reload(&self.store)
    }

    /// Resolve a backlogged conflict with a chosen rule.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        rule_id: RuleId,
    ) -> Result<ConflictResolutionResult, EngineError> {
        self.conflicts.resolve_existing_conflict_with_rule(
            &mut self.store,
            &self.groups,
            &mut self.ctx,
            conflict_id,
            rule_id,
        )
    }

    pub fn state(&self) -> Result<SessionState, EngineError> {
        Ok(SessionState {
            groups: self.store.group_status_counts(self.session_id)?,
            link_groups: self.store.link_group_status_counts(self.session_id)?,
            unresolved_conflicts: self.conflicts.unresolved_conflicts(&self.store)?.len(),
            stopped: self.stopped.clone(),
        })
    }

    /// Run one batch: delta, analysis, migration, then the link passes.
    /// A stopped session refuses further polls.
    pub fn poll(&mut self) -> Result<PollReport, EngineError> {
        if let Some(reason) = &self.stopped {
            return Err(EngineError::SessionStopped { reason: reason.clone() });
        }
        let mut report = PollReport::default();
        match self.run_pass(&mut report) {
            Ok(()) => Ok(report),
            Err(EngineError::Storage(err)) if err.is_busy() => {
                let fault = Fault::new(FAULT_STORAGE_BUSY, err.to_string());
                self.absorb_fault(&fault, &mut report)?;
                Ok(report)
            }
            Err(err) => Err(err),
        }
    }

    fn run_pass(&mut self, report: &mut PollReport) -> Result<(), EngineError> {
        if !self.recovered {
            self.recover()?;
        }
        self.record_unrecorded(report)?;
        self.conflicts.reactivate_scheduled_retries(&mut self.store)?;
        self.groups.requeue_backlogged(&mut self.store)?;

        for source in self.sources() {
            self.delta_pass(source, report)?;
            self.link_delta_pass(source, report)?;
        }
        self.analysis_pass(report)?;
        self.migration_pass(report)?;
        self.link_pass(report)?;

        tracing::info!(
            session = %self.session_id,
            detected = report.groups_detected,
            migrated = report.migrated,
            backlogged = report.backlogged,
            blocked = report.blocked,
            links = report.links_migrated,
            "pass complete"
        );
        Ok(())
    }

    /// First poll of a run: drop half-created deltas, re-check groups a
    /// crash left in flight, seed configured rules and bring back mapping
    /// overrides earlier runs resolved.
    fn recover(&mut self) -> Result<(), EngineError> {
        let obsolete = self.groups.remove_incomplete_change_groups(&mut self.store)?;
        let demoted = self.groups.demote_in_progress_to_pending(&mut self.store)?;
        let seeded = self
            .conflicts
            .seed_rules(&mut self.store, &self.config.resolution_rules)?;
        let overrides = self.conflicts.restore_mapping_overrides(&self.store, &mut self.ctx)?;
        self.errors.begin_run();
        self.recovered = true;
        tracing::info!(session = %self.session_id, obsolete, demoted, seeded, overrides, "session run started");
        Ok(())
    }

    /// Store the completion of groups already written on the peer. Runs
    /// before anything else in a pass so those groups are never written twice.
    fn record_unrecorded(&mut self, report: &mut PollReport) -> Result<(), EngineError> {
        let mut pending = std::mem::take(&mut self.unrecorded).into_iter();
        while let Some(mut entry) = pending.next() {
            if let Err(err) = self
                .groups
                .complete(&mut self.store, &mut entry.group, entry.peer, &entry.result.peer_change)
            {
                self.unrecorded.push(entry);
                self.unrecorded.extend(pending);
                return Err(err);
            }
            report.migrated += 1;
            self.verify_group(&entry.group, entry.peer, &entry.result, report)?;
        }
        Ok(())
    }

    fn sources(&self) -> Vec<SourceId> {
        match self.config.direction {
            SyncDirection::LeftToRight => vec![self.config.left_source()],
            SyncDirection::Bidirectional => vec![self.config.left_source(), self.config.right_source()],
        }
    }

    fn peer_of(&self, source_id: SourceId) -> Result<SourceId, EngineError> {
        self.config
            .peer_of(source_id)
            .ok_or_else(|| EngineError::InvariantViolation(format!("source {source_id} is not part of the session")))
    }

    fn absorb_fault(&mut self, fault: &Fault, report: &mut PollReport) -> Result<(), EngineError> {
        match self.errors.route(fault) {
            RoutingDecision::Routed => {
                report.faults_routed += 1;
                Ok(())
            }
            RoutingDecision::Stop => Err(self.stop(fault)),
        }
    }

    fn stop(&mut self, fault: &Fault) -> EngineError {
        let reason = fault.to_string();
        tracing::error!(session = %self.session_id, reason = %reason, "session stopped");
        self.stopped = Some(reason.clone());
        EngineError::SessionStopped { reason }
    }

    // -- delta --

    fn delta_pass(&mut self, source: SourceId, report: &mut PollReport) -> Result<(), EngineError> {
        let since = mark_for(&mut self.delta_marks, source)?.reload(&self.store)?;
        let enumerated = adapter_for(&mut self.adapters, source)?.enumerate_changes(since);
        let batch = match enumerated {
            Ok(batch) => batch,
            Err(fault) => return self.absorb_fault(&fault, report),
        };

        let created = self
            .groups
            .create_delta_groups(&mut self.store, source, batch.actions)?;
        self.groups.promote_delta_to_pending(&mut self.store, source)?;
        report.groups_detected += created.len();

        // The batch is durable; only now may the mark move.
        mark_for(&mut self.delta_marks, source)?.update(&mut self.store, batch.checkpoint)?;
        Ok(())
    }

    fn link_delta_pass(&mut self, source: SourceId, report: &mut PollReport) -> Result<(), EngineError> {
        let since = mark_for(&mut self.link_marks, source)?.reload(&self.store)?;
        let enumerated = adapter_for(&mut self.adapters, source)?.enumerate_link_changes(since);
        let batch = match enumerated {
            Ok(batch) => batch,
            Err(fault) => return self.absorb_fault(&fault, report),
        };
        for change in batch.changes {
            if self
                .links
                .add_link_change_group(&mut self.store, source, &change.name, change.actions)?
                .is_some()
            {
                report.link_groups_detected += 1;
            }
        }
        mark_for(&mut self.link_marks, source)?.update(&mut self.store, batch.checkpoint)?;
        Ok(())
    }

    // -- analysis --

    fn analysis_pass(&mut self, report: &mut PollReport) -> Result<(), EngineError> {
        let mut after = 0;
        loop {
            let page = self.groups.next_page(&self.store, &[ChangeStatus::Pending], after)?;
            let Some(last) = page.last() else { break };
            after = last.execution_order;
            for mut group in page {
                self.analyse_group(&mut group, report)?;
            }
        }
        Ok(())
    }

    fn analyse_group(&mut self, group: &mut ChangeGroup, report: &mut PollReport) -> Result<(), EngineError> {
        self.groups.advance(&mut self.store, group, ChangeStatus::InAnalysis)?;
        for action in group.actions.iter_mut().filter(|a| !a.status.is_terminal()) {
            action.status = ActionStatus::Pending;
            action.conflicted = false;
            action.translated_path = None;
        }

        let source = group.source_id;
        let peer = self.peer_of(source)?;
        let ids: Vec<ActionId> = group
            .actions
            .iter()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.action_id)
            .collect();

        let mut outcomes = Vec::new();
        for id in ids {
            let replayed = match group.action_mut(id) {
                Some(stored) => {
                    stored.translated_path = self.ctx.translate(self.translator.as_ref(), source, &stored.path);
                    self.conflicts.replayed_resolutions(&self.store, stored)?
                }
                None => continue,
            };
            for result in &replayed {
                self.groups.apply_resolution(group, id, result, &mut self.ctx)?;
            }
            if !replayed.is_empty() {
                tracing::debug!(session = %self.session_id, group = %group.group_id, action = %id, "resolutions replayed");
            }
            let Some(action) = group.action(id).cloned() else {
                continue;
            };
            let peer_has_item = self.peer_has_item(&action, peer, report)?;

            let found = {
                let pre = DetectionContext::new(DetectionPoint::PreAnalysis, group, peer, &self.store);
                let mut found = self.conflicts.detect_conflicts(&pre, &action)?;
                let mut migration = DetectionContext::new(DetectionPoint::PreMigration, group, peer, &self.store)
                    .with_translated_path(action.translated_path.as_deref());
                if let Some(exists) = peer_has_item {
                    migration = migration.with_peer_has_item(exists);
                }
                found.extend(self.conflicts.detect_conflicts(&migration, &action)?);
                found
            };

            let detected: Vec<String> = found.iter().map(|c| c.conflict_type.clone()).collect();
            for conflict in found {
                let (_, result) = self.conflicts.resolve(&mut self.store, conflict, Some(&action))?;
                outcomes.push((id, result));
            }
            let detected: Vec<&str> = detected.iter().map(String::as_str).collect();
            self.conflicts.close_stale_conflicts(
                &mut self.store,
                ConflictTarget::Action(id),
                &[DetectionPoint::PreAnalysis, DetectionPoint::PreMigration],
                &detected,
            )?;
        }

        // Resolved outcomes first so a later unresolved one still backlogs.
        outcomes.sort_by_key(|(_, result)| !result.resolved);
        for (id, result) in &outcomes {
            self.groups.apply_resolution(group, *id, result, &mut self.ctx)?;
        }
        for action in group.actions.iter_mut() {
            if action.is_migratable() && action.translated_path.is_none() {
                action.translated_path = self.ctx.translate(self.translator.as_ref(), source, &action.path);
            }
        }

        report.analysed += 1;
        if group.status == ChangeStatus::Skipped {
            store_group(&mut self.store, group)?;
            report.skipped += 1;
            return Ok(());
        }
        let next = if group.has_backlogged_actions() {
            report.backlogged += 1;
            ChangeStatus::Pending
        } else if group.actions.iter().all(|a| a.status.is_terminal()) {
            report.skipped += 1;
            ChangeStatus::Skipped
        } else {
            report.ready += 1;
            ChangeStatus::ReadyForMigration
        };
        self.groups.advance(&mut self.store, group, next)
    }

    /// Whether the peer already has the item an edit changes. `None` for
    /// other kinds, untranslated paths, or a peer that cannot tell.
    fn peer_has_item(
        &mut self,
        action: &MigrationAction,
        peer: SourceId,
        report: &mut PollReport,
    ) -> Result<Option<bool>, EngineError> {
        if action.kind != ActionKind::Edit {
            return Ok(None);
        }
        let Some(path) = action.translated_path.as_deref() else {
            return Ok(None);
        };
        match adapter_for(&mut self.adapters, peer)?.has_item(path) {
            Ok(exists) => Ok(exists),
            Err(fault) => {
                self.absorb_fault(&fault, report)?;
                Ok(None)
            }
        }
    }

    // -- migration --

    fn migration_pass(&mut self, report: &mut PollReport) -> Result<(), EngineError> {
        let mut held = self.held_scopes()?;
        let mut after = 0;
        loop {
            let page = self
                .groups
                .next_page(&self.store, &[ChangeStatus::ReadyForMigration], after)?;
            let Some(last) = page.last() else { break };
            after = last.execution_order;
            for mut group in page {
                if self.is_blocked(&group, &held) {
                    tracing::debug!(session = %self.session_id, group = %group.group_id, "waiting on an earlier group");
                    report.blocked += 1;
                    hold(&mut held, &group);
                    continue;
                }
                self.migrate_group(&mut group, report)?;
                if group.status != ChangeStatus::Complete && group.status != ChangeStatus::Skipped {
                    hold(&mut held, &group);
                }
            }
        }
        Ok(())
    }

    /// Paths of unfinished groups and scopes of their open conflicts.
    fn held_scopes(&self) -> Result<Vec<Held>, EngineError> {
        let mut held = Vec::new();
        let mut orders = BTreeMap::new();
        let statuses = [ChangeStatus::Pending, ChangeStatus::InAnalysis, ChangeStatus::Backlogged];
        let mut after = 0;
        loop {
            let page = self.groups.next_page(&self.store, &statuses, after)?;
            let Some(last) = page.last() else { break };
            after = last.execution_order;
            for group in &page {
                orders.insert(group.group_id, (group.source_id, group.execution_order));
                hold(&mut held, group);
            }
        }
        for conflict in self.conflicts.unresolved_conflicts(&self.store)? {
            let Some(&(source_id, execution_order)) = conflict.group_id.and_then(|id| orders.get(&id)) else {
                continue;
            };
            if conflict.scope_hint.is_empty() {
                continue;
            }
            held.push(Held {
                source_id,
                execution_order,
                scope: conflict.scope_hint,
            });
        }
        Ok(held)
    }

    fn is_blocked(&self, group: &ChangeGroup, held: &[Held]) -> bool {
        let scope = self.conflicts.scope();
        held.iter()
            .filter(|h| h.source_id == group.source_id && h.execution_order < group.execution_order)
            .any(|h| group.touched_paths().any(|path| scope.is_in_scope(path, &h.scope)))
    }

    fn migrate_group(&mut self, group: &mut ChangeGroup, report: &mut PollReport) -> Result<(), EngineError> {
        let source = group.source_id;
        if self.groups.is_change_completed(&self.store, source, &group.name)? {
            for action in group.actions.iter_mut().filter(|a| !a.status.is_terminal()) {
                action.status = ActionStatus::Skipped;
            }
            self.groups.advance(&mut self.store, group, ChangeStatus::Skipped)?;
            tracing::info!(session = %self.session_id, name = %group.name, "change already migrated");
            report.skipped += 1;
            return Ok(());
        }

        let peer = self.peer_of(source)?;
        if !untranslated(group).is_empty() {
            self.raise_untranslated(group)?;
            if group.status == ChangeStatus::Skipped {
                store_group(&mut self.store, group)?;
                report.skipped += 1;
                return Ok(());
            }
            if group.has_backlogged_actions() || !untranslated(group).is_empty() {
                report.backlogged += 1;
                return self.groups.advance(&mut self.store, group, ChangeStatus::Backlogged);
            }
            if group.actions.iter().all(|a| a.status.is_terminal()) {
                report.skipped += 1;
                return self.groups.advance(&mut self.store, group, ChangeStatus::Skipped);
            }
        }

        self.groups.advance(&mut self.store, group, ChangeStatus::InProgress)?;
        match self.write_group(group, peer)? {
            Ok(result) => {
                if let Err(err) = self.groups.complete(&mut self.store, group, peer, &result.peer_change) {
                    tracing::warn!(
                        session = %self.session_id,
                        group = %group.group_id,
                        peer_change = %result.peer_change,
                        error = %err,
                        "written on the peer but not recorded"
                    );
                    self.unrecorded.push(Unrecorded {
                        group: group.clone(),
                        peer,
                        result,
                    });
                    return Err(err);
                }
                report.migrated += 1;
                self.verify_group(group, peer, &result, report)
            }
            Err(fault) => match self.errors.route(&fault) {
                RoutingDecision::Routed => {
                    report.faults_routed += 1;
                    self.groups.advance(&mut self.store, group, ChangeStatus::Backlogged)
                }
                RoutingDecision::Stop => {
                    self.groups.advance(&mut self.store, group, ChangeStatus::Pending)?;
                    Err(self.stop(&fault))
                }
            },
        }
    }

    /// Migratable actions must carry a peer path; any that lost theirs get a
    /// path-not-mapped conflict and the stored rules a chance to supply one.
    fn raise_untranslated(&mut self, group: &mut ChangeGroup) -> Result<(), EngineError> {
        let mut outcomes = Vec::new();
        for id in untranslated(group) {
            let Some(action) = group.action(id).cloned() else {
                continue;
            };
            let conflict = MigrationConflict::for_action(self.session_id, group.source_id, PATH_NOT_MAPPED, &action)
                .with_details(format!("{} reached migration without a peer path", action.path));
            let (conflict, result) = self.conflicts.resolve(&mut self.store, conflict, Some(&action))?;
            tracing::warn!(
                session = %self.session_id,
                group = %group.group_id,
                conflict = %conflict.conflict_id,
                path = %action.path,
                resolved = result.resolved,
                "untranslated action held back"
            );
            outcomes.push((id, result));
        }
        outcomes.sort_by_key(|(_, result)| !result.resolved);
        for (id, result) in &outcomes {
            self.groups.apply_resolution(group, *id, result, &mut self.ctx)?;
        }
        Ok(())
    }

    /// Download content from the source side and write the group on the peer.
    fn write_group(
        &mut self,
        group: &ChangeGroup,
        peer: SourceId,
    ) -> Result<Result<MigrationResult, Fault>, EngineError> {
        let mut contents = BTreeMap::new();
        let source_adapter = adapter_for(&mut self.adapters, group.source_id)?;
        for action in group
            .actions
            .iter()
            .filter(|a| a.is_migratable() && carries_content(a.kind))
        {
            match source_adapter.download(&action.item) {
                Ok(bytes) => {
                    contents.insert(action.action_id, bytes);
                }
                Err(fault) => return Ok(Err(fault)),
            }
        }
        Ok(adapter_for(&mut self.adapters, peer)?.apply(group, &contents))
    }

    /// Compare written content with the source and raise post-migration
    /// conflicts. The group stays Complete; open conflicts show in the backlog.
    fn verify_group(
        &mut self,
        group: &ChangeGroup,
        peer: SourceId,
        result: &MigrationResult,
        report: &mut PollReport,
    ) -> Result<(), EngineError> {
        for action in group
            .actions
            .iter()
            .filter(|a| a.status == ActionStatus::Complete && carries_content(a.kind))
        {
            let Some(peer_item) = result.peer_items.get(&action.action_id) else {
                continue;
            };
            let differs = match adapter_for(&mut self.adapters, peer)?.diff(peer_item, &action.item) {
                Ok(differs) => differs,
                Err(fault) => {
                    self.absorb_fault(&fault, report)?;
                    continue;
                }
            };
            let found = {
                let post = DetectionContext::new(DetectionPoint::PostMigration, group, peer, &self.store)
                    .with_content_differs(differs);
                self.conflicts.detect_conflicts(&post, action)?
            };
            for conflict in found {
                let (conflict, outcome) = self.conflicts.resolve(&mut self.store, conflict, Some(action))?;
                if !outcome.resolved {
                    tracing::warn!(
                        session = %self.session_id,
                        group = %group.group_id,
                        conflict = %conflict.conflict_id,
                        path = %action.path,
                        "migrated content needs attention"
                    );
                }
            }
        }
        Ok(())
    }

    // -- links --

    fn link_pass(&mut self, report: &mut PollReport) -> Result<(), EngineError> {
        let now = Utc::now();
        self.links.promote_deferred_to_in_analysis(&mut self.store, now)?;
        self.links.promote_created_to_in_analysis(&mut self.store)?;
        self.links
            .analyze(&mut self.store, &self.conflicts, self.translator.as_ref(), &mut self.ctx, now)?;
        self.links.retry_conflicted_actions(&mut self.store, &self.conflicts)?;
        self.links.promote_translated_to_ready(&mut self.store)?;

        let mut after = 0;
        loop {
            let page = self
                .links
                .load_groups(&self.store, LinkGroupStatus::ReadyForMigration, after)?;
            let Some(last) = page.last() else { break };
            after = last.group_id.raw();
            for mut group in page {
                let peer = self.peer_of(group.source_id)?;
                let adapter = adapter_for(&mut self.adapters, peer)?;
                let outcome = self.links.migrate(
                    &mut self.store,
                    &self.conflicts,
                    self.translator.as_ref(),
                    &mut self.ctx,
                    adapter.as_mut(),
                    &mut group,
                );
                match outcome {
                    Ok(LinkMigrationOutcome::Completed) => report.links_migrated += 1,
                    Ok(LinkMigrationOutcome::Partial) => {}
                    Ok(LinkMigrationOutcome::Blocked) => report.links_blocked += 1,
                    Err(EngineError::Adapter(fault)) => self.absorb_fault(&fault, report)?,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }
}

fn carries_content(kind: ActionKind) -> bool {
    matches!(
        kind,
        ActionKind::Add | ActionKind::Edit | ActionKind::Branch | ActionKind::Merge | ActionKind::Undelete
    )
}

fn untranslated(group: &ChangeGroup) -> Vec<ActionId> {
    group
        .actions
        .iter()
        .filter(|a| a.is_migratable() && a.translated_path.is_none())
        .map(|a| a.action_id)
        .collect()
}

fn hold(held: &mut Vec<Held>, group: &ChangeGroup) {
    for path in group.touched_paths() {
        held.push(Held {
            source_id: group.source_id,
            execution_order: group.execution_order,
            scope: path.to_string(),
        });
    }
}

fn store_group(store: &mut dyn Storage, group: &mut ChangeGroup) -> Result<(), EngineError> {
    group.refresh_backlog_flag();
    Ok(store.save_change_group(group)?)
}

fn mark_for(
    marks: &mut BTreeMap<SourceId, HighWaterMark<i64>>,
    source: SourceId,
) -> Result<&mut HighWaterMark<i64>, EngineError> {
    marks
        .get_mut(&source)
        .ok_or_else(|| EngineError::InvariantViolation(format!("no high-water mark for source {source}")))
}

fn adapter_for(
    adapters: &mut BTreeMap<SourceId, Box<dyn Adapter>>,
    source: SourceId,
) -> Result<&mut Box<dyn Adapter>, EngineError> {
    adapters
        .get_mut(&source)
        .ok_or_else(|| EngineError::InvariantViolation(format!("no adapter for source {source}")))
}
