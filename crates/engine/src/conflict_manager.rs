use std::collections::{BTreeMap, BTreeSet};

use tandem_core::conflict::rule_precedence;
use tandem_core::{
    BasicPathScope, ChangeGroupId, ConflictId, ConflictResolutionResult, ConflictResolutionRule,
    ConflictStatus, ConflictTarget, DetectionPoint, MigrationAction, MigrationConflict,
    ResolutionCategory, ResolutionOutcome, ResolvedBy, RuleId, ScopeInterpreter, SessionId,
};
use tandem_storage::Storage;

use crate::change_group_service::ChangeGroupService;
use crate::config::RuleConfig;
use crate::conflict_types::{ConflictType, DetectionContext, builtin_conflict_types};
use crate::context::RunContext;
use crate::error::EngineError;
use crate::link_service::apply_link_resolution;
use crate::resolution_actions::{ResolutionAction, builtin_resolution_actions, validate_rule_data};

/// Registry of conflict types and resolution actions, and the rule engine
/// that matches stored rules to raised conflicts.
pub struct ConflictManager {
    session_id: SessionId,
    scope: Box<dyn ScopeInterpreter>,
    conflict_types: Vec<Box<dyn ConflictType>>,
    actions: BTreeMap<String, Box<dyn ResolutionAction>>,
}

impl ConflictManager {
    /// Empty registry over slash-delimited path scopes.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            scope: Box::new(BasicPathScope),
            conflict_types: Vec::new(),
            actions: BTreeMap::new(),
        }
    }

    pub fn with_builtins(session_id: SessionId, max_retry_count: u32) -> Self {
        let mut manager = Self::new(session_id);
        for conflict_type in builtin_conflict_types() {
            manager.register_conflict_type(conflict_type);
        }
        for action in builtin_resolution_actions(max_retry_count) {
            manager.register_resolution_action(action);
        }
        manager
    }

    pub fn with_scope_interpreter(mut self, scope: Box<dyn ScopeInterpreter>) -> Self {
        self.scope = scope;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn scope(&self) -> &dyn ScopeInterpreter {
        self.scope.as_ref()
    }

    /// Returns false when a type with the same reference name is already
    /// registered; the first registration wins.
    pub fn register_conflict_type(&mut self, conflict_type: Box<dyn ConflictType>) -> bool {
        let name = conflict_type.reference_name();
        if self.conflict_types.iter().any(|t| t.reference_name() == name) {
            return false;
        }
        tracing::debug!(session = %self.session_id, conflict_type = name, "conflict type registered");
        self.conflict_types.push(conflict_type);
        true
    }

    pub fn register_resolution_action(&mut self, action: Box<dyn ResolutionAction>) -> bool {
        let name = action.reference_name().to_string();
        if self.actions.contains_key(&name) {
            return false;
        }
        self.actions.insert(name, action);
        true
    }

    pub fn conflict_type(&self, reference_name: &str) -> Option<&dyn ConflictType> {
        self.conflict_types
            .iter()
            .find(|t| t.reference_name() == reference_name)
            .map(|t| t.as_ref())
    }

    pub fn conflict_types(&self) -> impl Iterator<Item = &dyn ConflictType> + '_ {
        self.conflict_types.iter().map(|t| t.as_ref())
    }

    // -- rules --

    /// Validate and store a rule. Storing a rule identical to an existing one
    /// returns the existing rule.
    pub fn add_rule(
        &self,
        store: &mut dyn Storage,
        rule: ConflictResolutionRule,
    ) -> Result<ConflictResolutionRule, EngineError> {
        self.store_rule(store, rule).map(|(rule, _)| rule)
    }

    /// Store the rules declared in configuration. Returns how many were new.
    pub fn seed_rules(&self, store: &mut dyn Storage, rules: &[RuleConfig]) -> Result<usize, EngineError> {
        let mut added = 0;
        for config in rules {
            let mut rule = ConflictResolutionRule::new(
                self.session_id,
                config.conflict_type.clone(),
                config.scope.clone(),
                config.action.clone(),
            );
            rule.details = config.details.clone();
            rule.data = config.data.clone();
            if self.store_rule(store, rule)?.1 {
                added += 1;
            }
        }
        Ok(added)
    }

    fn store_rule(
        &self,
        store: &mut dyn Storage,
        mut rule: ConflictResolutionRule,
    ) -> Result<(ConflictResolutionRule, bool), EngineError> {
        if rule.session_id != self.session_id {
            return Err(EngineError::Configuration(format!(
                "rule belongs to session {}, not {}",
                rule.session_id, self.session_id
            )));
        }
        self.validate_rule(&rule)?;
        let existing = store.rules_for_type(self.session_id, &rule.conflict_type)?;
        if let Some(same) = existing.into_iter().find(|r| r.same_content(&rule)) {
            return Ok((same, false));
        }
        store.insert_rule(&mut rule)?;
        tracing::info!(
            session = %self.session_id,
            rule = %rule.rule_id,
            conflict_type = %rule.conflict_type,
            scope = %rule.scope,
            action = %rule.action,
            "resolution rule added"
        );
        Ok((rule, true))
    }

    fn validate_rule(&self, rule: &ConflictResolutionRule) -> Result<(), EngineError> {
        if !self.scope.is_well_formed(&rule.scope) {
            return Err(EngineError::Configuration(format!("malformed rule scope '{}'", rule.scope)));
        }
        let action = self.resolution_action(&rule.action)?;
        validate_rule_data(action, rule)?;
        let conflict_type = self.conflict_type(&rule.conflict_type).ok_or_else(|| {
            EngineError::Configuration(format!("unknown conflict type '{}'", rule.conflict_type))
        })?;
        if !conflict_type.supported_actions().contains(&rule.action.as_str()) {
            return Err(EngineError::Configuration(format!(
                "conflict type '{}' does not support '{}'",
                rule.conflict_type, rule.action
            )));
        }
        Ok(())
    }

    fn resolution_action(&self, name: &str) -> Result<&dyn ResolutionAction, EngineError> {
        self.actions
            .get(name)
            .map(|a| a.as_ref())
            .ok_or_else(|| EngineError::Configuration(format!("unknown resolution action '{name}'")))
    }

    // -- detection --

    /// Run every conflict type registered for `ctx.point` against `action`.
    /// Types already resolved for the action's current content are skipped.
    pub fn detect_conflicts(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
    ) -> Result<Vec<MigrationConflict>, EngineError> {
        let mut found = Vec::new();
        for conflict_type in self.conflict_types.iter() {
            if !conflict_type.detection_points().contains(&ctx.point) {
                continue;
            }
            if let Some(conflict) = self.detect_with(ctx, action, conflict_type.as_ref())? {
                found.push(conflict);
            }
        }
        Ok(found)
    }

    /// Run a single registered conflict type.
    pub fn detect_conflict(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
        conflict_type: &str,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        let conflict_type = self.conflict_type(conflict_type).ok_or_else(|| {
            EngineError::Configuration(format!("unknown conflict type '{conflict_type}'"))
        })?;
        self.detect_with(ctx, action, conflict_type)
    }

    fn detect_with(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
        conflict_type: &dyn ConflictType,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        let target = ConflictTarget::Action(action.action_id);
        if action.action_id.is_persisted()
            && ctx
                .store
                .has_resolved_conflict(target, conflict_type.reference_name(), Some(action.fingerprint()))?
        {
            return Ok(None);
        }
        conflict_type.detect(ctx, action)
    }

    // -- resolution --

    /// Persist `conflict` (reusing an open conflict of the same type on the
    /// same target) and try the stored rules on it, most specific first.
    pub fn resolve(
        &self,
        store: &mut dyn Storage,
        conflict: MigrationConflict,
        action: Option<&MigrationAction>,
    ) -> Result<(MigrationConflict, ConflictResolutionResult), EngineError> {
        let mut conflict = self.persist(store, conflict)?;

        let mut rules = store.rules_for_type(self.session_id, &conflict.conflict_type)?;
        rules.sort_by(|a, b| rule_precedence(self.scope.as_ref(), a, b));

        for rule in rules.iter().filter(|r| {
            self.scope.is_in_scope(&conflict.scope_hint, &r.scope) && r.matches_details(&conflict.details)
        }) {
            let handler = self.resolution_action(&rule.action)?;
            validate_rule_data(handler, rule)?;
            if !handler.can_resolve(&conflict, rule, action) {
                continue;
            }
            let mut result = handler.resolve(&conflict, rule, action)?;
            result.rule_id = Some(rule.rule_id);
            self.mark_resolved(store, &mut conflict, rule.rule_id, &result)?;
            return Ok((conflict, result));
        }

        conflict.status = ConflictStatus::Unresolved;
        store.update_conflict(&conflict)?;
        tracing::warn!(
            session = %self.session_id,
            conflict = %conflict.conflict_id,
            conflict_type = %conflict.conflict_type,
            scope = %conflict.scope_hint,
            "conflict unresolved"
        );
        Ok((conflict, ConflictResolutionResult::unresolved()))
    }

    fn persist(&self, store: &mut dyn Storage, mut conflict: MigrationConflict) -> Result<MigrationConflict, EngineError> {
        let existing = store
            .conflicts_for_target(conflict.target)?
            .into_iter()
            .find(|c| c.conflict_type == conflict.conflict_type && c.status != ConflictStatus::Resolved);
        match existing {
            Some(mut open) => {
                open.details = conflict.details;
                open.scope_hint = conflict.scope_hint;
                open.fingerprint = conflict.fingerprint.or(open.fingerprint);
                if conflict.group_id.is_some() {
                    open.group_id = conflict.group_id;
                }
                Ok(open)
            }
            None => {
                store.insert_conflict(&mut conflict)?;
                tracing::debug!(
                    session = %self.session_id,
                    conflict = %conflict.conflict_id,
                    conflict_type = %conflict.conflict_type,
                    "conflict raised"
                );
                Ok(conflict)
            }
        }
    }

    fn mark_resolved(
        &self,
        store: &mut dyn Storage,
        conflict: &mut MigrationConflict,
        rule_id: RuleId,
        result: &ConflictResolutionResult,
    ) -> Result<(), EngineError> {
        conflict.status = if result.category == ResolutionCategory::ScheduleForRetry {
            ConflictStatus::ScheduledForRetry
        } else {
            ConflictStatus::Resolved
        };
        conflict.resolved_by_rule = Some(rule_id);
        conflict.resolved_by = (conflict.status == ConflictStatus::Resolved).then_some(ResolvedBy::Rule);
        conflict.outcome = ResolutionOutcome::of(result);
        store.update_conflict(conflict)?;
        tracing::info!(
            session = %self.session_id,
            conflict = %conflict.conflict_id,
            conflict_type = %conflict.conflict_type,
            rule = %rule_id,
            category = result.category.as_str(),
            "conflict resolved"
        );
        Ok(())
    }

    /// Resolve a stored conflict with a chosen rule and apply the outcome to
    /// whatever the conflict was raised against.
    pub fn resolve_existing_conflict_with_rule(
        &self,
        store: &mut dyn Storage,
        groups: &ChangeGroupService,
        ctx: &mut RunContext,
        conflict_id: ConflictId,
        rule_id: RuleId,
    ) -> Result<ConflictResolutionResult, EngineError> {
        let mut conflict = store
            .get_conflict(conflict_id)?
            .ok_or_else(|| EngineError::ConflictNotFound(conflict_id.to_string()))?;
        let rule = store
            .get_rule(rule_id)?
            .ok_or_else(|| EngineError::RuleNotFound(rule_id.to_string()))?;
        if rule.conflict_type != conflict.conflict_type {
            return Err(EngineError::Configuration(format!(
                "rule {rule_id} handles '{}', conflict {conflict_id} is '{}'",
                rule.conflict_type, conflict.conflict_type
            )));
        }
        if !self.scope.is_in_scope(&conflict.scope_hint, &rule.scope) {
            return Err(EngineError::Configuration(format!(
                "rule {rule_id} scope '{}' does not cover '{}'",
                rule.scope, conflict.scope_hint
            )));
        }
        let handler = self.resolution_action(&rule.action)?;
        validate_rule_data(handler, &rule)?;

        let result = match conflict.target {
            ConflictTarget::Action(action_id) => {
                let group_id = conflict.group_id.ok_or_else(|| {
                    EngineError::InvariantViolation(format!("conflict {conflict_id} has no group"))
                })?;
                let mut group = groups.load(store, group_id)?;
                let action = group.action(action_id).cloned();
                let mut result = handler.resolve(&conflict, &rule, action.as_ref())?;
                result.rule_id = Some(rule_id);
                groups.apply_resolution(&mut group, action_id, &result, ctx)?;
                if self.has_other_open_conflicts(store, conflict.target, conflict_id)? {
                    groups.apply_resolution(&mut group, action_id, &ConflictResolutionResult::unresolved(), ctx)?;
                }
                store.save_change_group(&mut group)?;
                result
            }
            ConflictTarget::LinkAction(action_id) => {
                let action = store
                    .load_link_action(action_id)?
                    .ok_or_else(|| EngineError::InvariantViolation(format!("link action {action_id} not found")))?;
                let mut group = store.load_link_group(action.group_id)?.ok_or_else(|| {
                    EngineError::InvariantViolation(format!("link group {} not found", action.group_id))
                })?;
                let mut result = handler.resolve(&conflict, &rule, None)?;
                result.rule_id = Some(rule_id);
                apply_link_resolution(&mut group, action_id, &result)?;
                if self.has_other_open_conflicts(store, conflict.target, conflict_id)? {
                    apply_link_resolution(&mut group, action_id, &ConflictResolutionResult::unresolved())?;
                }
                store.save_link_group(&mut group)?;
                result
            }
            ConflictTarget::Group(group_id) => {
                let mut group = groups.load(store, group_id)?;
                let mut result = handler.resolve(&conflict, &rule, None)?;
                result.rule_id = Some(rule_id);
                let ids: Vec<_> = group
                    .actions
                    .iter()
                    .filter(|a| a.conflicted)
                    .map(|a| a.action_id)
                    .collect();
                for action_id in ids {
                    groups.apply_resolution(&mut group, action_id, &result, ctx)?;
                }
                store.save_change_group(&mut group)?;
                result
            }
        };

        self.mark_resolved(store, &mut conflict, rule_id, &result)?;
        Ok(result)
    }

    /// Apply an existing rule to every open conflict it covers.
    pub fn resolve_existing_conflicts_with_existing_rule(
        &self,
        store: &mut dyn Storage,
        groups: &ChangeGroupService,
        ctx: &mut RunContext,
        rule_id: RuleId,
    ) -> Result<usize, EngineError> {
        let rule = store
            .get_rule(rule_id)?
            .ok_or_else(|| EngineError::RuleNotFound(rule_id.to_string()))?;
        let covered: Vec<ConflictId> = store
            .conflicts_with_status(self.session_id, ConflictStatus::Unresolved)?
            .into_iter()
            .filter(|c| {
                c.conflict_type == rule.conflict_type
                    && self.scope.is_in_scope(&c.scope_hint, &rule.scope)
                    && rule.matches_details(&c.details)
            })
            .map(|c| c.conflict_id)
            .collect();
        let mut resolved = 0;
        for conflict_id in covered {
            self.resolve_existing_conflict_with_rule(store, groups, ctx, conflict_id, rule_id)?;
            resolved += 1;
        }
        Ok(resolved)
    }

    fn has_other_open_conflicts(
        &self,
        store: &dyn Storage,
        target: ConflictTarget,
        except: ConflictId,
    ) -> Result<bool, EngineError> {
        Ok(store
            .conflicts_for_target(target)?
            .iter()
            .any(|c| c.conflict_id != except && c.is_open()))
    }

    // -- replay --

    /// Path changes earlier rules made to `action`, for conflicts that stay
    /// resolved because the action's content has not changed since.
    pub fn replayed_resolutions(
        &self,
        store: &dyn Storage,
        action: &MigrationAction,
    ) -> Result<Vec<ConflictResolutionResult>, EngineError> {
        if !action.action_id.is_persisted() {
            return Ok(Vec::new());
        }
        let fingerprint = Some(action.fingerprint());
        Ok(store
            .conflicts_for_target(ConflictTarget::Action(action.action_id))?
            .into_iter()
            .filter(|c| {
                c.status == ConflictStatus::Resolved
                    && c.resolved_by == Some(ResolvedBy::Rule)
                    && c.fingerprint == fingerprint
            })
            .filter_map(|c| c.outcome.map(|outcome| outcome.to_result(c.resolved_by_rule)))
            .collect())
    }

    /// Put the mapping overrides of earlier change-mapping resolutions back
    /// into a fresh run context. Returns how many were restored.
    pub fn restore_mapping_overrides(&self, store: &dyn Storage, ctx: &mut RunContext) -> Result<usize, EngineError> {
        let mut restored = 0;
        for conflict in store.conflicts_with_status(self.session_id, ConflictStatus::Resolved)? {
            let Some((from, to)) = conflict.outcome.and_then(|o| o.mapping_override) else {
                continue;
            };
            if ctx.add_mapping_override(conflict.source_id, &from, &to) {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::debug!(session = %self.session_id, restored, "mapping overrides restored");
        }
        Ok(restored)
    }

    // -- queries and maintenance --

    /// Rules that resolved at least one conflict of the group.
    pub fn rules_applied_to_group(
        &self,
        store: &dyn Storage,
        group_id: ChangeGroupId,
    ) -> Result<Vec<ConflictResolutionRule>, EngineError> {
        let ids: BTreeSet<RuleId> = store
            .conflicts_for_group(group_id)?
            .into_iter()
            .filter_map(|c| c.resolved_by_rule)
            .collect();
        let mut rules = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rule) = store.get_rule(id)? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    pub fn is_item_in_backlog(&self, store: &dyn Storage, path: &str) -> Result<bool, EngineError> {
        Ok(store.is_path_backlogged(self.session_id, path)?)
    }

    pub fn unresolved_conflicts(&self, store: &dyn Storage) -> Result<Vec<MigrationConflict>, EngineError> {
        Ok(store.conflicts_with_status(self.session_id, ConflictStatus::Unresolved)?)
    }

    /// Conflicts scheduled for retry become unresolved again, counting the
    /// attempt.
    pub fn reactivate_scheduled_retries(&self, store: &mut dyn Storage) -> Result<usize, EngineError> {
        let scheduled = store.conflicts_with_status(self.session_id, ConflictStatus::ScheduledForRetry)?;
        let count = scheduled.len();
        for mut conflict in scheduled {
            conflict.retry_count += 1;
            conflict.status = ConflictStatus::Unresolved;
            store.update_conflict(&conflict)?;
        }
        if count > 0 {
            tracing::debug!(session = %self.session_id, count, "scheduled retries reactivated");
        }
        Ok(count)
    }

    /// Close open conflicts on `target` raised at one of `points` whose type
    /// was not detected again.
    pub fn close_stale_conflicts(
        &self,
        store: &mut dyn Storage,
        target: ConflictTarget,
        points: &[DetectionPoint],
        detected: &[&str],
    ) -> Result<usize, EngineError> {
        let mut closed = 0;
        for mut conflict in store.conflicts_for_target(target)? {
            if !conflict.is_open() || detected.contains(&conflict.conflict_type.as_str()) {
                continue;
            }
            let Some(conflict_type) = self.conflict_type(&conflict.conflict_type) else {
                continue;
            };
            if !conflict_type.detection_points().iter().any(|p| points.contains(p)) {
                continue;
            }
            conflict.close(ResolvedBy::NotRedetected);
            store.update_conflict(&conflict)?;
            closed += 1;
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict_types::{EDIT_EDIT, PATH_NOT_MAPPED};
    use tandem_core::{ActionId, ActionKind, ChangeGroup, ChangeStatus, SourceId};
    use tandem_storage::SqliteStorage;

    fn manager(session: SessionId) -> ConflictManager {
        ConflictManager::with_builtins(session, 3)
    }

    fn edit_conflict(session: SessionId, raw: i64, path: &str) -> MigrationConflict {
        MigrationConflict::new(
            session,
            SourceId::new(),
            EDIT_EDIT,
            ConflictTarget::Action(ActionId::from_raw(raw)),
            path,
        )
    }

    fn rule(session: SessionId, scope: &str, action: &str) -> ConflictResolutionRule {
        ConflictResolutionRule::new(session, EDIT_EDIT, scope, action)
    }

    #[test]
    fn most_specific_rule_wins_regardless_of_insertion_order() -> Result<(), EngineError> {
        for reversed in [false, true] {
            let session = SessionId::new();
            let mut store = SqliteStorage::open_in_memory()?;
            let cm = manager(session);
            let mut rules = vec![rule(session, "/", "skip-action"), rule(session, "/A", "auto-resolve")];
            if reversed {
                rules.reverse();
            }
            for r in rules {
                cm.add_rule(&mut store, r)?;
            }
            let (conflict, result) = cm.resolve(&mut store, edit_conflict(session, 1, "/A/b.txt"), None)?;
            assert!(result.resolved);
            assert_eq!(result.category, ResolutionCategory::AutoResolve);
            assert_eq!(conflict.status, ConflictStatus::Resolved);
            assert_eq!(conflict.resolved_by_rule, result.rule_id);
        }
        Ok(())
    }

    #[test]
    fn scope_matches_whole_segments_only() -> Result<(), EngineError> {
        let session = SessionId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        cm.add_rule(&mut store, rule(session, "/A/B", "skip-action"))?;

        let (_, result) = cm.resolve(&mut store, edit_conflict(session, 1, "/A/b/c.txt"), None)?;
        assert!(result.resolved);
        let (conflict, result) = cm.resolve(&mut store, edit_conflict(session, 2, "/A"), None)?;
        assert!(!result.resolved);
        assert_eq!(conflict.status, ConflictStatus::Unresolved);
        let (_, result) = cm.resolve(&mut store, edit_conflict(session, 3, "/A/Bc/d.txt"), None)?;
        assert!(!result.resolved);
        Ok(())
    }

    #[test]
    fn unresolved_conflict_is_reused_not_duplicated() -> Result<(), EngineError> {
        let session = SessionId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        let (first, _) = cm.resolve(&mut store, edit_conflict(session, 7, "/x"), None)?;
        let (second, _) = cm.resolve(&mut store, edit_conflict(session, 7, "/x").with_details("again"), None)?;
        assert_eq!(first.conflict_id, second.conflict_id);
        assert_eq!(cm.unresolved_conflicts(&store)?.len(), 1);
        assert_eq!(second.details, "again");
        Ok(())
    }

    #[test]
    fn invalid_rules_are_rejected() -> Result<(), EngineError> {
        let session = SessionId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        let bad = [
            rule(session, "A//B", "skip-action"),
            rule(session, "/A", "no-such-action"),
            rule(session, "/A", "update-path"),
            ConflictResolutionRule::new(session, PATH_NOT_MAPPED, "/A", "auto-resolve"),
            ConflictResolutionRule::new(session, "unknown-type", "/", "skip-action"),
        ];
        for r in bad {
            let err = cm.add_rule(&mut store, r).unwrap_err();
            assert!(matches!(err, EngineError::Configuration(_)), "{err}");
        }
        assert!(store.rules_for_type(session, EDIT_EDIT)?.is_empty());
        Ok(())
    }

    #[test]
    fn identical_rule_is_stored_once() -> Result<(), EngineError> {
        let session = SessionId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        let a = cm.add_rule(&mut store, rule(session, "/A", "skip-action"))?;
        let b = cm.add_rule(&mut store, rule(session, "/A", "skip-action"))?;
        assert_eq!(a.rule_id, b.rule_id);
        assert_eq!(store.rules_for_type(session, EDIT_EDIT)?.len(), 1);
        Ok(())
    }

    #[test]
    fn scheduled_retry_reactivates_until_limit() -> Result<(), EngineError> {
        let session = SessionId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        cm.add_rule(&mut store, rule(session, "/", "schedule-retry").with_data("max_retries", "2"))?;

        let mut attempts = 0;
        loop {
            let (conflict, result) = cm.resolve(&mut store, edit_conflict(session, 1, "/a"), None)?;
            if !result.resolved {
                assert_eq!(conflict.retry_count, 2);
                break;
            }
            assert_eq!(conflict.status, ConflictStatus::ScheduledForRetry);
            attempts += 1;
            assert_eq!(cm.reactivate_scheduled_retries(&mut store)?, 1);
        }
        assert_eq!(attempts, 2);
        Ok(())
    }

    #[test]
    fn out_of_band_resolution_releases_backlogged_action() -> Result<(), EngineError> {
        let session = SessionId::new();
        let source = SourceId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        let groups = ChangeGroupService::new(session, 50, 600);
        let mut ctx = RunContext::new();

        let mut group = ChangeGroup::new(session, source, "cs-9");
        group.add_action(MigrationAction::new(ActionKind::Edit, "/A/b.txt"));
        store.create_change_group(&mut group)?;
        let action = group.actions[0].clone();

        let conflict = MigrationConflict::for_action(session, source, EDIT_EDIT, &action);
        let (conflict, result) = cm.resolve(&mut store, conflict, Some(&action))?;
        groups.apply_resolution(&mut group, action.action_id, &result, &mut ctx)?;
        group.status = ChangeStatus::Backlogged;
        store.save_change_group(&mut group)?;
        assert!(cm.is_item_in_backlog(&store, "/A/b.txt")?);

        let rule = cm.add_rule(&mut store, rule(session, "/A", "auto-resolve"))?;
        let resolved = cm.resolve_existing_conflicts_with_existing_rule(&mut store, &groups, &mut ctx, rule.rule_id)?;
        assert_eq!(resolved, 1);

        let stored = groups.load(&store, group.group_id)?;
        assert!(!stored.actions[0].conflicted);
        assert!(!stored.has_backlogged_actions());
        assert_eq!(store.get_conflict(conflict.conflict_id)?.unwrap().status, ConflictStatus::Resolved);
        assert_eq!(cm.rules_applied_to_group(&store, group.group_id)?.len(), 1);
        assert!(!cm.is_item_in_backlog(&store, "/A/b.txt")?);
        Ok(())
    }

    #[test]
    fn stale_conflicts_close_when_not_redetected() -> Result<(), EngineError> {
        let session = SessionId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        let (conflict, _) = cm.resolve(&mut store, edit_conflict(session, 4, "/p"), None)?;

        let closed = cm.close_stale_conflicts(&mut store, conflict.target, &[DetectionPoint::PreMigration], &[EDIT_EDIT])?;
        assert_eq!(closed, 0);
        let closed = cm.close_stale_conflicts(&mut store, conflict.target, &[DetectionPoint::PostMigration], &[])?;
        assert_eq!(closed, 0);
        let closed = cm.close_stale_conflicts(&mut store, conflict.target, &[DetectionPoint::PreMigration], &[])?;
        assert_eq!(closed, 1);
        assert!(cm.unresolved_conflicts(&store)?.is_empty());
        let stored = store.get_conflict(conflict.conflict_id)?.unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(stored.resolved_by, Some(ResolvedBy::NotRedetected));
        assert_eq!(stored.resolved_by_rule, None);
        Ok(())
    }

    #[test]
    fn path_resolutions_replay_while_the_action_is_unchanged() -> Result<(), EngineError> {
        let session = SessionId::new();
        let source = SourceId::new();
        let mut store = SqliteStorage::open_in_memory()?;
        let cm = manager(session);
        let mut group = ChangeGroup::new(session, source, "cs-1");
        group.add_action(MigrationAction::new(ActionKind::Add, "/Z/x.txt"));
        group.add_action(MigrationAction::new(ActionKind::Add, "/Y/y.txt"));
        store.create_change_group(&mut group)?;
        cm.add_rule(
            &mut store,
            ConflictResolutionRule::new(session, PATH_NOT_MAPPED, "/Z", "update-path")
                .with_data("map_from", "/Z")
                .with_data("map_to", "/M/Z"),
        )?;
        cm.add_rule(
            &mut store,
            ConflictResolutionRule::new(session, PATH_NOT_MAPPED, "/Y", "change-mapping")
                .with_data("source_path", "/Y")
                .with_data("target_path", "/M/Y"),
        )?;

        let (z, y) = (group.actions[0].clone(), group.actions[1].clone());
        for action in [&z, &y] {
            let conflict = MigrationConflict::for_action(session, source, PATH_NOT_MAPPED, action);
            let (conflict, _) = cm.resolve(&mut store, conflict, Some(action))?;
            assert_eq!(conflict.resolved_by, Some(ResolvedBy::Rule));
        }

        let replayed = cm.replayed_resolutions(&store, &z)?;
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].category, ResolutionCategory::UpdateAction);
        assert_eq!(replayed[0].translated_path.as_deref(), Some("/M/Z/x.txt"));
        assert!(replayed[0].rule_id.is_some());

        let mut ctx = RunContext::new();
        assert_eq!(cm.restore_mapping_overrides(&store, &mut ctx)?, 1);
        assert_eq!(cm.restore_mapping_overrides(&store, &mut ctx)?, 0);

        let changed = z.clone().with_item("elsewhere");
        assert!(cm.replayed_resolutions(&store, &changed)?.is_empty());
        Ok(())
    }
}
