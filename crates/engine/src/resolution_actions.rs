use tandem_core::{
    ActionKind, ConflictResolutionResult, ConflictResolutionRule, MigrationAction,
    MigrationConflict, ResolutionCategory,
};

use crate::adapter::map_prefix;
use crate::error::EngineError;

/// A resolution strategy a rule can name. Implementations return the
/// outcome; applying it to the pipeline is the caller's job.
pub trait ResolutionAction: Send + Sync {
    fn reference_name(&self) -> &str;

    fn category(&self) -> ResolutionCategory;

    /// Keys that must be present and non-empty in the rule's data.
    fn required_data(&self) -> &[&'static str] {
        &[]
    }

    fn can_resolve(
        &self,
        _conflict: &MigrationConflict,
        _rule: &ConflictResolutionRule,
        _action: Option<&MigrationAction>,
    ) -> bool {
        true
    }

    fn resolve(
        &self,
        conflict: &MigrationConflict,
        rule: &ConflictResolutionRule,
        action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError>;
}

/// Check the rule carries the data `action` needs.
pub fn validate_rule_data(
    action: &dyn ResolutionAction,
    rule: &ConflictResolutionRule,
) -> Result<(), EngineError> {
    for key in action.required_data() {
        match rule.data.get(*key) {
            Some(value) if !value.trim().is_empty() => {}
            _ => {
                return Err(EngineError::Configuration(format!(
                    "rule {} for '{}' is missing '{key}'",
                    rule.rule_id,
                    action.reference_name()
                )));
            }
        }
    }
    Ok(())
}

fn data_value<'r>(rule: &'r ConflictResolutionRule, key: &str) -> Result<&'r str, EngineError> {
    rule.data
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| EngineError::Configuration(format!("rule {} is missing '{key}'", rule.rule_id)))
}

pub struct SkipAction;

impl ResolutionAction for SkipAction {
    fn reference_name(&self) -> &str {
        "skip-action"
    }

    fn category(&self) -> ResolutionCategory {
        ResolutionCategory::SuppressAction
    }

    fn resolve(
        &self,
        _conflict: &MigrationConflict,
        _rule: &ConflictResolutionRule,
        _action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError> {
        Ok(ConflictResolutionResult::resolved(self.category()))
    }
}

pub struct SkipGroup;

impl ResolutionAction for SkipGroup {
    fn reference_name(&self) -> &str {
        "skip-group"
    }

    fn category(&self) -> ResolutionCategory {
        ResolutionCategory::SuppressGroup
    }

    fn resolve(
        &self,
        _conflict: &MigrationConflict,
        _rule: &ConflictResolutionRule,
        _action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError> {
        Ok(ConflictResolutionResult::resolved(self.category()))
    }
}

pub struct AutoResolve;

impl ResolutionAction for AutoResolve {
    fn reference_name(&self) -> &str {
        "auto-resolve"
    }

    fn category(&self) -> ResolutionCategory {
        ResolutionCategory::AutoResolve
    }

    fn resolve(
        &self,
        _conflict: &MigrationConflict,
        _rule: &ConflictResolutionRule,
        _action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError> {
        Ok(ConflictResolutionResult::resolved(self.category()))
    }
}

/// Park the conflict and retry next pass, up to `max_retries` times.
pub struct ScheduleRetry {
    default_max_retries: u32,
}

impl ScheduleRetry {
    pub fn new(default_max_retries: u32) -> Self {
        Self { default_max_retries }
    }

    fn max_retries(&self, rule: &ConflictResolutionRule) -> Result<u32, EngineError> {
        match rule.data.get("max_retries") {
            None => Ok(self.default_max_retries),
            Some(raw) => raw.trim().parse().map_err(|_| {
                EngineError::Configuration(format!(
                    "rule {}: max_retries '{raw}' is not a number",
                    rule.rule_id
                ))
            }),
        }
    }
}

impl ResolutionAction for ScheduleRetry {
    fn reference_name(&self) -> &str {
        "schedule-retry"
    }

    fn category(&self) -> ResolutionCategory {
        ResolutionCategory::ScheduleForRetry
    }

    fn can_resolve(
        &self,
        conflict: &MigrationConflict,
        rule: &ConflictResolutionRule,
        _action: Option<&MigrationAction>,
    ) -> bool {
        // Malformed data is reported by `resolve`.
        self.max_retries(rule)
            .map_or(true, |max| conflict.retry_count < max)
    }

    fn resolve(
        &self,
        _conflict: &MigrationConflict,
        rule: &ConflictResolutionRule,
        _action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError> {
        let mut result = ConflictResolutionResult::resolved(self.category());
        result.retry_limit = Some(self.max_retries(rule)?);
        Ok(result)
    }
}

/// Rewrite the action's peer path by prefix.
pub struct UpdatePath;

impl ResolutionAction for UpdatePath {
    fn reference_name(&self) -> &str {
        "update-path"
    }

    fn category(&self) -> ResolutionCategory {
        ResolutionCategory::UpdateAction
    }

    fn required_data(&self) -> &[&'static str] {
        &["map_from", "map_to"]
    }

    fn can_resolve(
        &self,
        _conflict: &MigrationConflict,
        rule: &ConflictResolutionRule,
        action: Option<&MigrationAction>,
    ) -> bool {
        match (action, rule.data.get("map_from"), rule.data.get("map_to")) {
            (Some(action), Some(from), Some(to)) => map_prefix(&action.path, from, to).is_some(),
            _ => false,
        }
    }

    fn resolve(
        &self,
        conflict: &MigrationConflict,
        rule: &ConflictResolutionRule,
        action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError> {
        let action = action.ok_or_else(|| {
            EngineError::InvariantViolation(format!("conflict {} has no action to update", conflict.conflict_id))
        })?;
        let (from, to) = (data_value(rule, "map_from")?, data_value(rule, "map_to")?);
        let mut result = ConflictResolutionResult::resolved(self.category());
        result.translated_path = map_prefix(&action.path, from, to);
        Ok(result)
    }
}

/// Add a path mapping for the rest of the run.
pub struct ChangeMapping;

impl ResolutionAction for ChangeMapping {
    fn reference_name(&self) -> &str {
        "change-mapping"
    }

    fn category(&self) -> ResolutionCategory {
        ResolutionCategory::ChangeConfigMapping
    }

    fn required_data(&self) -> &[&'static str] {
        &["source_path", "target_path"]
    }

    fn resolve(
        &self,
        _conflict: &MigrationConflict,
        rule: &ConflictResolutionRule,
        _action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError> {
        let mut result = ConflictResolutionResult::resolved(self.category());
        result.mapping_override = Some((
            data_value(rule, "source_path")?.to_string(),
            data_value(rule, "target_path")?.to_string(),
        ));
        Ok(result)
    }
}

/// Replace an edit of an item the peer never received with an add.
pub struct EditToAdd;

impl ResolutionAction for EditToAdd {
    fn reference_name(&self) -> &str {
        "edit-to-add"
    }

    fn category(&self) -> ResolutionCategory {
        ResolutionCategory::CreateNewActions
    }

    fn can_resolve(
        &self,
        _conflict: &MigrationConflict,
        _rule: &ConflictResolutionRule,
        action: Option<&MigrationAction>,
    ) -> bool {
        action.is_some_and(|a| a.kind == ActionKind::Edit)
    }

    fn resolve(
        &self,
        conflict: &MigrationConflict,
        _rule: &ConflictResolutionRule,
        action: Option<&MigrationAction>,
    ) -> Result<ConflictResolutionResult, EngineError> {
        let action = action.ok_or_else(|| {
            EngineError::InvariantViolation(format!("conflict {} has no action to replace", conflict.conflict_id))
        })?;
        let mut add = MigrationAction::new(ActionKind::Add, action.path.clone())
            .with_item(action.item.clone())
            .with_content_type(action.content_type.clone());
        add.version = action.version.clone();
        add.translated_path = action.translated_path.clone();

        let mut result = ConflictResolutionResult::resolved(self.category());
        result.new_actions.push(add);
        Ok(result)
    }
}

pub fn builtin_resolution_actions(default_max_retries: u32) -> Vec<Box<dyn ResolutionAction>> {
    vec![
        Box::new(SkipAction),
        Box::new(SkipGroup),
        Box::new(AutoResolve),
        Box::new(ScheduleRetry::new(default_max_retries)),
        Box::new(UpdatePath),
        Box::new(ChangeMapping),
        Box::new(EditToAdd),
    ]
}
