use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change_group::MigrationAction;
use crate::error::CoreError;
use crate::ids::*;
use crate::link::LinkChangeAction;
use crate::scope::ScopeInterpreter;

/// Pipeline checkpoints at which conflict types are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionPoint {
    PreAnalysis,
    PreMigration,
    PostMigration,
}

/// What a conflict was raised against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictTarget {
    Action(ActionId),
    Group(ChangeGroupId),
    LinkAction(LinkActionId),
}

impl ConflictTarget {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Action(_) => "action",
            Self::Group(_) => "group",
            Self::LinkAction(_) => "link_action",
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            Self::Action(id) => id.raw(),
            Self::Group(id) => id.raw(),
            Self::LinkAction(id) => id.raw(),
        }
    }

    pub fn from_parts(kind: &str, raw: i64) -> Result<Self, CoreError> {
        match kind {
            "action" => Ok(Self::Action(ActionId::from_raw(raw))),
            "group" => Ok(Self::Group(ChangeGroupId::from_raw(raw))),
            "link_action" => Ok(Self::LinkAction(LinkActionId::from_raw(raw))),
            _ => Err(CoreError::InvalidStatus(format!("unknown conflict target: {kind}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
    /// Resolved for now; re-raised at the start of the next pass.
    ScheduledForRetry,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
            Self::ScheduledForRetry => "scheduled_for_retry",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "unresolved" => Ok(Self::Unresolved),
            "resolved" => Ok(Self::Resolved),
            "scheduled_for_retry" => Ok(Self::ScheduledForRetry),
            _ => Err(CoreError::InvalidStatus(format!("unknown conflict status: {s}"))),
        }
    }
}

/// What closed a resolved conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolvedBy {
    /// A resolution rule handled it; `resolved_by_rule` names the rule.
    Rule,
    /// Re-analysis of the target no longer raised it.
    NotRedetected,
    /// The link endpoint it waited on has been migrated.
    EndpointCreated,
}

impl ResolvedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::NotRedetected => "not_redetected",
            Self::EndpointCreated => "endpoint_created",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "rule" => Ok(Self::Rule),
            "not_redetected" => Ok(Self::NotRedetected),
            "endpoint_created" => Ok(Self::EndpointCreated),
            _ => Err(CoreError::InvalidStatus(format!("unknown resolution reason: {s}"))),
        }
    }
}

/// Path changes a rule made to its action. Analysis starts each action from
/// a fresh translation, so these are stored with the conflict and applied
/// again every time the action is analysed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub category: ResolutionCategory,
    pub translated_path: Option<String>,
    pub mapping_override: Option<(String, String)>,
}

impl ResolutionOutcome {
    /// `None` for resolutions that leave nothing to re-apply.
    pub fn of(result: &ConflictResolutionResult) -> Option<Self> {
        let keeps_paths = matches!(
            result.category,
            ResolutionCategory::UpdateAction | ResolutionCategory::ChangeConfigMapping
        );
        if !result.resolved || !keeps_paths {
            return None;
        }
        Some(Self {
            category: result.category,
            translated_path: result.translated_path.clone(),
            mapping_override: result.mapping_override.clone(),
        })
    }

    pub fn to_result(&self, rule_id: Option<RuleId>) -> ConflictResolutionResult {
        let mut result = ConflictResolutionResult::resolved(self.category);
        result.rule_id = rule_id;
        result.translated_path = self.translated_path.clone();
        result.mapping_override = self.mapping_override.clone();
        result
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConflict {
    pub conflict_id: ConflictId,
    pub session_id: SessionId,
    pub source_id: SourceId,
    /// Reference name of the conflict type.
    pub conflict_type: String,
    pub target: ConflictTarget,
    /// Group owning the target, when there is one.
    pub group_id: Option<ChangeGroupId>,
    pub scope_hint: String,
    /// Free-form description; rules may match on a substring of it.
    pub details: String,
    /// Content hash of the target at the time the conflict was raised.
    pub fingerprint: Option<Fingerprint>,
    pub status: ConflictStatus,
    pub resolved_by_rule: Option<RuleId>,
    /// Set whenever `status` is Resolved.
    pub resolved_by: Option<ResolvedBy>,
    /// Replayed on re-analysis of the target.
    pub outcome: Option<ResolutionOutcome>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl MigrationConflict {
    pub fn new(
        session_id: SessionId,
        source_id: SourceId,
        conflict_type: impl Into<String>,
        target: ConflictTarget,
        scope_hint: impl Into<String>,
    ) -> Self {
        Self {
            conflict_id: ConflictId::UNSAVED,
            session_id,
            source_id,
            conflict_type: conflict_type.into(),
            target,
            group_id: None,
            scope_hint: scope_hint.into(),
            details: String::new(),
            fingerprint: None,
            status: ConflictStatus::Unresolved,
            resolved_by_rule: None,
            resolved_by: None,
            outcome: None,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Conflict against a single migration action; carries its fingerprint.
    pub fn for_action(
        session_id: SessionId,
        source_id: SourceId,
        conflict_type: impl Into<String>,
        action: &MigrationAction,
    ) -> Self {
        let mut conflict = Self::new(
            session_id,
            source_id,
            conflict_type,
            ConflictTarget::Action(action.action_id),
            action.path.clone(),
        );
        conflict.group_id = Some(action.group_id);
        conflict.fingerprint = Some(action.fingerprint());
        conflict
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_scope_hint(mut self, scope_hint: impl Into<String>) -> Self {
        self.scope_hint = scope_hint.into();
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Unresolved
    }

    /// Close the conflict without a rule.
    pub fn close(&mut self, by: ResolvedBy) {
        self.status = ConflictStatus::Resolved;
        self.resolved_by = Some(by);
    }
}

/// Category reported by a resolution action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionCategory {
    UpdateAction,
    CreateNewActions,
    SuppressAction,
    SuppressGroup,
    ChangeConfigMapping,
    ScheduleForRetry,
    AutoResolve,
    Other,
}

impl ResolutionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateAction => "update_action",
            Self::CreateNewActions => "create_new_actions",
            Self::SuppressAction => "suppress_action",
            Self::SuppressGroup => "suppress_group",
            Self::ChangeConfigMapping => "change_config_mapping",
            Self::ScheduleForRetry => "schedule_for_retry",
            Self::AutoResolve => "auto_resolve",
            Self::Other => "other",
        }
    }
}

/// A durable (scope, conflict type, resolution action) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolutionRule {
    pub rule_id: RuleId,
    pub session_id: SessionId,
    pub conflict_type: String,
    pub scope: String,
    /// Reference name of the resolution action.
    pub action: String,
    /// Substring a conflict's details must contain; `None` matches any.
    pub details: Option<String>,
    pub data: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ConflictResolutionRule {
    pub fn new(
        session_id: SessionId,
        conflict_type: impl Into<String>,
        scope: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: RuleId::UNSAVED,
            session_id,
            conflict_type: conflict_type.into(),
            scope: scope.into(),
            action: action.into(),
            details: None,
            data: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn matches_details(&self, details: &str) -> bool {
        match &self.details {
            None => true,
            Some(d) if d.is_empty() => true,
            Some(d) => details.to_lowercase().contains(&d.to_lowercase()),
        }
    }

    pub fn data_to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(&self.data).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn data_from_msgpack(bytes: &[u8]) -> Result<BTreeMap<String, String>, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Two rules with equal content are the same rule.
    pub fn same_content(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.conflict_type == other.conflict_type
            && self.scope == other.scope
            && self.action == other.action
            && self.details == other.details
            && self.data == other.data
    }
}

/// Most specific scope first, then rules naming details before wildcard
/// rules, then creation order.
pub fn rule_precedence(
    scope: &dyn ScopeInterpreter,
    a: &ConflictResolutionRule,
    b: &ConflictResolutionRule,
) -> Ordering {
    let specified = |r: &ConflictResolutionRule| r.details.as_deref().is_some_and(|d| !d.is_empty());
    scope
        .compare_specificity(&a.scope, &b.scope)
        .then_with(|| specified(b).cmp(&specified(a)))
        .then_with(|| a.rule_id.cmp(&b.rule_id))
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolutionResult {
    pub resolved: bool,
    pub category: ResolutionCategory,
    pub rule_id: Option<RuleId>,
    /// Actions inserted in place of the conflicted one.
    pub new_actions: Vec<MigrationAction>,
    pub new_link_actions: Vec<LinkChangeAction>,
    /// Replacement translated path for the conflicted action.
    pub translated_path: Option<String>,
    /// Path mapping override (source prefix, target prefix).
    pub mapping_override: Option<(String, String)>,
    pub retry_limit: Option<u32>,
}

impl ConflictResolutionResult {
    pub fn unresolved() -> Self {
        Self {
            resolved: false,
            category: ResolutionCategory::Other,
            rule_id: None,
            new_actions: Vec::new(),
            new_link_actions: Vec::new(),
            translated_path: None,
            mapping_override: None,
            retry_limit: None,
        }
    }

    pub fn resolved(category: ResolutionCategory) -> Self {
        Self {
            resolved: true,
            category,
            ..Self::unresolved()
        }
    }
}
