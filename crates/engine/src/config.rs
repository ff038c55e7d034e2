use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_core::{ErrorSignature, ScopeInterpreter, SessionId, SourceId, scope::BasicPathScope};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Changes flow from the left source to the right one only.
    LeftToRight,
    #[default]
    Bidirectional,
}

/// One step of the deferred-link retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeStep {
    pub interval_secs: u64,
    pub retries: u32,
}

/// Left-side path prefix and the right-side prefix it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRouterConfig {
    pub signature: ErrorSignature,
    /// Absent means route every occurrence.
    #[serde(default)]
    pub max_occurrence: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub conflict_type: String,
    pub scope: String,
    pub action: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub session_id: Uuid,
    pub left_source: Uuid,
    pub right_source: Uuid,
    /// Adapter reference names, looked up in the adapter registry.
    #[serde(default)]
    pub left_adapter: String,
    #[serde(default)]
    pub right_adapter: String,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_group_span_secs")]
    pub max_group_span_secs: u64,
    #[serde(default = "default_link_age_schedule")]
    pub link_age_schedule: Vec<AgeStep>,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default)]
    pub path_mappings: Vec<PathMapping>,
    #[serde(default)]
    pub error_routers: Vec<ErrorRouterConfig>,
    #[serde(default)]
    pub resolution_rules: Vec<RuleConfig>,
}

fn default_page_size() -> usize {
    50
}

fn default_max_group_span_secs() -> u64 {
    600
}

fn default_link_age_schedule() -> Vec<AgeStep> {
    vec![
        AgeStep { interval_secs: 0, retries: 3 },
        AgeStep { interval_secs: 60, retries: 3 },
        AgeStep { interval_secs: 600, retries: 5 },
    ]
}

fn default_max_retry_count() -> u32 {
    3
}

impl SessionConfig {
    pub fn new(session_id: SessionId, left_source: SourceId, right_source: SourceId) -> Self {
        Self {
            session_id: *session_id.as_uuid(),
            left_source: *left_source.as_uuid(),
            right_source: *right_source.as_uuid(),
            left_adapter: String::new(),
            right_adapter: String::new(),
            direction: SyncDirection::default(),
            page_size: default_page_size(),
            max_group_span_secs: default_max_group_span_secs(),
            link_age_schedule: default_link_age_schedule(),
            max_retry_count: default_max_retry_count(),
            path_mappings: Vec::new(),
            error_routers: Vec::new(),
            resolution_rules: Vec::new(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Configuration(format!("invalid session config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn to_yaml(&self) -> Result<String, EngineError> {
        serde_yaml::to_string(self).map_err(|e| EngineError::Configuration(e.to_string()))
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::from_uuid(self.session_id)
    }

    pub fn left_source(&self) -> SourceId {
        SourceId::from_uuid(self.left_source)
    }

    pub fn right_source(&self) -> SourceId {
        SourceId::from_uuid(self.right_source)
    }

    /// The other side of the session.
    pub fn peer_of(&self, source_id: SourceId) -> Option<SourceId> {
        if source_id == self.left_source() {
            Some(self.right_source())
        } else if source_id == self.right_source() {
            Some(self.left_source())
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.left_source == self.right_source {
            return Err(EngineError::Configuration(
                "left and right sources must differ".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(EngineError::Configuration("page_size must be positive".into()));
        }
        if self.link_age_schedule.is_empty() {
            return Err(EngineError::Configuration(
                "link_age_schedule needs at least one step".into(),
            ));
        }
        let scope = BasicPathScope;
        for mapping in &self.path_mappings {
            if !mapping.left.starts_with('/') || !scope.is_well_formed(&mapping.left) {
                return Err(EngineError::Configuration(format!(
                    "malformed left mapping path: {}",
                    mapping.left
                )));
            }
            if !mapping.right.starts_with('/') || !scope.is_well_formed(&mapping.right) {
                return Err(EngineError::Configuration(format!(
                    "malformed right mapping path: {}",
                    mapping.right
                )));
            }
        }
        for router in &self.error_routers {
            if router.max_occurrence == Some(0) {
                return Err(EngineError::Configuration(format!(
                    "max_occurrence for {} must be positive",
                    router.signature
                )));
            }
        }
        for rule in &self.resolution_rules {
            if !scope.is_well_formed(&rule.scope) {
                return Err(EngineError::Configuration(format!(
                    "malformed rule scope: {}",
                    rule.scope
                )));
            }
        }
        Ok(())
    }
}
