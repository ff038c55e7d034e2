use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use tandem_core::{ActionId, ActionKind, ChangeGroup, Fault, LinkChangeAction, SourceId};

use crate::config::{PathMapping, SessionConfig};
use crate::error::EngineError;

/// One action as reported by an adapter's change enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedAction {
    /// Source-side change identifier the action belongs to.
    pub change_name: String,
    /// Opaque item reference, stored and handed back unchanged.
    pub item: String,
    pub kind: ActionKind,
    pub path: String,
    pub from_path: Option<String>,
    pub content_type: String,
    pub version: Option<String>,
    pub owner: Option<String>,
    pub comment: String,
    pub change_time: DateTime<Utc>,
}

impl DetectedAction {
    pub fn new(change_name: impl Into<String>, kind: ActionKind, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            change_name: change_name.into(),
            item: path.clone(),
            kind,
            path,
            from_path: None,
            content_type: String::new(),
            version: None,
            owner: None,
            comment: String::new(),
            change_time: Utc::now(),
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = item.into();
        self
    }

    pub fn with_from_path(mut self, from_path: impl Into<String>) -> Self {
        self.from_path = Some(from_path.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
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
}

/// Everything detected after a checkpoint, plus the checkpoint that bounds it.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub actions: Vec<DetectedAction>,
    pub checkpoint: i64,
}

#[derive(Debug, Clone)]
pub struct DetectedLinkChange {
    pub name: String,
    pub actions: Vec<LinkChangeAction>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkBatch {
    pub changes: Vec<DetectedLinkChange>,
    pub checkpoint: i64,
}

/// What the peer did with one change group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    /// Peer-side change identifier, recorded in the conversion history.
    pub peer_change: String,
    /// Peer item references written per action.
    pub peer_items: BTreeMap<ActionId, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkApplyOutcome {
    Applied { server_change_id: String },
    /// The peer refused the link for a reason that is not a fault.
    Conflict { conflict_type: String, details: String },
}

/// A concrete external system. Faults are returned, never panicked, and
/// conflicts are reported as values.
pub trait Adapter: Send {
    fn reference_name(&self) -> &str;

    fn enumerate_changes(&mut self, since: i64) -> Result<ChangeBatch, Fault>;

    fn download(&mut self, item: &str) -> Result<Vec<u8>, Fault>;

    /// True when the two items' contents differ.
    fn diff(&mut self, item: &str, other_item: &str) -> Result<bool, Fault>;

    /// Whether `path` currently exists on this system; `None` when the
    /// system cannot tell.
    fn has_item(&mut self, _path: &str) -> Result<Option<bool>, Fault> {
        Ok(None)
    }

    /// Write a group on this system. `contents` holds the downloaded bytes
    /// of each content-bearing action.
    fn apply(
        &mut self,
        group: &ChangeGroup,
        contents: &BTreeMap<ActionId, Vec<u8>>,
    ) -> Result<MigrationResult, Fault>;

    fn enumerate_link_changes(&mut self, since: i64) -> Result<LinkBatch, Fault> {
        Ok(LinkBatch {
            changes: Vec::new(),
            checkpoint: since,
        })
    }

    fn apply_link(&mut self, action: &LinkChangeAction) -> Result<LinkApplyOutcome, Fault>;
}

pub type AdapterFactory =
    Box<dyn Fn(&SessionConfig, SourceId) -> Result<Box<dyn Adapter>, EngineError> + Send + Sync>;

/// Startup-time table of adapter constructors keyed by reference name.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, reference_name: impl Into<String>, factory: F)
    where
        F: Fn(&SessionConfig, SourceId) -> Result<Box<dyn Adapter>, EngineError> + Send + Sync + 'static,
    {
        self.factories.insert(reference_name.into(), Box::new(factory));
    }

    pub fn contains(&self, reference_name: &str) -> bool {
        self.factories.contains_key(reference_name)
    }

    pub fn create(
        &self,
        reference_name: &str,
        config: &SessionConfig,
        source_id: SourceId,
    ) -> Result<Box<dyn Adapter>, EngineError> {
        let factory = self.factories.get(reference_name).ok_or_else(|| {
            EngineError::Configuration(format!("no adapter registered as '{reference_name}'"))
        })?;
        factory(config, source_id)
    }
}

/// Maps a path on one side to the equivalent path on the other side.
pub trait TranslationService: Send {
    /// `None` means the path is outside the mapped scope.
    fn translate(&self, source_id: SourceId, path: &str) -> Option<String>;
}

/// Replace the `from` prefix of `path` with `to`. Prefixes match whole
/// segments and ignore case.
pub fn map_prefix(path: &str, from: &str, to: &str) -> Option<String> {
    let from = from.trim_end_matches('/');
    if from.is_empty() {
        return Some(format!("{}{}", to.trim_end_matches('/'), path));
    }
    let head = path.get(..from.len())?;
    if !head.eq_ignore_ascii_case(from) {
        return None;
    }
    let rest = &path[from.len()..];
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    Some(format!("{}{}", to.trim_end_matches('/'), rest))
}

/// Translator driven by the session's path mappings. With no mappings every
/// path maps to itself.
pub struct PathMappingTranslator {
    left_source: SourceId,
    right_source: SourceId,
    mappings: Vec<PathMapping>,
}

impl PathMappingTranslator {
    pub fn new(left_source: SourceId, right_source: SourceId, mappings: Vec<PathMapping>) -> Self {
        let mut mappings = mappings;
        // Longest prefix wins.
        mappings.sort_by(|a, b| b.left.len().cmp(&a.left.len()));
        Self {
            left_source,
            right_source,
            mappings,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.left_source(),
            config.right_source(),
            config.path_mappings.clone(),
        )
    }
}

impl TranslationService for PathMappingTranslator {
    fn translate(&self, source_id: SourceId, path: &str) -> Option<String> {
        if self.mappings.is_empty() {
            return Some(path.to_string());
        }
        if source_id == self.left_source {
            self.mappings
                .iter()
                .find_map(|m| map_prefix(path, &m.left, &m.right))
        } else if source_id == self.right_source {
            let mut reversed: Vec<&PathMapping> = self.mappings.iter().collect();
            reversed.sort_by(|a, b| b.right.len().cmp(&a.right.len()));
            reversed
                .into_iter()
                .find_map(|m| map_prefix(path, &m.right, &m.left))
        } else {
            None
        }
    }
}
