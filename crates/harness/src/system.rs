use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tandem_core::{
    ActionId, ActionKind, ArtifactLink, ChangeGroup, Fault, LinkActionKind, LinkChangeAction,
};
use tandem_engine::{
    Adapter, ChangeBatch, DetectedAction, DetectedLinkChange, LinkApplyOutcome, LinkBatch, MigrationResult,
};

/// Adapter call a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FaultPoint {
    Enumerate,
    Download,
    Apply,
    ApplyLink,
    Diff,
}

/// Runs inside the next `apply`, after the write.
struct ApplyHook(Box<dyn FnOnce() + Send>);

impl fmt::Debug for ApplyHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApplyHook")
    }
}

#[derive(Debug, Default)]
struct SystemState {
    seq: i64,
    changes: Vec<(i64, DetectedAction)>,
    link_seq: i64,
    link_changes: Vec<(i64, DetectedLinkChange)>,
    files: BTreeMap<String, Vec<u8>>,
    /// Bytes handed to `apply`, keyed by the source item they came from.
    received: BTreeMap<String, Vec<u8>>,
    applied: Vec<String>,
    links: Vec<(LinkActionKind, ArtifactLink)>,
    faults: BTreeMap<FaultPoint, VecDeque<Fault>>,
    corrupt_writes: bool,
    rejected_link_types: BTreeMap<String, String>,
    enumerations: Vec<i64>,
    apply_hook: Option<ApplyHook>,
}

/// In-memory repository standing in for one side of a session. Clones share
/// state, so a test keeps a handle while the worker owns the adapter.
#[derive(Debug, Clone)]
pub struct FakeSystem {
    name: String,
    state: Arc<Mutex<SystemState>>,
}

impl FakeSystem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SystemState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, SystemState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one detected action, and its content when it carries any.
    pub fn push(&self, action: DetectedAction, content: Option<&str>) {
        let mut state = self.state();
        if let Some(content) = content {
            state.files.insert(action.path.clone(), content.as_bytes().to_vec());
        }
        if action.kind == ActionKind::Delete {
            state.files.remove(&action.path);
        }
        state.seq += 1;
        let seq = state.seq;
        state.changes.push((seq, action));
    }

    pub fn add(&self, change: &str, path: &str, content: &str) {
        self.push(DetectedAction::new(change, ActionKind::Add, path), Some(content));
    }

    pub fn edit(&self, change: &str, path: &str, content: &str) {
        self.push(DetectedAction::new(change, ActionKind::Edit, path), Some(content));
    }

    pub fn delete(&self, change: &str, path: &str) {
        self.push(DetectedAction::new(change, ActionKind::Delete, path), None);
    }

    /// Content that existed before the session started; it has no history.
    pub fn seed(&self, path: &str, content: &str) {
        self.state().files.insert(path.to_string(), content.as_bytes().to_vec());
    }

    pub fn link_change(&self, name: &str, actions: Vec<LinkChangeAction>) {
        let mut state = self.state();
        state.link_seq += 1;
        let seq = state.link_seq;
        state.link_changes.push((
            seq,
            DetectedLinkChange {
                name: name.to_string(),
                actions,
            },
        ));
    }

    pub fn fail_next(&self, point: FaultPoint, fault: Fault) {
        self.state().faults.entry(point).or_default().push_back(fault);
    }

    /// Every later write stores bytes different from those received.
    pub fn set_corrupt_writes(&self, corrupt: bool) {
        self.state().corrupt_writes = corrupt;
    }

    /// Links of `link_type` come back as a conflict of `conflict_type`.
    pub fn reject_links(&self, link_type: &str, conflict_type: &str) {
        self.state()
            .rejected_link_types
            .insert(link_type.to_lowercase(), conflict_type.to_string());
    }

    pub fn accept_links(&self, link_type: &str) {
        self.state().rejected_link_types.remove(&link_type.to_lowercase());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Names of the groups written here, in write order.
    pub fn applied(&self) -> Vec<String> {
        self.state().applied.clone()
    }

    pub fn links(&self) -> Vec<(LinkActionKind, ArtifactLink)> {
        self.state().links.clone()
    }

    /// Checkpoints `enumerate_changes` was called with.
    pub fn enumerations(&self) -> Vec<i64> {
        self.state().enumerations.clone()
    }

    /// Run `hook` once, right after the next successful write.
    pub fn on_next_apply(&self, hook: impl FnOnce() + Send + 'static) {
        self.state().apply_hook = Some(ApplyHook(Box::new(hook)));
    }

    fn injected(state: &mut SystemState, point: FaultPoint) -> Result<(), Fault> {
        match state.faults.get_mut(&point).and_then(VecDeque::pop_front) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

impl Adapter for FakeSystem {
    fn reference_name(&self) -> &str {
        &self.name
    }

    fn enumerate_changes(&mut self, since: i64) -> Result<ChangeBatch, Fault> {
        let mut state = self.state();
        Self::injected(&mut state, FaultPoint::Enumerate)?;
        state.enumerations.push(since);
        let actions = state
            .changes
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, action)| action.clone())
            .collect();
        Ok(ChangeBatch {
            actions,
            checkpoint: state.seq.max(since),
        })
    }

    fn download(&mut self, item: &str) -> Result<Vec<u8>, Fault> {
        let mut state = self.state();
        Self::injected(&mut state, FaultPoint::Download)?;
        state
            .files
            .get(item)
            .cloned()
            .ok_or_else(|| Fault::new("NotFound", format!("{} has no item {item}", self.name)))
    }

    fn diff(&mut self, item: &str, other_item: &str) -> Result<bool, Fault> {
        let mut state = self.state();
        Self::injected(&mut state, FaultPoint::Diff)?;
        Ok(state.files.get(item) != state.received.get(other_item))
    }

    fn has_item(&mut self, path: &str) -> Result<Option<bool>, Fault> {
        Ok(Some(self.state().files.contains_key(path)))
    }

    fn apply(
        &mut self,
        group: &ChangeGroup,
        contents: &BTreeMap<ActionId, Vec<u8>>,
    ) -> Result<MigrationResult, Fault> {
        let mut state = self.state();
        Self::injected(&mut state, FaultPoint::Apply)?;

        let mut peer_items = BTreeMap::new();
        for action in group.actions.iter().filter(|a| a.is_migratable()) {
            let target = action
                .translated_path
                .clone()
                .unwrap_or_else(|| action.path.clone());
            match action.kind {
                ActionKind::Delete => {
                    state.files.remove(&target);
                }
                ActionKind::Rename => {
                    let moved = action
                        .from_path
                        .as_ref()
                        .and_then(|from| state.files.remove(from))
                        .unwrap_or_default();
                    state.files.insert(target.clone(), moved);
                }
                ActionKind::Label => {}
                _ => {
                    let bytes = contents.get(&action.action_id).cloned().unwrap_or_default();
                    let mut written = bytes.clone();
                    if state.corrupt_writes {
                        written.extend_from_slice(b"\0");
                    }
                    state.files.insert(target.clone(), written);
                    state.received.insert(action.item.clone(), bytes);
                }
            }
            peer_items.insert(action.action_id, target);
        }

        state.seq += 1;
        let seq = state.seq;
        let peer_change = format!("{}-{seq}", self.name);
        // The write shows up in this system's own history, as it would on a
        // real server.
        for action in group.actions.iter().filter(|a| a.is_migratable()) {
            let path = action
                .translated_path
                .clone()
                .unwrap_or_else(|| action.path.clone());
            state
                .changes
                .push((seq, DetectedAction::new(peer_change.clone(), action.kind, path)));
        }
        state.applied.push(group.name.clone());
        tracing::debug!(system = %self.name, group = %group.name, change = %peer_change, "applied");
        if let Some(ApplyHook(hook)) = state.apply_hook.take() {
            hook();
        }
        Ok(MigrationResult {
            peer_change,
            peer_items,
        })
    }

    fn enumerate_link_changes(&mut self, since: i64) -> Result<LinkBatch, Fault> {
        let state = self.state();
        let changes = state
            .link_changes
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, change)| change.clone())
            .collect();
        Ok(LinkBatch {
            changes,
            checkpoint: state.link_seq.max(since),
        })
    }

    fn apply_link(&mut self, action: &LinkChangeAction) -> Result<LinkApplyOutcome, Fault> {
        let mut state = self.state();
        Self::injected(&mut state, FaultPoint::ApplyLink)?;
        if let Some(conflict_type) = state
            .rejected_link_types
            .get(&action.link.link_type.to_lowercase())
        {
            return Ok(LinkApplyOutcome::Conflict {
                conflict_type: conflict_type.clone(),
                details: format!("{} refuses {} links", self.name, action.link.link_type),
            });
        }

        state.links.push((action.kind, action.link.clone()));
        state.link_seq += 1;
        let seq = state.link_seq;
        let server_change_id = format!("{}-link-{seq}", self.name);
        let echo = LinkChangeAction::new(action.kind, action.link.clone())
            .with_server_link_change_id(server_change_id.clone());
        state.link_changes.push((
            seq,
            DetectedLinkChange {
                name: server_change_id.clone(),
                actions: vec![echo],
            },
        ));
        Ok(LinkApplyOutcome::Applied { server_change_id })
    }
}
