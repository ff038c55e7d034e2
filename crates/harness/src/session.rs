use std::error::Error;
use std::thread;

use tandem_core::{SessionId, SourceId};
use tandem_engine::{Adapter, AdapterRegistry, EngineError, PollReport, SessionConfig, SessionWorker};
use tandem_storage::SqliteStorage;
use tempfile::TempDir;

use crate::system::FakeSystem;

pub const FAKE_ADAPTER: &str = "fake";

/// Registry whose "fake" adapter hands out `left` or `right` by source.
pub fn fake_registry(left: &FakeSystem, right: &FakeSystem) -> AdapterRegistry {
    let (left, right) = (left.clone(), right.clone());
    let mut registry = AdapterRegistry::new();
    registry.register(
        FAKE_ADAPTER,
        move |config: &SessionConfig, source: SourceId| -> Result<Box<dyn Adapter>, EngineError> {
            if source == config.left_source() {
                Ok(Box::new(left.clone()))
            } else {
                Ok(Box::new(right.clone()))
            }
        },
    );
    registry
}

/// One session worker between two fake systems.
pub struct TestSession {
    pub worker: SessionWorker,
    pub left: FakeSystem,
    pub right: FakeSystem,
}

impl TestSession {
    /// Fresh ids, fake adapters on both sides, defaults otherwise.
    pub fn config() -> SessionConfig {
        let mut config = SessionConfig::new(SessionId::new(), SourceId::new(), SourceId::new());
        config.left_adapter = FAKE_ADAPTER.into();
        config.right_adapter = FAKE_ADAPTER.into();
        config
    }

    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(Self::config())
    }

    pub fn with_config(config: SessionConfig) -> Result<Self, EngineError> {
        Self::build(
            config,
            SqliteStorage::open_in_memory()?,
            FakeSystem::new("left"),
            FakeSystem::new("right"),
        )
    }

    /// File-backed session, so it can be reopened or shared.
    pub fn open(config: SessionConfig, db_path: &str) -> Result<Self, EngineError> {
        Self::build(
            config,
            SqliteStorage::open(db_path)?,
            FakeSystem::new("left"),
            FakeSystem::new("right"),
        )
    }

    /// Session over a store the caller opened and tuned.
    pub fn with_store(config: SessionConfig, store: SqliteStorage) -> Result<Self, EngineError> {
        Self::build(config, store, FakeSystem::new("left"), FakeSystem::new("right"))
    }

    /// Drop the worker and start a new one on the same database and
    /// systems, as a process restart would.
    pub fn reopen(self, db_path: &str) -> Result<Self, EngineError> {
        let Self { worker, left, right } = self;
        let config = worker.config().clone();
        drop(worker);
        Self::build(config, SqliteStorage::open(db_path)?, left, right)
    }

    fn build(
        config: SessionConfig,
        store: SqliteStorage,
        left: FakeSystem,
        right: FakeSystem,
    ) -> Result<Self, EngineError> {
        let worker = SessionWorker::from_registry(config, store, &fake_registry(&left, &right))?;
        Ok(Self { worker, left, right })
    }

    pub fn poll(&mut self) -> Result<PollReport, EngineError> {
        self.worker.poll()
    }

    pub fn session_id(&self) -> SessionId {
        self.worker.session_id()
    }

    pub fn left_id(&self) -> SourceId {
        self.worker.config().left_source()
    }

    pub fn right_id(&self) -> SourceId {
        self.worker.config().right_source()
    }
}

/// Several sessions sharing one database file, each polled on its own
/// thread.
pub struct TestSessionGroup {
    dir: TempDir,
    sessions: Vec<TestSession>,
}

impl TestSessionGroup {
    pub fn new(count: usize) -> Result<Self, Box<dyn Error>> {
        let mut group = Self {
            dir: tempfile::tempdir()?,
            sessions: Vec::new(),
        };
        for _ in 0..count {
            group.add_session(TestSession::config())?;
        }
        Ok(group)
    }

    pub fn db_path(&self) -> String {
        self.dir.path().join("sessions.db").to_string_lossy().into_owned()
    }

    pub fn add_session(&mut self, config: SessionConfig) -> Result<usize, EngineError> {
        let session = TestSession::open(config, &self.db_path())?;
        self.sessions.push(session);
        Ok(self.sessions.len() - 1)
    }

    pub fn session(&self, index: usize) -> &TestSession {
        &self.sessions[index]
    }

    pub fn session_mut(&mut self, index: usize) -> &mut TestSession {
        &mut self.sessions[index]
    }

    /// Poll every session `polls` times in parallel. Results are in session
    /// order.
    pub fn run(&mut self, polls: usize) -> Vec<Result<Vec<PollReport>, EngineError>> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .sessions
                .iter_mut()
                .map(|session| {
                    scope.spawn(move || {
                        let mut reports = Vec::with_capacity(polls);
                        for _ in 0..polls {
                            reports.push(session.poll()?);
                        }
                        Ok::<_, EngineError>(reports)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(EngineError::InvariantViolation("session thread panicked".into())))
                })
                .collect()
        })
    }
}
