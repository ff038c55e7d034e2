use tandem_core::{CheckpointValue, SessionId, SourceId};
use tandem_storage::Storage;

use crate::error::EngineError;

/// A named, typed checkpoint persisted per (session, source, name).
///
/// The value is loaded on first use and cached. `update` writes through to
/// the store and refuses to move backwards; only `reset` may lower it.
#[derive(Debug, Clone)]
pub struct HighWaterMark<T: CheckpointValue> {
    session_id: SessionId,
    source_id: SourceId,
    name: String,
    cached: Option<T>,
}

impl<T: CheckpointValue> HighWaterMark<T> {
    pub fn new(session_id: SessionId, source_id: SourceId, name: impl Into<String>) -> Self {
        Self {
            session_id,
            source_id,
            name: name.into(),
            cached: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached value, loading it on first use. An absent row reads as
    /// `T::default()`.
    pub fn value(&mut self, store: &dyn Storage) -> Result<T, EngineError> {
        if let Some(value) = &self.cached {
            return Ok(value.clone());
        }
        self.reload(store)
    }

    /// Force a re-read, picking up administrative resets made elsewhere.
    pub fn reload(&mut self, store: &dyn Storage) -> Result<T, EngineError> {
        let raw = store.read_checkpoint(self.session_id, self.source_id, &self.name)?;
        let value = match raw {
            Some(raw) => T::decode(&raw)?,
            None => T::default(),
        };
        self.cached = Some(value.clone());
        Ok(value)
    }

    /// Persist `value`, then cache it. Call only after the batch this value
    /// bounds is durable.
    pub fn update(&mut self, store: &mut dyn Storage, value: T) -> Result<(), EngineError> {
        let current = self.value(store)?;
        if value < current {
            return Err(EngineError::CheckpointRegression {
                name: self.name.clone(),
                current: current.encode(),
                proposed: value.encode(),
            });
        }
        if value == current && self.stored(store)? {
            return Ok(());
        }
        store.write_checkpoint(self.session_id, self.source_id, &self.name, &value.encode())?;
        tracing::debug!(
            session = %self.session_id,
            source = %self.source_id,
            name = %self.name,
            value = %value.encode(),
            "high-water mark advanced"
        );
        self.cached = Some(value);
        Ok(())
    }

    /// Administrative reset; may lower the value.
    pub fn reset(&mut self, store: &mut dyn Storage, value: T) -> Result<(), EngineError> {
        store.write_checkpoint(self.session_id, self.source_id, &self.name, &value.encode())?;
        tracing::info!(
            session = %self.session_id,
            name = %self.name,
            value = %value.encode(),
            "high-water mark reset"
        );
        self.cached = Some(value);
        Ok(())
    }

    pub fn cached(&self) -> Option<&T> {
        self.cached.as_ref()
    }

    fn stored(&self, store: &dyn Storage) -> Result<bool, EngineError> {
        Ok(store
            .read_checkpoint(self.session_id, self.source_id, &self.name)?
            .is_some())
    }
}
