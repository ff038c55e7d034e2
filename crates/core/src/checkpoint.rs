use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// A value that can be stored as a high-water mark. The stored form is text
/// so the store stays agnostic of the concrete type.
pub trait CheckpointValue: Clone + Ord + Default + std::fmt::Debug {
    fn encode(&self) -> String;
    fn decode(raw: &str) -> Result<Self, CoreError>;
}

impl CheckpointValue for i64 {
    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Result<Self, CoreError> {
        raw.parse()
            .map_err(|_| CoreError::InvalidCheckpoint(format!("not an i64: {raw}")))
    }
}

impl CheckpointValue for u64 {
    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Result<Self, CoreError> {
        raw.parse()
            .map_err(|_| CoreError::InvalidCheckpoint(format!("not a u64: {raw}")))
    }
}

impl CheckpointValue for String {
    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(raw: &str) -> Result<Self, CoreError> {
        Ok(raw.to_string())
    }
}

impl CheckpointValue for DateTime<Utc> {
    fn encode(&self) -> String {
        self.to_rfc3339()
    }

    fn decode(raw: &str) -> Result<Self, CoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CoreError::InvalidCheckpoint(format!("bad timestamp {raw}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn integer_checkpoints_roundtrip() {
        assert_eq!(i64::decode(&42i64.encode()).unwrap(), 42);
        assert_eq!(u64::decode("18").unwrap(), 18);
        assert!(i64::decode("forty-two").is_err());
    }

    #[test]
    fn timestamp_checkpoint_keeps_ordering() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        let decoded = DateTime::<Utc>::decode(&late.encode()).unwrap();
        assert_eq!(decoded, late);
        assert!(DateTime::<Utc>::decode(&early.encode()).unwrap() < decoded);
    }
}
