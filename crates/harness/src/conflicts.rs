use std::collections::BTreeSet;

use tandem_core::{DetectionPoint, MigrationAction, MigrationConflict};
use tandem_engine::{ConflictType, DetectionContext, EngineError};

pub const CONTENT_TYPE_MISMATCH: &str = "content-type-mismatch";

/// Raised at classification time for content the peer cannot store.
/// Actions with no content type pass.
pub struct ContentTypeMismatch {
    accepted: BTreeSet<String>,
}

impl ContentTypeMismatch {
    pub fn accepting<'a>(content_types: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            accepted: content_types.into_iter().map(str::to_lowercase).collect(),
        }
    }
}

impl ConflictType for ContentTypeMismatch {
    fn reference_name(&self) -> &str {
        CONTENT_TYPE_MISMATCH
    }

    fn friendly_name(&self) -> &str {
        "Content type not supported by the peer"
    }

    fn detection_points(&self) -> &[DetectionPoint] {
        &[DetectionPoint::PreAnalysis]
    }

    fn supported_actions(&self) -> &[&'static str] {
        &["skip-action", "skip-group", "auto-resolve", "schedule-retry"]
    }

    fn supports_multiple_retry(&self) -> bool {
        true
    }

    fn detect(
        &self,
        ctx: &DetectionContext<'_>,
        action: &MigrationAction,
    ) -> Result<Option<MigrationConflict>, EngineError> {
        if action.content_type.is_empty() || self.accepted.contains(&action.content_type.to_lowercase()) {
            return Ok(None);
        }
        Ok(Some(ctx.conflict_for(CONTENT_TYPE_MISMATCH, action).with_details(format!(
            "content type {} is not accepted",
            action.content_type
        ))))
    }
}
