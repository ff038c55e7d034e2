use std::collections::HashMap;

use tandem_core::SourceId;

use crate::adapter::{TranslationService, map_prefix};

/// Caches and overrides that live for one session run. Passed explicitly to
/// the pipeline entry points and dropped with the run; mapping overrides are
/// restored from resolved conflicts when the next run starts.
#[derive(Debug, Default)]
pub struct RunContext {
    translations: HashMap<(SourceId, String), Option<String>>,
    /// (source, source prefix, target prefix) added by resolutions.
    mapping_overrides: Vec<(SourceId, String, String)>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate through the overrides first, then the translator. Results
    /// are cached for the rest of the run.
    pub fn translate(
        &mut self,
        translator: &dyn TranslationService,
        source_id: SourceId,
        path: &str,
    ) -> Option<String> {
        let key = (source_id, path.to_lowercase());
        if let Some(hit) = self.translations.get(&key) {
            return hit.clone();
        }
        let overridden = self
            .mapping_overrides
            .iter()
            .filter(|(source, _, _)| *source == source_id)
            .find_map(|(_, from, to)| map_prefix(path, from, to));
        let translated = overridden.or_else(|| translator.translate(source_id, path));
        self.translations.insert(key, translated.clone());
        translated
    }

    /// Returns false when the same override is already present.
    pub fn add_mapping_override(&mut self, source_id: SourceId, from: &str, to: &str) -> bool {
        let known = self
            .mapping_overrides
            .iter()
            .any(|(source, f, t)| *source == source_id && f == from && t == to);
        if known {
            return false;
        }
        self.mapping_overrides
            .push((source_id, from.to_string(), to.to_string()));
        // Cached misses may now translate.
        self.translations.clear();
        true
    }

    pub fn cached_translations(&self) -> usize {
        self.translations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PathMappingTranslator;
    use crate::config::PathMapping;

    #[test]
    fn override_applies_to_unmapped_path() {
        let (left, right) = (SourceId::new(), SourceId::new());
        let translator = PathMappingTranslator::new(
            left,
            right,
            vec![PathMapping {
                left: "/Main".into(),
                right: "/Mirror".into(),
            }],
        );
        let mut ctx = RunContext::new();
        assert_eq!(ctx.translate(&translator, left, "/Extra/a.txt"), None);
        assert_eq!(ctx.cached_translations(), 1);

        assert!(ctx.add_mapping_override(left, "/Extra", "/Mirror/Extra"));
        assert!(!ctx.add_mapping_override(left, "/Extra", "/Mirror/Extra"));
        assert_eq!(
            ctx.translate(&translator, left, "/Extra/a.txt").as_deref(),
            Some("/Mirror/Extra/a.txt")
        );
        assert_eq!(ctx.translate(&translator, right, "/Extra/a.txt"), None);
    }
}
