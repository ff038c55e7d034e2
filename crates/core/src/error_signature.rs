use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Matches any type or any message.
pub const WILDCARD: &str = "*";

/// A classified failure raised by an external collaborator. `kind` plays the
/// role of an exception type name; `inner` is the underlying cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: String,
    pub message: String,
    pub inner: Option<Box<Fault>>,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            inner: None,
        }
    }

    pub fn with_inner(mut self, inner: Fault) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Type/message pair for one level of a fault chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureLevel {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl SignatureLevel {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    fn has_type(&self) -> bool {
        !self.kind.is_empty() && self.kind != WILDCARD
    }

    fn has_message(&self) -> bool {
        !self.message.is_empty() && self.message != WILDCARD
    }

    pub fn matches(&self, fault: &Fault) -> bool {
        let type_ok = !self.has_type() || self.kind.eq_ignore_ascii_case(&fault.kind);
        let message_ok = !self.has_message() || fault.message.contains(&self.message);
        type_ok && message_ok
    }
}

/// Predicate over a fault and, for two-level signatures, its inner fault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorSignature {
    #[serde(flatten)]
    pub outer: SignatureLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<SignatureLevel>,
}

impl ErrorSignature {
    pub fn one_level(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            outer: SignatureLevel::new(kind, message),
            inner: None,
        }
    }

    pub fn two_level(outer: SignatureLevel, inner: SignatureLevel) -> Self {
        Self {
            outer,
            inner: Some(inner),
        }
    }

    /// Any fault at all.
    pub fn wildcard() -> Self {
        Self::one_level(WILDCARD, WILDCARD)
    }

    /// Any fault that has an inner fault.
    pub fn wildcard_two_level() -> Self {
        Self::two_level(
            SignatureLevel::new(WILDCARD, WILDCARD),
            SignatureLevel::new(WILDCARD, WILDCARD),
        )
    }

    pub fn matches(&self, fault: &Fault) -> bool {
        if !self.outer.matches(fault) {
            return false;
        }
        match (&self.inner, &fault.inner) {
            (None, _) => true,
            (Some(sig), Some(inner)) => sig.matches(inner),
            (Some(_), None) => false,
        }
    }

    fn specificity(&self) -> (usize, usize, usize) {
        let levels = 1 + usize::from(self.inner.is_some());
        let levels_iter = || std::iter::once(&self.outer).chain(self.inner.as_ref());
        let messages = levels_iter().filter(|l| l.has_message()).count();
        let types = levels_iter().filter(|l| l.has_type()).count();
        (levels, messages, types)
    }
}

/// Sorting puts the most specific signature first, so the first match in a
/// sorted list wins. Wildcards sort last.
impl Ord for ErrorSignature {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .specificity()
            .cmp(&self.specificity())
            .then_with(|| self.outer.kind.cmp(&other.outer.kind))
            .then_with(|| self.outer.message.cmp(&other.outer.message))
            .then_with(|| {
                let key = |s: &Self| s.inner.as_ref().map(|l| (l.kind.clone(), l.message.clone()));
                key(self).cmp(&key(other))
            })
    }
}

impl PartialOrd for ErrorSignature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.outer.kind, self.outer.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " <- {}[{}]", inner.kind, inner.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_level_matches_type_and_message_substring() {
        let sig = ErrorSignature::one_level("Timeout", "connect");
        assert!(sig.matches(&Fault::new("timeout", "failed to connect to host")));
        assert!(!sig.matches(&Fault::new("Timeout", "read stalled")));
        assert!(!sig.matches(&Fault::new("Permission", "failed to connect")));
    }

    #[test]
    fn wildcard_matches_everything() {
        assert!(ErrorSignature::wildcard().matches(&Fault::new("Anything", "")));
        assert!(ErrorSignature::one_level("Io", "").matches(&Fault::new("Io", "disk full")));
    }

    #[test]
    fn two_level_requires_inner_match() {
        let sig = ErrorSignature::two_level(
            SignatureLevel::new("Adapter", WILDCARD),
            SignatureLevel::new("Io", "refused"),
        );
        let bare = Fault::new("Adapter", "download failed");
        assert!(!sig.matches(&bare));
        let wrapped = bare.clone().with_inner(Fault::new("Io", "connection refused"));
        assert!(sig.matches(&wrapped));
        let other = bare.with_inner(Fault::new("Io", "reset by peer"));
        assert!(!sig.matches(&other));
    }

    #[test]
    fn more_specific_sorts_first() {
        let mut sigs = vec![
            ErrorSignature::wildcard(),
            ErrorSignature::one_level("Io", ""),
            ErrorSignature::one_level("Io", "refused"),
            ErrorSignature::wildcard_two_level(),
            ErrorSignature::two_level(
                SignatureLevel::new("Adapter", "x"),
                SignatureLevel::new("Io", "y"),
            ),
        ];
        sigs.sort();
        assert_eq!(sigs[0].outer.kind, "Adapter");
        assert_eq!(sigs[1], ErrorSignature::wildcard_two_level());
        assert_eq!(sigs[2], ErrorSignature::one_level("Io", "refused"));
        assert_eq!(sigs[3], ErrorSignature::one_level("Io", ""));
        assert_eq!(sigs[4], ErrorSignature::wildcard());
    }
}
