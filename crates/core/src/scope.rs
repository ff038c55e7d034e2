use std::cmp::Ordering;

/// Decides whether a conflict's scope hint falls inside a rule's scope.
pub trait ScopeInterpreter: Send + Sync {
    /// True when `rule_scope` covers `scope_to_check`.
    fn is_in_scope(&self, scope_to_check: &str, rule_scope: &str) -> bool;

    fn is_well_formed(&self, scope: &str) -> bool;

    /// Number of hierarchy levels; the root scope has depth 0.
    fn depth(&self, scope: &str) -> usize;

    /// Most specific scope first.
    fn compare_specificity(&self, a: &str, b: &str) -> Ordering {
        self.depth(b).cmp(&self.depth(a))
    }
}

/// Slash-delimited path scopes compared segment by segment, ignoring case.
/// An empty scope and `/` both mean "everything".
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicPathScope;

pub const ROOT_SCOPE: &str = "/";

fn segments(scope: &str) -> impl Iterator<Item = &str> {
    scope.split('/').filter(|s| !s.is_empty())
}

impl BasicPathScope {
    pub fn is_root(scope: &str) -> bool {
        segments(scope).next().is_none() && (scope.is_empty() || scope.starts_with('/'))
    }

    /// Conflict hints that are not paths (e.g. "any" or an item id).
    pub fn is_path(scope: &str) -> bool {
        scope.starts_with('/')
    }
}

impl ScopeInterpreter for BasicPathScope {
    fn is_in_scope(&self, scope_to_check: &str, rule_scope: &str) -> bool {
        if Self::is_root(rule_scope) {
            return true;
        }
        if !Self::is_path(scope_to_check) {
            return false;
        }
        let mut checked = segments(scope_to_check);
        for rule_segment in segments(rule_scope) {
            match checked.next() {
                Some(seg) if seg.eq_ignore_ascii_case(rule_segment) => {}
                _ => return false,
            }
        }
        true
    }

    fn is_well_formed(&self, scope: &str) -> bool {
        scope.is_empty() || (scope.starts_with('/') && !scope.contains("//"))
    }

    fn depth(&self, scope: &str) -> usize {
        segments(scope).count()
    }
}
