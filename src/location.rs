//! Scope identity: a user tag plus the source position that opened the scope.
//!
//! Two invocations at the same call site collapse to the same node, so node
//! identity must be total and stable. All fields compare by content — two
//! `"parse"` literals in different compilation units are the same tag even if
//! the compiler did not pool them into one allocation.

use std::fmt;

/// Source position captured at a scope's call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub const fn new(file: &'static str, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Capture the current source position as a [`Location`].
#[macro_export]
macro_rules! here {
    () => {
        $crate::Location::new(file!(), line!(), column!())
    };
}

/// Identity of one node in a thread's scope graph.
///
/// Field order matters: the derived `Ord` compares tag first, then file,
/// line, column, which is the ordering the graph's map keys rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeNode {
    pub tag: &'static str,
    pub location: Location,
}

impl ScopeNode {
    pub const fn new(tag: &'static str, location: Location) -> Self {
        Self { tag, location }
    }

    /// The synthetic root node that parents the first real scope on every
    /// thread.
    pub(crate) const fn root() -> Self {
        Self::new("root", Location::new(file!(), 0, 0))
    }
}

impl fmt::Display for ScopeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tag, self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total_and_content_based() {
        // Compare against a non-literal string with the same content to make
        // sure identity does not depend on pointer equality.
        let owned = String::from("alpha");
        let leaked: &'static str = Box::leak(owned.into_boxed_str());
        let a = ScopeNode::new("alpha", Location::new("a.rs", 1, 1));
        let b = ScopeNode::new(leaked, Location::new("a.rs", 1, 1));
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn ordering_breaks_ties_by_location() {
        let a = ScopeNode::new("t", Location::new("a.rs", 1, 1));
        let b = ScopeNode::new("t", Location::new("a.rs", 1, 7));
        let c = ScopeNode::new("t", Location::new("a.rs", 2, 1));
        let d = ScopeNode::new("t", Location::new("b.rs", 1, 1));
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn here_captures_this_file() {
        let loc = here!();
        assert!(loc.file.ends_with("location.rs"));
        assert!(loc.line > 0);
        assert!(loc.column > 0);
    }
}
