//! Forced-termination filter
//!
//! Certain tool calls stand for an action that must not be repeated by looping
//! back (a single data fetch meant to be followed by formatting). When a turn
//! invokes one of them, the turn is forced to be the last of the run and the
//! termination strategy is not consulted for it.

use std::collections::BTreeSet;

/// Set of tool names whose invocation forces the loop to stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForcedTerminationFilter {
    tools: BTreeSet<String>,
}

impl ForcedTerminationFilter {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
        }
    }

    /// A filter that never fires.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        self.tools.contains(tool_name)
    }

    /// First invoked tool (in call order) that forces a stop.
    pub fn first_match<'a, I>(&self, invoked: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        invoked
            .into_iter()
            .find(|name| self.matches(name))
            .cloned()
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
