//! Tool visibility and display-name mapping.
//!
//! Static for the process lifetime: loaded from the agent settings document
//! at startup and never reloaded for an in-flight reply.

use std::collections::{HashMap, HashSet};

use crate::settings::AgentSettings;

/// Maps raw tool names to display names and hides internal tools.
#[derive(Clone, Debug, Default)]
pub struct ToolDisplayFilter {
    hidden: HashSet<String>,
    rename: HashMap<String, String>,
}

impl ToolDisplayFilter {
    /// Build a filter from explicit tables.
    #[must_use]
    pub fn new(hidden: HashSet<String>, rename: HashMap<String, String>) -> Self {
        Self { hidden, rename }
    }

    /// Build the filter from the settings document.
    #[must_use]
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            hidden: settings.hidden_tools.iter().cloned().collect(),
            rename: settings.tool_display_names.clone(),
        }
    }

    /// Whether a raw tool name is hidden from clients.
    #[must_use]
    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden.contains(name)
    }

    /// User-facing name for a raw tool name.
    #[must_use]
    pub fn display(&self, name: &str) -> String {
        self.rename
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}
