//! Agent settings document.
//!
//! Loading flow:
//! 1. Start with compiled [`AgentSettings::default()`]
//! 2. If the settings file exists, overlay its values onto the defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! The settings are read once at startup; in-flight replies never observe a
//! reload (the tool display filter is copied out of the document on boot).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// How the agent subprocess is driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Single agent answering directly.
    Direct,
    /// Coordinator decomposing the task into phases.
    Coordinator,
}

impl AgentMode {
    /// CLI flag value for `--mode`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Coordinator => "coordinator",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent settings document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Path of the agent executable to fork.
    pub agent_program: String,
    /// LLM provider passed to the agent.
    pub llm_provider: String,
    /// Model name passed to the agent.
    pub model_name: String,
    /// API key passed to the agent.
    pub api_key: String,
    /// Agent workspace directory.
    pub workspace: String,
    /// Agent driving mode.
    pub mode: AgentMode,
    /// Raw tool names whose calls and results must not reach clients.
    pub hidden_tools: Vec<String>,
    /// Raw tool name → user-facing display name.
    pub tool_display_names: HashMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_program: "agent".into(),
            llm_provider: "dashscope".into(),
            model_name: "qwen3-max-preview".into(),
            api_key: String::new(),
            workspace: ".".into(),
            mode: AgentMode::Direct,
            hidden_tools: Vec::new(),
            tool_display_names: HashMap::new(),
        }
    }
}

/// Settings loading errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid JSON, or does not fit the schema.
    #[error("invalid settings document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Load settings from a path with env var overrides.
///
/// A missing file yields the defaults; a malformed file is an error.
pub fn load_settings_from_path(path: &Path) -> Result<AgentSettings, SettingsError> {
    let defaults = serde_json::to_value(AgentSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading agent settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        merge_documents(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AgentSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Overlay a user document onto the defaults.
///
/// Nested objects combine key by key; anything else (arrays, strings,
/// numbers) is taken wholesale from the user document. A `null` in the user
/// document leaves the default in place rather than erasing it.
pub fn merge_documents(mut base: Value, patch: Value) -> Value {
    overlay(&mut base, patch);
    base
}

fn overlay(base: &mut Value, patch: Value) {
    if patch.is_null() {
        return;
    }
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_val) in patch_map {
                if patch_val.is_null() {
                    continue;
                }
                if let Some(slot) = base_map.get_mut(&key) {
                    overlay(slot, patch_val);
                } else {
                    let _ = base_map.insert(key, patch_val);
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

fn apply_env_overrides(settings: &mut AgentSettings) {
    if let Ok(v) = std::env::var("STUDIO_AGENT_PROGRAM") {
        if !v.is_empty() {
            settings.agent_program = v;
        }
    }
    if let Ok(v) = std::env::var("STUDIO_API_KEY") {
        if !v.is_empty() {
            settings.api_key = v;
        }
    }
    if let Ok(v) = std::env::var("STUDIO_MODEL_NAME") {
        if !v.is_empty() {
            settings.model_name = v;
        }
    }
    if let Ok(v) = std::env::var("STUDIO_LLM_PROVIDER") {
        if !v.is_empty() {
            settings.llm_provider = v;
        }
    }
}
