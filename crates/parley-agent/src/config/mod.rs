//! Runtime configuration.
//!
//! A [`RuntimeConfig`] describes the backend endpoint, the personas of a
//! crew and the optional routing, tool and compaction stages.  It is read
//! from a TOML or JSON file (chosen by extension), after which a handful of
//! `PARLEY_*` environment variables may override file values:
//!
//! | Variable                    | Overrides                 |
//! |-----------------------------|---------------------------|
//! | `PARLEY_BASE_URL`           | `backend.base_url`        |
//! | `PARLEY_API_KEY`            | `backend.api_key`         |
//! | `PARLEY_CONTEXT_THRESHOLD`  | `compaction.threshold`    |
//! | `PARLEY_TOOL_MODE`          | `tools.mode`              |
//!
//! A `.env` file in the working directory is honoured when loading.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::ModelSettings;
use crate::compaction::{CompressionPrompt, ContextCompactor};
use crate::error::{AgentError, Result};
use crate::llm::LlmClientConfig;
use crate::router::{Route, RoutingTable};
use crate::tools::{ToolCallMode, ToolOrchestrator};

pub const ENV_BASE_URL: &str = "PARLEY_BASE_URL";
pub const ENV_API_KEY: &str = "PARLEY_API_KEY";
pub const ENV_CONTEXT_THRESHOLD: &str = "PARLEY_CONTEXT_THRESHOLD";
pub const ENV_TOOL_MODE: &str = "PARLEY_TOOL_MODE";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Inference endpoint shared by every persona and sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            timeout_secs: 120,
            max_tokens: 4096,
        }
    }
}

impl BackendConfig {
    /// Client configuration for this endpoint.
    pub fn client_config(&self) -> LlmClientConfig {
        LlmClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            max_tokens: self.max_tokens,
            ..LlmClientConfig::openai_compatible(&self.api_key, "", &self.base_url)
        }
    }
}

/// One answering persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(flatten)]
    pub settings: ModelSettings,
    #[serde(default)]
    pub system_instructions: String,
    #[serde(default = "default_true")]
    pub keep_history: bool,
}

/// Topic classification stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Classifier model.
    #[serde(default)]
    pub model: String,
    /// Replaces the built-in classifier instructions.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default, alias = "routing")]
    pub routes: Vec<Route>,
    /// Falls back to the crew's `default_persona` when absent.
    #[serde(default, alias = "default_agent")]
    pub default_persona: Option<String>,
}

/// Tool orchestration stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub mode: ToolCallMode,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_rounds: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mode: ToolCallMode::default(),
            model: String::new(),
            temperature: None,
            max_rounds: ToolOrchestrator::DEFAULT_MAX_ROUNDS,
        }
    }
}

impl ToolsConfig {
    pub fn settings(&self) -> ModelSettings {
        ModelSettings {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: None,
        }
    }
}

/// Context compaction stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub threshold: usize,
    pub model: String,
    pub prompt: CompressionPrompt,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: ContextCompactor::DEFAULT_THRESHOLD,
            model: String::new(),
            prompt: CompressionPrompt::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Complete description of a crew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    pub personas: BTreeMap<String, PersonaConfig>,
    pub default_persona: String,
    #[serde(default)]
    pub routing: Option<RoutingConfig>,
    #[serde(default)]
    pub tools: Option<ToolsConfig>,
    #[serde(default)]
    pub compaction: Option<CompactionConfig>,
}

impl RuntimeConfig {
    /// Parse a TOML document.  No overrides, no validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Parse a JSON document.  No overrides, no validation.
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse JSON config: {e}"),
        })
    }

    /// Read `path`, apply `.env` and `PARLEY_*` overrides, and validate.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = ?env_file, "loaded .env file");
        }

        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to read config file {}: {e}", path.display()),
        })?;

        let mut config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        info!(path = ?path, personas = config.personas.len(), "configuration loaded");
        Ok(config)
    }

    /// Apply `PARLEY_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(env_non_empty)
    }

    /// Apply overrides read through `lookup` (variable name to value).
    ///
    /// A threshold or tool mode override enables its stage with defaults
    /// when the file did not configure it.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.backend.base_url = base_url;
        }
        if let Some(api_key) = lookup(ENV_API_KEY) {
            self.backend.api_key = api_key;
        }
        if let Some(raw) = lookup(ENV_CONTEXT_THRESHOLD) {
            let threshold = raw.trim().parse().map_err(|_| AgentError::ConfigError {
                reason: format!("{ENV_CONTEXT_THRESHOLD} must be a positive integer, got {raw:?}"),
            })?;
            self.compaction.get_or_insert_with(Default::default).threshold = threshold;
        }
        if let Some(raw) = lookup(ENV_TOOL_MODE) {
            let mode = serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
                .map_err(|_| AgentError::ConfigError {
                    reason: format!(
                        "{ENV_TOOL_MODE} must be one of single_shot, loop, parallel; got {raw:?}"
                    ),
                })?;
            self.tools.get_or_insert_with(Default::default).mode = mode;
        }
        Ok(())
    }

    /// Check cross-references and limits.
    pub fn validate(&self) -> Result<()> {
        if self.personas.is_empty() {
            return Err(invalid("at least one persona must be configured"));
        }
        if let Some(id) = self.personas.keys().find(|id| id.trim().is_empty()) {
            return Err(invalid(format!("persona id {id:?} must not be blank")));
        }
        if !self.personas.contains_key(&self.default_persona) {
            return Err(invalid(format!(
                "default_persona {:?} is not a configured persona",
                self.default_persona
            )));
        }
        if let Some(routing) = &self.routing {
            let table = self.routing_table(routing);
            if let Some(unknown) = table.persona_ids().find(|id| !self.personas.contains_key(*id)) {
                return Err(invalid(format!("routing refers to unknown persona {unknown:?}")));
            }
        }
        if let Some(tools) = &self.tools
            && tools.max_rounds == 0
        {
            return Err(invalid("tools.max_rounds must be at least 1"));
        }
        if let Some(compaction) = &self.compaction
            && compaction.threshold == 0
        {
            return Err(invalid("compaction.threshold must be at least 1"));
        }
        Ok(())
    }

    /// The routing table described by `routing`, with the crew default as
    /// fallback.
    pub fn routing_table(&self, routing: &RoutingConfig) -> RoutingTable {
        RoutingTable {
            routes: routing.routes.clone(),
            default_persona: routing
                .default_persona
                .clone()
                .unwrap_or_else(|| self.default_persona.clone()),
        }
    }
}

fn invalid(reason: impl Into<String>) -> AgentError {
    AgentError::ValidationError {
        reason: reason.into(),
    }
}

/// Read a non-empty environment variable, returning `None` if unset or empty.
fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
