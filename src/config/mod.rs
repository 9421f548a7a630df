//! Configuration management for termpal
//!
//! Configuration is loaded from `~/.termpal/config.json` with environment
//! variable overrides (`TERMPAL_SECTION_KEY`). The resulting [`Config`] is a
//! plain value: the CLI builds it once and passes the relevant pieces into the
//! agent loop, so there is no process-wide configuration state.

mod types;
pub mod validate;

pub use types::*;

use crate::error::{Result, TermpalError};
use std::path::{Path, PathBuf};
use tracing::warn;

impl Config {
    /// Returns the termpal configuration directory path (~/.termpal)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".termpal")
    }

    /// Returns the path to the config file (~/.termpal/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    ///
    /// A missing file yields the defaults. Unknown fields are reported as
    /// warnings; malformed values and invalid overrides are `Config` errors.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
                TermpalError::Config(format!("{}: invalid JSON: {}", path.display(), e))
            })?;
            for diagnostic in validate::validate_config(&raw) {
                warn!(path = %path.display(), "{}", diagnostic);
            }
            serde_json::from_value(raw)
                .map_err(|e| TermpalError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: TERMPAL_SECTION_KEY
    fn apply_env_overrides(&mut self) -> Result<()> {
        // Agent
        if let Ok(val) = std::env::var("TERMPAL_AGENT_MODEL") {
            self.agent.model = val;
        }
        if let Some(v) = parse_env("TERMPAL_AGENT_MAX_TOKENS")? {
            self.agent.max_tokens = v;
        }
        if let Some(v) = parse_env("TERMPAL_AGENT_TEMPERATURE")? {
            self.agent.temperature = v;
        }
        if let Some(v) = parse_env("TERMPAL_AGENT_CONTEXT_BUDGET")? {
            self.agent.context_budget = v;
        }
        if let Some(v) = parse_env("TERMPAL_AGENT_MAX_TOOL_DEPTH")? {
            self.agent.max_tool_depth = v;
        }
        if let Some(v) = parse_env("TERMPAL_AGENT_TOOL_TIMEOUT_SECS")? {
            self.agent.tool_timeout_secs = v;
        }

        // Backend
        if let Ok(val) = std::env::var("TERMPAL_BACKEND_KIND") {
            self.backend.kind = val.parse()?;
        }
        if let Ok(val) = std::env::var("TERMPAL_BACKEND_API_KEY") {
            self.backend.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("TERMPAL_BACKEND_API_BASE") {
            self.backend.api_base = Some(val);
        }

        // Tools
        if let Ok(val) = std::env::var("TERMPAL_TOOLS_CONFIRMATION") {
            self.tools.confirmation = val.parse()?;
        }
        if let Ok(val) = std::env::var("TERMPAL_TOOLS_WORKSPACE") {
            self.tools.workspace = val;
        }

        // Storage, retrieval, logging
        if let Ok(val) = std::env::var("TERMPAL_STORAGE_DIR") {
            self.storage.dir = val;
        }
        if let Some(v) = parse_env("TERMPAL_RETRIEVAL_ENABLED")? {
            self.retrieval.enabled = v;
        }
        if let Ok(val) = std::env::var("TERMPAL_RETRIEVAL_PRECEDENCE") {
            self.retrieval.precedence = val.parse()?;
        }
        if let Ok(val) = std::env::var("TERMPAL_LOG_LEVEL") {
            self.logging.level = val;
        }

        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.agent.context_budget == 0 {
            return Err(TermpalError::Config(
                "agent.context_budget must be greater than zero".to_string(),
            ));
        }
        if self.agent.max_tool_depth == 0 {
            return Err(TermpalError::Config(
                "agent.max_tool_depth must be greater than zero".to_string(),
            ));
        }
        if self.agent.tool_timeout_secs == 0 {
            return Err(TermpalError::Config(
                "agent.tool_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Remote
            && self
                .backend
                .api_key
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
        {
            return Err(TermpalError::Config(
                "backend.api_key is required for the remote backend (set TERMPAL_BACKEND_API_KEY)"
                    .to_string(),
            ));
        }
        if self.retrieval.enabled && self.retrieval.top_k == 0 {
            return Err(TermpalError::Config(
                "retrieval.top_k must be greater than zero when retrieval is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the expanded workspace path (resolves ~ to home directory)
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.tools.workspace)
    }

    /// Returns the expanded conversation store directory
    pub fn storage_path(&self) -> PathBuf {
        expand_home(&self.storage.dir)
    }

    /// Returns the directory indexed for retrieval
    pub fn docs_path(&self) -> PathBuf {
        match &self.retrieval.docs_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_path(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TermpalError::Config(format!("{} has an invalid value '{}'", key, val))),
        Err(_) => Ok(None),
    }
}

/// Expand ~ to home directory in a path string
fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.agent.max_tool_depth, 8);
        assert_eq!(config.tools.confirmation, ConfirmationPolicy::PromptEachTime);
        assert_eq!(config.backend.kind, BackendKind::Remote);
        assert_eq!(config.retrieval.precedence, RetrievalPrecedence::HistoryFirst);
        assert!(config.retry.enabled);
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{"agent": {"context_budget": 2000}, "tools": {"confirmation": "deny-all"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.agent.context_budget, 2000);
        assert_eq!(config.agent.max_tool_depth, 8);
        assert_eq!(config.tools.confirmation, ConfirmationPolicy::DenyAll);
    }

    #[test]
    fn test_invalid_policy_in_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"tools": {"confirmation": "sometimes"}}"#).unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err, TermpalError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "auto-approve".parse::<ConfirmationPolicy>().unwrap(),
            ConfirmationPolicy::AutoApprove
        );
        assert_eq!(
            "PROMPT_EACH_TIME".parse::<ConfirmationPolicy>().unwrap(),
            ConfirmationPolicy::PromptEachTime
        );
        assert!("maybe".parse::<ConfirmationPolicy>().is_err());
    }

    #[test]
    fn test_env_override() {
        env::set_var("TERMPAL_AGENT_TEMPERATURE", "0.1");
        env::set_var("TERMPAL_AGENT_MAX_TOOL_DEPTH", "3");

        let mut config = Config::default();
        config.apply_env_overrides().unwrap();

        assert!((config.agent.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.agent.max_tool_depth, 3);

        env::remove_var("TERMPAL_AGENT_TEMPERATURE");
        env::remove_var("TERMPAL_AGENT_MAX_TOOL_DEPTH");
    }

    #[test]
    fn test_validate_requires_api_key_for_remote() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.backend.api_key = Some("sk-test".to_string());
        assert!(config.validate().is_ok());

        config.backend.api_key = None;
        config.backend.kind = BackendKind::Local;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = Config::default();
        config.backend.kind = BackendKind::Local;
        config.agent.context_budget = 0;
        assert!(matches!(config.validate(), Err(TermpalError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.agent.model = "llama3".to_string();
        config.backend.kind = BackendKind::Local;
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.agent.model, "llama3");
        assert_eq!(loaded.backend.kind, BackendKind::Local);
    }

    #[test]
    fn test_load_nonexistent() {
        let path = PathBuf::from("/nonexistent/path/config.json");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.agent.context_budget, 16_000);
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home("~/conversations");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("conversations"));
        }
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
        assert_eq!(expand_home("relative"), PathBuf::from("relative"));
    }
}
