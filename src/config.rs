//! Configuration for cortex-chat
//!
//! Values are layered: built-in defaults, then `config.toml` in the config
//! home (`$GPT_CLI_HOME`, default `~/.gpt-cli`), then `OPENAI_*` environment
//! variables. The binary applies its command-line flags last and calls
//! [`ChatConfig::validate`].

use crate::llm::{CompletionOptions, DEFAULT_API_BASE};
use crate::memory::MemoryWindow;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_HOME_ENV: &str = "GPT_CLI_HOME";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Typed runtime configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    /// Extra instructions sent with every request
    pub default_prompt: String,
    /// Interaction transcript
    pub log_file: PathBuf,
    pub memory_path: PathBuf,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_summary_tokens: u32,
    /// Turns kept verbatim after summarization
    pub memory_limit: usize,
    /// Turn count that triggers summarization; defaults to `memory_limit`
    pub summary_threshold: Option<usize>,
    pub stream: bool,
    pub markdown: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: "gpt-4o".to_string(),
            default_prompt: String::new(),
            log_file: PathBuf::from("~/.gpt.log"),
            memory_path: PathBuf::from("~/.gpt_memory.json"),
            temperature: 0.5,
            max_tokens: 4096,
            max_summary_tokens: 2048,
            memory_limit: 10,
            summary_threshold: None,
            stream: false,
            markdown: true,
        }
    }
}

impl ChatConfig {
    /// Load defaults, the config file and the process environment.
    ///
    /// `path` overrides the config file location. A missing file is fine.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.expand_paths();
        Ok(config)
    }

    /// Read a TOML config file, or defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `OPENAI_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_API_KEY") {
            self.api_key = Some(v.trim().to_string());
        }
        if let Some(v) = get("OPENAI_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.model = v;
        }
        if let Some(v) = get("OPENAI_DEFAULT_PROMPT") {
            self.default_prompt = v;
        }
        if let Some(v) = get("OPENAI_LOGFILE") {
            self.log_file = PathBuf::from(v);
        }
        if let Some(v) = get("OPENAI_MEMORY_PATH") {
            self.memory_path = PathBuf::from(v);
        }
        if let Some(v) = get("OPENAI_TEMPERATURE") {
            self.temperature = parse_env("OPENAI_TEMPERATURE", &v)?;
        }
        if let Some(v) = get("OPENAI_MAX_TOKENS") {
            self.max_tokens = parse_env("OPENAI_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("OPENAI_MAX_SUMMARY_TOKENS") {
            self.max_summary_tokens = parse_env("OPENAI_MAX_SUMMARY_TOKENS", &v)?;
        }
        if let Some(v) = get("OPENAI_MEMORY_LIMIT") {
            self.memory_limit = parse_env("OPENAI_MEMORY_LIMIT", &v)?;
        }
        if let Some(v) = get("OPENAI_SUMMARY_THRESHOLD") {
            self.summary_threshold = Some(parse_env("OPENAI_SUMMARY_THRESHOLD", &v)?);
        }
        if let Some(v) = get("OPENAI_STREAM_ENABLED") {
            self.stream = v.trim().eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    /// Expand a leading `~/` in file paths.
    pub fn expand_paths(&mut self) {
        self.log_file = expand_home(&self.log_file);
        self.memory_path = expand_home(&self.memory_path);
    }

    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit == 0 {
            return Err(Error::Config("memory_limit must be at least 1".into()));
        }
        if let Some(threshold) = self.summary_threshold {
            if threshold < self.memory_limit {
                return Err(Error::Config(format!(
                    "summary_threshold ({}) must not be below memory_limit ({})",
                    threshold, self.memory_limit
                )));
            }
        }
        if self.max_tokens == 0 || self.max_summary_tokens == 0 {
            return Err(Error::Config("token budgets must be at least 1".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Config(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".into()));
        }
        Ok(())
    }

    pub fn window(&self) -> MemoryWindow {
        MemoryWindow::new(self.memory_limit)
            .with_threshold(self.summary_threshold.unwrap_or(self.memory_limit))
    }

    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
        }
    }

    pub fn with_memory_path(mut self, path: PathBuf) -> Self {
        self.memory_path = path;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_markdown(mut self, markdown: bool) -> Self {
        self.markdown = markdown;
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, value)))
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Directory holding `config.toml`
pub fn config_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(CONFIG_HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".gpt-cli"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_home()?.join(CONFIG_FILE_NAME))
}

/// Store `api_key` in the config file, keeping the rest of it as written.
pub fn set_api_key(config_path: &Path, api_key: &str) -> anyhow::Result<()> {
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let existing = if config_path.exists() {
        std::fs::read_to_string(config_path)?
    } else {
        String::new()
    };

    let mut doc: toml_edit::DocumentMut = existing.parse()?;
    doc["api_key"] = toml_edit::value(api_key.trim());
    std::fs::write(config_path, doc.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(config_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
