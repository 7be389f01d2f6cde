use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::github::api_client::DEFAULT_API_URL;

/// Invalid or missing input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required flag(s) {} not set", quote_flags(.0))]
    Missing(Vec<&'static str>),

    #[error("private key file {0} is empty")]
    EmptyPrivateKeyFile(PathBuf),

    #[error("\"private-key\" and \"private-key-file\" are mutually exclusive")]
    ConflictingKeySources,

    #[error("repository must be in the form \"owner/name\", got \"{0}\"")]
    InvalidRepository(String),
}

fn quote_flags(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| match *name {
            "private-key" => "\"private-key\" (or \"private-key-file\")".to_string(),
            name => format!("\"{}\"", name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// A repository coordinate, `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepositoryRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || ConfigError::InvalidRepository(trimmed.to_string());

        let (owner, name) = trimmed.split_once('/').ok_or_else(invalid)?;
        let (owner, name) = (owner.trim(), name.trim());
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Optional settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    /// API base URL; point this at `https://HOST/api/v3` for GitHub Enterprise Server
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Timeout for each GitHub API request in seconds (default: 30)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Load settings from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let config: Config = toml::from_str(&content)
                    .with_context(|| "Failed to parse configuration file")?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }
}

/// Where the private key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateKeySource {
    Inline(String),
    File(PathBuf),
}

/// Raw, unvalidated inputs as supplied by flags or environment.
#[derive(Debug, Clone, Default)]
pub struct RawInputs {
    pub app_id: Option<String>,
    pub private_key: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub repository: Option<String>,
    pub api_url: Option<String>,
}

/// Validated inputs for one token request.
#[derive(Clone)]
pub struct AppConfig {
    pub app_id: String,
    pub private_key: String,
    pub repository: RepositoryRef,
    pub api_url: String,
    pub timeout: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("app_id", &self.app_id)
            .field("private_key", &"<redacted>")
            .field("repository", &self.repository)
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Validate raw inputs, reading the key file if one was given.
    ///
    /// Flags take precedence over the settings file for the API URL.
    pub fn resolve(inputs: &RawInputs, file: &Config) -> Result<Self> {
        let app_id = non_blank(inputs.app_id.as_deref());
        let repository = non_blank(inputs.repository.as_deref());
        let key_source = match (
            non_blank(inputs.private_key.as_deref()),
            inputs.private_key_file.as_ref().filter(|p| !p.as_os_str().is_empty()),
        ) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingKeySources.into()),
            (Some(key), None) => Some(PrivateKeySource::Inline(key.to_string())),
            (None, Some(path)) => Some(PrivateKeySource::File(path.clone())),
            (None, None) => None,
        };

        let (app_id, repository, key_source) = match (app_id, repository, key_source) {
            (Some(app_id), Some(repository), Some(key_source)) => {
                (app_id.to_string(), repository, key_source)
            }
            (app_id, repository, key_source) => {
                let mut missing = Vec::new();
                if app_id.is_none() {
                    missing.push("app-id");
                }
                if repository.is_none() {
                    missing.push("repository");
                }
                if key_source.is_none() {
                    missing.push("private-key");
                }
                return Err(ConfigError::Missing(missing).into());
            }
        };
        let repository: RepositoryRef = repository.parse()?;

        let private_key = match key_source {
            PrivateKeySource::Inline(key) => key,
            PrivateKeySource::File(path) => {
                let key = std::fs::read_to_string(&path).with_context(|| {
                    format!("Failed to read private key file: {}", path.display())
                })?;
                if key.trim().is_empty() {
                    return Err(ConfigError::EmptyPrivateKeyFile(path).into());
                }
                key
            }
        };

        let api_url = non_blank(inputs.api_url.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| file.github.api_url.clone());

        Ok(Self {
            app_id,
            private_key,
            repository,
            api_url,
            timeout: Duration::from_secs(file.github.timeout_seconds),
        })
    }
}
