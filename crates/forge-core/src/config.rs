//! Configuration parsing for the engine.
//!
//! Key=value format in `.forge/config`.
//! Precedence: CLI flags > `--config` file > `.forge/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Engine and backend configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Directories and scripts
    pub projects_dir: PathBuf,
    pub entry_script: String,

    // Package resolver/installer
    pub uv_bin: PathBuf,

    // Execution limits
    /// Wall-clock limit per script run in seconds (0 = no timeout).
    pub run_timeout_sec: u32,
    /// Maximum automatic run/fix cycles per build invocation.
    pub max_fix_attempts: u32,

    // Model backend (passed into the backend as an explicit value, never
    // read from ambient process state)
    pub backend_url: String,
    pub backend_model: Option<String>,
    pub api_key: Option<String>,
    /// Timeout per generation request in seconds (0 = no timeout).
    pub generate_timeout_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("projects"),
            entry_script: "main.py".to_string(),
            uv_bin: PathBuf::from("uv"),
            run_timeout_sec: 120,
            max_fix_attempts: 3,
            backend_url: "http://127.0.0.1:1234/v1".to_string(),
            backend_model: None,
            api_key: None,
            generate_timeout_sec: 300,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            // Must contain '='
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "projects_dir" => self.projects_dir = PathBuf::from(value),
            "entry_script" => self.entry_script = value.to_string(),
            "uv_bin" => self.uv_bin = PathBuf::from(value),
            "run_timeout_sec" => {
                self.run_timeout_sec = Self::parse_int(key, value)?;
            }
            "max_fix_attempts" => {
                self.max_fix_attempts = Self::parse_int(key, value)?;
            }
            "backend_url" => self.backend_url = value.to_string(),
            "backend_model" => {
                self.backend_model = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "api_key" => {
                self.api_key = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "generate_timeout_sec" => {
                self.generate_timeout_sec = Self::parse_int(key, value)?;
            }
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int(key: &str, value: &str) -> Result<u32, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.projects_dir.is_relative() {
            self.projects_dir = workspace_root.join(&self.projects_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.projects_dir, PathBuf::from("projects"));
        assert_eq!(config.entry_script, "main.py");
        assert_eq!(config.uv_bin, PathBuf::from("uv"));
        assert_eq!(config.run_timeout_sec, 120);
        assert_eq!(config.max_fix_attempts, 3);
        assert!(config.backend_model.is_none());
        assert!(config.api_key.is_none());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
projects_dir="/srv/forge/projects"
max_fix_attempts=5
run_timeout_sec=60
backend_url=http://10.0.0.5:8080/v1
backend_model="qwen2.5-coder"
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.projects_dir, PathBuf::from("/srv/forge/projects"));
        assert_eq!(config.max_fix_attempts, 5);
        assert_eq!(config.run_timeout_sec, 60);
        assert_eq!(config.backend_url, "http://10.0.0.5:8080/v1");
        assert_eq!(config.backend_model.as_deref(), Some("qwen2.5-coder"));
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn invalid_int_is_rejected() {
        let mut config = Config::default();
        let result = config.parse_content("max_fix_attempts=lots");
        assert!(matches!(result, Err(ConfigError::InvalidInt { .. })));
    }

    #[test]
    fn line_without_equals_is_rejected() {
        let mut config = Config::default();
        let result = config.parse_content("just a line");
        assert!(matches!(result, Err(ConfigError::InvalidLine(_))));
    }

    #[test]
    fn empty_api_key_stays_none() {
        let mut config = Config::default();
        config.parse_content("api_key=").unwrap();
        assert!(config.api_key.is_none());

        config.parse_content("api_key=sk-test").unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "max_fix_attempts=7\n# comment\n\nuv_bin=/opt/uv\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_fix_attempts, 7);
        assert_eq!(config.uv_bin, PathBuf::from("/opt/uv"));
        // Untouched keys keep their defaults.
        assert_eq!(config.entry_script, "main.py");
    }

    #[test]
    fn resolve_paths_anchors_relative_projects_dir() {
        let mut config = Config::default();
        config.resolve_paths(Path::new("/home/user/forge"));
        assert_eq!(
            config.projects_dir,
            PathBuf::from("/home/user/forge/projects")
        );

        let mut absolute = Config::default();
        absolute.projects_dir = PathBuf::from("/data/projects");
        absolute.resolve_paths(Path::new("/home/user/forge"));
        assert_eq!(absolute.projects_dir, PathBuf::from("/data/projects"));
    }
}
