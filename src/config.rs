// Configuration: optional TOML file plus environment overrides

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::secret::Naming;

const DEFAULT_EDITOR: &str = "vi";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// sops binary name or path
    pub sops_bin: String,
    /// helm binary name or path
    pub helm_bin: String,
    /// Inserted before the extension to name decrypted siblings
    pub decrypted_suffix: String,
    /// File name globs that mark a values file as a secret
    pub secret_patterns: Vec<String>,
    /// Ask before running a forwarded helm command
    pub confirm: bool,
    pub editor: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sops_bin: "sops".to_string(),
            helm_bin: "helm".to_string(),
            decrypted_suffix: ".dec".to_string(),
            secret_patterns: vec!["secrets*.yaml".to_string(), "secrets*.yml".to_string()],
            confirm: true,
            editor: None,
        }
    }
}

impl Config {
    /// Load the config file if present, then apply environment overrides.
    pub fn load() -> Result<Self, Error> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.naming()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(sops) = lookup("HELM_SECRETS_SOPS_BIN") {
            self.sops_bin = sops;
        }
        if let Some(helm) = lookup("HELM_BIN") {
            self.helm_bin = helm;
        }
        if let Some(suffix) = lookup("HELM_SECRETS_DEC_SUFFIX") {
            self.decrypted_suffix = suffix;
        }
        if let Some(confirm) = lookup("HELM_SECRETS_CONFIRM") {
            self.confirm = !matches!(confirm.trim(), "0" | "false" | "no");
        }
        if self.editor.is_none() {
            self.editor = lookup("EDITOR").filter(|e| !e.trim().is_empty());
        }
    }

    pub fn naming(&self) -> Result<Naming, Error> {
        Naming::new(&self.secret_patterns, &self.decrypted_suffix)
    }

    pub fn editor(&self) -> &str {
        self.editor.as_deref().unwrap_or(DEFAULT_EDITOR)
    }

    pub fn config_path() -> Option<PathBuf> {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join(".config"))
            })?;
        Some(config_dir.join("helm-secrets").join("config.toml"))
    }
}
