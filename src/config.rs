//! Proxy configuration
//! Built once from command-line definitions or a YAML file, read-only afterwards

use crate::body::RewriteRules;
use crate::error::{ReproError, Result};
use crate::mapping::MappingTable;
use serde::Deserialize;
use std::path::Path;

/// Validated configuration consumed by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct Config {
    mappings: MappingTable,
    rewrite_rules: RewriteRules,
    ssl_allow_insecure: bool,
    no_logging: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `local -> scheme://remote` mapping
    pub fn add_mapping(&mut self, local: &str, scheme: &str, remote: &str) -> Result<()> {
        self.mappings.add_mapping(local, scheme, remote).map(|_| ())
    }

    /// Register a route regex whose responses get their body rewritten
    pub fn add_rewrite_route(&mut self, pattern: &str) -> Result<()> {
        self.rewrite_rules.add(pattern)
    }

    pub fn set_ssl_allow_insecure(&mut self, allow: bool) {
        self.ssl_allow_insecure = allow;
    }

    pub fn set_no_logging(&mut self, no_logging: bool) {
        self.no_logging = no_logging;
    }

    pub fn count_mappings(&self) -> usize {
        self.mappings.count_mappings()
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    pub fn rewrite_rules(&self) -> &RewriteRules {
        &self.rewrite_rules
    }

    pub fn ssl_allow_insecure(&self) -> bool {
        self.ssl_allow_insecure
    }

    pub fn no_logging(&self) -> bool {
        self.no_logging
    }

    /// Add mappings from a `local=scheme=remote[,local=scheme=remote...]` list
    pub fn add_mapping_defs(&mut self, defs: &str) -> Result<()> {
        if defs.is_empty() {
            return Ok(());
        }

        for definition in defs.split(',') {
            let parts: Vec<&str> = definition.split('=').collect();
            if parts.len() != 3 {
                return Err(ReproError::config_invalid(format!(
                    "syntax error in mapping: {}",
                    definition
                )));
            }
            self.add_mapping(parts[0], parts[1], parts[2])?;
        }

        Ok(())
    }

    /// Add rewrite routes from a comma-separated list of regexes
    pub fn add_rewrite_defs(&mut self, defs: &str) -> Result<()> {
        if defs.is_empty() {
            return Ok(());
        }

        for definition in defs.split(',') {
            self.add_rewrite_route(definition)?;
        }

        Ok(())
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_error = |message: String| ReproError::ConfigFile {
            path: path.display().to_string(),
            message,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        let file: FileConfig = serde_yaml::from_str(&contents).map_err(|e| config_error(e.to_string()))?;

        file.into_config()
    }
}

/// On-disk YAML layout
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub mappings: Vec<FileMapping>,
    #[serde(default)]
    pub rewrite: Vec<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub no_logging: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMapping {
    pub local: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub remote: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl FileConfig {
    /// Validate into a [`Config`]
    pub fn into_config(self) -> Result<Config> {
        let mut config = Config::new();
        config.set_ssl_allow_insecure(self.allow_insecure);
        config.set_no_logging(self.no_logging);

        for mapping in &self.mappings {
            config.add_mapping(&mapping.local, &mapping.scheme, &mapping.remote)?;
        }

        for route in &self.rewrite {
            config.add_rewrite_route(route)?;
        }

        Ok(config)
    }
}
