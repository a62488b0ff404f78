//! Configuration Manager

use super::{ProxyConfig, RawProxyConfig};
use crate::Result;
use anyhow::{bail, Context};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

/// Hint printed when the variables file cannot be used
const VARS_FORMAT_HINT: &str = r#"expected format { "key1": "value1", "key2": "value2" ... }"#;

/// On-disk format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// `.toml` files are read as TOML, everything else as JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, substituting `{{key}}` placeholders from
    /// the optional variables file first.
    pub fn load_from_file(path: &Path, vars_path: Option<&Path>) -> Result<ProxyConfig> {
        tracing::debug!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let vars = match vars_path {
            Some(vars_path) => Self::load_vars(vars_path)?,
            None => HashMap::new(),
        };

        let config = Self::load_from_str(&content, ConfigFormat::from_path(path), &vars)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;

        tracing::debug!(
            "Configuration loaded and validated successfully ({} rules, {} enabled)",
            config.forward.len(),
            config.enabled_rules().count()
        );
        Ok(config)
    }

    /// Load a flat JSON object of string variables
    pub fn load_vars(path: &Path) -> Result<HashMap<String, String>> {
        tracing::debug!("Loading variables from: {}", path.display());
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read variables file {}, {}",
                path.display(),
                VARS_FORMAT_HINT
            )
        })?;

        serde_json::from_str(&content).with_context(|| {
            format!(
                "Failed to parse variables file {}, {}",
                path.display(),
                VARS_FORMAT_HINT
            )
        })
    }

    /// Substitute variables, reject leftovers, parse and validate
    pub fn load_from_str(
        content: &str,
        format: ConfigFormat,
        vars: &HashMap<String, String>,
    ) -> Result<ProxyConfig> {
        let text = substitute_variables(content, vars);
        check_unresolved(&text)?;

        let raw: RawProxyConfig = match format {
            ConfigFormat::Json => {
                serde_json::from_str(&text).context("Failed to parse JSON configuration")?
            }
            ConfigFormat::Toml => {
                toml::from_str(&text).context("Failed to parse TOML configuration")?
            }
        };

        ProxyConfig::from_raw(raw).context("Configuration validation failed")
    }
}

/// Replace every `{{key}}` in `content` with its value
pub fn substitute_variables(content: &str, vars: &HashMap<String, String>) -> String {
    vars.iter().fold(content.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{{{}}}}}", key), value)
    })
}

/// Fail if any `{{...}}` placeholder survived substitution
fn check_unresolved(text: &str) -> Result<()> {
    if !text.contains("{{") {
        return Ok(());
    }

    let placeholder = Regex::new(r"\{\{([^}]+)\}\}").context("Invalid placeholder pattern")?;
    let unknown: Vec<&str> = placeholder
        .find_iter(text)
        .map(|m| m.as_str())
        .collect();

    if unknown.is_empty() {
        bail!("Unterminated variable placeholder found in config");
    }
    bail!("Unknown variables found in config: {}", unknown.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_variables() {
        let vars = HashMap::from([
            ("host".to_string(), "10.0.0.5".to_string()),
            ("port".to_string(), "8080".to_string()),
        ]);
        let text = substitute_variables(
            r#"{"dst": "{{host}}:{{port}}", "src": ":{{port}}"}"#,
            &vars,
        );
        assert_eq!(text, r#"{"dst": "10.0.0.5:8080", "src": ":8080"}"#);
    }

    #[test]
    fn test_unresolved_placeholders_are_listed() {
        let err = check_unresolved(r#"{"dst": "{{host}}:{{port}}"}"#).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("{{host}}"));
        assert!(message.contains("{{port}}"));

        assert!(check_unresolved("{{").is_err());
        assert!(check_unresolved(r#"{"forward": []}"#).is_ok());
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("proxy.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("proxy.TOML")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("proxy")), ConfigFormat::Json);
    }

    #[test]
    fn test_load_toml() {
        let content = r#"
            silent = true

            [[forward]]
            src = ":7000"
            dst = "127.0.0.1:7001"
            type = "udp"
            label = "dns"
        "#;
        let config =
            ConfigManager::load_from_str(content, ConfigFormat::Toml, &HashMap::new()).unwrap();
        assert!(config.silent);
        assert_eq!(config.forward.len(), 1);
        assert_eq!(config.forward[0].label, "dns");
        assert_eq!(config.forward[0].transport, crate::TransportKind::Udp);
    }
}
