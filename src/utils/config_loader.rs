use dotenvy::dotenv;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::env;
use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Error loading config: {0}")]
    ConfigError(String),
}

/// Read a TOML file, expanding `${VAR}` references from the environment
/// (after loading `.env` if one exists).
pub async fn load_from_file<T: DeserializeOwned>(file_name: impl AsRef<Path>) -> Result<T, LoadConfigError> {
    dotenv().ok();
    let contents = tokio::fs::read_to_string(file_name).await?;
    parse_config(&contents)
}

pub fn parse_config<T: DeserializeOwned>(raw_config: &str) -> Result<T, LoadConfigError> {
    let contents = expand_vars(raw_config)?;
    Ok(toml::from_str(&contents)?)
}

fn expand_vars(raw_config: &str) -> Result<String, LoadConfigError> {
    // unset variables are left as-is so the TOML error points at them
    let re = Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)\}").map_err(|e| LoadConfigError::ConfigError(e.to_string()))?;
    Ok(re
        .replace_all(raw_config, |caps: &Captures| match env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => caps[0].to_string(),
        })
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Section {
        url: String,
        interval: u64,
    }

    #[test]
    fn test_expand_known_variable() {
        // SAFETY: test-local variable name, no other test reads it
        unsafe { env::set_var("CROWDSALE_MONITOR_TEST_HOST", "node.example") };
        let section: Section = parse_config("url = \"wss://${CROWDSALE_MONITOR_TEST_HOST}:8546\"\ninterval = 10\n").unwrap();
        assert_eq!(section.url, "wss://node.example:8546");
        assert_eq!(section.interval, 10);
    }

    #[test]
    fn test_unknown_variable_is_kept() {
        let expanded = expand_vars("url = \"${CROWDSALE_MONITOR_SURELY_UNSET}\"").unwrap();
        assert_eq!(expanded, "url = \"${CROWDSALE_MONITOR_SURELY_UNSET}\"");
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let result: Result<Section, _> = parse_config("url = ");
        assert!(matches!(result, Err(LoadConfigError::TomlError(_))));
    }
}
