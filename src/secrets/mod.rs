// dbvault/src/secrets/mod.rs
#[cfg(test)]
use std::collections::HashMap;
use std::env;

use crate::errors::{PipelineError, Result};

/// Source of credentials, looked up by logical name.
pub trait SecretsProvider: Send + Sync {
    fn get(&self, logical_name: &str) -> Result<String>;
}

/// Reads secrets from the process environment, after `.env` has been loaded.
/// Logical names are upper-cased and prefixed, so `database_url` with the
/// prefix `DBVAULT_` reads `DBVAULT_DATABASE_URL`.
#[derive(Debug, Default)]
pub struct EnvSecretsProvider {
    prefix: String,
}

impl EnvSecretsProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        EnvSecretsProvider { prefix: prefix.into() }
    }

    /// Loads `.env` from the working directory if present.
    pub fn with_dotenv(prefix: impl Into<String>) -> Self {
        if let Ok(path) = dotenv::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::new(prefix)
    }

    fn var_name(&self, logical_name: &str) -> String {
        format!("{}{}", self.prefix, logical_name.to_ascii_uppercase())
    }
}

impl SecretsProvider for EnvSecretsProvider {
    fn get(&self, logical_name: &str) -> Result<String> {
        let var = self.var_name(logical_name);
        match env::var(&var) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(PipelineError::Prerequisite(format!(
                "credential '{}' is not set (expected environment variable {})",
                logical_name, var
            ))),
        }
    }
}

/// Fixed set of secrets.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MapSecretsProvider {
    values: HashMap<String, String>,
}

#[cfg(test)]
impl MapSecretsProvider {
    pub fn new<K: Into<String>, V: Into<String>>(values: impl IntoIterator<Item = (K, V)>) -> Self {
        MapSecretsProvider {
            values: values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
impl SecretsProvider for MapSecretsProvider {
    fn get(&self, logical_name: &str) -> Result<String> {
        self.values
            .get(logical_name)
            .cloned()
            .ok_or_else(|| PipelineError::Prerequisite(format!("credential '{}' is not set", logical_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_provider_maps_logical_names() {
        let provider = EnvSecretsProvider::new("DBVAULT_TEST_");
        assert_eq!(provider.var_name("database_url"), "DBVAULT_TEST_DATABASE_URL");
    }

    #[test]
    fn test_env_provider_reports_missing_credential() {
        let provider = EnvSecretsProvider::new("DBVAULT_SURELY_UNSET_");
        let err = provider.get("database_url").unwrap_err();
        assert!(matches!(err, PipelineError::Prerequisite(_)));
        assert!(err.to_string().contains("DBVAULT_SURELY_UNSET_DATABASE_URL"));
    }

    #[test]
    fn test_map_provider() {
        let provider = MapSecretsProvider::new([("DATABASE_URL", "postgres://localhost/app")]);
        assert_eq!(provider.get("DATABASE_URL").unwrap(), "postgres://localhost/app");
        assert!(provider.get("OTHER").is_err());
    }
}
