//! Runtime configuration
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the binary before this runs). Each section has a `from_env()` that fills
//! defaults and a `validate()` that rejects unusable values.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dataverse::delete::{
    DEFAULT_DELETE_BATCH_SIZE, DEFAULT_DELETE_CONCURRENCY, DEFAULT_DELETE_PAGE_SIZE,
};
use crate::dataverse::retry::{
    DEFAULT_ERROR_BACKOFF_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_AFTER_SECS,
};
use crate::dataverse::upsert::{DEFAULT_UPSERT_BATCH_SIZE, DEFAULT_UPSERT_CONCURRENCY};
use crate::dataverse::{
    ClientCredentials, DeleteOptions, RetryPolicy, StaticToken, TokenProvider, UpsertOptions,
};
use crate::error::{IngestError, Result};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_XMLA_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DATAVERSE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_PIPELINES_FILE: &str = "pipelines/pipelines.yaml";

/// Largest number of operations Dataverse accepts in one `$batch`
pub const MAX_BATCH_OPERATIONS: usize = 1000;

/// Source of configuration values, keyed by variable name
pub trait VarSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
pub struct ProcessEnv;

impl VarSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl VarSource for std::collections::HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

fn optional(vars: &dyn VarSource, key: &str) -> Option<String> {
    vars.var(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(vars: &dyn VarSource, key: &str) -> Result<String> {
    optional(vars, key).ok_or_else(|| IngestError::config(format!("{} is not set", key)))
}

fn parsed<T: std::str::FromStr>(vars: &dyn VarSource, key: &str, default: T) -> Result<T> {
    match optional(vars, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| IngestError::config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

fn flag(vars: &dyn VarSource, key: &str, default: bool) -> Result<bool> {
    match optional(vars, key).map(|v| v.to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(IngestError::config(format!("{} must be true or false, got {}", key, v))),
        None => Ok(default),
    }
}

// ============================================================================
// XMLA
// ============================================================================

#[derive(Debug, Clone)]
pub struct XmlaConfig {
    pub server: String,
    /// Used when a pipeline does not name its own catalog
    pub catalog: Option<String>,
    pub username: String,
    pub password: String,
    pub ssl_verify: bool,
    pub timeout_secs: u64,
}

impl XmlaConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&ProcessEnv)
    }

    pub fn from_vars(vars: &dyn VarSource) -> Result<Self> {
        let config = Self {
            server: required(vars, "XMLA_SERVER")?,
            catalog: optional(vars, "XMLA_CATALOG"),
            username: required(vars, "XMLA_USERNAME")?,
            password: required(vars, "XMLA_PASSWORD")?,
            ssl_verify: flag(vars, "XMLA_SSL_VERIFY", false)?,
            timeout_secs: parsed(vars, "XMLA_TIMEOUT_SECS", DEFAULT_XMLA_TIMEOUT_SECS)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.server.starts_with("http://") && !self.server.starts_with("https://") {
            return Err(IngestError::config(format!(
                "XMLA_SERVER must be an http(s) URL, got {}",
                self.server
            )));
        }
        if self.timeout_secs == 0 {
            return Err(IngestError::config("XMLA_TIMEOUT_SECS must be greater than 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Dataverse
// ============================================================================

#[derive(Clone)]
pub struct DataverseConfig {
    pub url: String,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Pre-issued bearer token; skips the client-credentials exchange
    pub access_token: Option<String>,
    pub authority: String,
    pub timeout_secs: u64,
    /// Idle connections kept per host
    pub pool_size: usize,
}

impl std::fmt::Debug for DataverseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataverseConfig")
            .field("url", &self.url)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("authority", &self.authority)
            .field("timeout_secs", &self.timeout_secs)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl DataverseConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&ProcessEnv)
    }

    pub fn from_vars(vars: &dyn VarSource) -> Result<Self> {
        let concurrency = parsed(vars, "UPSERT_MAX_CONCURRENCY", DEFAULT_UPSERT_CONCURRENCY)?
            .max(parsed(vars, "DELETE_MAX_CONCURRENCY", DEFAULT_DELETE_CONCURRENCY)?);

        let config = Self {
            url: required(vars, "DATAVERSE_URL")?
                .trim_end_matches('/')
                .to_string(),
            tenant_id: optional(vars, "DATAVERSE_TENANT_ID"),
            client_id: optional(vars, "DATAVERSE_CLIENT_ID"),
            client_secret: optional(vars, "DATAVERSE_CLIENT_SECRET"),
            access_token: optional(vars, "DATAVERSE_ACCESS_TOKEN"),
            authority: optional(vars, "DATAVERSE_AUTHORITY")
                .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string()),
            timeout_secs: parsed(vars, "DATAVERSE_TIMEOUT_SECS", DEFAULT_DATAVERSE_TIMEOUT_SECS)?,
            pool_size: concurrency.max(1) * 2,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("https://") && !self.url.starts_with("http://") {
            return Err(IngestError::config(format!(
                "DATAVERSE_URL must be an http(s) URL, got {}",
                self.url
            )));
        }
        if self.access_token.is_none() {
            for (key, value) in [
                ("DATAVERSE_TENANT_ID", &self.tenant_id),
                ("DATAVERSE_CLIENT_ID", &self.client_id),
                ("DATAVERSE_CLIENT_SECRET", &self.client_secret),
            ] {
                if value.is_none() {
                    return Err(IngestError::config(format!(
                        "{} is required unless DATAVERSE_ACCESS_TOKEN is set",
                        key
                    )));
                }
            }
        }
        if self.timeout_secs == 0 {
            return Err(IngestError::config("DATAVERSE_TIMEOUT_SECS must be greater than 0"));
        }
        Ok(())
    }

    /// Token source for this environment.
    pub fn token_provider(&self, http: reqwest::Client) -> Result<Arc<dyn TokenProvider>> {
        if let Some(token) = &self.access_token {
            return Ok(Arc::new(StaticToken::new(token.clone())));
        }

        let (Some(tenant_id), Some(client_id), Some(client_secret)) =
            (&self.tenant_id, &self.client_id, &self.client_secret)
        else {
            return Err(IngestError::config(
                "client credentials are incomplete and no access token is set",
            ));
        };

        Ok(Arc::new(ClientCredentials::new(
            http,
            &self.authority,
            tenant_id,
            client_id.clone(),
            client_secret.clone(),
            &self.url,
        )))
    }
}

// ============================================================================
// Sync tuning
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub upsert: UpsertOptions,
    pub delete: DeleteOptions,
    pub pipelines_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upsert: UpsertOptions::default(),
            delete: DeleteOptions::default(),
            pipelines_file: PathBuf::from(DEFAULT_PIPELINES_FILE),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&ProcessEnv)
    }

    pub fn from_vars(vars: &dyn VarSource) -> Result<Self> {
        let retry = RetryPolicy {
            max_attempts: parsed(vars, "RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            default_retry_after: Duration::from_secs(parsed(
                vars,
                "RETRY_DEFAULT_AFTER_SECS",
                DEFAULT_RETRY_AFTER_SECS,
            )?),
            error_backoff: Duration::from_secs(parsed(
                vars,
                "RETRY_ERROR_BACKOFF_SECS",
                DEFAULT_ERROR_BACKOFF_SECS,
            )?),
        };

        let upsert = UpsertOptions::default()
            .with_batch_size(parsed(vars, "UPSERT_BATCH_SIZE", DEFAULT_UPSERT_BATCH_SIZE)?)
            .with_max_concurrency(parsed(
                vars,
                "UPSERT_MAX_CONCURRENCY",
                DEFAULT_UPSERT_CONCURRENCY,
            )?)
            .with_retry(retry.clone());

        let delete = DeleteOptions::default()
            .with_page_size(parsed(vars, "DELETE_PAGE_SIZE", DEFAULT_DELETE_PAGE_SIZE)?)
            .with_batch_size(parsed(vars, "DELETE_BATCH_SIZE", DEFAULT_DELETE_BATCH_SIZE)?)
            .with_max_concurrency(parsed(
                vars,
                "DELETE_MAX_CONCURRENCY",
                DEFAULT_DELETE_CONCURRENCY,
            )?)
            .with_retry(retry);

        let config = Self {
            upsert,
            delete,
            pipelines_file: optional(vars, "PIPELINES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PIPELINES_FILE)),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("UPSERT_BATCH_SIZE", self.upsert.batch_size),
            ("UPSERT_MAX_CONCURRENCY", self.upsert.max_concurrency),
            ("DELETE_PAGE_SIZE", self.delete.page_size),
            ("DELETE_BATCH_SIZE", self.delete.batch_size),
            ("DELETE_MAX_CONCURRENCY", self.delete.max_concurrency),
            ("RETRY_MAX_ATTEMPTS", self.upsert.retry.max_attempts as usize),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(IngestError::config(format!("{} must be greater than 0", key)));
            }
        }

        for (key, value) in [
            ("UPSERT_BATCH_SIZE", self.upsert.batch_size),
            ("DELETE_BATCH_SIZE", self.delete.batch_size),
        ] {
            if value > MAX_BATCH_OPERATIONS {
                return Err(IngestError::config(format!(
                    "{} must be at most {}, got {}",
                    key, MAX_BATCH_OPERATIONS, value
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_xmla_defaults() {
        let config = XmlaConfig::from_vars(&vars(&[
            ("XMLA_SERVER", "https://olap.example.com"),
            ("XMLA_USERNAME", "svc"),
            ("XMLA_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert!(!config.ssl_verify);
        assert_eq!(config.timeout_secs, DEFAULT_XMLA_TIMEOUT_SECS);
        assert!(config.catalog.is_none());
    }

    #[test]
    fn test_xmla_requires_credentials() {
        let err = XmlaConfig::from_vars(&vars(&[("XMLA_SERVER", "https://olap.example.com")]))
            .unwrap_err();
        assert!(err.to_string().contains("XMLA_USERNAME"));
    }

    #[test]
    fn test_xmla_rejects_bad_flag() {
        let err = XmlaConfig::from_vars(&vars(&[
            ("XMLA_SERVER", "https://olap.example.com"),
            ("XMLA_USERNAME", "svc"),
            ("XMLA_PASSWORD", "secret"),
            ("XMLA_SSL_VERIFY", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_dataverse_static_token_skips_credentials() {
        let config = DataverseConfig::from_vars(&vars(&[
            ("DATAVERSE_URL", "https://org.crm.dynamics.com/"),
            ("DATAVERSE_ACCESS_TOKEN", "tok"),
        ]))
        .unwrap();

        assert_eq!(config.url, "https://org.crm.dynamics.com");
        assert_eq!(config.authority, DEFAULT_AUTHORITY);
        assert!(config.token_provider(reqwest::Client::new()).is_ok());
        assert!(!format!("{:?}", config).contains("tok\""));
    }

    #[test]
    fn test_dataverse_requires_client_credentials() {
        let err = DataverseConfig::from_vars(&vars(&[
            ("DATAVERSE_URL", "https://org.crm.dynamics.com"),
            ("DATAVERSE_TENANT_ID", "t"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("DATAVERSE_CLIENT_ID"));
    }

    #[test]
    fn test_sync_defaults() {
        let config = SyncConfig::from_vars(&vars(&[])).unwrap();
        assert_eq!(config.upsert.batch_size, 400);
        assert_eq!(config.upsert.max_concurrency, 6);
        assert_eq!(config.delete.page_size, 5000);
        assert_eq!(config.delete.batch_size, 100);
        assert_eq!(config.delete.max_concurrency, 8);
        assert_eq!(config.upsert.retry, RetryPolicy::default());
        assert_eq!(config.pipelines_file, PathBuf::from(DEFAULT_PIPELINES_FILE));
    }

    #[test]
    fn test_sync_overrides() {
        let config = SyncConfig::from_vars(&vars(&[
            ("UPSERT_BATCH_SIZE", "250"),
            ("RETRY_MAX_ATTEMPTS", "2"),
            ("RETRY_ERROR_BACKOFF_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.upsert.batch_size, 250);
        assert_eq!(config.delete.retry.max_attempts, 2);
        assert_eq!(config.delete.retry.error_backoff, Duration::ZERO);
    }

    #[test]
    fn test_sync_rejects_zero_and_oversized_batches() {
        assert!(SyncConfig::from_vars(&vars(&[("DELETE_BATCH_SIZE", "0")])).is_err());
        let err = SyncConfig::from_vars(&vars(&[("UPSERT_BATCH_SIZE", "1001")])).unwrap_err();
        assert!(err.to_string().contains("at most 1000"));
        assert!(SyncConfig::from_vars(&vars(&[("UPSERT_BATCH_SIZE", "many")])).is_err());
    }
}
