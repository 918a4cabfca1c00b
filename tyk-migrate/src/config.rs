//! Connection and run settings.
//!
//! Settings come from an optional TOML file. String values of the form
//! `${VAR}` are read from the environment. Anything left unset falls back to
//! the defaults of the original Tyk deployment, except the database password,
//! which has no silent default.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::errors::MigrateError;
use crate::runner::CommitStrategy;

/// Legacy password shipped with the original deployment. Only used after an explicit opt-in.
pub const INSECURE_DEFAULT_PASSWORD: &str = "your_password";

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Configuration stored in tyk-migrate.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrateConfig {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub postgres: PostgresSettings,
    #[serde(default)]
    pub migration: MigrationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Falls back to `REDIS_URL`, then to a local instance.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSettings {
    /// Full connection string. Overrides the discrete fields below.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    /// Environment variable holding the password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default)]
    pub allow_insecure_default_password: bool,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: default_pg_host(),
            port: default_pg_port(),
            database: default_pg_database(),
            user: default_pg_user(),
            password_env: default_password_env(),
            allow_insecure_default_password: false,
        }
    }
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_database() -> String {
    "tyk_db".to_string()
}

fn default_pg_user() -> String {
    "tyk_admin".to_string()
}

fn default_password_env() -> String {
    "POSTGRES_PASSWORD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    #[serde(default)]
    pub commit: CommitStrategy,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            commit: CommitStrategy::default(),
            timeout_secs: None,
            scan_count: default_scan_count(),
        }
    }
}

fn default_scan_count() -> usize {
    500
}

/// Where the database password came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSource {
    Environment,
    InsecureDefault,
}

impl MigrateConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, MigrateError> {
        toml::from_str(content).map_err(|err| MigrateError::config(format!("invalid config: {err}")))
    }

    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            MigrateError::config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn redis_url(&self) -> Result<String, MigrateError> {
        self.redis_url_with(&env_lookup)
    }

    pub fn redis_url_with<F>(&self, lookup: &F) -> Result<String, MigrateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match &self.redis.url {
            Some(url) => expand_env(url, lookup),
            None => Ok(lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string())),
        }
    }

    pub fn postgres_options(&self) -> Result<PgConnectOptions, MigrateError> {
        self.postgres_options_with(&env_lookup).map(|(options, source)| {
            if source == Some(PasswordSource::InsecureDefault) {
                log::warn!(
                    "{} is not set; using the insecure default password because allow_insecure_default_password is enabled",
                    self.postgres.password_env
                );
            }
            options
        })
    }

    /// Connection options plus where the password came from (`None` when a URL carries it).
    pub fn postgres_options_with<F>(
        &self,
        lookup: &F,
    ) -> Result<(PgConnectOptions, Option<PasswordSource>), MigrateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = &self.postgres.url {
            let url = expand_env(url, lookup)?;
            let options = PgConnectOptions::from_str(&url)
                .map_err(|err| MigrateError::config(format!("invalid postgres url: {err}")))?;
            return Ok((options, None));
        }

        let (password, source) = self.resolve_password_with(lookup)?;
        let options = PgConnectOptions::new()
            .host(&self.postgres.host)
            .port(self.postgres.port)
            .database(&self.postgres.database)
            .username(&self.postgres.user)
            .password(&password);
        Ok((options, Some(source)))
    }

    pub fn resolve_password_with<F>(&self, lookup: &F) -> Result<(String, PasswordSource), MigrateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_name = self.postgres.password_env.as_str();
        match lookup(var_name) {
            Some(password) => Ok((password, PasswordSource::Environment)),
            None if self.postgres.allow_insecure_default_password => {
                Ok((INSECURE_DEFAULT_PASSWORD.to_string(), PasswordSource::InsecureDefault))
            }
            None => Err(MigrateError::config(format!(
                "{var_name} is not set. Export it, or set postgres.allow_insecure_default_password = true to use the legacy default"
            ))),
        }
    }

    /// Postgres endpoint for display, without credentials.
    pub fn postgres_display(&self) -> String {
        match &self.postgres.url {
            Some(url) => match expand_env(url, &env_lookup) {
                Ok(url) => redact_url(&url),
                Err(_) => url.clone(),
            },
            None => format!(
                "postgres://{}@{}:{}/{}",
                self.postgres.user, self.postgres.host, self.postgres.port, self.postgres.database
            ),
        }
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Expand a whole-value `${VAR}` reference.
pub fn expand_env<F>(value: &str, lookup: &F) -> Result<String, MigrateError>
where
    F: Fn(&str) -> Option<String>,
{
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        lookup(var_name).ok_or_else(|| MigrateError::config(format!("environment variable {var_name} not set")))
    } else {
        Ok(value.to_string())
    }
}

/// Replace the password of a connection URL with `***`.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_err() {
                return raw.to_string();
            }
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = MigrateConfig::default();
        assert_eq!(config.postgres.host, "localhost");
        assert_eq!(config.postgres.database, "tyk_db");
        assert_eq!(config.postgres.user, "tyk_admin");
        assert_eq!(config.postgres.password_env, "POSTGRES_PASSWORD");
        assert!(!config.postgres.allow_insecure_default_password);
        assert_eq!(config.migration.commit, CommitStrategy::Single);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = MigrateConfig::from_toml_str(
            r#"
            [postgres]
            database = "gateway"

            [migration]
            commit = "per-category"
            timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.postgres.database, "gateway");
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.migration.commit, CommitStrategy::PerCategory);
        assert_eq!(config.migration.timeout_secs, Some(30));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = MigrateConfig::from_toml_str("[postgres\nport = ").unwrap_err();
        assert!(matches!(err, MigrateError::Config { .. }));
    }

    #[test]
    fn redis_url_resolution_order() {
        let config = MigrateConfig::default();
        assert_eq!(config.redis_url_with(&env(&[])).unwrap(), DEFAULT_REDIS_URL);
        assert_eq!(
            config.redis_url_with(&env(&[("REDIS_URL", "redis://cache:6380/1")])).unwrap(),
            "redis://cache:6380/1"
        );

        let mut explicit = MigrateConfig::default();
        explicit.redis.url = Some("${TYK_REDIS}".to_string());
        assert_eq!(
            explicit.redis_url_with(&env(&[("TYK_REDIS", "redis://r/2")])).unwrap(),
            "redis://r/2"
        );
        assert!(explicit.redis_url_with(&env(&[])).is_err());
    }

    #[test]
    fn missing_password_without_opt_in_is_rejected() {
        let config = MigrateConfig::default();
        let err = config.resolve_password_with(&env(&[])).unwrap_err();
        assert!(err.to_string().contains("POSTGRES_PASSWORD"));
    }

    #[test]
    fn insecure_default_requires_opt_in() {
        let mut config = MigrateConfig::default();
        config.postgres.allow_insecure_default_password = true;
        let (password, source) = config.resolve_password_with(&env(&[])).unwrap();
        assert_eq!(password, INSECURE_DEFAULT_PASSWORD);
        assert_eq!(source, PasswordSource::InsecureDefault);
    }

    #[test]
    fn environment_password_wins() {
        let mut config = MigrateConfig::default();
        config.postgres.allow_insecure_default_password = true;
        let (password, source) = config
            .resolve_password_with(&env(&[("POSTGRES_PASSWORD", "s3cret")]))
            .unwrap();
        assert_eq!(password, "s3cret");
        assert_eq!(source, PasswordSource::Environment);
    }

    #[test]
    fn postgres_url_skips_password_policy() {
        let mut config = MigrateConfig::default();
        config.postgres.url = Some("${DATABASE_URL}".to_string());
        let (_, source) = config
            .postgres_options_with(&env(&[("DATABASE_URL", "postgres://u:p@db:5432/tyk")]))
            .unwrap();
        assert_eq!(source, None);
    }

    #[test]
    fn expand_env_leaves_plain_values() {
        assert_eq!(expand_env("localhost", &env(&[])).unwrap(), "localhost");
        assert_eq!(expand_env("${X}", &env(&[("X", "y")])).unwrap(), "y");
    }

    #[test]
    fn redacts_passwords() {
        assert_eq!(redact_url("redis://:hunter2@cache:6379/0"), "redis://:***@cache:6379/0");
        assert_eq!(redact_url("postgres://u:p@db/tyk"), "postgres://u:***@db/tyk");
        assert_eq!(redact_url("redis://localhost:6379/0"), "redis://localhost:6379/0");
    }

    #[test]
    fn test_config_serialization() {
        let config = MigrateConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("password_env"));
        assert!(toml_str.contains("commit"));
    }
}
