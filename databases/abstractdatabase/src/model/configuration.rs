//! Storage client configuration.
//!
//! Backend-agnostic: endpoint, credentials, target table and timeouts.
//! Backends translate it into their own connection string.

use std::{fmt::Debug, time::Duration};

#[derive(Clone)]
pub struct StoreConfig {
    pub application_name: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,

    /// Table receiving validation rows.
    pub table: String,

    pub connect_timeout: Duration,
}

impl Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("application_name", &self.application_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("table", &self.table)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            application_name: Some("validation-pipeline".into()),
            host: "localhost".into(),
            port: 5432,
            database: "postgres".into(),
            user: "postgres".into(),
            password: None,
            table: "validations".into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// Validate cross-field consistency. Keep this strict to fail fast.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be > 0".into()));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid("database must not be empty".into()));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::Invalid("user must not be empty".into()));
        }
        if !is_identifier(&self.table) {
            return Err(ConfigError::Invalid(format!(
                "table '{}' is not a plain identifier",
                self.table
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect_timeout must be > 0".into()));
        }
        Ok(())
    }

    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::new()
    }

    /// libpq-style `key=value` connection string.
    pub fn connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("dbname={}", self.database),
            format!("user={}", self.user),
            format!("connect_timeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(pw) = &self.password {
            parts.push(format!("password={pw}"));
        }
        if let Some(app) = &self.application_name {
            parts.push(format!("application_name={app}"));
        }
        parts.join(" ")
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builder for `StoreConfig` (avoids a "giant constructor").
#[derive(Debug, Default)]
pub struct StoreConfigBuilder {
    cfg: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            cfg: StoreConfig::default(),
        }
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.cfg.application_name = Some(name.into());
        self
    }

    pub fn endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.cfg.host = host.into();
        self.cfg.port = port;
        self
    }

    pub fn database(mut self, db: impl Into<String>) -> Self {
        self.cfg.database = db.into();
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.cfg.user = user.into();
        self.cfg.password = password;
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.cfg.table = table.into();
        self
    }

    pub fn connect_timeout(mut self, t: Duration) -> Self {
        self.cfg.connect_timeout = t;
        self
    }

    pub fn build(self) -> Result<StoreConfig, ConfigError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(s) => write!(f, "invalid config: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn builder_rejects_bad_table() {
        let err = StoreConfig::builder().table("validations; drop").build().unwrap_err();
        assert!(err.to_string().contains("plain identifier"));
    }

    #[test]
    fn connection_string_and_redacted_debug() {
        let cfg = StoreConfig::builder()
            .endpoint("db.internal", 6543)
            .database("fares")
            .credentials("ingest", Some("s3cret".into()))
            .build()
            .unwrap();
        let s = cfg.connection_string();
        assert!(s.contains("host=db.internal"));
        assert!(s.contains("port=6543"));
        assert!(s.contains("dbname=fares"));
        assert!(s.contains("password=s3cret"));
        assert!(!format!("{cfg:?}").contains("s3cret"));
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("validations"));
        assert!(is_identifier("_v2"));
        assert!(!is_identifier("2v"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }
}
