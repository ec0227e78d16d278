//! MongoDB connection configuration.

use std::time::Duration;

use mongodb::options::{ClientOptions, SelectionCriteria};

use crate::error::{MongoError, MongoResult};

/// MongoDB connection configuration.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// MongoDB connection URI.
    pub uri: String,
    /// Database name.
    pub database: String,
    /// Application name (shown in server logs).
    pub app_name: Option<String>,
    /// Maximum connection pool size.
    pub max_pool_size: Option<u32>,
    /// Connection timeout.
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout.
    pub server_selection_timeout: Option<Duration>,
    /// Read preference.
    pub read_preference: ReadPreference,
    /// Retry reads.
    pub retry_reads: Option<bool>,
    /// Direct connection (bypass replica set discovery).
    pub direct_connection: Option<bool>,
}

/// MongoDB read preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Read from primary only.
    #[default]
    Primary,
    /// Read from secondary preferred, fallback to primary.
    SecondaryPreferred,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: String::new(),
            app_name: Some("glint".to_string()),
            max_pool_size: Some(10),
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(30)),
            read_preference: ReadPreference::Primary,
            retry_reads: Some(true),
            direct_connection: None,
        }
    }
}

impl MongoConfig {
    /// Create a new configuration from a MongoDB URI.
    pub fn from_uri(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Set the maximum pool size.
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the server selection timeout.
    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = Some(timeout);
        self
    }

    /// Set the read preference.
    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.read_preference = preference;
        self
    }

    /// Enable direct connection (bypass replica set discovery).
    pub fn direct_connection(mut self, enabled: bool) -> Self {
        self.direct_connection = Some(enabled);
        self
    }

    /// Check the configuration without connecting.
    pub fn validate(&self) -> MongoResult<()> {
        if !(self.uri.starts_with("mongodb://") || self.uri.starts_with("mongodb+srv://")) {
            return Err(MongoError::config(
                "URI must start with mongodb:// or mongodb+srv://",
            ));
        }
        if self.database.is_empty() {
            return Err(MongoError::config("database name is required"));
        }
        if self.max_pool_size == Some(0) {
            return Err(MongoError::config("max_pool_size must be greater than 0"));
        }
        Ok(())
    }

    /// Convert to MongoDB ClientOptions.
    pub async fn to_client_options(&self) -> MongoResult<ClientOptions> {
        self.validate()?;

        let mut options = ClientOptions::parse(&self.uri)
            .await
            .map_err(|e| MongoError::config(format!("failed to parse URI: {}", e)))?;

        if let Some(ref app_name) = self.app_name {
            options.app_name = Some(app_name.clone());
        }

        if let Some(max_pool) = self.max_pool_size {
            options.max_pool_size = Some(max_pool);
        }

        if let Some(connect_timeout) = self.connect_timeout {
            options.connect_timeout = Some(connect_timeout);
        }

        if let Some(selection_timeout) = self.server_selection_timeout {
            options.server_selection_timeout = Some(selection_timeout);
        }

        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            match self.read_preference {
                ReadPreference::Primary => mongodb::options::ReadPreference::Primary,
                ReadPreference::SecondaryPreferred => {
                    mongodb::options::ReadPreference::SecondaryPreferred {
                        options: Default::default(),
                    }
                }
            },
        ));

        if let Some(retry_reads) = self.retry_reads {
            options.retry_reads = Some(retry_reads);
        }

        if let Some(direct) = self.direct_connection {
            options.direct_connection = Some(direct);
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MongoConfig::default();
        assert_eq!(config.uri, "mongodb://localhost:27017");
        assert_eq!(config.app_name.as_deref(), Some("glint"));
        assert_eq!(config.read_preference, ReadPreference::Primary);
    }

    #[test]
    fn test_from_uri_with_overrides() {
        let config = MongoConfig::from_uri("mongodb://db:27017", "care")
            .max_pool_size(4)
            .read_preference(ReadPreference::SecondaryPreferred);
        assert_eq!(config.database, "care");
        assert_eq!(config.max_pool_size, Some(4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(MongoConfig::from_uri("postgres://x", "care").validate().is_err());
        assert!(MongoConfig::from_uri("mongodb://x", "").validate().is_err());
        assert!(
            MongoConfig::from_uri("mongodb://x", "care")
                .max_pool_size(0)
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_to_client_options() {
        let options = MongoConfig::from_uri("mongodb://localhost:27017", "care")
            .direct_connection(true)
            .to_client_options()
            .await
            .unwrap();
        assert_eq!(options.app_name.as_deref(), Some("glint"));
        assert_eq!(options.direct_connection, Some(true));
    }
}
