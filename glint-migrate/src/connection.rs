//! Reachability checks for the source and target stores.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::schema::TABLES;
use crate::store::{DocumentSource, RelationalTarget, ServerInfo};

/// Options for [`ConnectionTestService::test_connections`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTestOptions {
    /// Per-store time limit.
    pub timeout: Duration,
    /// Also count collections and tables.
    pub verbose: bool,
}

impl Default for ConnectionTestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            verbose: false,
        }
    }
}

impl ConnectionTestOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-store time limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable object counts.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Outcome for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreCheck {
    /// Which store.
    pub store: &'static str,
    /// Ping and server info succeeded in time.
    pub is_reachable: bool,
    /// Round-trip time of the check.
    pub latency: Duration,
    /// Server product and version.
    pub server: Option<ServerInfo>,
    /// Collections in the source, or mapped tables present in the target.
    pub object_count: Option<u64>,
    /// Failure description.
    pub error_message: Option<String>,
}

/// Outcome of a connection test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionTestResult {
    /// Document store, when configured.
    pub source: Option<StoreCheck>,
    /// Relational store, when configured.
    pub target: Option<StoreCheck>,
}

impl ConnectionTestResult {
    /// At least one store was checked and every checked store is reachable.
    pub fn is_success(&self) -> bool {
        let checks: Vec<&StoreCheck> = self.source.iter().chain(self.target.iter()).collect();
        !checks.is_empty() && checks.iter().all(|c| c.is_reachable)
    }
}

/// Pings the configured stores.
#[derive(Clone, Default)]
pub struct ConnectionTestService {
    source: Option<Arc<dyn DocumentSource>>,
    target: Option<Arc<dyn RelationalTarget>>,
}

impl std::fmt::Debug for ConnectionTestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTestService")
            .field("source", &self.source.is_some())
            .field("target", &self.target.is_some())
            .finish()
    }
}

impl ConnectionTestService {
    /// Create a service with no stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a document store.
    pub fn source(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Check a relational store.
    pub fn target(mut self, target: Arc<dyn RelationalTarget>) -> Self {
        self.target = Some(target);
        self
    }

    /// Check every configured store.
    pub async fn test_connections(&self, options: &ConnectionTestOptions) -> ConnectionTestResult {
        let source = async {
            match &self.source {
                Some(source) => Some(
                    check("document store", options.timeout, async {
                        source.ping().await?;
                        let info = source.server_info().await?;
                        let count = if options.verbose {
                            Some(source.list_collections().await?.len() as u64)
                        } else {
                            None
                        };
                        Ok::<_, MigrationError>((info, count))
                    })
                    .await,
                ),
                None => None,
            }
        };
        let target = async {
            match &self.target {
                Some(target) => Some(
                    check("relational store", options.timeout, async {
                        target.ping().await?;
                        let info = target.server_info().await?;
                        let count = if options.verbose {
                            let mut present = 0;
                            for table in TABLES {
                                if target.table_exists(table.table).await? {
                                    present += 1;
                                }
                            }
                            Some(present)
                        } else {
                            None
                        };
                        Ok::<_, MigrationError>((info, count))
                    })
                    .await,
                ),
                None => None,
            }
        };

        let (source, target) = tokio::join!(source, target);
        ConnectionTestResult { source, target }
    }
}

async fn check<F>(store: &'static str, timeout: Duration, probe: F) -> StoreCheck
where
    F: Future<Output = MigrateResult<(ServerInfo, Option<u64>)>>,
{
    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, probe)
        .await
        .unwrap_or(Err(MigrationError::Timeout(timeout.as_millis() as u64)));
    let latency = start.elapsed();

    match outcome {
        Ok((info, count)) => {
            debug!(store, version = %info.version, latency_ms = latency.as_millis() as u64, "Store reachable");
            StoreCheck {
                store,
                is_reachable: true,
                latency,
                server: Some(info),
                object_count: count,
                error_message: None,
            }
        }
        Err(err) => {
            warn!(store, error = %err, "Store unreachable");
            StoreCheck {
                store,
                is_reachable: false,
                latency,
                server: None,
                object_count: None,
                error_message: Some(err.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemorySource, InMemoryTarget};
    use bson::doc;

    #[tokio::test]
    async fn test_both_reachable_verbose() {
        let source = InMemorySource::new("care")
            .with_collection("entries", vec![doc! { "_id": 1 }])
            .with_collection("food", vec![doc! { "_id": 1 }]);
        let target = InMemoryTarget::new();
        target.create_raw_table("entries", &[("id", "uuid")]);
        let service = ConnectionTestService::new()
            .source(Arc::new(source))
            .target(Arc::new(target));

        let result = service
            .test_connections(&ConnectionTestOptions::new().verbose(true))
            .await;
        assert!(result.is_success());
        assert_eq!(result.source.as_ref().unwrap().object_count, Some(2));
        assert_eq!(result.target.as_ref().unwrap().object_count, Some(1));
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let target = InMemoryTarget::new();
        target.set_unreachable(true);
        let service = ConnectionTestService::new()
            .source(Arc::new(InMemorySource::new("care")))
            .target(Arc::new(target));

        let result = service.test_connections(&ConnectionTestOptions::new()).await;
        assert!(!result.is_success());
        assert!(result.source.unwrap().is_reachable);
        let target = result.target.unwrap();
        assert!(!target.is_reachable);
        assert!(target.error_message.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_nothing_configured_is_not_success() {
        let result = ConnectionTestService::new()
            .test_connections(&ConnectionTestOptions::new())
            .await;
        assert!(!result.is_success());
    }
}
