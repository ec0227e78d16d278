//! MongoDB client wrapper with built-in connection pooling.

use std::sync::Arc;

use bson::{Bson, Document, doc};
use futures::TryStreamExt;
use mongodb::{Client, Collection, Database};
use tracing::{debug, info};

use crate::config::MongoConfig;
use crate::error::{MongoError, MongoResult};

/// A MongoDB client with connection pooling.
///
/// The MongoDB driver handles connection pooling internally, so this
/// client only pairs the driver's Client with the database being migrated.
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    database: Database,
    config: Arc<MongoConfig>,
}

impl std::fmt::Debug for MongoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoClient")
            .field("database", &self.config.database)
            .finish()
    }
}

impl MongoClient {
    /// Create a new client from configuration.
    ///
    /// The driver connects lazily; use [`MongoClient::ping`] to check
    /// reachability.
    pub async fn new(config: MongoConfig) -> MongoResult<Self> {
        let options = config.to_client_options().await?;

        let client = Client::with_options(options)
            .map_err(|e| MongoError::connection(format!("failed to create client: {}", e)))?;

        let database = client.database(&config.database);

        info!(database = %config.database, "MongoDB client created");

        Ok(Self {
            client,
            database,
            config: Arc::new(config),
        })
    }

    /// Get a collection with BSON documents.
    pub fn collection_doc(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }

    /// Get the underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Get the underlying MongoDB client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the configuration.
    pub fn config(&self) -> &MongoConfig {
        &self.config
    }

    /// Ping the server.
    pub async fn ping(&self) -> MongoResult<()> {
        self.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    /// Server version from `buildInfo`.
    pub async fn server_version(&self) -> MongoResult<String> {
        let reply = self.run_command(doc! { "buildInfo": 1 }).await?;
        reply
            .get_str("version")
            .map(str::to_string)
            .map_err(|_| MongoError::query("buildInfo reply has no version"))
    }

    /// List user collection names, sorted.
    pub async fn list_collections(&self) -> MongoResult<Vec<String>> {
        let mut names: Vec<String> = self
            .database
            .list_collection_names(None)
            .await?
            .into_iter()
            .filter(|name| !name.starts_with("system."))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Run an aggregation pipeline and collect the results.
    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> MongoResult<Vec<Document>> {
        debug!(collection, stages = pipeline.len(), "Running aggregation");
        let cursor = self
            .collection_doc(collection)
            .aggregate(pipeline, None)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    /// Run a database command.
    pub async fn run_command(&self, command: Document) -> MongoResult<Document> {
        let result = self.database.run_command(command, None).await?;
        Ok(result)
    }
}

/// Read a non-negative integer from a server reply value.
pub(crate) fn bson_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(v) => u64::try_from(*v).ok(),
        Bson::Int64(v) => u64::try_from(*v).ok(),
        Bson::Double(v) if *v >= 0.0 => Some(*v as u64),
        _ => None,
    }
}
