//! # glint-mongodb
//!
//! MongoDB document source for the glint migration engine.
//!
//! This crate provides:
//! - Connection management with the official MongoDB driver
//! - Paged reads in `_id` order with date-range filtering
//! - Sampling for shape inference
//! - Index listing with usage statistics from `$indexStats`
//! - Mapping of server error codes onto the engine's error taxonomy
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use glint_mongodb::{MongoClient, MongoConfig, MongoSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MongoClient::new(MongoConfig::from_uri("mongodb://localhost:27017", "care")).await?;
//!     let source = Arc::new(MongoSource::new(client));
//!     // Hand `source` to glint_migrate::MigrationEngine::new(..)
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod source;

pub use bson::{Bson, Document, doc};
pub use client::MongoClient;
pub use config::{MongoConfig, ReadPreference};
pub use error::{MongoError, MongoResult};
pub use source::{MongoSource, filter_document, source_index};
