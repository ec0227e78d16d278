//! [`DocumentSource`] over a live MongoDB database.

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use chrono::SecondsFormat;
use futures::TryStreamExt;
use glint_migrate::schema::DateEncoding;
use glint_migrate::store::{IndexKeyKind, SourceIndex};
use glint_migrate::transform::bson_to_json;
use glint_migrate::{
    BatchRequest, DocumentSource, MigrateResult, ServerInfo, SourceFilter, SourcePosition,
};
use mongodb::IndexModel;
use mongodb::options::FindOptions;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::client::{MongoClient, bson_u64};
use crate::error::MongoError;

/// Reads collections through a [`MongoClient`].
#[derive(Debug, Clone)]
pub struct MongoSource {
    client: MongoClient,
}

impl MongoSource {
    /// Wrap a client.
    pub fn new(client: MongoClient) -> Self {
        Self { client }
    }

    /// The wrapped client.
    pub fn client(&self) -> &MongoClient {
        &self.client
    }

    async fn index_usage(&self, collection: &str) -> HashMap<String, u64> {
        // `$indexStats` needs the clusterMonitor role; usage is optional.
        match self
            .client
            .aggregate(collection, vec![doc! { "$indexStats": {} }])
            .await
        {
            Ok(stats) => stats
                .iter()
                .filter_map(|s| {
                    let name = s.get_str("name").ok()?;
                    let ops = s.get_document("accesses").ok()?.get("ops").and_then(bson_u64)?;
                    Some((name.to_string(), ops))
                })
                .collect(),
            Err(e) => {
                debug!(collection, error = %e, "Index usage unavailable");
                HashMap::new()
            }
        }
    }
}

/// Build the query document for a filtered read, optionally after a cursor.
///
/// `$gt` only matches `_id`s of the cursor's own type bracket, so the cursor
/// clause also admits every bracket that sorts later. Dates are matched
/// either in their declared encoding or as native BSON dates, so collections
/// with mixed representations filter consistently.
pub fn filter_document(filter: &SourceFilter, after: Option<&SourcePosition>) -> Document {
    let mut clauses = Vec::new();

    if let Some(after) = after {
        clauses.push(cursor_clause(after));
    }

    let range = filter.date_range;
    if let (true, Some(field)) = (range.is_bounded(), filter.date_field) {
        let encoded = |at: chrono::DateTime<chrono::Utc>| match field.encoding {
            DateEncoding::EpochMillis => Bson::Int64(at.timestamp_millis()),
            DateEncoding::IsoString => {
                Bson::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        };
        let native = |at: chrono::DateTime<chrono::Utc>| Bson::DateTime(at.into());

        let mut encoded_bounds = Document::new();
        let mut native_bounds = Document::new();
        if let Some(start) = range.start {
            encoded_bounds.insert("$gte", encoded(start));
            native_bounds.insert("$gte", native(start));
        }
        if let Some(end) = range.end {
            encoded_bounds.insert("$lte", encoded(end));
            native_bounds.insert("$lte", native(end));
        }
        let branch = |bounds: Document| {
            let mut branch = Document::new();
            branch.insert(field.field, bounds);
            Bson::Document(branch)
        };
        clauses.push(doc! { "$or": [branch(encoded_bounds), branch(native_bounds)] });
    }

    match clauses.len() {
        0 => Document::new(),
        1 => clauses.remove(0),
        _ => doc! { "$and": clauses },
    }
}

fn cursor_clause(after: &SourcePosition) -> Document {
    let greater = doc! { "_id": { "$gt": after.to_bson() } };
    let later: Vec<Bson> = after
        .bracket()
        .following()
        .map(|b| Bson::String(b.type_alias().to_string()))
        .collect();
    if later.is_empty() {
        greater
    } else {
        doc! { "$or": [greater, { "_id": { "$type": later } }] }
    }
}

/// Convert a driver index model into the engine's description.
pub fn source_index(model: &IndexModel, usage: Option<u64>) -> SourceIndex {
    let options = model.options.as_ref();
    let keys: Vec<(String, IndexKeyKind)> = model
        .keys
        .iter()
        .map(|(field, value)| {
            let kind = if field.contains("$**") {
                IndexKeyKind::Wildcard
            } else {
                IndexKeyKind::from_bson(value)
            };
            (field.clone(), kind)
        })
        .collect();
    let name = options
        .and_then(|o| o.name.clone())
        .unwrap_or_else(|| {
            keys.iter()
                .map(|(f, _)| format!("{}_1", f))
                .collect::<Vec<_>>()
                .join("_")
        });

    SourceIndex {
        name,
        keys,
        unique: options.and_then(|o| o.unique).unwrap_or(false),
        sparse: options.and_then(|o| o.sparse).unwrap_or(false),
        partial_filter: options
            .and_then(|o| o.partial_filter_expression.clone())
            .map(|d| bson_to_json(&Bson::Document(d))),
        usage_ops: usage,
    }
}

#[async_trait]
impl DocumentSource for MongoSource {
    async fn ping(&self) -> MigrateResult<()> {
        Ok(self.client.ping().await?)
    }

    async fn server_info(&self) -> MigrateResult<ServerInfo> {
        Ok(ServerInfo {
            product: "MongoDB".to_string(),
            version: self.client.server_version().await?,
        })
    }

    fn database_name(&self) -> &str {
        &self.client.config().database
    }

    async fn list_collections(&self) -> MigrateResult<Vec<String>> {
        Ok(self.client.list_collections().await?)
    }

    async fn count_documents(&self, collection: &str, filter: &SourceFilter) -> MigrateResult<u64> {
        let query = filter_document(filter, None);
        let count = self
            .client
            .collection_doc(collection)
            .count_documents(query, None)
            .await
            .map_err(MongoError::from)?;
        Ok(count)
    }

    async fn fetch_batch(
        &self,
        collection: &str,
        request: &BatchRequest,
    ) -> MigrateResult<Vec<Document>> {
        let query = filter_document(&request.filter, request.after.as_ref());
        trace!(collection, query = %query, limit = request.limit, "Fetching batch");

        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .limit(request.limit as i64)
            .batch_size(request.limit.min(u32::MAX as usize) as u32)
            .build();
        let cursor = self
            .client
            .collection_doc(collection)
            .find(query, options)
            .await
            .map_err(MongoError::from)?;
        let documents: Vec<Document> = cursor.try_collect().await.map_err(MongoError::from)?;
        Ok(documents)
    }

    async fn sample_documents(&self, collection: &str, size: usize) -> MigrateResult<Vec<Document>> {
        let pipeline = vec![doc! { "$sample": { "size": size as i64 } }];
        Ok(self.client.aggregate(collection, pipeline).await?)
    }

    async fn list_indexes(&self, collection: &str) -> MigrateResult<Vec<SourceIndex>> {
        let models: Vec<IndexModel> = self
            .client
            .collection_doc(collection)
            .list_indexes(None)
            .await
            .map_err(MongoError::from)?
            .try_collect()
            .await
            .map_err(MongoError::from)?;
        let usage = self.index_usage(collection).await;

        Ok(models
            .iter()
            .map(|model| {
                let name = model.options.as_ref().and_then(|o| o.name.as_deref());
                source_index(model, name.and_then(|n| usage.get(n).copied()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use glint_migrate::DateRange;
    use glint_migrate::schema::DateField;
    use mongodb::options::IndexOptions;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filter_document_unfiltered() {
        assert_eq!(filter_document(&SourceFilter::default(), None), doc! {});
        let after = SourcePosition::DateTime(5);
        assert_eq!(
            filter_document(&SourceFilter::default(), Some(&after)),
            doc! { "_id": { "$gt": Bson::DateTime(bson::DateTime::from_millis(5)) } }
        );
    }

    #[test]
    fn test_cursor_admits_later_id_types() {
        let after = SourcePosition::Int(5);
        assert_eq!(
            filter_document(&SourceFilter::default(), Some(&after)),
            doc! {
                "$or": [
                    { "_id": { "$gt": 5_i64 } },
                    { "_id": { "$type": ["string", "binData", "objectId", "bool", "date"] } }
                ]
            }
        );

        let after = SourcePosition::ObjectId("650000000000000000000001".into());
        let query = filter_document(&SourceFilter::default(), Some(&after));
        let branches = query.get_array("$or").unwrap();
        assert_eq!(
            branches[1],
            Bson::Document(doc! { "_id": { "$type": ["bool", "date"] } })
        );
    }

    #[test]
    fn test_filter_document_epoch_range() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let filter = SourceFilter::new(
            DateRange {
                start: Some(start),
                end: None,
            },
            Some(DateField {
                field: "date",
                encoding: DateEncoding::EpochMillis,
            }),
        );
        let query = filter_document(&filter, None);
        let branches = query.get_array("$or").unwrap();
        assert_eq!(
            branches[0],
            Bson::Document(doc! { "date": { "$gte": start.timestamp_millis() } })
        );
        assert_eq!(
            branches[1],
            Bson::Document(doc! { "date": { "$gte": Bson::DateTime(start.into()) } })
        );
    }

    #[test]
    fn test_filter_document_iso_range_with_cursor() {
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let filter = SourceFilter::new(
            DateRange {
                start: None,
                end: Some(end),
            },
            Some(DateField {
                field: "created_at",
                encoding: DateEncoding::IsoString,
            }),
        );
        let after = SourcePosition::String("abc".into());
        let query = filter_document(&filter, Some(&after));
        let clauses = query.get_array("$and").unwrap();
        assert_eq!(clauses.len(), 2);
        let cursor = clauses[0].as_document().unwrap();
        assert_eq!(
            cursor.get_array("$or").unwrap()[0],
            Bson::Document(doc! { "_id": { "$gt": "abc" } })
        );
        let range = clauses[1].as_document().unwrap();
        assert_eq!(
            range.get_array("$or").unwrap()[0],
            Bson::Document(doc! { "created_at": { "$lte": "2024-02-01T12:00:00.000Z" } })
        );
    }

    #[test]
    fn test_filter_ignores_range_without_field() {
        let filter = SourceFilter::new(
            DateRange {
                start: Some(Utc::now()),
                end: None,
            },
            None,
        );
        assert_eq!(filter_document(&filter, None), doc! {});
    }

    #[test]
    fn test_source_index_conversion() {
        let model = IndexModel::builder()
            .keys(doc! { "type": 1, "date": -1 })
            .options(
                IndexOptions::builder()
                    .name("type_1_date_-1".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        let index = source_index(&model, Some(12));
        assert_eq!(index.name, "type_1_date_-1");
        assert_eq!(
            index.keys,
            vec![
                ("type".to_string(), IndexKeyKind::Ascending),
                ("date".to_string(), IndexKeyKind::Descending),
            ]
        );
        assert!(index.unique);
        assert!(!index.sparse);
        assert_eq!(index.usage_ops, Some(12));
    }

    #[test]
    fn test_source_index_text_and_wildcard() {
        let text = IndexModel::builder().keys(doc! { "notes": "text" }).build();
        let index = source_index(&text, None);
        assert_eq!(index.keys[0].1, IndexKeyKind::Text);
        assert_eq!(index.name, "notes_1");

        let wildcard = IndexModel::builder().keys(doc! { "$**": 1 }).build();
        assert_eq!(source_index(&wildcard, None).keys[0].1, IndexKeyKind::Wildcard);
    }
}
