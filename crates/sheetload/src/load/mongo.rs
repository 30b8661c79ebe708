//! MongoDB document sink

use super::{DocumentSink, FailureCause, RecordOutcome, SinkError, SinkErrorKind, Upsert};
use crate::config::MongoConfig;
use async_trait::async_trait;
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use sheetload_common::{FieldValue, Schema, TypedRecord};
use tracing::debug;

/// Duplicate key
const DUPLICATE_KEY: i32 = 11000;

/// Document validation failure
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;

/// Build a client; the driver connects on first operation
pub async fn connect(config: &MongoConfig) -> Result<Client, SinkError> {
    let mut options = ClientOptions::parse(&config.uri).await.map_err(|e| classify(&e))?;
    options.app_name = Some("sheetload".to_string());
    Client::with_options(options).map_err(|e| classify(&e))
}

/// Convert a coerced value to BSON
pub fn to_bson(value: &FieldValue) -> Bson {
    match value {
        FieldValue::Null => Bson::Null,
        FieldValue::Integer(v) => Bson::Int64(*v),
        FieldValue::Decimal(v) => Bson::Double(*v),
        FieldValue::Boolean(v) => Bson::Boolean(*v),
        FieldValue::Text(v) => Bson::String(v.clone()),
    }
}

/// `$set` body for a record: every schema column plus bookkeeping
pub fn set_document(schema: &Schema, record: &TypedRecord) -> Document {
    let mut set = Document::new();
    for column in &schema.columns {
        set.insert(column.name.clone(), to_bson(record.field(&column.name)));
    }
    set.insert("id_synthesized", record.id_synthesized);
    set.insert("updated_at", DateTime::now());
    set
}

/// Upserts records one document at a time, keyed by `_id`
pub struct MongoDocumentSink {
    client: Client,
    collection: Collection<Document>,
    schema: Schema,
    concurrency: usize,
}

impl MongoDocumentSink {
    pub fn new(client: Client, database: &str, collection: &str, schema: Schema, concurrency: usize) -> Self {
        let collection = client.database(database).collection::<Document>(collection);
        Self {
            client,
            collection,
            schema,
            concurrency: concurrency.max(1),
        }
    }

    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }

    async fn upsert_one(&self, record: &TypedRecord) -> RecordOutcome {
        let filter = doc! { "_id": record.id.as_str() };
        let update = doc! {
            "$set": set_document(&self.schema, record),
            "$setOnInsert": { "inserted_at": DateTime::now() },
        };

        match self.collection.update_one(filter, update).upsert(true).await {
            Ok(result) if result.upserted_id.is_some() => RecordOutcome::ok(record.id.clone(), Upsert::Inserted),
            Ok(_) => RecordOutcome::ok(record.id.clone(), Upsert::Updated),
            Err(e) => {
                let error = classify(&e);
                debug!(id = %record.id, error = %error, "Document upsert failed");
                RecordOutcome::failed(record.id.clone(), error)
            }
        }
    }

    /// Round-trip to the server
    pub async fn ping(&self) -> Result<(), SinkError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| classify(&e))
    }

    pub async fn count(&self) -> Result<u64, SinkError> {
        self.collection
            .count_documents(doc! {})
            .await
            .map_err(|e| classify(&e))
    }

    /// First `limit` documents ordered by `_id`, none for a non-positive limit
    pub async fn preview(&self, limit: i64) -> Result<Vec<Document>, SinkError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let cursor = self
            .collection
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .limit(limit)
            .await
            .map_err(|e| classify(&e))?;
        cursor.try_collect().await.map_err(|e| classify(&e))
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<Document>, SinkError> {
        self.collection
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| classify(&e))
    }
}

#[async_trait]
impl DocumentSink for MongoDocumentSink {
    async fn upsert_many(&self, records: &[TypedRecord]) -> Vec<RecordOutcome> {
        let futures: Vec<_> = records.iter().map(|record| self.upsert_one(record).boxed()).collect();
        stream::iter(futures)
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

/// Classify a driver error
pub fn classify(err: &mongodb::error::Error) -> SinkError {
    let (kind, cause) = if err.contains_label(RETRYABLE_WRITE_ERROR)
        || err.contains_label(TRANSIENT_TRANSACTION_ERROR)
    {
        (SinkErrorKind::Transient, FailureCause::Connectivity)
    } else {
        match err.kind.as_ref() {
            ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
                (SinkErrorKind::Transient, FailureCause::Connectivity)
            }
            ErrorKind::Write(WriteFailure::WriteError(write)) => (SinkErrorKind::Permanent, write_error_cause(write.code)),
            ErrorKind::Write(_) | ErrorKind::Command(_) => (SinkErrorKind::Permanent, FailureCause::WriteRejected),
            ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
                (SinkErrorKind::Permanent, FailureCause::DataException)
            }
            _ => (SinkErrorKind::Permanent, FailureCause::Other),
        }
    };

    SinkError::new(kind, cause, err.to_string())
}

/// Cause for a server write error code
pub fn write_error_cause(code: i32) -> FailureCause {
    match code {
        DUPLICATE_KEY | DOCUMENT_VALIDATION_FAILURE => FailureCause::ConstraintViolation,
        _ => FailureCause::WriteRejected,
    }
}
