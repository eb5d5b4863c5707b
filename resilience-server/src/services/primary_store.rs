//! SQLite-backed primary store: the health probe target and backup source.

use crate::db::connection::DbPool;
use crate::models::document::{self, Document};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resilience_core::backup::{BackupSource, Snapshot};
use resilience_core::clock::Clock;
use resilience_core::health::{ConnectionState, PrimaryProbe};
use resilience_core::CoreError;
use serde_json::Value;
use std::sync::Arc;

pub struct SqlitePrimaryStore {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    id_field: String,
}

impl SqlitePrimaryStore {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, id_field: impl Into<String>) -> Self {
        Self {
            pool,
            clock,
            id_field: id_field.into(),
        }
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn)
        })
        .await?
    }

    /// Insert or replace a document keyed by its public id. Returns the id.
    pub async fn upsert(&self, collection: &str, body: Value) -> anyhow::Result<String> {
        let public_id = match body.get(&self.id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => anyhow::bail!("document is missing '{}'", self.id_field),
        };
        let now = self.clock.now();
        let collection = collection.to_string();
        let id = public_id.clone();
        self.blocking(move |conn| document::upsert(conn, &collection, &id, &body, now))
            .await?;
        Ok(public_id)
    }

    pub async fn get(&self, collection: &str, public_id: &str) -> anyhow::Result<Option<Value>> {
        let collection = collection.to_string();
        let public_id = public_id.to_string();
        let doc = self
            .blocking(move |conn| document::find_one(conn, &collection, &public_id))
            .await?;
        Ok(doc.map(|d| d.body))
    }

    pub async fn list(&self, collection: &str) -> anyhow::Result<Vec<Value>> {
        let collection = collection.to_string();
        let docs = self
            .blocking(move |conn| document::find_by_collection(conn, &collection))
            .await?;
        Ok(docs.into_iter().map(|d| d.body).collect())
    }
}

fn group(docs: Vec<Document>) -> Snapshot {
    let mut snapshot = Snapshot::default();
    for doc in docs {
        snapshot.collections.entry(doc.collection).or_default().push(doc.body);
    }
    snapshot
}

#[async_trait]
impl PrimaryProbe for SqlitePrimaryStore {
    async fn connection_state(&self) -> Result<ConnectionState, CoreError> {
        let outcome = self
            .blocking(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await;
        match outcome {
            Ok(()) => Ok(ConnectionState::Connected),
            Err(e) => {
                tracing::debug!(error = %e, "Primary store probe failed");
                Ok(ConnectionState::Disconnected)
            }
        }
    }
}

#[async_trait]
impl BackupSource for SqlitePrimaryStore {
    async fn full_snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(group(self.blocking(document::find_all).await?))
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> anyhow::Result<Snapshot> {
        Ok(group(
            self.blocking(move |conn| document::find_updated_since(conn, since))
                .await?,
        ))
    }
}
