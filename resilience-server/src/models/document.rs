use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

// ── Document ──

#[derive(Debug, Clone)]
pub struct Document {
    pub collection: String,
    pub public_id: String,
    pub body: Value,
    pub updated_at: String,
}

/// Fixed-width UTC timestamps so text comparison orders them correctly.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    let body: String = row.get("body")?;
    Ok(Document {
        collection: row.get("collection")?,
        public_id: row.get("public_id")?,
        // Unparseable bodies surface as strings rather than failing the whole read.
        body: serde_json::from_str(&body).unwrap_or(Value::String(body)),
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Document>> {
    let mut stmt = conn.prepare("SELECT * FROM documents ORDER BY collection, public_id")?;
    let rows = stmt.query_map([], row_to_document)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn find_updated_since(conn: &Connection, since: DateTime<Utc>) -> anyhow::Result<Vec<Document>> {
    let mut stmt =
        conn.prepare("SELECT * FROM documents WHERE updated_at > ?1 ORDER BY collection, public_id")?;
    let rows = stmt.query_map(params![timestamp(since)], row_to_document)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn find_by_collection(conn: &Connection, collection: &str) -> anyhow::Result<Vec<Document>> {
    let mut stmt = conn.prepare("SELECT * FROM documents WHERE collection = ?1 ORDER BY public_id")?;
    let rows = stmt.query_map(params![collection], row_to_document)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn find_one(conn: &Connection, collection: &str, public_id: &str) -> anyhow::Result<Option<Document>> {
    Ok(conn
        .query_row(
            "SELECT * FROM documents WHERE collection = ?1 AND public_id = ?2",
            params![collection, public_id],
            row_to_document,
        )
        .optional()?)
}

pub fn upsert(conn: &Connection, collection: &str, public_id: &str, body: &Value, now: DateTime<Utc>) -> anyhow::Result<()> {
    let now = timestamp(now);
    conn.execute(
        "INSERT INTO documents (collection, public_id, body, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(collection, public_id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        params![collection, public_id, serde_json::to_string(body)?, now],
    )?;
    Ok(())
}
