//! HTTP client for the hosted pinning API.
//!
//! Endpoints (bearer-token authenticated):
//! - `POST pin-file`: multipart upload with a JSON `metadata` part
//! - `POST pin-json`: JSON document with metadata
//! - `GET {contentId}`: fetch content
//! - `DELETE unpin/{contentId}`
//! - `GET pins?metadata=...`: list pinned entries
//! - `GET test-auth`

use super::{Archive, ArchiveError, PinFilter, PinMetadata, PinnedEntry, PutResult};
use crate::config::ArchiveConfig;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub struct HttpArchive {
    client: Client,
    base_url: String,
    token: String,
    upload_timeout: Duration,
    download_timeout: Duration,
}

#[derive(Deserialize)]
struct PinResponse {
    #[serde(alias = "IpfsHash", alias = "cid")]
    #[serde(rename = "contentId")]
    content_id: String,
    #[serde(alias = "PinSize", default)]
    size: u64,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    rows: Vec<ListRow>,
}

#[derive(Deserialize)]
struct ListRow {
    #[serde(alias = "ipfs_pin_hash")]
    #[serde(rename = "contentId")]
    content_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(alias = "date_pinned")]
    #[serde(rename = "pinnedAt")]
    pinned_at: DateTime<Utc>,
    #[serde(alias = "keyvalues", default)]
    metadata: Option<PinMetadata>,
}

impl HttpArchive {
    pub fn new(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, ArchiveError> {
        let resp = self.authed(builder).send().await.map_err(|e| {
            if e.is_timeout() {
                ArchiveError::Timeout(what.to_string())
            } else {
                ArchiveError::Transport(e)
            }
        })?;
        check_status(resp).await
    }

    async fn pin_response(resp: Response) -> Result<PutResult, ArchiveError> {
        let body: PinResponse = resp.json().await.map_err(|e| ArchiveError::Upload(e.to_string()))?;
        Ok(PutResult {
            content_id: body.content_id,
            size_bytes: body.size,
        })
    }
}

async fn check_status(resp: Response) -> Result<Response, ArchiveError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ArchiveError::Auth);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ArchiveError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Archive for HttpArchive {
    async fn put(&self, bytes: Bytes, name: &str, metadata: PinMetadata) -> Result<PutResult, ArchiveError> {
        let size = bytes.len() as u64;
        let part = Part::bytes(bytes.to_vec())
            .file_name(name.to_string())
            .mime_str("application/octet-stream")?;
        let sidecar = json!({ "name": name, "keyvalues": metadata });
        let form = Form::new()
            .part("file", part)
            .text("metadata", sidecar.to_string());

        let builder = self
            .client
            .post(self.url("pin-file"))
            .multipart(form)
            .timeout(self.upload_timeout);
        let resp = self.send(builder, "pin-file").await.map_err(upload_error)?;
        let mut result = Self::pin_response(resp).await?;
        if result.size_bytes == 0 {
            result.size_bytes = size;
        }
        tracing::debug!(content_id = %result.content_id, size, name, "Pinned file");
        Ok(result)
    }

    async fn put_json(
        &self,
        value: &serde_json::Value,
        name: &str,
        metadata: PinMetadata,
    ) -> Result<PutResult, ArchiveError> {
        let body = json!({
            "content": value,
            "metadata": { "name": name, "keyvalues": metadata },
        });
        let builder = self
            .client
            .post(self.url("pin-json"))
            .json(&body)
            .timeout(self.upload_timeout);
        let resp = self.send(builder, "pin-json").await.map_err(upload_error)?;
        let mut result = Self::pin_response(resp).await?;
        if result.size_bytes == 0 {
            result.size_bytes = serde_json::to_vec(value)?.len() as u64;
        }
        Ok(result)
    }

    async fn get(&self, content_id: &str) -> Result<Bytes, ArchiveError> {
        let builder = self.client.get(self.url(content_id)).timeout(self.download_timeout);
        let resp = match self.send(builder, "get").await {
            Err(ArchiveError::Http { status: 404, .. }) => {
                return Err(ArchiveError::NotFound(content_id.to_string()));
            }
            other => other?,
        };
        resp.bytes().await.map_err(|e| ArchiveError::Download(e.to_string()))
    }

    async fn unpin(&self, content_id: &str) -> Result<bool, ArchiveError> {
        let builder = self
            .client
            .delete(self.url(&format!("unpin/{}", content_id)))
            .timeout(self.download_timeout);
        match self.send(builder, "unpin").await {
            Ok(_) => Ok(true),
            Err(ArchiveError::Http { status: 404, .. }) => Ok(false),
            Err(e) => Err(ArchiveError::Unpin(e.to_string())),
        }
    }

    async fn list(&self, filter: &PinFilter) -> Result<Vec<PinnedEntry>, ArchiveError> {
        let metadata = serde_json::to_string(&filter.metadata)?;
        let builder = self
            .client
            .get(self.url("pins"))
            .query(&[("metadata", metadata.as_str()), ("status", "pinned")])
            .timeout(self.download_timeout);
        let resp = self.send(builder, "pins").await?;
        let body: ListResponse = resp.json().await.map_err(|e| ArchiveError::Download(e.to_string()))?;

        Ok(body
            .rows
            .into_iter()
            .map(|row| PinnedEntry {
                content_id: row.content_id,
                name: row.name.unwrap_or_default(),
                size_bytes: row.size,
                pinned_at: row.pinned_at,
                metadata: row.metadata.unwrap_or_default(),
            })
            // Server-side filtering is advisory; enforce it here too.
            .filter(|e| filter.matches(&e.metadata))
            .collect())
    }

    async fn test_connection(&self) -> bool {
        let builder = self.client.get(self.url("test-auth")).timeout(Duration::from_secs(10));
        match self.send(builder, "test-auth").await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Archive connection test failed");
                false
            }
        }
    }
}

fn upload_error(e: ArchiveError) -> ArchiveError {
    match e {
        ArchiveError::Timeout(_) | ArchiveError::Auth | ArchiveError::Upload(_) => e,
        other => ArchiveError::Upload(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_response_accepts_hosted_field_names() {
        let hosted: PinResponse = serde_json::from_str(r#"{"IpfsHash":"bafy123","PinSize":42}"#).unwrap();
        assert_eq!(hosted.content_id, "bafy123");
        assert_eq!(hosted.size, 42);

        let native: PinResponse = serde_json::from_str(r#"{"contentId":"abc"}"#).unwrap();
        assert_eq!(native.content_id, "abc");
        assert_eq!(native.size, 0);
    }

    #[test]
    fn test_list_row_parsing() {
        let body = r#"{"rows":[{"ipfs_pin_hash":"bafy1","size":10,"date_pinned":"2024-01-01T00:00:00Z","keyvalues":{"role":"manifest"}}]}"#;
        let parsed: ListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].content_id, "bafy1");
        assert_eq!(parsed.rows[0].metadata.as_ref().unwrap()["role"], "manifest");
    }

    #[test]
    fn test_url_joining() {
        let archive = HttpArchive::new(&ArchiveConfig {
            base_url: "https://archive.example.com/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(archive.url("pin-file"), "https://archive.example.com/v1/pin-file");
    }

    #[tokio::test]
    async fn test_unreachable_archive_fails_connection_test() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let archive = HttpArchive::new(&ArchiveConfig {
            base_url: format!("http://127.0.0.1:{}", port),
            ..Default::default()
        })
        .unwrap();
        assert!(!archive.test_connection().await);
    }
}
