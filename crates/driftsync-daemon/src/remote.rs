//! Remote document-store side adapter over its HTTP JSON API.
//!
//! A thin client: one method per endpoint, status codes mapped onto
//! `SideError::Remote` so the engine's error classification can tell quota,
//! permission and billing problems apart from plain connectivity loss.

use async_trait::async_trait;
use driftsync_core::metadata::{DocType, Metadata, RemoteRef, SideName};
use driftsync_core::side::{ContentStream, Result, Side, SideError, StreamSource};
use driftsync_core::sync::{CorruptionSource, FileCorruption};
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Identity the store reports back for a created or updated document.
#[derive(Debug, Clone, Deserialize)]
struct StoredDoc {
    id: String,
    rev: u64,
}

/// One entry of the remote change feed.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteChange {
    pub seq: String,
    pub doc: RemoteChangeDoc,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteChangeDoc {
    pub id: String,
    pub rev: u64,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub executable: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ChangesPage {
    last_seq: String,
    results: Vec<RemoteChange>,
}

#[derive(Debug, Clone, Deserialize)]
struct CorruptionReport {
    id: String,
    rev: u64,
    path: String,
    checksum: String,
}

pub struct RemoteSide {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    source: OnceLock<Arc<dyn Side>>,
}

impl RemoteSide {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        RemoteSide {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            source: OnceLock::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|err| SideError::Io(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        let details = serde_json::from_str(&message).ok();
        Err(SideError::Remote {
            status: status.as_u16(),
            message,
            details,
        })
    }

    async fn send_for_doc(&self, builder: reqwest::RequestBuilder) -> Result<StoredDoc> {
        let response = self.send(builder).await?;
        response
            .json::<StoredDoc>()
            .await
            .map_err(|err| SideError::Io(err.to_string()))
    }

    fn remote_ref<'a>(&self, doc: &'a Metadata) -> Result<&'a RemoteRef> {
        doc.remote
            .as_ref()
            .ok_or_else(|| SideError::NotFound(format!("{} has no remote identity", doc.path)))
    }

    async fn upload(&self, doc: &mut Metadata) -> Result<()> {
        let source = self
            .source
            .get()
            .ok_or_else(|| SideError::Io("no counterpart side wired".into()))?;
        let stream = source.create_read_stream(doc).await?;
        let bytes = stream.into_bytes().await?;

        let stored = match &doc.remote {
            Some(remote) => {
                let builder = self
                    .client
                    .put(self.url(&format!("/files/{}", remote.id)))
                    .query(&[("checksum", doc.checksum.as_deref().unwrap_or(""))])
                    .body(bytes);
                self.send_for_doc(builder).await?
            }
            None => {
                let builder = self
                    .client
                    .post(self.url("/files"))
                    .query(&[
                        ("path", doc.path.as_str()),
                        ("checksum", doc.checksum.as_deref().unwrap_or("")),
                    ])
                    .query(&[("executable", doc.executable)])
                    .body(bytes);
                self.send_for_doc(builder).await?
            }
        };
        doc.remote = Some(RemoteRef {
            id: stored.id,
            rev: stored.rev,
        });
        Ok(())
    }

    async fn patch(&self, doc: &mut Metadata) -> Result<()> {
        let remote = self.remote_ref(doc)?;
        let endpoint = match doc.doc_type {
            DocType::File => format!("/files/{}", remote.id),
            DocType::Folder => format!("/folders/{}", remote.id),
        };
        let builder = self.client.patch(self.url(&endpoint)).json(&serde_json::json!({
            "path": doc.path,
            "executable": doc.executable,
            "updated_at": doc.updated_at,
        }));
        let stored = self.send_for_doc(builder).await?;
        doc.remote = Some(RemoteRef {
            id: stored.id,
            rev: stored.rev,
        });
        Ok(())
    }

    /// Fetch a page of the remote change feed, starting after `since`.
    pub async fn changes(&self, since: Option<&str>) -> Result<(String, Vec<RemoteChange>)> {
        let mut builder = self.client.get(self.url("/changes"));
        if let Some(since) = since {
            builder = builder.query(&[("since", since)]);
        }
        let page: ChangesPage = self
            .send(builder)
            .await?
            .json()
            .await
            .map_err(|err| SideError::Io(err.to_string()))?;
        Ok((page.last_seq, page.results))
    }
}

#[async_trait]
impl StreamSource for RemoteSide {
    async fn create_read_stream(&self, doc: &Metadata) -> Result<ContentStream> {
        let remote = self.remote_ref(doc)?;
        let builder = self.client.get(self.url(&format!("/files/{}/content", remote.id)));
        let response = self.send(builder).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SideError::Io(err.to_string()))?;
        Ok(ContentStream::from_bytes(bytes.to_vec()))
    }
}

#[async_trait]
impl Side for RemoteSide {
    fn name(&self) -> SideName {
        SideName::Remote
    }

    fn connect_source(&self, other: Arc<dyn Side>) {
        let _ = self.source.set(other);
    }

    async fn add_file(&self, doc: &mut Metadata) -> Result<()> {
        info!(path = %doc.path, "uploading file");
        self.upload(doc).await
    }

    async fn add_folder(&self, doc: &mut Metadata) -> Result<()> {
        info!(path = %doc.path, "creating folder");
        let builder = self
            .client
            .post(self.url("/folders"))
            .json(&serde_json::json!({ "path": doc.path }));
        let stored = self.send_for_doc(builder).await?;
        doc.remote = Some(RemoteRef {
            id: stored.id,
            rev: stored.rev,
        });
        Ok(())
    }

    async fn overwrite_file(&self, doc: &mut Metadata, _old: Option<&Metadata>) -> Result<()> {
        info!(path = %doc.path, "overwriting file");
        self.upload(doc).await
    }

    async fn update_file_metadata(&self, doc: &mut Metadata, _old: &Metadata) -> Result<()> {
        info!(path = %doc.path, "updating file metadata");
        self.patch(doc).await
    }

    async fn update_folder(&self, doc: &mut Metadata, _old: &Metadata) -> Result<()> {
        if doc.remote.is_none() {
            return self.add_folder(doc).await;
        }
        self.patch(doc).await
    }

    async fn move_file(&self, doc: &mut Metadata, old: &Metadata) -> Result<()> {
        info!(path = %doc.path, oldpath = %old.path, "moving file");
        if doc.remote.is_none() {
            doc.remote = old.remote.clone();
        }
        self.patch(doc).await
    }

    async fn move_folder(&self, doc: &mut Metadata, old: &Metadata) -> Result<()> {
        info!(path = %doc.path, oldpath = %old.path, "moving folder");
        if doc.remote.is_none() {
            doc.remote = old.remote.clone();
        }
        self.patch(doc).await
    }

    async fn assign_new_rev(&self, doc: &mut Metadata) -> Result<()> {
        let remote = self.remote_ref(doc)?;
        let endpoint = match doc.doc_type {
            DocType::File => format!("/files/{}", remote.id),
            DocType::Folder => format!("/folders/{}", remote.id),
        };
        let stored = self.send_for_doc(self.client.get(self.url(&endpoint))).await?;
        doc.remote = Some(RemoteRef {
            id: stored.id,
            rev: stored.rev,
        });
        Ok(())
    }

    async fn trash(&self, doc: &Metadata) -> Result<()> {
        let Some(remote) = doc.remote.as_ref() else {
            warn!(path = %doc.path, "nothing to trash remotely");
            return Ok(());
        };
        info!(path = %doc.path, "trashing remotely");
        self.send(self.client.post(self.url(&format!("/trash/{}", remote.id))))
            .await?;
        Ok(())
    }

    async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
        let remote = self.remote_ref(doc)?;
        info!(path = %doc.path, "deleting remote folder");
        self.send(
            self.client
                .delete(self.url(&format!("/folders/{}", remote.id))),
        )
        .await?;
        Ok(())
    }

    async fn rename_conflicting_doc(&self, doc: &Metadata, new_path: &str) -> Result<()> {
        info!(path = %doc.path, new_path, "renaming to resolve a conflict");
        let mut renamed = doc.clone();
        renamed.path = new_path.to_string();
        self.patch(&mut renamed).await
    }

    async fn probe(&self) -> Result<()> {
        self.send(self.client.get(self.url("/status"))).await?;
        Ok(())
    }
}

#[async_trait]
impl CorruptionSource for RemoteSide {
    async fn fetch_file_corruptions(&self) -> Result<Vec<FileCorruption>> {
        let reports: Vec<CorruptionReport> = self
            .send(self.client.get(self.url("/corruptions")))
            .await?
            .json()
            .await
            .map_err(|err| SideError::Io(err.to_string()))?;
        Ok(reports
            .into_iter()
            .map(|report| FileCorruption {
                remote_id: report.id,
                rev: report.rev,
                path: report.path,
                checksum: report.checksum,
            })
            .collect())
    }
}
