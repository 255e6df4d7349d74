//! Persistent storage for the shared configuration document
//!
//! The store holds two records: the configuration document itself and the
//! identity record of the data-plane process, which carries diagnostic
//! annotations written when a hash mismatch is observed.

use crate::document::{ConfigDocument, DocumentError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Errors raised by a [`ConfigStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Invalid identity record '{path}': {source}")]
    Identity {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Access to the persisted document and the data-plane identity record
///
/// Reads and writes of one record are assumed atomic; serialising
/// read-modify-write sequences is the caller's job.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch the document exactly as persisted
    async fn fetch_document(&self) -> Result<ConfigDocument, StoreError>;

    /// Replace the persisted document
    async fn persist_document(&self, document: &ConfigDocument) -> Result<(), StoreError>;

    /// Merge `annotations` into the identity record, overwriting existing keys
    async fn annotate_identity(
        &self,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityRecord {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// Store backed by two files on a shared volume
#[derive(Debug, Clone)]
pub struct FileStore {
    document_path: PathBuf,
    identity_path: PathBuf,
}

impl FileStore {
    pub fn new(document_path: impl Into<PathBuf>, identity_path: impl Into<PathBuf>) -> Self {
        Self {
            document_path: document_path.into(),
            identity_path: identity_path.into(),
        }
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    pub fn identity_path(&self) -> &Path {
        &self.identity_path
    }

    async fn read_identity(&self) -> Result<IdentityRecord, StoreError> {
        let display = self.identity_path.display().to_string();
        match tokio::fs::read_to_string(&self.identity_path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(IdentityRecord::default()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                StoreError::Identity {
                    path: display,
                    source,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IdentityRecord::default()),
            Err(source) => Err(StoreError::Read {
                path: display,
                source,
            }),
        }
    }
}

/// Write `contents` next to `path` and rename it into place
async fn replace_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let write_error = |source| StoreError::Write {
        path: path.display().to_string(),
        source,
    };

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, contents)
        .await
        .map_err(write_error)?;
    tokio::fs::rename(&staging, path).await.map_err(write_error)
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn fetch_document(&self) -> Result<ConfigDocument, StoreError> {
        let display = self.document_path.display().to_string();
        let contents = tokio::fs::read_to_string(&self.document_path)
            .await
            .map_err(|source| StoreError::Read {
                path: display.clone(),
                source,
            })?;

        Ok(ConfigDocument::from_json(&display, &contents)?)
    }

    async fn persist_document(&self, document: &ConfigDocument) -> Result<(), StoreError> {
        let contents = document.to_persisted_json()?;
        replace_file(&self.document_path, contents.as_bytes()).await?;

        tracing::debug!(path = %self.document_path.display(), "Configuration document persisted");
        Ok(())
    }

    async fn annotate_identity(
        &self,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut record = self.read_identity().await?;
        record.annotations.extend(annotations);

        let contents =
            serde_json::to_vec_pretty(&record).map_err(|source| StoreError::Identity {
                path: self.identity_path.display().to_string(),
                source,
            })?;
        replace_file(&self.identity_path, &contents).await
    }
}

/// Store held in process memory
///
/// The document is kept in its persisted text form so that reads go through the
/// same parse path as [`FileStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    document: Mutex<String>,
    annotations: Mutex<BTreeMap<String, String>>,
    writes: Mutex<usize>,
}

impl InMemoryStore {
    /// Seed the store with a document in persisted form
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(contents.into()),
            ..Self::default()
        }
    }

    /// Current persisted text of the document
    pub fn contents(&self) -> String {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.annotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of times the document has been persisted
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ConfigStore for InMemoryStore {
    async fn fetch_document(&self) -> Result<ConfigDocument, StoreError> {
        Ok(ConfigDocument::from_json("<memory>", &self.contents())?)
    }

    async fn persist_document(&self, document: &ConfigDocument) -> Result<(), StoreError> {
        let contents = document.to_persisted_json()?;
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = contents;
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    async fn annotate_identity(
        &self,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.annotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(annotations);
        Ok(())
    }
}
