//! On-disk upload store.
//!
//! Uploaded files are written under a single directory with generated names
//! of the form `{unix-millis}-{9 base36 chars}{.ext}`. Files are opened with
//! `create_new`, so two concurrent uploads can never clobber each other even
//! if their generated names collide; the loser simply draws a new name.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::multipart::UploadedFile;
use crate::static_files;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 9;
const MAX_EXTENSION_LEN: usize = 16;
const MAX_NAME_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("could not allocate a unique file name")]
    NameExhausted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidName(_) => AppError::bad_request("Invalid file name"),
            StorageError::NotFound(_) => AppError::not_found("File not found"),
            StorageError::NameExhausted => AppError::internal("upload names exhausted"),
            StorageError::Io(io) => AppError::Io(io),
        }
    }
}

/// Metadata describing a stored upload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    /// Generated on-disk name, also used as the file's identifier.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

impl StoredFile {
    fn new(id: String, original_name: Option<String>, mime_type: String, size: u64) -> Self {
        let url = format!("/api/uploads/{id}/file");
        Self {
            id,
            original_name,
            mime_type,
            size,
            url,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeleteFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BulkSummary {
    pub total: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Per-item outcome of [`UploadStore::delete_many`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BulkDeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
    pub summary: BulkSummary,
}

/// Generates a collision-resistant name for an upload, keeping a sanitized
/// extension from `original`.
///
/// ```
/// let name = handwire::storage::generate_name("Holiday Photo.JPG");
/// assert!(name.ends_with(".jpg"));
/// ```
pub fn generate_name(original: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix: String = std::iter::repeat_with(|| BASE36[fastrand::usize(..BASE36.len())] as char)
        .take(SUFFIX_LEN)
        .collect();

    let ext = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| {
            !e.is_empty()
                && e.len() <= MAX_EXTENSION_LEN
                && e.bytes().all(|b| b.is_ascii_alphanumeric())
        })
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();

    format!("{millis}-{suffix}{ext}")
}

/// Rejects anything that is not a single plain file name.
fn validate_name(id: &str) -> Result<(), StorageError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::InvalidName(id.to_owned()));
    }
    Ok(())
}

/// A flat directory of uploaded files.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the upload directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Writes `file` under a freshly generated name.
    pub async fn save(&self, file: &UploadedFile) -> Result<StoredFile, StorageError> {
        self.ensure_root().await?;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let id = generate_name(&file.filename);
            let path = self.root.join(&id);
            let mut out = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(out) => out,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(%id, "generated upload name taken, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            out.write_all(&file.data).await?;
            out.flush().await?;
            info!(%id, original = %file.filename, size = file.size, "stored upload");
            return Ok(StoredFile::new(
                id,
                Some(file.filename.clone()),
                file.mime_type.clone(),
                file.size as u64,
            ));
        }

        Err(StorageError::NameExhausted)
    }

    /// Lists stored files sorted by name, which is also upload order.
    pub async fn list(&self) -> Result<Vec<StoredFile>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            let mime = static_files::content_type(Path::new(&id)).to_owned();
            files.push(StoredFile::new(id, None, mime, meta.len()));
        }
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    /// Deletes one stored file by its generated name.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        validate_name(id)?;
        match tokio::fs::remove_file(self.root.join(id)).await {
            Ok(()) => {
                info!(%id, "deleted upload");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every id independently; failures are collected, never fatal.
    pub async fn delete_many(&self, ids: &[String]) -> BulkDeleteReport {
        let mut deleted = Vec::new();
        let mut failed = Vec::new();

        for id in ids {
            match self.delete(id).await {
                Ok(()) => deleted.push(id.clone()),
                Err(err) => {
                    warn!(%id, error = %err, "bulk delete item failed");
                    let reason = match err {
                        StorageError::Io(_) => "Could not delete file".to_owned(),
                        other => other.to_string(),
                    };
                    failed.push(DeleteFailure {
                        id: id.clone(),
                        reason,
                    });
                }
            }
        }

        let summary = BulkSummary {
            total: ids.len(),
            deleted: deleted.len(),
            failed: failed.len(),
        };
        BulkDeleteReport {
            deleted,
            failed,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashSet;

    fn upload(name: &str, data: &'static [u8]) -> UploadedFile {
        UploadedFile {
            filename: name.to_owned(),
            mime_type: "application/octet-stream".to_owned(),
            size: data.len(),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn generated_names_have_expected_shape() {
        let name = generate_name("report.final.PDF");
        let (stem, ext) = name.split_once('.').unwrap();
        assert_eq!(ext, "pdf");
        let (millis, suffix) = stem.split_once('-').unwrap();
        assert!(millis.parse::<u128>().is_ok());
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
    }

    #[test]
    fn suspicious_extensions_are_dropped() {
        assert!(!generate_name("x.p/hp").contains('/'));
        assert!(!generate_name("noext").contains('.'));
        assert!(!generate_name("weird.ext with space").contains(' '));
    }

    #[tokio::test]
    async fn concurrent_saves_of_same_name_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());

        let saves = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.save(&upload("same.txt", b"payload")).await })
        });
        let mut ids = HashSet::new();
        for save in saves {
            ids.insert(save.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(store.list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn save_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("nested"));

        let stored = store.save(&upload("logo.png", b"png!")).await.unwrap();
        assert_eq!(stored.url, format!("/api/uploads/{}/file", stored.id));
        assert_eq!(stored.original_name.as_deref(), Some("logo.png"));

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].mime_type, "image/png");
        assert_eq!(listed[0].size, 4);

        store.delete(&stored.id).await.unwrap();
        assert!(matches!(
            store.delete(&stored.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        for id in ["../etc/passwd", "a/b", "..", ""] {
            assert!(matches!(
                store.delete(id).await,
                Err(StorageError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn bulk_delete_collects_partial_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path());
        let a = store.save(&upload("a.txt", b"a")).await.unwrap();
        let b = store.save(&upload("b.txt", b"b")).await.unwrap();

        let ids = vec![a.id.clone(), "missing.txt".to_owned(), b.id.clone(), "../x".to_owned()];
        let report = store.delete_many(&ids).await;

        assert_eq!(report.deleted, vec![a.id, b.id]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].id, "missing.txt");
        assert_eq!(
            report.summary,
            BulkSummary {
                total: 4,
                deleted: 2,
                failed: 2
            }
        );
    }
}
