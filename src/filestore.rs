use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{QmsError, Result};

/// Content-addressed file storage boundary. `LocalFileStore` is the only
/// production implementation shipped; remote/object-store backends are a
/// deployment concern outside this crate.
pub trait FileStore: Send + Sync {
    /// Write `content` under `key`, returning its SHA-256 checksum.
    fn put(&self, key: &str, content: &[u8]) -> Result<String>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn exists(&self, key: &str) -> bool;
}

/// Writes under a configured root directory using the same
/// temp-file-then-rename durability discipline as the artifact pipeline's
/// PDF generation: content never appears at its final path until fully
/// written.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl FileStore for LocalFileStore {
    fn put(&self, key: &str, content: &[u8]) -> Result<String> {
        let final_path = self.resolve(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| QmsError::FileSystem {
                path: parent.display().to_string(),
                message: format!("failed to create directory: {e}"),
            })?;
        }

        let tmp_path = final_path.with_extension("tmp");
        fs::write(&tmp_path, content).map_err(|e| QmsError::FileSystem {
            path: tmp_path.display().to_string(),
            message: format!("failed to write temp file: {e}"),
        })?;
        fs::rename(&tmp_path, &final_path).map_err(|e| QmsError::FileSystem {
            path: final_path.display().to_string(),
            message: format!("failed to rename into place: {e}"),
        })?;

        let mut hasher = Sha256::new();
        hasher.update(content);
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key);
        fs::read(&path).map_err(|e| QmsError::FileSystem {
            path: path.display().to_string(),
            message: format!("failed to read file: {e}"),
        })
    }

    fn exists(&self, key: &str) -> bool {
        Path::new(&self.resolve(key)).exists()
    }
}

/// Build the content-addressed key for a document version's original
/// upload or its rendered, signed artifact.
pub fn artifact_key(document_id: uuid::Uuid, version: &str, signed: bool) -> String {
    if signed {
        format!("documents/{document_id}/{version}/signed.pdf")
    } else {
        format!("documents/{document_id}/{version}/original")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path());

        let checksum = store.put("documents/doc1/1.0/original", b"hello").unwrap();
        assert_eq!(checksum.len(), 64);
        assert!(store.exists("documents/doc1/1.0/original"));
        assert_eq!(store.get("documents/doc1/1.0/original").unwrap(), b"hello");
    }

    #[test]
    fn test_get_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(store.get("documents/missing").is_err());
    }

    #[test]
    fn test_artifact_key_shapes() {
        let id = uuid::Uuid::new_v4();
        assert!(artifact_key(id, "1.0", false).ends_with("/original"));
        assert!(artifact_key(id, "1.0", true).ends_with("/signed.pdf"));
    }
}
