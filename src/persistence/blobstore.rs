//! Keyed blob store for serialized manager/workspace state (§4.9, §6).
//!
//! Blobs are addressed by logical name (`wm_core`, `kws_<id>_core`,
//! `kws_<id>_app_*`) and encrypted at rest with the key derived from
//! `RuntimeConfig::encryption_passphrase`. A schema-version row guards
//! compatibility across on-disk format changes.

use std::fs;
use std::path::PathBuf;

use crate::error::CoreError;
use crate::persistence::crypto::{self, EncryptedData, BLOB_ENVELOPE_VERSION};

/// Current on-disk schema version. Bump when the blob or event-log format
/// changes incompatibly; `BlobStore::open` refuses to attach to a directory
/// stamped with a newer version than this binary understands.
pub const SCHEMA_VERSION: u32 = 1;

pub trait BlobStore: Send {
    fn put(&mut self, name: &str, data: &[u8]) -> Result<(), CoreError>;
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, CoreError>;
    fn delete(&mut self, name: &str) -> Result<(), CoreError>;
}

/// File-backed blob store: one encrypted file per logical name inside a
/// directory, plus a `schema_version` marker file.
pub struct FileBlobStore {
    root: PathBuf,
    key: [u8; 32],
}

impl FileBlobStore {
    pub fn open(root: impl Into<PathBuf>, passphrase: &str) -> Result<Self, CoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(CoreError::from)?;

        let version_path = root.join("schema_version");
        match fs::read_to_string(&version_path) {
            Ok(contents) => {
                let on_disk: u32 = contents.trim().parse().map_err(|_| {
                    CoreError::internal("corrupt schema_version marker")
                })?;
                if on_disk > SCHEMA_VERSION {
                    return Err(CoreError::internal(format!(
                        "data directory schema version {on_disk} is newer than this binary ({SCHEMA_VERSION})"
                    )));
                }
            }
            Err(_) => {
                fs::write(&version_path, SCHEMA_VERSION.to_string()).map_err(CoreError::from)?;
            }
        }

        Ok(Self { root, key: crypto::derive_key(passphrase) })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, CoreError> {
        if name.is_empty() || name.contains(['/', '\\', '\0']) {
            return Err(CoreError::internal(format!("invalid blob name {name:?}")));
        }
        Ok(self.root.join(format!("{name}.blob")))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&mut self, name: &str, data: &[u8]) -> Result<(), CoreError> {
        let path = self.path_for(name)?;
        let envelope = crypto::encrypt(&self.key, data, BLOB_ENVELOPE_VERSION)?;
        let json = serde_json::to_vec(&envelope)
            .map_err(|e| CoreError::internal(format!("failed to serialize blob envelope: {e}")))?;

        // Write-then-rename keeps a crash mid-write from leaving a
        // partially-written blob in place (§4.9 long-running transaction).
        let tmp_path = path.with_extension("blob.tmp");
        fs::write(&tmp_path, &json).map_err(CoreError::from)?;
        fs::rename(&tmp_path, &path).map_err(CoreError::from)?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read(&path).map_err(CoreError::from)?;
        let envelope: EncryptedData = serde_json::from_slice(&json)
            .map_err(|e| CoreError::Decode(format!("corrupt blob envelope: {e}")))?;
        Ok(Some(crypto::decrypt(&self.key, &envelope)?))
    }

    fn delete(&mut self, name: &str) -> Result<(), CoreError> {
        let path = self.path_for(name)?;
        if path.exists() {
            fs::remove_file(&path).map_err(CoreError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileBlobStore::open(dir.path(), "passphrase").unwrap();
        store.put("wm_core", b"serialized manager state").unwrap();
        assert_eq!(store.get("wm_core").unwrap().unwrap(), b"serialized manager state");
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path(), "passphrase").unwrap();
        assert!(store.get("kws_5_core").unwrap().is_none());
    }

    #[test]
    fn delete_removes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileBlobStore::open(dir.path(), "passphrase").unwrap();
        store.put("kws_1_core", b"state").unwrap();
        store.delete("kws_1_core").unwrap();
        assert!(store.get("kws_1_core").unwrap().is_none());
    }

    #[test]
    fn reopen_after_put_observes_committed_blob() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileBlobStore::open(dir.path(), "pw").unwrap();
            store.put("wm_core", b"v1").unwrap();
        }
        let reopened = FileBlobStore::open(dir.path(), "pw").unwrap();
        assert_eq!(reopened.get("wm_core").unwrap().unwrap(), b"v1");
    }

    #[test]
    fn rejects_path_traversal_in_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileBlobStore::open(dir.path(), "pw").unwrap();
        assert!(store.put("../escape", b"x").is_err());
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("schema_version"), (SCHEMA_VERSION + 1).to_string()).unwrap();
        assert!(FileBlobStore::open(dir.path(), "pw").is_err());
    }
}
