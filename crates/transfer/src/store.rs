use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{TransferError, UploadSession};

/// Schema version written into every session record.
pub const SESSION_VERSION: u32 = 1;

const SESSION_SUFFIX: &str = ".session.json";

#[derive(Serialize)]
struct RecordRef<'a> {
    version: u32,
    #[serde(flatten)]
    session: &'a UploadSession,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Durable location of one upload session record.
///
/// Records are written to a temporary sibling and renamed into place, so a
/// reader sees either the previous record or the new one, never a partial
/// write.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store next to `source`, named `<source>.session.json`.
    pub fn for_source(source: &Path) -> Self {
        let mut name = source.as_os_str().to_owned();
        name.push(SESSION_SUFFIX);
        Self::new(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Atomically replaces the record with `session`.
    pub fn save(&self, session: &UploadSession) -> Result<(), TransferError> {
        let record = RecordRef {
            version: SESSION_VERSION,
            session,
        };
        let json = serde_json::to_vec_pretty(&record)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            uploaded = session.uploaded_count(),
            parts = session.part_count,
            "session saved"
        );
        Ok(())
    }

    /// Loads the record, `None` if no record exists.
    pub fn load(&self) -> Result<Option<UploadSession>, TransferError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let probe: VersionProbe = serde_json::from_slice(&bytes)?;
        if probe.version != SESSION_VERSION {
            return Err(TransferError::UnsupportedSessionVersion {
                found: probe.version,
                expected: SESSION_VERSION,
            });
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Deletes the record. Missing records are not an error.
    pub fn remove(&self) -> Result<(), TransferError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MIB, SourceIdentity};
    use tempfile::TempDir;

    fn planned_session(dir: &Path) -> UploadSession {
        let path = dir.join("archive.tar");
        std::fs::write(&path, vec![7u8; 2 * MIB as usize + 5]).unwrap();
        let source = SourceIdentity::of(&path).unwrap();
        let mut session = UploadSession::new("vault", source, MIB, None).unwrap();
        session.plan(|_| Ok(())).unwrap();
        session
    }

    #[test]
    fn store_path_for_source() {
        let store = SessionStore::for_source(Path::new("/data/archive.tar"));
        assert_eq!(store.path(), Path::new("/data/archive.tar.session.json"));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut session = planned_session(dir.path());
        session.upload_id = Some("up-1".into());
        session.mark_uploaded(0).unwrap();

        let store = SessionStore::for_source(&session.source.path);
        assert!(!store.exists());
        store.save(&session).unwrap();
        assert!(store.exists());
        assert!(!store.tmp_path().exists());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn record_carries_version() {
        let dir = TempDir::new().unwrap();
        let session = planned_session(dir.path());
        let store = SessionStore::new(dir.path().join("s.json"));
        store.save(&session).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(value["version"], SESSION_VERSION);
        assert_eq!(value["vault"], "vault");
        assert_eq!(value["parts"].as_array().unwrap().len(), 3);
        assert!(value.get("upload_id").is_none());
    }

    #[test]
    fn missing_record_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_none());
        store.remove().unwrap();
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("s.json"));
        std::fs::write(store.path(), r#"{"version": 99, "vault": "v"}"#).unwrap();
        assert!(matches!(
            store.load(),
            Err(TransferError::UnsupportedSessionVersion {
                found: 99,
                expected: SESSION_VERSION
            })
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let dir = TempDir::new().unwrap();
        let session = planned_session(dir.path());
        let store = SessionStore::new(dir.path().join("s.json"));
        store.save(&session).unwrap();

        let bytes = std::fs::read(store.path()).unwrap();
        std::fs::write(store.path(), &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(store.load(), Err(TransferError::Json(_))));
    }

    #[test]
    fn remove_deletes_record() {
        let dir = TempDir::new().unwrap();
        let session = planned_session(dir.path());
        let store = SessionStore::new(dir.path().join("s.json"));
        store.save(&session).unwrap();
        store.remove().unwrap();
        assert!(!store.exists());
    }
}
