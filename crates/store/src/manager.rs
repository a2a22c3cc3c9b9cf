//! Process-wide registry of open store sessions.
//!
//! A store file may be bound to at most one session. The manager owns the
//! registry explicitly; callers hold it wherever they need it.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::info;

use crate::{
    config::StoreConfig,
    error::{Error, Result},
    session::Session,
};

/// Registry mapping canonical store paths to their sessions.
#[derive(Debug, Default)]
pub struct StoreManager {
    sessions: Mutex<HashMap<PathBuf, Session>>,
}

impl StoreManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or creates) the store at `path` and registers its session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionAlreadyOpen`] if a session for the same file is
    /// registered, or any error from [`Session::open_path`].
    pub fn open(&self, path: impl AsRef<Path>, config: StoreConfig) -> Result<Session> {
        let path = canonical_path(path.as_ref())?;
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&path) {
            return Err(Error::SessionAlreadyOpen { path: path.display().to_string() });
        }
        let session = Session::open_path(&path, config)?;
        sessions.insert(path.clone(), session.clone());
        info!(path = %path.display(), open_sessions = sessions.len(), "Registered session");
        Ok(session)
    }

    /// The registered session for `path`, if any.
    pub fn session(&self, path: impl AsRef<Path>) -> Option<Session> {
        let path = canonical_path(path.as_ref()).ok()?;
        self.sessions.lock().get(&path).cloned()
    }

    /// Closes and deregisters the session for `path`.
    ///
    /// Returns `false` if no session was registered.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if closing the session fails; it is deregistered anyway.
    pub fn close_session(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = canonical_path(path.as_ref())?;
        let Some(session) = self.sessions.lock().remove(&path) else {
            return Ok(false);
        };
        info!(path = %path.display(), "Deregistered session");
        session.close()?;
        Ok(true)
    }

    /// Paths of all registered sessions.
    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Closes and deregisters every session.
    ///
    /// # Errors
    ///
    /// Returns the first close error; all sessions are deregistered regardless.
    pub fn close_all(&self) -> Result<()> {
        let sessions: Vec<Session> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        let mut first_error = None;
        for session in sessions {
            if let Err(e) = session.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Canonicalizes `path`, resolving the parent directory when the file does not exist yet.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.canonicalize()?);
    }
    let name = path.file_name().ok_or_else(|| Error::Io {
        source: io::Error::new(io::ErrorKind::InvalidInput, "store path has no file name"),
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(parent.canonicalize()?.join(name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use revtree_test_utils::TestDir;

    use super::*;

    #[test]
    fn test_one_session_per_path() {
        let dir = TestDir::new();
        let manager = StoreManager::new();
        let path = dir.join("store.rt");

        manager.open(&path, StoreConfig::default()).unwrap();
        let err = manager.open(&path, StoreConfig::default()).unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyOpen { .. }));

        // A different spelling of the same file is still the same store.
        let aliased = dir.path().join(".").join("store.rt");
        assert!(manager.open(aliased, StoreConfig::default()).is_err());
        assert_eq!(manager.open_paths().len(), 1);
    }

    #[test]
    fn test_close_session_allows_reopen() {
        let dir = TestDir::new();
        let manager = StoreManager::new();
        let path = dir.join("store.rt");

        let session = manager.open(&path, StoreConfig::default()).unwrap();
        assert!(manager.session(&path).is_some());
        assert!(manager.close_session(&path).unwrap());
        assert!(session.is_closed());
        assert!(!manager.close_session(&path).unwrap());

        let reopened = manager.open(&path, StoreConfig::default()).unwrap();
        assert_eq!(reopened.latest_revision(), 0);
    }

    #[test]
    fn test_close_all() {
        let dir = TestDir::new();
        let manager = StoreManager::new();
        let first = manager.open(dir.join("a.rt"), StoreConfig::default()).unwrap();
        let second = manager.open(dir.join("b.rt"), StoreConfig::default()).unwrap();

        manager.close_all().unwrap();
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert!(manager.open_paths().is_empty());
    }
}
