//! On-disk session credential.
//!
//! A single JSON record at a per-user path. Nothing is cached in memory:
//! every call re-reads the file so a login performed by another process is
//! picked up on the next invocation. Writes go to a sibling temp file that
//! is renamed over the record, so a concurrent reader never sees a torn file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Role allowed to select databases outside its own list.
pub const SUPER_ADMIN_ROLE: &str = "super_admin";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Not authenticated. Run quarri_request_code and quarri_verify_code to log in.")]
    NotAuthenticated,

    #[error("Database '{name}' not found. Available databases: [{}]", available.join(", "))]
    UnknownDatabase { name: String, available: Vec<String> },

    #[error("credential file error: {0}")]
    Io(#[from] io::Error),

    #[error("credential encoding error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    #[serde(alias = "name")]
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<String>,
}

impl DatabaseEntry {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self { database_name: database_name.into(), display_name: None, access_level: None }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn matches(&self, name_or_display: &str) -> bool {
        self.database_name == name_or_display
            || self.display_name.as_deref() == Some(name_or_display)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub token: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_database: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl StoredCredentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_super_admin(&self) -> bool {
        self.role.as_deref() == Some(SUPER_ADMIN_ROLE)
    }

    /// Explicit selection, else the first accessible database.
    pub fn effective_database(&self) -> Option<&str> {
        self.selected_database
            .as_deref()
            .or_else(|| self.databases.first().map(|d| d.database_name.as_str()))
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.iter().map(|d| d.database_name.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The record as stored, expired or not. Missing or corrupt files are `None`.
    pub fn load_unchecked(&self) -> Option<StoredCredentials> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("could not read credentials at {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("ignoring malformed credentials at {}: {e}", self.path.display());
                None
            }
        }
    }

    /// A usable session, or `None` when missing, malformed or expired.
    pub fn load(&self) -> Option<StoredCredentials> {
        let creds = self.load_unchecked()?;
        if creds.is_expired() {
            debug!("stored credentials expired at {}", creds.expires_at);
            return None;
        }
        Some(creds)
    }

    /// Email of the last login, even when that session has expired.
    pub fn stored_email(&self) -> Option<String> {
        self.load_unchecked().map(|c| c.email).filter(|e| !e.is_empty())
    }

    pub fn save(&self, creds: &StoredCredentials) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)?;
        }

        let json = serde_json::to_vec_pretty(creds)?;
        let tmp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));

        let written = write_private_file(&tmp, &json).and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("credentials saved to {}", self.path.display());
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves `name_or_display` against the database list and persists the
    /// internal name. Super admins may store a name outside their list.
    pub fn select_database(&self, name_or_display: &str) -> Result<String, CredentialError> {
        let mut creds = self.load().ok_or(CredentialError::NotAuthenticated)?;

        let resolved = match creds.databases.iter().find(|d| d.matches(name_or_display)) {
            Some(entry) => entry.database_name.clone(),
            None if creds.is_super_admin() => name_or_display.to_string(),
            None => {
                return Err(CredentialError::UnknownDatabase {
                    name: name_or_display.to_string(),
                    available: creds.database_names(),
                })
            }
        };

        creds.selected_database = Some(resolved.clone());
        self.save(&creds)?;
        Ok(resolved)
    }

    pub fn get_selected_database(&self) -> Option<String> {
        self.load()?.effective_database().map(String::from)
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn sample(expires_in: Duration) -> StoredCredentials {
        StoredCredentials {
            token: "tok-123".into(),
            email: "ana@example.com".into(),
            role: Some("user".into()),
            databases: vec![
                DatabaseEntry::new("sales_db").with_display_name("Sales"),
                DatabaseEntry::new("ops_db").with_display_name("Operations"),
            ],
            selected_database: None,
            expires_at: Utc::now() + expires_in,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("nested").join("credentials.json"))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let creds = sample(Duration::hours(1));
        store.save(&creds).unwrap();
        assert_eq!(store.load(), Some(creds));
    }

    #[test]
    fn expired_record_is_absent_but_email_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample(Duration::hours(-1))).unwrap();
        assert!(store.load().is_none());
        assert!(store.get_selected_database().is_none());
        assert_eq!(store.stored_email().as_deref(), Some("ana@example.com"));
        assert!(store.path().exists());
    }

    #[test]
    fn missing_or_malformed_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load().is_none());

        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_none());
        assert!(store.stored_email().is_none());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample(Duration::hours(1))).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn save_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut first = sample(Duration::hours(1));
        first.selected_database = Some("ops_db".into());
        store.save(&first).unwrap();

        let second = StoredCredentials { token: "tok-456".into(), ..sample(Duration::hours(2)) };
        store.save(&second).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.token, "tok-456");
        assert_eq!(loaded.selected_database, None);
    }

    #[test]
    fn first_database_is_the_implicit_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample(Duration::hours(1))).unwrap();
        assert_eq!(store.get_selected_database().as_deref(), Some("sales_db"));
    }

    #[test]
    fn select_by_display_name_stores_internal_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample(Duration::hours(1))).unwrap();

        assert_eq!(store.select_database("Operations").unwrap(), "ops_db");
        assert_eq!(store.get_selected_database().as_deref(), Some("ops_db"));
        assert_eq!(store.load().unwrap().selected_database.as_deref(), Some("ops_db"));
    }

    #[test]
    fn select_unknown_database_fails_for_regular_role() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample(Duration::hours(1))).unwrap();

        let err = store.select_database("hr_db").unwrap_err();
        assert!(matches!(err, CredentialError::UnknownDatabase { .. }));
        assert!(err.to_string().contains("sales_db, ops_db"));
        assert_eq!(store.load().unwrap().selected_database, None);
    }

    #[test]
    fn super_admin_may_select_any_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let creds = StoredCredentials { role: Some(SUPER_ADMIN_ROLE.into()), ..sample(Duration::hours(1)) };
        store.save(&creds).unwrap();

        assert_eq!(store.select_database("hr_db").unwrap(), "hr_db");
        assert_eq!(store.get_selected_database().as_deref(), Some("hr_db"));
    }

    #[test]
    fn select_without_session_is_not_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(matches!(store.select_database("sales_db"), Err(CredentialError::NotAuthenticated)));
    }

    #[test]
    fn legacy_name_key_is_accepted() {
        let entry: DatabaseEntry =
            serde_json::from_str(r#"{"name":"sales_db","display_name":"Sales"}"#).unwrap();
        assert_eq!(entry.database_name, "sales_db");
        assert!(entry.matches("Sales"));
    }

    #[cfg(unix)]
    #[test]
    fn record_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample(Duration::hours(1))).unwrap();

        let file_mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        let dir_mode = fs::metadata(store.path().parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }
}
