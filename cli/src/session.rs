//! One open vault file.
//!
//! A session owns the decrypted tree for the lifetime of a command. Key
//! derivation and merges run on the blocking pool; a busy flag keeps edits
//! and merges from interleaving.

use crate::config::Config;
use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vaultsync_engine::{Database, DatabaseMerger, MergeLog};
use zeroize::Zeroizing;

/// Options for [`VaultSession::merge_from`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Merge the remote-sync subtree too
    pub remote_sync: bool,
    /// Re-save the remote file when the merge finds it out of date
    pub write_remote: bool,
}

/// An open vault and the file it came from.
pub struct VaultSession {
    path: PathBuf,
    password: Zeroizing<String>,
    db: Arc<Mutex<Database>>,
    dirty: AtomicBool,
    busy: AtomicBool,
}

/// Held while an operation has exclusive use of a session.
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl VaultSession {
    /// Create a new empty vault at `path` and write it out.
    pub async fn create(path: impl Into<PathBuf>, config: &Config, force: bool) -> Result<Self> {
        let path = path.into();
        if !force && tokio::fs::try_exists(&path).await? {
            return Err(AppError::AlreadyExists(path.display().to_string()));
        }

        let password = config.password.clone();
        let (memory_rounds, file_rounds) = (config.memory_rounds, config.file_rounds);
        let db = tokio::task::spawn_blocking(move || {
            Database::new(&password, memory_rounds, file_rounds)
        })
        .await??;

        let session = Self::with_database(path, config.password.clone(), db);
        session.save().await?;
        info!("Created vault at {}", session.path.display());
        Ok(session)
    }

    /// Open the vault stored at `path`.
    pub async fn open(path: impl Into<PathBuf>, config: &Config) -> Result<Self> {
        let path = path.into();
        let json = tokio::fs::read_to_string(&path).await?;

        let password = config.password.clone();
        let memory_rounds = config.memory_rounds;
        let db = tokio::task::spawn_blocking(move || {
            Database::open_vault_json(&json, &password, memory_rounds)
        })
        .await??;

        debug!("Opened vault at {}", path.display());
        Ok(Self::with_database(path, config.password.clone(), db))
    }

    fn with_database(path: PathBuf, password: Zeroizing<String>, db: Database) -> Self {
        Self {
            path,
            password,
            db: Arc::new(Mutex::new(db)),
            dirty: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        }
    }

    /// Whether the tree has changed since it was last saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Claim the session for one operation, or fail with [`AppError::Busy`].
    pub fn try_begin(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| AppError::Busy)?;
        Ok(BusyGuard { flag: &self.busy })
    }

    /// Run `f` against the tree.
    pub async fn read<R>(&self, f: impl FnOnce(&Database) -> R) -> R {
        let db = self.db.lock().await;
        f(&db)
    }

    /// Run a mutation against the tree, marking the session dirty on success.
    pub async fn edit<R>(
        &self,
        f: impl FnOnce(&mut Database) -> vaultsync_engine::Result<R>,
    ) -> Result<R> {
        let _guard = self.try_begin()?;
        let mut db = self.db.lock().await;
        let out = f(&mut db)?;
        self.dirty.store(true, Ordering::Release);
        Ok(out)
    }

    /// Write the vault back to its file.
    pub async fn save(&self) -> Result<()> {
        let json = self.read(|db| db.to_vault_json()).await?;
        write_atomic(&self.path, &json).await?;
        self.dirty.store(false, Ordering::Release);
        debug!("Saved vault to {}", self.path.display());
        Ok(())
    }

    /// Merge the vault file at `remote_path` into this one.
    ///
    /// The remote file must use the same password. With
    /// [`MergeOptions::write_remote`] an out-of-date remote file is overwritten
    /// with the merged vault, keeping the remote's own copy of anything the
    /// merge left out; a failure there is reported in the log rather than as
    /// an error, since the local merge already succeeded.
    pub async fn merge_from(&self, remote_path: &Path, options: MergeOptions) -> Result<MergeLog> {
        let _guard = self.try_begin()?;
        let json = tokio::fs::read_to_string(remote_path).await?;

        let db = Arc::clone(&self.db);
        let password = self.password.clone();
        let (mut log, outgoing) = tokio::task::spawn_blocking(
            move || -> vaultsync_engine::Result<(MergeLog, Option<vaultsync_engine::Result<String>>)> {
                let mut local = db.blocking_lock();
                let remote = Database::load_like(&json, &password, &local)?;
                let merger = merger_for(options);
                let log = merger.merge(&remote, &mut local)?;

                let outgoing = (options.write_remote && log.remote_out_of_date()).then(|| {
                    remote_copy(&remote, &local, &merger).and_then(|db| db.to_vault_json())
                });
                Ok((log, outgoing))
            },
        )
        .await??;
        if log.local_changed() {
            self.dirty.store(true, Ordering::Release);
        }

        if let Some(outgoing) = outgoing {
            let target = remote_path.display().to_string();
            let saved = match outgoing {
                Ok(json) => write_atomic(remote_path, &json).await.map_err(AppError::from),
                Err(e) => Err(AppError::from(e)),
            };
            match saved {
                Ok(()) => info!("Re-saved remote copy at {}", target),
                Err(e) => {
                    warn!("Failed to re-save remote copy at {}: {}", target, e);
                    log.error(false, target, format!("failed to re-save remote copy: {}", e));
                }
            }
        }

        Ok(log)
    }
}

fn merger_for(options: MergeOptions) -> DatabaseMerger {
    if options.remote_sync {
        DatabaseMerger::new()
    } else {
        DatabaseMerger::excluding_remote_sync()
    }
}

/// The merged vault as the remote file should hold it: everything in
/// `local`, except that subtrees `merger` leaves out keep the remote's copy.
fn remote_copy(
    remote: &Database,
    local: &Database,
    merger: &DatabaseMerger,
) -> vaultsync_engine::Result<Database> {
    let mut outgoing = Database::create_like(local);
    DatabaseMerger::new().merge(remote, &mut outgoing)?;
    merger.merge(local, &mut outgoing)?;
    Ok(outgoing)
}

/// Write through a temporary file so a crash never leaves half a vault.
async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vaultsync_engine::{LogLevel, REMOTE_SYNC_NODE};

    fn config(password: &str) -> Config {
        Config {
            password: Zeroizing::new(password.to_string()),
            memory_rounds: 1,
            file_rounds: 1,
        }
    }

    async fn put(session: &VaultSession, name: &str, value: &[u8]) {
        session
            .edit(|db| {
                let root = db.root();
                db.add_entry(root, name, value)
            })
            .await
            .unwrap();
    }

    async fn get(session: &VaultSession, name: &str) -> Option<Vec<u8>> {
        session
            .read(|db| {
                db.find_path(&[name])
                    .map(|idx| db.value_of(idx).unwrap().unwrap_or_default())
            })
            .await
    }

    #[tokio::test]
    async fn create_save_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.json");

        let session = VaultSession::create(&path, &config("pw"), false).await.unwrap();
        assert!(!session.is_dirty());
        put(&session, "mail", b"alice").await;
        assert!(session.is_dirty());
        session.save().await.unwrap();
        assert!(!session.is_dirty());

        let reopened = VaultSession::open(&path, &config("pw")).await.unwrap();
        assert_eq!(get(&reopened, "mail").await, Some(b"alice".to_vec()));
    }

    #[tokio::test]
    async fn create_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.json");
        VaultSession::create(&path, &config("pw"), false).await.unwrap();

        let result = VaultSession::create(&path, &config("pw"), false).await;
        assert!(matches!(result, Err(AppError::AlreadyExists(_))));
        assert!(VaultSession::create(&path, &config("pw"), true).await.is_ok());
    }

    #[tokio::test]
    async fn open_with_wrong_password() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.json");
        VaultSession::create(&path, &config("pw"), false).await.unwrap();

        let result = VaultSession::open(&path, &config("nope")).await;
        assert!(matches!(result, Err(AppError::Engine(_))));
    }

    #[tokio::test]
    async fn merge_from_another_file() {
        let dir = TempDir::new().unwrap();
        let local_path = dir.path().join("local.json");
        let remote_path = dir.path().join("remote.json");

        let local = VaultSession::create(&local_path, &config("pw"), false).await.unwrap();
        std::fs::copy(&local_path, &remote_path).unwrap();

        let remote = VaultSession::open(&remote_path, &config("pw")).await.unwrap();
        put(&remote, "bank", b"1234").await;
        remote.save().await.unwrap();

        let log = local
            .merge_from(&remote_path, MergeOptions::default())
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.items()[0].text, "added");
        assert_eq!(get(&local, "bank").await, Some(b"1234".to_vec()));
        assert!(local.is_dirty());
        assert!(local.try_begin().is_ok());
    }

    #[tokio::test]
    async fn merging_identical_copy_leaves_session_clean() {
        let dir = TempDir::new().unwrap();
        let local_path = dir.path().join("local.json");
        let remote_path = dir.path().join("remote.json");

        let local = VaultSession::create(&local_path, &config("pw"), false).await.unwrap();
        put(&local, "bank", b"1234").await;
        local.save().await.unwrap();
        std::fs::copy(&local_path, &remote_path).unwrap();

        let log = local
            .merge_from(&remote_path, MergeOptions::default())
            .await
            .unwrap();
        assert_eq!(log.items()[0].text, "unchanged");
        assert!(!log.local_changed());
        assert!(!local.is_dirty());
    }

    #[tokio::test]
    async fn write_remote_updates_stale_copy() {
        let dir = TempDir::new().unwrap();
        let local_path = dir.path().join("local.json");
        let remote_path = dir.path().join("remote.json");

        let local = VaultSession::create(&local_path, &config("pw"), false).await.unwrap();
        std::fs::copy(&local_path, &remote_path).unwrap();
        put(&local, "notes", b"mine").await;

        let options = MergeOptions {
            remote_sync: false,
            write_remote: true,
        };
        let log = local.merge_from(&remote_path, options).await.unwrap();
        assert!(log.remote_out_of_date());
        assert!(log.items().iter().all(|i| i.level != LogLevel::Error));

        let remote = VaultSession::open(&remote_path, &config("pw")).await.unwrap();
        assert_eq!(get(&remote, "notes").await, Some(b"mine".to_vec()));
    }

    #[tokio::test]
    async fn write_remote_keeps_remote_sync_subtree() {
        let dir = TempDir::new().unwrap();
        let local_path = dir.path().join("local.json");
        let remote_path = dir.path().join("remote.json");

        let local = VaultSession::create(&local_path, &config("pw"), false).await.unwrap();
        std::fs::copy(&local_path, &remote_path).unwrap();

        let remote = VaultSession::open(&remote_path, &config("pw")).await.unwrap();
        put(&remote, REMOTE_SYNC_NODE, b"remote endpoint").await;
        remote.save().await.unwrap();
        put(&local, "notes", b"mine").await;

        let options = MergeOptions {
            remote_sync: false,
            write_remote: true,
        };
        let log = local.merge_from(&remote_path, options).await.unwrap();
        assert!(log.remote_out_of_date());
        assert!(log.items().iter().all(|i| i.level != LogLevel::Error));
        assert_eq!(get(&local, REMOTE_SYNC_NODE).await, None);

        let remote = VaultSession::open(&remote_path, &config("pw")).await.unwrap();
        assert_eq!(get(&remote, "notes").await, Some(b"mine".to_vec()));
        assert_eq!(
            get(&remote, REMOTE_SYNC_NODE).await,
            Some(b"remote endpoint".to_vec())
        );
    }

    #[tokio::test]
    async fn busy_session_rejects_work() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.json");
        let session = VaultSession::create(&path, &config("pw"), false).await.unwrap();

        let guard = session.try_begin().unwrap();
        assert!(matches!(session.try_begin(), Err(AppError::Busy)));

        let edit = session.edit(|db| db.add_group(db.root(), "x")).await;
        assert!(matches!(edit, Err(AppError::Busy)));
        let merge = session.merge_from(&path, MergeOptions::default()).await;
        assert!(matches!(merge, Err(AppError::Busy)));

        drop(guard);
        assert!(session.edit(|db| db.add_group(db.root(), "x")).await.is_ok());
    }

    #[tokio::test]
    async fn missing_remote_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.json");
        let session = VaultSession::create(&path, &config("pw"), false).await.unwrap();

        let result = session
            .merge_from(&dir.path().join("missing.json"), MergeOptions::default())
            .await;
        assert!(matches!(result, Err(AppError::Io(_))));
        assert!(session.try_begin().is_ok());
    }
}
