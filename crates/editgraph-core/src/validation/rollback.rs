//! Backups and restore for files touched by an edit.
//!
//! Every backed-up file ends a transaction in exactly one of two states: its
//! new content (after [`EditRollback::discard_backups`]) or its original
//! content (after a restore). A file that did not exist when it was backed
//! up is deleted on restore.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, Utc};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::config::ValidationConfig;
use crate::errors::{EditGraphError, EditGraphResult};
use crate::validation::vcs::{GitCli, VersionControl};

pub const DEFAULT_STASH_MESSAGE: &str = "Edit validation stash";

#[derive(Clone, Debug, PartialEq)]
pub struct FileBackup {
    pub file_path: String,
    /// `None` when the file did not exist at backup time.
    pub original_content: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub git_tracked: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollbackResult {
    pub success: bool,
    pub files_restored: Vec<String>,
    pub errors: Vec<String>,
}

pub struct EditRollback {
    project_root: PathBuf,
    backup_dir: PathBuf,
    vcs: Option<Box<dyn VersionControl>>,
    backups: IndexMap<String, FileBackup>,
    stash_created: bool,
}

impl EditRollback {
    /// Rollback manager for `project_root`. Git is used only when enabled in
    /// `config` and the root is a repository.
    pub fn new(project_root: impl Into<PathBuf>, config: &ValidationConfig) -> Self {
        let project_root = project_root.into();
        let vcs: Option<Box<dyn VersionControl>> = if config.use_vcs {
            let git = GitCli::new(&project_root);
            git.is_repository().then(|| Box::new(git) as Box<dyn VersionControl>)
        } else {
            None
        };
        Self {
            backup_dir: project_root.join(&config.backup_dir),
            project_root,
            vcs,
            backups: IndexMap::new(),
            stash_created: false,
        }
    }

    /// Rollback manager without version control.
    pub fn in_memory(project_root: impl Into<PathBuf>) -> Self {
        let config = ValidationConfig {
            use_vcs: false,
            ..ValidationConfig::default()
        };
        Self::new(project_root, &config)
    }

    pub fn with_vcs(mut self, vcs: Box<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn uses_vcs(&self) -> bool {
        self.vcs.is_some()
    }

    /// Resolve a project-relative path. Absolute paths and paths whose `..`
    /// components climb above the project root are rejected.
    fn full_path(&self, file_path: &str) -> EditGraphResult<PathBuf> {
        let mut depth = 0usize;
        for component in Path::new(file_path).components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth = depth.checked_sub(1).ok_or_else(|| escapes_root(file_path))?;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(escapes_root(file_path));
                }
            }
        }
        Ok(self.project_root.join(file_path))
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Snapshot `file_path` before it is edited.
    ///
    /// The first backup of a path wins, so repeated calls inside one
    /// transaction keep the pre-transaction content.
    pub fn backup_file(&mut self, file_path: &str, use_disk: bool) -> EditGraphResult<()> {
        if self.backups.contains_key(file_path) {
            return Ok(());
        }

        let original_content = match std::fs::read_to_string(self.full_path(file_path)?) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let backup_path = match (&original_content, use_disk) {
            (Some(content), true) => Some(self.create_disk_backup(file_path, content)?),
            _ => None,
        };

        let git_tracked = self
            .vcs
            .as_ref()
            .is_some_and(|vcs| vcs.is_tracked(file_path));

        debug!(file_path, existed = original_content.is_some(), "backed up file");
        self.backups.insert(
            file_path.to_string(),
            FileBackup {
                file_path: file_path.to_string(),
                original_content,
                backup_path,
                timestamp: Utc::now(),
                git_tracked,
            },
        );
        Ok(())
    }

    fn create_disk_backup(&self, file_path: &str, content: &str) -> EditGraphResult<PathBuf> {
        std::fs::create_dir_all(&self.backup_dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let safe_name = file_path.replace(['/', '\\'], "_");
        let path = self.backup_dir.join(format!("{safe_name}.{stamp}.bak"));
        std::fs::write(&path, content)?;
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Restore / discard
    // -----------------------------------------------------------------------

    /// Put `file_path` back to its backed-up state and forget the backup.
    ///
    /// Returns `Ok(false)` when there is no backup. On error the backup is
    /// kept so the restore can be retried.
    pub fn restore_file(&mut self, file_path: &str) -> EditGraphResult<bool> {
        let Some(backup) = self.backups.get(file_path) else {
            return Ok(false);
        };
        let full_path = self.full_path(file_path)?;

        match &backup.original_content {
            Some(content) => {
                if let Some(parent) = full_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full_path, content)?;
            }
            None => match std::fs::remove_file(&full_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }

        if let Some(backup) = self.backups.shift_remove(file_path) {
            remove_disk_backup(&backup);
        }
        debug!(file_path, "restored file");
        Ok(true)
    }

    /// Restore every outstanding backup. Failures are collected, not raised,
    /// and never stop the remaining restores.
    pub fn restore_all(&mut self) -> RollbackResult {
        let mut result = RollbackResult {
            success: true,
            ..RollbackResult::default()
        };

        let paths: Vec<String> = self.backups.keys().cloned().collect();
        for file_path in paths {
            match self.restore_file(&file_path) {
                Ok(_) => result.files_restored.push(file_path),
                Err(e) => {
                    warn!(file_path = %file_path, err = %e, "failed to restore file");
                    result.errors.push(format!("Failed to restore {file_path}: {e}"));
                    result.success = false;
                }
            }
        }

        if self.stash_created {
            if let Some(vcs) = &self.vcs {
                if let Err(e) = vcs.stash_pop() {
                    result.errors.push(format!("Failed to pop stash: {e}"));
                    result.success = false;
                }
            }
            self.stash_created = false;
        }

        result
    }

    /// Drop every backup without restoring; the edits are kept.
    pub fn discard_backups(&mut self) {
        for (_, backup) in self.backups.drain(..) {
            remove_disk_backup(&backup);
        }

        if self.stash_created {
            if let Some(vcs) = &self.vcs {
                if let Err(e) = vcs.stash_drop() {
                    warn!(err = %e, "failed to drop stash");
                }
            }
            self.stash_created = false;
        }
    }

    /// Stash local changes as a save point before a batch of edits.
    pub fn stash_changes(&mut self, message: &str) -> bool {
        let Some(vcs) = &self.vcs else {
            return false;
        };
        match vcs.stash_push(message) {
            Ok(created) => {
                self.stash_created = created;
                created
            }
            Err(e) => {
                warn!(err = %e, "stash failed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn has_backup(&self, file_path: &str) -> bool {
        self.backups.contains_key(file_path)
    }

    pub fn get_backup(&self, file_path: &str) -> Option<&FileBackup> {
        self.backups.get(file_path)
    }

    pub fn all_backups(&self) -> Vec<&FileBackup> {
        self.backups.values().collect()
    }

    /// Delete `*.bak` files in the backup directory older than `max_age`.
    pub fn cleanup_old_backups(&self, max_age: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.backup_dir) else {
            return 0;
        };
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bak") {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            if matches!(modified, Ok(mtime) if mtime <= cutoff) && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up old backups");
        }
        removed
    }
}

fn escapes_root(file_path: &str) -> EditGraphError {
    EditGraphError::Validation(format!("Path escapes project root: {file_path}"))
}

fn remove_disk_backup(backup: &FileBackup) {
    if let Some(path) = &backup.backup_path {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), err = %e, "failed to remove disk backup");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EditTransaction
// ---------------------------------------------------------------------------

/// Scoped edit batch: rolled back on drop unless committed.
pub struct EditTransaction {
    rollback: EditRollback,
    committed: bool,
}

impl EditTransaction {
    pub fn new(rollback: EditRollback) -> Self {
        Self {
            rollback,
            committed: false,
        }
    }

    pub fn backup(&mut self, file_path: &str) -> EditGraphResult<()> {
        self.rollback.backup_file(file_path, false)
    }

    /// Back up `file_path` and write `content` in its place.
    pub fn apply(&mut self, file_path: &str, content: &str) -> EditGraphResult<()> {
        self.backup(file_path)?;
        let full_path = self.rollback.full_path(file_path)?;
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full_path, content)?;
        Ok(())
    }

    pub fn rollback(&mut self) -> RollbackResult {
        self.rollback.restore_all()
    }

    /// Keep the edits and drop the backups.
    pub fn commit(mut self) {
        self.committed = true;
        self.rollback.discard_backups();
    }

    pub fn manager(&self) -> &EditRollback {
        &self.rollback
    }
}

impl Drop for EditTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let result = self.rollback.restore_all();
        if !result.success {
            warn!(errors = ?result.errors, "transaction rollback incomplete");
        }
    }
}
