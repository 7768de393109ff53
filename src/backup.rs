use chrono::{DateTime, Local, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Result, SaveError};
use crate::storage::{BackupData, BackupMetadata, Chain, Command};
use crate::store_manager::CommandStore;

const BACKUP_PREFIX: &str = "save-history-";

/// A backup file found in the backup directory.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub modified: DateTime<Local>,
    pub size: u64,
}

fn checksum(commands: &[Command], chains: &[Chain]) -> Result<String> {
    let bytes = serde_json::to_vec(&(commands, chains))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

impl CommandStore {
    /// A fresh timestamped path; never one that already exists.
    fn default_backup_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S-%3f");
        let dir = &self.config.backup_dir;
        let mut path = dir.join(format!("{}{}.json", BACKUP_PREFIX, stamp));
        let mut n = 1;
        // `_` sorts after `.`, keeping listings in creation order
        while path.exists() {
            path = dir.join(format!("{}{}_{}.json", BACKUP_PREFIX, stamp, n));
            n += 1;
        }
        path
    }

    /// Writes commands and chains with a checksummed header.
    ///
    /// Without an explicit path the file goes into the backup directory under a
    /// timestamped name.
    pub fn create_backup(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.default_backup_path(),
        };
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| SaveError::storage(dir, e))?;
        }

        let data = BackupData {
            metadata: BackupMetadata {
                version: self.config.version.clone(),
                created_at: Utc::now(),
                command_count: self.commands.len(),
                chain_count: self.chains.len(),
                checksum: Some(checksum(&self.commands, &self.chains)?),
            },
            commands: self.commands.clone(),
            chains: self.chains.clone(),
        };
        let content = serde_json::to_string_pretty(&data)?;
        fs::write(&path, content).map_err(|e| SaveError::storage(&path, e))?;
        tracing::info!(path = %path.display(), commands = data.metadata.command_count, "backup written");
        Ok(path)
    }

    /// Replaces commands and chains with a backup's contents.
    ///
    /// The checksum is verified first and the current state is backed up before
    /// anything is overwritten. Edit history is dropped since it refers to the
    /// replaced records.
    pub fn restore_backup(&mut self, path: &Path) -> Result<BackupMetadata> {
        let content = fs::read_to_string(path).map_err(|e| SaveError::storage(path, e))?;
        let data: BackupData = serde_json::from_str(&content)?;

        if let Some(expected) = &data.metadata.checksum {
            let actual = checksum(&data.commands, &data.chains)?;
            if &actual != expected {
                return Err(SaveError::validation(format!(
                    "backup checksum mismatch for {}",
                    path.display()
                )));
            }
        } else {
            tracing::warn!(path = %path.display(), "backup has no checksum, restoring unverified");
        }

        let safety = self.create_backup(None)?;
        tracing::info!(path = %safety.display(), "saved current state before restore");

        let mut document = self.document();
        document.commands = data.commands;
        document.chains = data.chains;
        document.edit_history.clear();
        self.replace_contents(document);
        self.save()?;
        Ok(data.metadata)
    }

    /// Backups in the backup directory, oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let dir = &self.config.backup_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SaveError::storage(dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SaveError::storage(dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(BACKUP_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let meta = entry.metadata().map_err(|e| SaveError::storage(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map(DateTime::<Local>::from)
                .unwrap_or_else(|_| Local::now());
            backups.push(BackupEntry {
                path: entry.path(),
                modified,
                size: meta.len(),
            });
        }
        backups.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(backups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChainDefinition;
    use crate::store_manager::tests::{add, temp_store};

    #[test]
    fn restore_brings_back_commands_and_chains() {
        let (dir, mut store) = temp_store();
        let id = add(&mut store, "echo keep");
        store.create_chain(ChainDefinition { name: "c".into(), ..Default::default() }).unwrap();
        let file = dir.path().join("manual.json");
        store.create_backup(Some(&file)).unwrap();

        store.remove_commands(&[id]).unwrap();
        add(&mut store, "echo later");
        let meta = store.restore_backup(&file).unwrap();

        assert_eq!((meta.command_count, meta.chain_count), (1, 1));
        assert_eq!(store.commands().len(), 1);
        assert_eq!(store.command(id).unwrap().raw, "echo keep");
        // IDs handed out before the restore are not reused
        assert_eq!(add(&mut store, "echo next"), 3);
        // the pre-restore state was saved as a safety backup
        assert_eq!(store.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn tampered_backup_is_refused() {
        let (dir, mut store) = temp_store();
        add(&mut store, "echo original");
        let file = dir.path().join("manual.json");
        store.create_backup(Some(&file)).unwrap();

        let tampered = fs::read_to_string(&file).unwrap().replace("echo original", "rm -rf /tmp/x");
        fs::write(&file, tampered).unwrap();

        let err = store.restore_backup(&file).unwrap_err();
        assert!(matches!(err, SaveError::Validation(_)));
        assert_eq!(store.commands()[0].raw, "echo original");
    }

    #[test]
    fn restoring_a_default_backup_keeps_it_intact() {
        let (_dir, mut store) = temp_store();
        add(&mut store, "echo first");
        let path = store.create_backup(None).unwrap();
        add(&mut store, "echo second");

        store.restore_backup(&path).unwrap();

        let kept: BackupData = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(kept.commands.len(), 1);
        assert_eq!(store.commands().len(), 1);
        // the safety backup went to its own file
        let listed = store.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, path);
    }

    #[test]
    fn back_to_back_default_backups_get_distinct_files() {
        let (_dir, store) = temp_store();
        let paths: Vec<PathBuf> = (0..3).map(|_| store.create_backup(None).unwrap()).collect();
        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[1], paths[2]);
        let listed: Vec<PathBuf> = store.list_backups().unwrap().into_iter().map(|b| b.path).collect();
        assert_eq!(listed, paths);
    }

    #[test]
    fn default_backups_are_listed() {
        let (_dir, store) = temp_store();
        assert!(store.list_backups().unwrap().is_empty());
        let path = store.create_backup(None).unwrap();
        let listed = store.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, path);
        assert!(listed[0].size > 0);
    }
}
