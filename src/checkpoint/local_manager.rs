//! Directory-per-token checkpoint manager on the local file system

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, CheckpointToken, TokenPair};
use crate::device::{DeviceHandle, FileSystemFile};

const INDEX_DIR: &str = "index-checkpoints";
const LOG_DIR: &str = "cpr-checkpoints";
const METADATA_FILE: &str = "info.dat";
const INDEX_SNAPSHOT_FILE: &str = "ht.dat";
const LOG_SNAPSHOT_FILE: &str = "snapshot.dat";
const OBJECT_SNAPSHOT_FILE: &str = "snapshot.obj.dat";

/// Checkpoint manager storing each token in its own directory under `root`.
///
/// Metadata commits write a temporary file, fsync it, rename it into place and fsync
/// the directory, so `info.dat` is either absent or complete.
#[derive(Debug, Clone)]
pub struct LocalCheckpointManager {
    root: PathBuf,
}

impl LocalCheckpointManager {
    /// Open (and create if needed) a checkpoint root directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(INDEX_DIR))?;
        fs::create_dir_all(root.join(LOG_DIR))?;
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of an index token
    pub fn index_checkpoint_dir(&self, token: CheckpointToken) -> PathBuf {
        self.root.join(INDEX_DIR).join(token.to_string())
    }

    /// Directory holding the artifacts of a log token
    pub fn log_checkpoint_dir(&self, token: CheckpointToken) -> PathBuf {
        self.root.join(LOG_DIR).join(token.to_string())
    }

    /// Path of the committed index metadata file
    pub fn index_metadata_path(&self, token: CheckpointToken) -> PathBuf {
        self.index_checkpoint_dir(token).join(METADATA_FILE)
    }

    /// Path of the committed log metadata file
    pub fn log_metadata_path(&self, token: CheckpointToken) -> PathBuf {
        self.log_checkpoint_dir(token).join(METADATA_FILE)
    }

    fn initialize(dir: &Path) -> io::Result<()> {
        if dir.join(METADATA_FILE).exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("checkpoint {} is already committed", dir.display()),
            ));
        }
        fs::create_dir_all(dir)
    }

    fn open_artifact(dir: &Path, name: &str) -> io::Result<DeviceHandle> {
        fs::create_dir_all(dir)?;
        let file = FileSystemFile::open(dir.join(name), true)?;
        Ok(Arc::new(file))
    }

    fn commit(dir: &Path, metadata: &[u8]) -> io::Result<()> {
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("checkpoint {} was never initialized", dir.display()),
            ));
        }
        let tmp_path = dir.join(format!("{METADATA_FILE}.tmp"));
        let mut file = File::create(&tmp_path)?;
        file.write_all(metadata)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, dir.join(METADATA_FILE))?;
        sync_dir(dir)
    }

    fn read_metadata(dir: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(dir.join(METADATA_FILE)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove_metadata(dir: &Path) -> io::Result<()> {
        match fs::remove_file(dir.join(METADATA_FILE)) {
            Ok(()) => sync_dir(dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn purge(dir: &Path) -> io::Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Committed tokens under `parent` with their metadata modification time.
    fn committed(parent: &Path) -> io::Result<Vec<(CheckpointToken, SystemTime)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(token) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            match fs::metadata(entry.path().join(METADATA_FILE)) {
                Ok(meta) => out.push((token, meta.modified()?)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

impl CheckpointManager for LocalCheckpointManager {
    fn initialize_index_checkpoint(&self, token: CheckpointToken) -> io::Result<()> {
        Self::initialize(&self.index_checkpoint_dir(token))
    }

    fn initialize_log_checkpoint(&self, token: CheckpointToken) -> io::Result<()> {
        Self::initialize(&self.log_checkpoint_dir(token))
    }

    fn index_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        Self::open_artifact(&self.index_checkpoint_dir(token), INDEX_SNAPSHOT_FILE)
    }

    fn snapshot_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        Self::open_artifact(&self.log_checkpoint_dir(token), LOG_SNAPSHOT_FILE)
    }

    fn snapshot_object_log_device(&self, token: CheckpointToken) -> io::Result<DeviceHandle> {
        Self::open_artifact(&self.log_checkpoint_dir(token), OBJECT_SNAPSHOT_FILE)
    }

    fn commit_index_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()> {
        Self::commit(&self.index_checkpoint_dir(token), metadata)
    }

    fn commit_log_checkpoint(&self, token: CheckpointToken, metadata: &[u8]) -> io::Result<()> {
        Self::commit(&self.log_checkpoint_dir(token), metadata)
    }

    fn index_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>> {
        Self::read_metadata(&self.index_checkpoint_dir(token))
    }

    fn log_commit_metadata(&self, token: CheckpointToken) -> io::Result<Option<Vec<u8>>> {
        Self::read_metadata(&self.log_checkpoint_dir(token))
    }

    fn latest_checkpoint(&self) -> io::Result<Option<TokenPair>> {
        let newest = |mut tokens: Vec<(CheckpointToken, SystemTime)>| {
            tokens.sort_by_key(|(_, modified)| *modified);
            tokens.pop().map(|(token, _)| token)
        };
        let log = newest(Self::committed(&self.root.join(LOG_DIR))?);
        let index = newest(Self::committed(&self.root.join(INDEX_DIR))?);
        Ok(log.map(|log_token| TokenPair::new(index, log_token)))
    }

    fn index_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>> {
        Ok(Self::committed(&self.root.join(INDEX_DIR))?
            .into_iter()
            .map(|(token, _)| token)
            .collect())
    }

    fn log_checkpoint_tokens(&self) -> io::Result<Vec<CheckpointToken>> {
        Ok(Self::committed(&self.root.join(LOG_DIR))?
            .into_iter()
            .map(|(token, _)| token)
            .collect())
    }

    fn remove_index_commit_metadata(&self, token: CheckpointToken) -> io::Result<()> {
        Self::remove_metadata(&self.index_checkpoint_dir(token))
    }

    fn remove_log_commit_metadata(&self, token: CheckpointToken) -> io::Result<()> {
        Self::remove_metadata(&self.log_checkpoint_dir(token))
    }

    fn purge_index_artifacts(&self, token: CheckpointToken) -> io::Result<()> {
        Self::purge(&self.index_checkpoint_dir(token))
    }

    fn purge_log_artifacts(&self, token: CheckpointToken) -> io::Result<()> {
        Self::purge(&self.log_checkpoint_dir(token))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
