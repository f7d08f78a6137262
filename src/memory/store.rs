//! On-disk storage for the conversation memory (JSON)

use super::model::ConversationMemory;
use crate::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Owner read/write only
#[cfg(unix)]
const MEMORY_FILE_MODE: u32 = 0o600;

/// Reads and writes the single memory file.
///
/// Saves go through a sibling temporary file that is renamed over the
/// target, so a failed or interrupted write leaves the previous file intact.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    file_path: PathBuf,
}

impl MemoryStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    /// Get the file path
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Path of the in-progress write
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .file_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "memory.json".into());
        name.push(".tmp");
        self.file_path.with_file_name(name)
    }

    /// Load memory from file. A missing file is an empty memory.
    pub async fn load(&self) -> Result<ConversationMemory> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No memory file at {}, starting empty", self.file_path.display());
                return Ok(ConversationMemory::new());
            }
            Err(e) => return Err(self.corrupt(e)),
        };

        let memory: ConversationMemory =
            serde_json::from_str(&content).map_err(|e| self.corrupt(e))?;
        debug!(
            "Loaded memory from {} ({} recent turns, summary {} chars)",
            self.file_path.display(),
            memory.recent().len(),
            memory.summary().len()
        );
        Ok(memory)
    }

    /// Save memory to file, replacing prior content atomically.
    pub async fn save(&self, memory: &ConversationMemory) -> Result<()> {
        let content = serde_json::to_string_pretty(memory)?;
        let tmp = self.temp_path();

        if let Err(e) = self.write_and_replace(&tmp, content.as_bytes()).await {
            if fs::remove_file(&tmp).await.is_ok() {
                debug!("Removed partial write {}", tmp.display());
            }
            return Err(Error::Persistence {
                path: self.file_path.clone(),
                source: e,
            });
        }

        debug!("Saved memory to {}", self.file_path.display());
        Ok(())
    }

    async fn write_and_replace(&self, tmp: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(MEMORY_FILE_MODE);

        let mut file = options.open(tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(tmp, &self.file_path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.file_path, std::fs::Permissions::from_mode(MEMORY_FILE_MODE))
                .await?;
        }
        Ok(())
    }

    /// Delete the memory file. Missing files are fine.
    pub async fn reset(&self) -> Result<()> {
        for path in [self.file_path.clone(), self.temp_path()] {
            match fs::remove_file(&path).await {
                Ok(()) => info!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    return Err(Error::Persistence { path, source: e });
                }
            }
        }
        Ok(())
    }

    fn corrupt(&self, reason: impl ToString) -> Error {
        Error::CorruptState {
            path: self.file_path.clone(),
            reason: reason.to_string(),
        }
    }
}
