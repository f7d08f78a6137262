//! Plain-text transcript of prompts and responses

use crate::Result;
use chrono::Local;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const SEPARATOR_WIDTH: usize = 80;

/// Append-only log of every completed exchange
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    path: PathBuf,
}

impl TranscriptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one prompt/response block
    pub async fn append(&self, prompt: &str, response: &str) -> Result<()> {
        let entry = format_entry(
            &Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            prompt,
            response,
        );

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Whole transcript, or `None` when nothing has been logged yet
    pub async fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the transcript. Returns `false` if there was none.
    pub async fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn format_entry(timestamp: &str, prompt: &str, response: &str) -> String {
    format!(
        "[{}] Prompt:\n{}\n\nResponse:\n{}\n{}\n",
        timestamp,
        prompt,
        response,
        "-".repeat(SEPARATOR_WIDTH)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_format_entry() {
        let entry = format_entry("2025-01-01 10:00:00", "hi", "hello");
        let expected = format!(
            "[2025-01-01 10:00:00] Prompt:\nhi\n\nResponse:\nhello\n{}\n",
            "-".repeat(80)
        );
        assert_eq!(entry, expected);
    }

    #[tokio::test]
    async fn test_append_read_clear() {
        let dir = TempDir::new().unwrap();
        let log = TranscriptLog::new(dir.path().join("gpt.log"));

        assert_eq!(log.read().await.unwrap(), None);

        log.append("first prompt", "first response").await.unwrap();
        log.append("second prompt", "second response").await.unwrap();

        let content = log.read().await.unwrap().unwrap();
        let first = content.find("first prompt").unwrap();
        let second = content.find("second prompt").unwrap();
        assert!(first < second);
        assert_eq!(content.matches("Response:").count(), 2);

        assert!(log.clear().await.unwrap());
        assert!(!log.clear().await.unwrap());
        assert_eq!(log.read().await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let log = TranscriptLog::new(dir.path().join("gpt.log"));
        log.append("p", "r").await.unwrap();
        let mode = std::fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
