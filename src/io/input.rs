use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// Reads the source list. A directory contributes every file in it, in
/// name order; unreadable files inside it are skipped.
pub async fn gather_text(path: &Path) -> Result<String> {
    if !path.is_dir() {
        return Ok(fs::read_to_string(path).await?);
    }

    let mut files: Vec<PathBuf> = Vec::new();
    let mut entries = fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut texts = Vec::with_capacity(files.len());
    for file in files {
        match fs::read_to_string(&file).await {
            Ok(content) => texts.push(content),
            Err(e) => debug!("Skipping {}: {}", file.display(), e),
        }
    }

    Ok(texts.join("\n"))
}
