use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::io::ResourceHead;

/// Persisted description of one cached resource (`<id>.meta.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    #[serde(default)]
    pub resource_id: String,
    pub file_size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub block_size: u64,
    /// Milliseconds since the Unix epoch
    pub last_validated_ts: i64,
    #[serde(default)]
    pub last_accessed_ts: i64,
}

impl CacheMeta {
    pub fn from_head(resource_id: &str, head: &ResourceHead, block_size: u64, now: i64) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            file_size: head.size,
            etag: head.etag.clone(),
            last_modified: head.last_modified.clone(),
            block_size,
            last_validated_ts: now,
            last_accessed_ts: now,
        }
    }

    /// Whether a fresh HEAD still describes the cached bytes.
    ///
    /// Size must match. ETag and Last-Modified are compared when both sides
    /// carry them.
    pub fn matches(&self, head: &ResourceHead) -> bool {
        fn same(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.file_size == head.size
            && same(&self.etag, &head.etag)
            && same(&self.last_modified, &head.last_modified)
    }
}

/// On-disk locations of one resource's cache files
#[derive(Debug, Clone)]
pub struct CachePaths {
    pub data: PathBuf,
    pub bitmap: PathBuf,
    pub meta: PathBuf,
}

impl CachePaths {
    pub fn new(dir: &Path, resource_id: &str) -> Self {
        let name = file_stem(resource_id);
        Self {
            data: dir.join(format!("{}.txt", name)),
            bitmap: dir.join(format!("{}.bitmap", name)),
            meta: dir.join(format!("{}.meta.json", name)),
        }
    }

    /// Delete all three files, ignoring ones that are already gone
    pub async fn remove_all(&self) -> Result<()> {
        for path in [&self.data, &self.bitmap, &self.meta] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

/// File name stem for a resource id; anything outside `[A-Za-z0-9._-]` becomes `_`
pub fn file_stem(resource_id: &str) -> String {
    resource_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub async fn load_meta(path: &Path) -> Result<Option<CacheMeta>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let meta = serde_json::from_str(&text)
        .with_context(|| format!("corrupt cache metadata {}", path.display()))?;
    Ok(Some(meta))
}

pub async fn save_meta(path: &Path, meta: &CacheMeta) -> Result<()> {
    let text = serde_json::to_string_pretty(meta)?;
    fs::write(path, text)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(size: u64, etag: Option<&str>) -> ResourceHead {
        ResourceHead {
            size,
            etag: etag.map(str::to_string),
            last_modified: None,
        }
    }

    #[test]
    fn matches_requires_same_size_and_etag() {
        let meta = CacheMeta::from_head("1", &head(100, Some("a")), 4096, 0);
        assert!(meta.matches(&head(100, Some("a"))));
        assert!(meta.matches(&head(100, None)));
        assert!(!meta.matches(&head(101, Some("a"))));
        assert!(!meta.matches(&head(100, Some("b"))));
    }

    #[test]
    fn file_stem_replaces_path_characters() {
        assert_eq!(file_stem("1342"), "1342");
        assert_eq!(file_stem("cache/epub/1342"), "cache_epub_1342");
        assert_eq!(file_stem("../x"), ".._x");
    }

    #[tokio::test]
    async fn meta_round_trips_with_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CachePaths::new(dir.path(), "12");
        let meta = CacheMeta::from_head("12", &head(10, Some("\"e\"")), 64, 1_700_000_000_000);

        save_meta(&paths.meta, &meta).await.unwrap();
        let text = std::fs::read_to_string(&paths.meta).unwrap();
        assert!(text.contains("\"fileSize\": 10"));
        assert!(text.contains("\"lastValidatedTs\""));

        assert_eq!(load_meta(&paths.meta).await.unwrap(), Some(meta));
        paths.remove_all().await.unwrap();
        assert_eq!(load_meta(&paths.meta).await.unwrap(), None);
    }
}
