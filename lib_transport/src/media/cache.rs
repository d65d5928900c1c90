//! # Media Cache
//!
//! On-disk layout below the cache root:
//! - `thumbnails/thumb_{id}.jpg`
//! - `media_{id}.{ext}` with the extension taken from the source URL
//!
//! Every file name is derived from the item id, so concurrent workers never
//! write the same path. Files are written to `*.part` first and renamed into
//! place, so a lookup never sees a half-written file.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use url::Url;

use crate::core::errors::TransportResult;
use crate::media::registry::MediaKind;

const THUMBNAIL_DIR: &str = "thumbnails";
const DEFAULT_EXTENSION: &str = "jpg";
const MAX_EXTENSION_LEN: usize = 5;

/// # Media Cache
#[derive(Debug, Clone)]
pub struct MediaCache {
    root: PathBuf,
}

impl MediaCache {
    /// Opens (and creates) the cache below `root`.
    pub async fn open(root: impl Into<PathBuf>) -> TransportResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(THUMBNAIL_DIR)).await?;
        debug!(root = %root.display(), "Media cache ready");
        Ok(Self { root })
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of the cached `kind` of `item_id`.
    pub fn path_for(&self, item_id: u64, kind: MediaKind, url: &str) -> PathBuf {
        match kind {
            MediaKind::Thumbnail => self.root.join(THUMBNAIL_DIR).join(format!("thumb_{item_id}.jpg")),
            MediaKind::Full => self.root.join(format!("media_{item_id}.{}", extension_of(url))),
        }
    }

    /// Path of a complete, non-empty cached file, if present.
    pub async fn lookup(&self, item_id: u64, kind: MediaKind, url: &str) -> Option<PathBuf> {
        let path = self.path_for(item_id, kind, url);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    /// Writes `bytes` atomically and returns the final path.
    pub async fn store(&self, item_id: u64, kind: MediaKind, url: &str, bytes: &[u8]) -> TransportResult<PathBuf> {
        let path = self.path_for(item_id, kind, url);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut part = path.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        fs::write(&part, bytes).await?;
        if let Err(e) = fs::rename(&part, &path).await {
            let _ = fs::remove_file(&part).await;
            return Err(e.into());
        }
        Ok(path)
    }

    /// Deletes every cached thumbnail; returns how many files were removed.
    pub async fn clear_thumbnails(&self) -> TransportResult<u64> {
        let dir = self.root.join(THUMBNAIL_DIR);
        let removed = remove_files_in(&dir).await?;
        info!(removed, "Thumbnail cache cleared");
        Ok(removed)
    }

    /// Deletes every cached file, thumbnails included.
    pub async fn clear_all(&self) -> TransportResult<u64> {
        let removed = remove_files_in(&self.root).await? + remove_files_in(&self.root.join(THUMBNAIL_DIR)).await?;
        info!(removed, "Media cache cleared");
        Ok(removed)
    }

    /// Total bytes of cached files.
    pub async fn size_bytes(&self) -> TransportResult<u64> {
        Ok(dir_size(&self.root).await? + dir_size(&self.root.join(THUMBNAIL_DIR)).await?)
    }
}

/// File extension of the URL path: alphanumeric, at most five characters,
/// lowercased; `jpg` otherwise.
pub fn extension_of(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= MAX_EXTENSION_LEN && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

async fn remove_files_in(dir: &Path) -> TransportResult<u64> {
    let mut removed = 0;
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn dir_size(dir: &Path) -> TransportResult<u64> {
    let mut total = 0;
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_comes_from_the_url_path() {
        assert_eq!(extension_of("https://cdn.example/upload/v/clip.MP4?sig=1"), "mp4");
        assert_eq!(extension_of("https://cdn.example/upload/photo"), "jpg");
        assert_eq!(extension_of("https://cdn.example/a.b/file.toolong"), "jpg");
        assert_eq!(extension_of("https://cdn.example/f.p-g"), "jpg");
        assert_eq!(extension_of("upload/doc.pdf#page=2"), "pdf");
    }

    #[tokio::test]
    async fn store_lookup_size_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path().join("media_cache")).await.unwrap();

        let url = "https://cdn.example/v.webm";
        assert!(cache.lookup(1, MediaKind::Full, url).await.is_none());

        let full = cache.store(1, MediaKind::Full, url, b"0123456789").await.unwrap();
        let thumb = cache.store(1, MediaKind::Thumbnail, url, b"abc").await.unwrap();
        assert!(full.ends_with("media_1.webm"));
        assert!(thumb.ends_with("thumbnails/thumb_1.jpg"));
        assert_eq!(cache.lookup(1, MediaKind::Full, url).await, Some(full.clone()));
        assert!(!full.with_file_name("media_1.webm.part").exists());
        assert_eq!(cache.size_bytes().await.unwrap(), 13);

        assert_eq!(cache.clear_thumbnails().await.unwrap(), 1);
        assert!(cache.lookup(1, MediaKind::Thumbnail, url).await.is_none());
        assert!(cache.lookup(1, MediaKind::Full, url).await.is_some());

        assert_eq!(cache.clear_all().await.unwrap(), 1);
        assert_eq!(cache.size_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn open_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(MediaCache::open(file.join("cache")).await.is_err());
    }
}
