//! Image media storage.
//!
//! Clients send images inline as base64 or data URLs. Before an image
//! message is persisted or broadcast, its payload is written once to a
//! content-addressed file and the content is replaced by that file's public
//! path.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use crate::message::generate_id;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Extension used when the payload does not name one.
const DEFAULT_EXTENSION: &str = "png";

/// Media errors.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Image is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("Image is empty")]
    Empty,

    #[error("Media I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns inline image payloads into stable references.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store an encoded image and return its public reference.
    ///
    /// Storing the same bytes twice yields the same reference.
    async fn store_image(&self, encoded: &str) -> Result<String, MediaError>;
}

/// A decoded inline image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub extension: String,
    pub bytes: Vec<u8>,
}

impl InlineImage {
    /// Decode a `data:image/<ext>;base64,...` URL or bare base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not base64 or decodes to nothing.
    pub fn decode(encoded: &str) -> Result<Self, MediaError> {
        let (extension, payload) = split_data_url(encoded.trim());
        let bytes = STANDARD.decode(payload)?;
        if bytes.is_empty() {
            return Err(MediaError::Empty);
        }
        Ok(Self {
            extension: extension.unwrap_or(DEFAULT_EXTENSION).to_string(),
            bytes,
        })
    }

    /// Hex SHA-256 of the decoded bytes.
    #[must_use]
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(&self.bytes);
        let mut hex = String::with_capacity(hash.len() * 2);
        for byte in hash {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    /// Content-addressed file name.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.digest(), self.extension)
    }
}

/// Split `data:image/png;base64,AAAA` into `(Some("png"), "AAAA")`.
fn split_data_url(encoded: &str) -> (Option<&str>, &str) {
    let Some(rest) = encoded.strip_prefix("data:") else {
        return (None, encoded);
    };
    let Some((header, payload)) = rest.split_once(',') else {
        return (None, encoded);
    };

    let extension = header
        .strip_prefix("image/")
        .and_then(|h| h.split(';').next())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    (extension, payload)
}

/// Filesystem-backed media store.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    dir: PathBuf,
    public_prefix: String,
}

impl FsMediaStore {
    /// Create a store writing into `dir`, served under `public_prefix`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_prefix: public_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Directory files are written into.
    #[must_use]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn store_image(&self, encoded: &str) -> Result<String, MediaError> {
        let image = InlineImage::decode(encoded)?;
        let file_name = image.file_name();
        let path = self.dir.join(&file_name);

        if tokio::fs::try_exists(&path).await? {
            debug!(file = %file_name, "Image already stored");
        } else {
            tokio::fs::create_dir_all(&self.dir).await?;
            // Each writer fills its own temp file; the link publishes it whole
            let tmp = self
                .dir
                .join(format!(".{file_name}.{}.tmp", generate_id("w")));
            tokio::fs::write(&tmp, &image.bytes).await?;
            let published = tokio::fs::hard_link(&tmp, &path).await;
            let _ = tokio::fs::remove_file(&tmp).await;

            match published {
                Ok(()) => {
                    debug!(file = %file_name, bytes = image.bytes.len(), "Image stored");
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(file = %file_name, "Image stored concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(format!("{}/{}", self.public_prefix, file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1x1 transparent PNG
    const PIXEL: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "parlor-media-{name}-{}",
            crate::message::generate_id("t")
        ))
    }

    #[test]
    fn test_decode_data_url() {
        let image = InlineImage::decode(&format!("data:image/jpeg;base64,{PIXEL}")).unwrap();
        assert_eq!(image.extension, "jpeg");

        let bare = InlineImage::decode(PIXEL).unwrap();
        assert_eq!(bare.extension, "png");
        assert_eq!(bare.bytes, image.bytes);
        assert_eq!(bare.digest().len(), 64);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            InlineImage::decode("not base64!!"),
            Err(MediaError::InvalidEncoding(_))
        ));
        assert!(matches!(
            InlineImage::decode("data:image/png;base64,"),
            Err(MediaError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_store_is_content_addressed() {
        let dir = scratch_dir("idempotent");
        let store = FsMediaStore::new(&dir, "/assets/images/");

        let first = store
            .store_image(&format!("data:image/png;base64,{PIXEL}"))
            .await
            .unwrap();
        let second = store
            .store_image(&format!("data:image/png;base64,{PIXEL}"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("/assets/images/"));
        assert!(first.ends_with(".png"));

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_store_one_file() {
        let dir = scratch_dir("concurrent");
        let store = std::sync::Arc::new(FsMediaStore::new(&dir, "/assets/images"));

        let bytes: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let encoded = format!("data:image/png;base64,{}", STANDARD.encode(&bytes));

        for _ in 0..10 {
            let mut handles = Vec::new();
            for _ in 0..16 {
                let store = store.clone();
                let encoded = encoded.clone();
                handles.push(tokio::spawn(
                    async move { store.store_image(&encoded).await },
                ));
            }

            let mut references = Vec::new();
            for handle in handles {
                references.push(handle.await.unwrap().unwrap());
            }
            references.dedup();
            assert_eq!(references.len(), 1);

            let files: Vec<_> = std::fs::read_dir(&dir)
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .collect();
            assert_eq!(files.len(), 1, "temp files left behind: {files:?}");
            assert_eq!(std::fs::read(&files[0]).unwrap(), bytes);

            std::fs::remove_dir_all(&dir).unwrap();
        }
    }
}
