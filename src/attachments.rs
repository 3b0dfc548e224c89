use crate::ids;
use base64::{engine::general_purpose, Engine as _};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Extension used when a data URL carries no usable image header.
pub const FALLBACK_EXTENSION: &str = "png";

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Turns a stored file path into something the front end can render.
pub trait DisplayResolver: Send + Sync {
    fn resolve(&self, path: &Path) -> String;
}

/// `file://` locators, for hosts that can read local files directly.
pub struct FileUrlResolver;

impl DisplayResolver for FileUrlResolver {
    fn resolve(&self, path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

/// Image blobs on disk, one file per attachment. Messages keep only the file
/// name.
pub struct AttachmentStore {
    dir: PathBuf,
    resolver: Arc<dyn DisplayResolver>,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, AttachmentError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(path = %dir.display(), "image storage ready");
        Ok(Self {
            dir,
            resolver: Arc::new(FileUrlResolver),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DisplayResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Decodes a base64 data URL, writes it under a fresh name and returns
    /// that name.
    pub async fn save_image(&self, data_url: &str) -> Result<String, AttachmentError> {
        let (extension, payload) = parse_data_url(data_url);
        let bytes = general_purpose::STANDARD.decode(payload.trim())?;
        let filename = ids::image_filename(&extension);
        tokio::fs::write(self.dir.join(&filename), bytes).await?;
        debug!(%filename, "image saved");
        Ok(filename)
    }

    /// Best-effort removal; a missing file is not an error.
    pub async fn delete_image(&self, filename: &str) -> Result<(), AttachmentError> {
        let Some(path) = self.path_for(filename) else {
            warn!(%filename, "refusing to delete image outside storage directory");
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%filename, "image deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(%filename, "image already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every listed file, logging failures instead of returning them.
    pub async fn delete_images(&self, filenames: &[String]) {
        for filename in filenames {
            if let Err(e) = self.delete_image(filename).await {
                warn!(%filename, error = %e, "could not delete image");
            }
        }
    }

    pub fn display_reference(&self, filename: &str) -> Option<String> {
        self.path_for(filename)
            .map(|path| self.resolver.resolve(&path))
    }

    /// Stored names are bare file names; anything with a path component is
    /// rejected.
    fn path_for(&self, filename: &str) -> Option<PathBuf> {
        let is_plain = !filename.is_empty()
            && Path::new(filename).file_name().and_then(|n| n.to_str()) == Some(filename)
            && filename != "."
            && filename != "..";
        is_plain.then(|| self.dir.join(filename))
    }
}

/// Splits `data:image/<ext>;base64,<payload>` into extension and payload.
/// Without a recognizable header the whole input is the payload.
pub fn parse_data_url(data_url: &str) -> (String, &str) {
    let parsed = data_url
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split_once(";base64,"))
        .filter(|(ext, _)| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_lowercase()));
    match parsed {
        Some((ext, payload)) if !payload.is_empty() => (ext.to_string(), payload),
        _ => (FALLBACK_EXTENSION.to_string(), data_url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const HELLO_PNG: &str = "data:image/png;base64,aGVsbG8=";

    #[test]
    fn test_parse_data_url() {
        assert_eq!(parse_data_url(HELLO_PNG), ("png".to_string(), "aGVsbG8="));
        assert_eq!(
            parse_data_url("data:image/jpeg;base64,AAAA"),
            ("jpeg".to_string(), "AAAA")
        );
        assert_eq!(parse_data_url("aGVsbG8="), ("png".to_string(), "aGVsbG8="));
        assert_eq!(
            parse_data_url("data:image/svg+xml;base64,AAAA"),
            ("png".to_string(), "data:image/svg+xml;base64,AAAA")
        );
    }

    #[tokio::test]
    async fn test_save_writes_decoded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let name = store.save_image(HELLO_PNG).await.unwrap();
        assert!(name.ends_with(".png"));
        assert_eq!(std::fs::read(dir.path().join(&name)).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_headerless_payload_uses_fallback_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let name = store.save_image("aGVsbG8=").await.unwrap();
        assert!(name.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_concurrent_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let saves = (0..50).map(|_| store.save_image(HELLO_PNG));
        let names = futures::future::try_join_all(saves).await.unwrap();
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), 50);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 50);
    }

    #[tokio::test]
    async fn test_invalid_base64_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let err = store.save_image("data:image/png;base64,@@@").await.unwrap_err();
        assert!(matches!(err, AttachmentError::Decode(_)));
    }

    #[tokio::test]
    async fn test_delete_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let name = store.save_image(HELLO_PNG).await.unwrap();
        store.delete_image(&name).await.unwrap();
        assert!(!dir.path().join(&name).exists());
        store.delete_image(&name).await.unwrap();
        store.delete_image("../escape.png").await.unwrap();
    }

    #[test]
    fn test_display_reference_uses_resolver() {
        struct Webview;
        impl DisplayResolver for Webview {
            fn resolve(&self, path: &Path) -> String {
                format!("webview://{}", path.file_name().unwrap().to_string_lossy())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path())
            .unwrap()
            .with_resolver(Arc::new(Webview));
        assert_eq!(
            store.display_reference("img_1.png").as_deref(),
            Some("webview://img_1.png")
        );
        assert_eq!(store.display_reference("a/b.png"), None);
    }
}
