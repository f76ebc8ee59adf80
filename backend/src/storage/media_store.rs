use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Local-disk store for uploaded images, keyed by content hash so repeated
/// uploads of the same bytes land on the same path.
#[derive(Clone)]
pub struct MediaStore {
    root: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaStoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file format")]
    InvalidFormat,
    #[error("file too large")]
    FileTooLarge,
}

const MAX_SIZE: usize = 50 * 1024 * 1024;

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn calculate_image_hash(image_data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image_data);
        hex::encode(hasher.finalize())
    }

    pub fn generate_key(user_id: Uuid, image_hash: &str, file_extension: &str) -> String {
        format!("images/{}/{}.{}", user_id, image_hash, file_extension)
    }

    pub fn extract_file_extension(mime_type: &str) -> Result<&str, MediaStoreError> {
        match mime_type {
            "image/jpeg" => Ok("jpg"),
            "image/png" => Ok("png"),
            "image/webp" => Ok("webp"),
            "image/gif" => Ok("gif"),
            // Float-valued formats mobile clients use for pre-normalized tensors.
            "image/tiff" => Ok("tiff"),
            "image/x-exr" | "image/aces" => Ok("exr"),
            _ => Err(MediaStoreError::InvalidFormat),
        }
    }

    pub fn validate_image_size(image_data: &[u8]) -> Result<(), MediaStoreError> {
        if image_data.len() > MAX_SIZE {
            return Err(MediaStoreError::FileTooLarge);
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Persists the bytes and returns their store key.
    pub fn save_image(
        &self,
        user_id: Uuid,
        image_data: &[u8],
        mime_type: &str,
    ) -> Result<String, MediaStoreError> {
        MediaStore::validate_image_size(image_data)?;
        let extension = MediaStore::extract_file_extension(mime_type)?;
        let hash = MediaStore::calculate_image_hash(image_data);
        let key = MediaStore::generate_key(user_id, &hash, extension);

        let path = self.resolve(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, image_data)?;
        Ok(key)
    }

    pub fn load_image(&self, key: &str) -> Result<Vec<u8>, MediaStoreError> {
        Ok(fs::read(self.resolve(key))?)
    }

    pub fn delete_image(&self, key: &str) -> Result<(), MediaStoreError> {
        let path = self.resolve(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MediaStoreError::Io(e)),
        }
    }

    pub fn delete_images(&self, keys: &[String]) -> Result<(), MediaStoreError> {
        for key in keys {
            self.delete_image(key)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());
        let user_id = Uuid::new_v4();

        let key = store.save_image(user_id, b"fake jpeg bytes", "image/jpeg").unwrap();
        assert!(key.starts_with(&format!("images/{user_id}/")));
        assert!(key.ends_with(".jpg"));
        assert_eq!(store.load_image(&key).unwrap(), b"fake jpeg bytes");

        store.delete_image(&key).unwrap();
        assert!(store.load_image(&key).is_err());
        // Deleting an absent key is not an error.
        store.delete_image(&key).unwrap();
    }

    #[test]
    fn identical_bytes_map_to_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());
        let user_id = Uuid::new_v4();

        let first = store.save_image(user_id, b"same", "image/png").unwrap();
        let second = store.save_image(user_id, b"same", "image/png").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_mime_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());
        let result = store.save_image(Uuid::new_v4(), b"x", "application/pdf");
        assert!(matches!(result, Err(MediaStoreError::InvalidFormat)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(matches!(
            MediaStore::validate_image_size(&vec![0u8; MAX_SIZE + 1]),
            Err(MediaStoreError::FileTooLarge)
        ));
    }
}
