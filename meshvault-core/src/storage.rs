//! Content-addressed on-disk blob storage
//!
//! Keys are mapped to a sharded directory layout through a path transform.
//! The default transform hashes the *key* (not the file bytes) with SHA-1
//! and splits the hex digest into 5-character directory segments, so the
//! location of a blob is a pure function of its key.

use sha1::{Digest, Sha1};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::crypto::{copy_decrypt, CipherError, EncryptionKey};

/// Width of each directory segment produced by [`cas_path_transform`]
pub const SEGMENT_WIDTH: usize = 5;

/// Number of lock stripes used to serialise writers and deletes of a shard
const LOCK_STRIPES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of a blob relative to the storage root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathKey {
    /// Nested directory components, `/`-separated
    pub path_name: String,
    pub file_name: String,
}

impl PathKey {
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path_name, self.file_name)
    }

    /// Top-level directory of this key; deleting it removes the whole shard
    pub fn first_segment(&self) -> &str {
        self.path_name
            .split('/')
            .next()
            .unwrap_or(&self.path_name)
    }
}

/// Maps a logical key to its on-disk location
pub type PathTransformFn = fn(&str) -> PathKey;

/// SHA-1 the key and split the 40-char hex digest into 8 segments of 5
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = hash
        .as_bytes()
        .chunks(SEGMENT_WIDTH)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();
    let path_name = segments.join("/");

    PathKey {
        path_name,
        file_name: hash,
    }
}

/// Store each key verbatim under a directory of the same name
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}

/// Filesystem-backed blob store scoped to a root directory
pub struct Store {
    root: PathBuf,
    transform: PathTransformFn,
    /// Writers and deleters of the same shard are serialised through these
    stripes: Vec<Mutex<()>>,
}

impl Store {
    /// Create a store using the content-addressed path transform
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_transform(root, cas_path_transform)
    }

    pub fn with_transform(root: impl Into<PathBuf>, transform: PathTransformFn) -> Self {
        Self {
            root: root.into(),
            transform,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the path key for `key`; never cached
    pub fn path_key(&self, key: &str) -> PathKey {
        (self.transform)(key)
    }

    fn full_path(&self, path_key: &PathKey) -> PathBuf {
        self.root.join(&path_key.path_name).join(&path_key.file_name)
    }

    /// A delete removes the whole first segment, so keys sharing it share a stripe
    fn stripe_index(path_key: &PathKey) -> usize {
        Sha1::digest(path_key.first_segment().as_bytes())[0] as usize % LOCK_STRIPES
    }

    async fn lock_key(&self, path_key: &PathKey) -> MutexGuard<'_, ()> {
        self.stripes[Self::stripe_index(path_key)].lock().await
    }

    /// Check whether a blob exists for `key`
    pub async fn has(&self, key: &str) -> bool {
        let path_key = self.path_key(key);
        fs::metadata(self.full_path(&path_key)).await.is_ok()
    }

    /// Write the reader's bytes verbatim, returning the number of bytes written
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_from(key, WriteSource::Plain(reader)).await
    }

    /// Decrypt an IV-prefixed stream and persist the plaintext
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &EncryptionKey,
        key: &str,
        reader: &mut R,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_from(key, WriteSource::Encrypted(enc_key, reader))
            .await
    }

    /// Stream into a temporary file, then rename it over the final path
    async fn write_from<R>(
        &self,
        key: &str,
        source: WriteSource<'_, R>,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path_key = self.path_key(key);
        let _guard = self.lock_key(&path_key).await;

        let dir = self.root.join(&path_key.path_name);
        fs::create_dir_all(&dir).await?;

        let full_path = dir.join(&path_key.file_name);
        let tmp_path = dir.join(format!(
            "{}.partial-{:08x}",
            path_key.file_name,
            rand::random::<u32>()
        ));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            let n = match source {
                WriteSource::Plain(reader) => tokio::io::copy(reader, &mut file).await?,
                WriteSource::Encrypted(enc_key, reader) => {
                    copy_decrypt(enc_key, reader, &mut file).await?
                }
            };
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &full_path).await?;
            Ok::<u64, StorageError>(n)
        }
        .await;

        match result {
            Ok(n) => {
                info!("Wrote {} bytes to {}", n, full_path.display());
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    /// Open the blob for `key`, returning its size and a readable handle
    pub async fn read(&self, key: &str) -> Result<(u64, File), StorageError> {
        let path_key = self.path_key(key);
        let full_path = self.full_path(&path_key);

        let file = match File::open(&full_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        debug!("Opened {} ({} bytes)", full_path.display(), size);
        Ok((size, file))
    }

    /// Remove the whole shard subtree that `key` lives in
    ///
    /// Every other key sharing the first path segment is removed as well.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path_key = self.path_key(key);
        let _guard = self.lock_key(&path_key).await;

        let shard = self.root.join(path_key.first_segment());
        match fs::remove_dir_all(&shard).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("Deleted {}", path_key.full_path());
        Ok(())
    }

    /// Remove the entire storage root
    pub async fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("Cleared store at {}", self.root.display());
        Ok(())
    }
}

enum WriteSource<'a, R: ?Sized> {
    Plain(&'a mut R),
    Encrypted(&'a EncryptionKey, &'a mut R),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::copy_encrypt;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn new_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("store"));
        (dir, store)
    }

    async fn read_all(store: &Store, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size as usize, buf.len());
        buf
    }

    #[test]
    fn test_path_transform() {
        let path_key = cas_path_transform("momsbestpicture");
        assert_eq!(path_key.file_name, "6804429f74181a63c50c3d81d733a12f14a353ff");
        assert_eq!(
            path_key.path_name,
            "68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff"
        );
        assert_eq!(
            path_key.full_path(),
            "68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff/6804429f74181a63c50c3d81d733a12f14a353ff"
        );
        assert_eq!(path_key.first_segment(), "68044");
    }

    #[test]
    fn test_path_transform_shape() {
        for key in ["", "a", "some/key with spaces", "\u{1F600}"] {
            let path_key = cas_path_transform(key);
            assert_eq!(path_key.file_name.len(), 40);
            assert!(path_key.file_name.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));

            let segments: Vec<&str> = path_key.path_name.split('/').collect();
            assert_eq!(segments.len(), 8);
            assert!(segments.iter().all(|s| s.len() == SEGMENT_WIDTH));
            assert_eq!(segments.concat(), path_key.file_name);
        }
    }

    #[tokio::test]
    async fn test_store_write_read_delete() {
        let (_dir, store) = new_store();

        for i in 0..50 {
            let key = format!("foo_{}", i);
            let data = b"some jpg bytes";

            let n = store.write(&key, &mut &data[..]).await.unwrap();
            assert_eq!(n as usize, data.len());
            assert!(store.has(&key).await, "expected key {} to exist", key);

            assert_eq!(read_all(&store, &key).await, data);

            store.delete(&key).await.unwrap();
            assert!(!store.has(&key).await, "expected key {} to be deleted", key);
        }
    }

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let (_dir, store) = new_store();

        store.write("key", &mut &b"first version"[..]).await.unwrap();
        store.write("key", &mut &b"v2"[..]).await.unwrap();
        assert_eq!(read_all(&store, "key").await, b"v2");

        // No temporary files left next to the blob
        let path_key = store.path_key("key");
        let mut entries = fs::read_dir(store.root().join(&path_key.path_name))
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![path_key.file_name]);
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let (_dir, store) = new_store();
        assert!(!store.has("nope").await);
        assert!(matches!(
            store.read("nope").await,
            Err(StorageError::NotFound(k)) if k == "nope"
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_whole_shard() {
        let (_dir, store) = new_store();

        // Find two keys whose hashes share the first segment
        let mut seen: HashMap<String, String> = HashMap::new();
        let (a, b) = (0..200_000)
            .find_map(|i| {
                let key = format!("key-{}", i);
                let segment = cas_path_transform(&key).first_segment().to_string();
                seen.insert(segment, key.clone()).map(|other| (other, key))
            })
            .expect("no shard collision found");
        let unrelated = (0..)
            .map(|i| format!("other-{}", i))
            .find(|k| {
                cas_path_transform(k).first_segment() != cas_path_transform(&a).first_segment()
            })
            .unwrap();

        for key in [&a, &b, &unrelated] {
            store.write(key, &mut &b"data"[..]).await.unwrap();
        }

        store.delete(&a).await.unwrap();
        assert!(!store.has(&a).await);
        assert!(!store.has(&b).await);
        assert!(store.has(&unrelated).await);
    }

    fn shared_shard_transform(key: &str) -> PathKey {
        PathKey {
            path_name: format!("shard/{}", key),
            file_name: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_write_survives_concurrent_shard_delete() {
        let dir = TempDir::new().unwrap();
        let store = Store::with_transform(dir.path().join("store"), shared_shard_transform);

        let (a, b) = (store.path_key("a"), store.path_key("b"));
        assert_eq!(a.first_segment(), b.first_segment());
        assert_eq!(Store::stripe_index(&a), Store::stripe_index(&b));

        for _ in 0..50 {
            let mut src = &b"sibling"[..];
            let (written, deleted) = tokio::join!(
                store.write("b", &mut src),
                store.delete("a"),
            );
            assert_eq!(written.unwrap(), 7);
            deleted.unwrap();
        }

        // Whichever ran last, the shard is either gone or holds a whole blob
        if store.has("b").await {
            assert_eq!(read_all(&store, "b").await, b"sibling");
        }
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_ok() {
        let (_dir, store) = new_store();
        store.delete("never-written").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_decrypt() {
        let (_dir, store) = new_store();
        let enc_key = EncryptionKey::generate();
        let data = b"encrypted on the wire";

        let mut ciphertext = Vec::new();
        copy_encrypt(&enc_key, &mut &data[..], &mut ciphertext)
            .await
            .unwrap();

        let n = store
            .write_decrypt(&enc_key, "secret", &mut &ciphertext[..])
            .await
            .unwrap();
        assert_eq!(n as usize, data.len());
        assert_eq!(read_all(&store, "secret").await, data);
    }

    #[tokio::test]
    async fn test_write_decrypt_short_input_leaves_no_blob() {
        let (_dir, store) = new_store();
        let enc_key = EncryptionKey::generate();

        let result = store
            .write_decrypt(&enc_key, "broken", &mut &[1u8, 2, 3][..])
            .await;
        assert!(matches!(
            result,
            Err(StorageError::Cipher(CipherError::ShortInput(3)))
        ));
        assert!(!store.has("broken").await);
    }

    #[tokio::test]
    async fn test_clear() {
        let (_dir, store) = new_store();
        store.write("a", &mut &b"1"[..]).await.unwrap();
        store.write("b", &mut &b"2"[..]).await.unwrap();

        store.clear().await.unwrap();
        assert!(!store.root().exists());
        assert!(!store.has("a").await);

        // Clearing twice is fine
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_transform() {
        let dir = TempDir::new().unwrap();
        let store = Store::with_transform(dir.path(), identity_path_transform);

        store.write("plain", &mut &b"bytes"[..]).await.unwrap();
        assert!(dir.path().join("plain").join("plain").exists());
        assert_eq!(read_all(&store, "plain").await, b"bytes");
    }
}
