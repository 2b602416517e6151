//! The on-disk blob store.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::debug;

use crate::Cid;

/// Errors from blob operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// No blob is stored under this cid.
    #[error("blob not found: {0}")]
    NotFound(Cid),
    /// The stored bytes no longer hash to their cid.
    #[error("blob integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// The cid the blob was stored under.
        expected: Cid,
        /// The hash the stored bytes actually produce.
        actual: Cid,
    },
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Append-only, content-addressed storage rooted at one directory.
///
/// Layout: `<root>/<hex[0..2]>/<full-hex-cid>`, with in-flight writes under
/// `*.tmp` names that are atomically renamed into place. Putting the same
/// bytes twice is a no-op.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, BlobError> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root)?;
        Ok(BlobStore { root })
    }

    fn blob_path(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid.shard()).join(cid.to_string())
    }

    /// Stores `data` and returns its cid. No-op if the blob already exists.
    pub fn put(&self, data: &[u8]) -> Result<Cid, BlobError> {
        let cid = Cid::hash(data);
        let path = self.blob_path(&cid);
        if path.exists() {
            return Ok(cid);
        }
        fs::create_dir_all(path.parent().expect("blob path has a shard dir"))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        debug!(%cid, size = data.len(), "stored blob");
        Ok(cid)
    }

    /// Stores everything `reader` yields, hashing while copying through a
    /// temp file, and returns the cid.
    pub fn put_stream(&self, mut reader: impl Read) -> Result<Cid, BlobError> {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let tmp = self.root.join(format!("ingest-{}.tmp", hex::encode(suffix)));

        let mut hasher = blake3::Hasher::new();
        let result: Result<Cid, BlobError> = (|| {
            let mut file = File::create(&tmp)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n])?;
            }
            file.sync_all()?;

            let cid = Cid::from(hasher.finalize());
            let path = self.blob_path(&cid);
            if path.exists() {
                fs::remove_file(&tmp)?;
                return Ok(cid);
            }
            fs::create_dir_all(path.parent().expect("blob path has a shard dir"))?;
            fs::rename(&tmp, &path)?;
            Ok(cid)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Reads a blob back, verifying its content against the cid.
    pub fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlobError> {
        let path = self.blob_path(cid);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(*cid))
            }
            Err(err) => return Err(err.into()),
        };
        let actual = Cid::hash(&data);
        if actual != *cid {
            return Err(BlobError::Integrity {
                expected: *cid,
                actual,
            });
        }
        Ok(data)
    }

    /// Whether a blob is present (without verifying it).
    pub fn has(&self, cid: &Cid) -> bool {
        self.blob_path(cid).exists()
    }

    /// Size in bytes of a stored blob.
    pub fn size(&self, cid: &Cid) -> Result<u64, BlobError> {
        match fs::metadata(self.blob_path(cid)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(*cid)),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes a blob. Removing an absent blob is a no-op.
    pub fn delete(&self, cid: &Cid) -> Result<(), BlobError> {
        match fs::remove_file(self.blob_path(cid)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Lazily walks the shard directories, yielding every stored cid.
    pub fn list(&self) -> impl Iterator<Item = Result<Cid, BlobError>> {
        Blobs::new(self.root.clone())
    }

    /// Removes every blob whose cid is not in `referenced`. Returns how many
    /// blobs were removed.
    pub fn gc(&self, referenced: &HashSet<Cid>) -> Result<usize, BlobError> {
        let mut removed = 0;
        for cid in self.list() {
            let cid = cid?;
            if !referenced.contains(&cid) {
                self.delete(&cid)?;
                removed += 1;
            }
        }
        debug!(removed, "blob gc done");
        Ok(removed)
    }
}

/// Lazy iterator over the store's cids.
#[derive(Debug)]
struct Blobs {
    shards: Option<fs::ReadDir>,
    current: Option<fs::ReadDir>,
}

impl Blobs {
    fn new(root: PathBuf) -> Self {
        Blobs {
            shards: fs::read_dir(root).ok(),
            current: None,
        }
    }
}

impl Iterator for Blobs {
    type Item = Result<Cid, BlobError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(dir) = &mut self.current {
                for entry in dir.by_ref() {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(err) => return Some(Err(err.into())),
                    };
                    // Skip temp files and anything that is not a cid name.
                    if let Ok(cid) = entry.file_name().to_string_lossy().parse::<Cid>() {
                        return Some(Ok(cid));
                    }
                }
                self.current = None;
            }

            let shards = self.shards.as_mut()?;
            let shard = match shards.next()? {
                Ok(shard) => shard,
                Err(err) => return Some(Err(err.into())),
            };
            let path = shard.path();
            if path.is_dir() && shard.file_name().len() == 2 {
                self.current = fs::read_dir(path).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = store();
        let cid = store.put(b"some bytes").unwrap();
        assert_eq!(cid, Cid::hash(b"some bytes"));
        assert_eq!(store.get(&cid).unwrap(), b"some bytes");
        assert!(store.has(&cid));
        assert_eq!(store.size(&cid).unwrap(), 10);
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let first = store.put(b"same").unwrap();
        let second = store.put(b"same").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list().count(), 1);
    }

    #[test]
    fn put_stream_matches_put() {
        let (_dir, store) = store();
        let data = vec![42u8; 200 * 1024];
        let streamed = store.put_stream(&data[..]).unwrap();
        assert_eq!(streamed, Cid::hash(&data));
        assert_eq!(store.get(&streamed).unwrap(), data);
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(store.root.clone())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn sharded_layout_on_disk() {
        let (_dir, store) = store();
        let cid = store.put(b"layout").unwrap();
        let expected = store
            .root
            .join(&cid.to_string()[..2])
            .join(cid.to_string());
        assert!(expected.exists());
    }

    #[test]
    fn corrupted_blob_fails_integrity_check() {
        let (_dir, store) = store();
        let cid = store.put(b"pristine").unwrap();
        fs::write(store.blob_path(&cid), b"tampered").unwrap();
        match store.get(&cid) {
            Err(BlobError::Integrity { expected, .. }) => assert_eq!(expected, cid),
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        let cid = Cid::hash(b"never stored");
        assert!(matches!(store.get(&cid), Err(BlobError::NotFound(_))));
        assert!(matches!(store.size(&cid), Err(BlobError::NotFound(_))));
        assert!(!store.has(&cid));
        store.delete(&cid).unwrap();
    }

    #[test]
    fn gc_keeps_only_referenced_blobs() {
        let (_dir, store) = store();
        let keep = store.put(b"keep me").unwrap();
        store.put(b"drop me").unwrap();
        store.put(b"drop me too").unwrap();

        let referenced: HashSet<Cid> = [keep].into_iter().collect();
        let removed = store.gc(&referenced).unwrap();
        assert_eq!(removed, 2);
        assert!(store.has(&keep));
        assert_eq!(store.list().count(), 1);
    }
}
