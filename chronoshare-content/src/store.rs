//! Segmentation and reassembly of local files.

use std::path::{Path, PathBuf};

use chronoshare_types::{DataObject, Hash, Name};
use tokio::io::AsyncWriteExt;

use crate::{ContentError, ObjectDb};

/// Maximum payload bytes per segment object.
pub const MAX_SEGMENT_SIZE: usize = 1024;

/// Freshness (seconds) stamped on segment objects at creation.
const SEGMENT_FRESHNESS: u32 = 60;

/// Slices local files into named, signed, hash-addressed segment objects
/// and reassembles complete sub-stores back into files.
pub struct ObjectStore {
    db_root: PathBuf,
    app_name: String,
}

impl ObjectStore {
    /// Create a store rooted at `<root>/.chronoshare/`.
    pub async fn new(root: &Path, app_name: &str) -> Result<Self, ContentError> {
        let db_root = root.join(".chronoshare");
        tokio::fs::create_dir_all(&db_root).await?;
        Ok(Self {
            db_root,
            app_name: app_name.to_string(),
        })
    }

    /// The directory holding the `objects/` tree.
    pub fn db_root(&self) -> &Path {
        &self.db_root
    }

    /// The prefix all segments of one file share:
    /// `<device>/<app>/file/<hash>`.
    pub fn file_base_name(device: &Name, app_name: &str, hash: &Hash) -> Name {
        device
            .clone()
            .append(app_name)
            .append("file")
            .append_bytes(hash.as_bytes().to_vec())
    }

    /// The name of one segment: `<device>/<app>/file/<hash>/<segment>`.
    pub fn segment_name(device: &Name, app_name: &str, hash: &Hash, segment: u64) -> Name {
        Self::file_base_name(device, app_name, hash).append_number(segment)
    }

    /// Slice a local file into ≤1024-byte signed segment objects and
    /// persist them in the sub-store for the file's content hash.
    ///
    /// Returns the content hash and the number of segments. An empty file
    /// still produces exactly one zero-length segment.
    pub async fn segment_file(
        &self,
        path: &Path,
        device: &Name,
    ) -> Result<(Hash, u64), ContentError> {
        let content = tokio::fs::read(path).await?;
        let hash = Hash::digest(&content);
        let db = ObjectDb::open(&self.db_root, &hash).await?;

        let mut segment: u64 = 0;
        let mut chunks = content.chunks(MAX_SEGMENT_SIZE);
        loop {
            let chunk = match chunks.next() {
                Some(chunk) => chunk,
                // An empty file still gets one zero-length segment.
                None if segment == 0 => &[][..],
                None => break,
            };
            let name = Self::segment_name(device, &self.app_name, &hash, segment);
            let object = DataObject::with_freshness(name, chunk.to_vec(), SEGMENT_FRESHNESS);
            db.save_segment(device, segment, &object).await?;
            segment += 1;
            if chunk.is_empty() {
                break;
            }
        }

        tracing::debug!("segmented {} into {} segments ({})", path.display(), segment, hash);
        Ok((hash, segment))
    }

    /// Reassemble a complete sub-store into a file at `out_path`.
    ///
    /// Returns `false` without touching the filesystem when the sub-store
    /// is missing or any segment is unpopulated.
    pub async fn assemble_file(
        &self,
        device: &Name,
        hash: &Hash,
        out_path: &Path,
    ) -> Result<bool, ContentError> {
        if !ObjectDb::exists(&self.db_root, device, hash).await? {
            tracing::warn!("no complete object store for {} (device {})", hash, device);
            return Ok(false);
        }

        if let Some(parent) = out_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = ObjectDb::open(&self.db_root, hash).await?;
        let mut out = tokio::fs::File::create(out_path).await?;
        let mut segment: u64 = 0;
        while let Some(object) = db.fetch_segment(device, segment).await? {
            out.write_all(&object.content).await?;
            segment += 1;
        }
        out.flush().await?;

        Ok(true)
    }

    /// Whether every segment of `hash` from `device` is present.
    pub async fn does_complete(&self, device: &Name, hash: &Hash) -> Result<bool, ContentError> {
        ObjectDb::exists(&self.db_root, device, hash).await
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("db_root", &self.db_root)
            .field("app_name", &self.app_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Name {
        "/alice/laptop".parse().unwrap()
    }

    async fn store(dir: &Path) -> ObjectStore {
        ObjectStore::new(dir, "chronoshare").await.unwrap()
    }

    #[tokio::test]
    async fn three_kilobyte_file_makes_three_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let content = vec![0xAB; 3072];
        let file = dir.path().join("big.bin");
        tokio::fs::write(&file, &content).await.unwrap();

        let (hash, segments) = store.segment_file(&file, &device()).await.unwrap();
        assert_eq!(hash, Hash::digest(&content));
        assert_eq!(segments, 3);
    }

    #[tokio::test]
    async fn uneven_file_has_short_tail_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let content = vec![0x01; 2500];
        let file = dir.path().join("uneven.bin");
        tokio::fs::write(&file, &content).await.unwrap();

        let (hash, segments) = store.segment_file(&file, &device()).await.unwrap();
        assert_eq!(segments, 3);

        let db = ObjectDb::open(store.db_root(), &hash).await.unwrap();
        let tail = db.fetch_segment(&device(), 2).await.unwrap().unwrap();
        assert_eq!(tail.content.len(), 2500 - 2 * MAX_SEGMENT_SIZE);
    }

    #[tokio::test]
    async fn empty_file_makes_one_empty_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let file = dir.path().join("empty");
        tokio::fs::write(&file, b"").await.unwrap();

        let (hash, segments) = store.segment_file(&file, &device()).await.unwrap();
        assert_eq!(segments, 1);

        let db = ObjectDb::open(store.db_root(), &hash).await.unwrap();
        let only = db.fetch_segment(&device(), 0).await.unwrap().unwrap();
        assert!(only.content.is_empty());
    }

    #[tokio::test]
    async fn segment_then_assemble_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        // Not a multiple of the segment size, to exercise the tail.
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let file = dir.path().join("original.bin");
        tokio::fs::write(&file, &content).await.unwrap();

        let (hash, _) = store.segment_file(&file, &device()).await.unwrap();

        let restored_path = dir.path().join("restored.bin");
        let ok = store
            .assemble_file(&device(), &hash, &restored_path)
            .await
            .unwrap();
        assert!(ok);

        let restored = tokio::fs::read(&restored_path).await.unwrap();
        assert_eq!(restored, content);
    }

    #[tokio::test]
    async fn assemble_empty_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let file = dir.path().join("empty");
        tokio::fs::write(&file, b"").await.unwrap();
        let (hash, _) = store.segment_file(&file, &device()).await.unwrap();

        let out = dir.path().join("empty.restored");
        assert!(store.assemble_file(&device(), &hash, &out).await.unwrap());
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn assemble_unknown_hash_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let out = dir.path().join("never");
        let ok = store
            .assemble_file(&device(), &Hash::digest(b"unknown"), &out)
            .await
            .unwrap();
        assert!(!ok);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn does_complete_tracks_segment_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let content = vec![7u8; 2048];
        let file = dir.path().join("f.bin");
        tokio::fs::write(&file, &content).await.unwrap();
        let (hash, _) = store.segment_file(&file, &device()).await.unwrap();

        assert!(store.does_complete(&device(), &hash).await.unwrap());
        assert!(!store
            .does_complete(&device(), &Hash::digest(b"other"))
            .await
            .unwrap());
        // A different device has no copy.
        let other: Name = "/brian/laptop".parse().unwrap();
        assert!(!store.does_complete(&other, &hash).await.unwrap());
    }

    #[tokio::test]
    async fn segment_names_follow_the_convention() {
        let hash = Hash::digest(b"x");
        let name = ObjectStore::segment_name(&device(), "chronoshare", &hash, 4);
        // /alice/laptop/chronoshare/file/<hash>/<segment>
        assert_eq!(name.len(), 6);
        assert_eq!(name.component_from_back(3).unwrap().as_str(), Some("chronoshare"));
        assert_eq!(name.component_from_back(2).unwrap().as_str(), Some("file"));
        assert_eq!(name.component_from_back(1).unwrap().as_bytes(), hash.as_bytes());
        assert_eq!(name.component_from_back(0).unwrap().as_number(), Some(4));
    }
}
