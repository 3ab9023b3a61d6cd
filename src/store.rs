//! Content-addressed storage for task outputs.
//!
//! Every artifact a task hands to another task goes through a [`BlobStore`].
//! Blobs are immutable once written; readers get their own local copy.

use std::fmt::{self, Display};
use std::fs;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::engine::TaskId;
use crate::error::StoreError;

/// Opaque identifier of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub(crate) String);

impl BlobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to an immutable artifact in a [`BlobStore`].
///
/// Two refs are equal when they name the same content, regardless of which
/// task wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: BlobId,
    pub size_bytes: u64,
    /// Task that wrote the blob, `None` for workflow inputs.
    pub origin: Option<TaskId>,
}

impl PartialEq for BlobRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.size_bytes == other.size_bytes
    }
}

impl Eq for BlobRef {}

impl Hash for BlobRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.size_bytes.hash(state);
    }
}

/// Every [`BlobRef`] embedded in a serialized task result.
pub(crate) fn blobs_in(value: &Value) -> Vec<BlobRef> {
    let mut found = Vec::new();
    collect_blobs(value, &mut found);
    found
}

fn collect_blobs(value: &Value, found: &mut Vec<BlobRef>) {
    match value {
        Value::Map(entries) => {
            let has = |key: &str| entries.iter().any(|(k, _)| k.as_text() == Some(key));
            if has("id")
                && has("size_bytes")
                && let Ok(blob) = value.deserialized::<BlobRef>()
            {
                found.push(blob);
                return;
            }
            for (_, nested) in entries {
                collect_blobs(nested, found);
            }
        }
        Value::Array(items) => {
            for nested in items {
                collect_blobs(nested, found);
            }
        }
        Value::Tag(_, nested) => collect_blobs(nested, found),
        _ => {}
    }
}

/// How a reader intends to use a local copy of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The copy is never modified, it may share storage with the blob.
    ReadOnly,
    /// The copy is a private, writable file.
    Mutable,
}

pub trait BlobStore: Send + Sync {
    /// Stores the file at `local` and returns a reference to it.
    fn put(&self, local: &Utf8Path, origin: Option<TaskId>) -> Result<BlobRef, StoreError>;

    /// Materializes `blob` at `local`.
    fn get(&self, blob: &BlobRef, local: &Utf8Path, access: Access) -> Result<(), StoreError>;

    /// Size of a stored blob in bytes.
    fn size(&self, blob: &BlobRef) -> Result<u64, StoreError>;

    /// Whether the content behind `blob` is still present. A ref this store
    /// could never have produced is not present.
    fn contains(&self, blob: &BlobRef) -> bool;

    /// Stores `local` if it exists. A missing file is not an error, it is
    /// reported as `None` so callers can branch on it.
    fn put_if_present(
        &self,
        local: &Utf8Path,
        origin: Option<TaskId>,
    ) -> Result<Option<BlobRef>, StoreError> {
        match fs::metadata(local) {
            Ok(_) => self.put(local, origin).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// A [`BlobStore`] backed by a local directory.
///
/// Blobs live under `<root>/<hex[..2]>/<hex>` and are made read-only once
/// published. Nothing is ever deleted.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: Utf8PathBuf,
    counter: AtomicU64,
}

impl LocalBlobStore {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp"))?;

        Ok(Self {
            root,
            counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Where a blob lives. Ids are the lowercase hex of a [`Hash32`], anything
    /// else never names a blob of this store.
    fn path_of(&self, id: &BlobId) -> Result<Utf8PathBuf, StoreError> {
        let hex = id.as_str();
        let valid = hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(StoreError::InvalidId(id.clone()));
        }

        Ok(self.root.join(&hex[..2]).join(hex))
    }

    fn scratch(&self) -> Utf8PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("{}-{n}", std::process::id()))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, local: &Utf8Path, origin: Option<TaskId>) -> Result<BlobRef, StoreError> {
        let id = BlobId(Hash32::of_file(local)?.to_hex());
        let path = self.path_of(&id)?;

        if !path.exists() {
            // Publish through a rename so readers never see a partial blob.
            let scratch = self.scratch();
            fs::copy(local, &scratch)?;

            let mut perms = fs::metadata(&scratch)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&scratch, perms)?;

            fs::create_dir_all(path.parent().unwrap_or(&self.root))?;
            fs::rename(&scratch, &path)?;
        }

        let size_bytes = fs::metadata(&path)?.len();
        tracing::debug!("stored {local} as {id} ({size_bytes} bytes)");

        Ok(BlobRef {
            id,
            size_bytes,
            origin,
        })
    }

    fn get(&self, blob: &BlobRef, local: &Utf8Path, access: Access) -> Result<(), StoreError> {
        let path = self.path_of(&blob.id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(blob.id.clone()));
        }

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        if local.exists() {
            fs::remove_file(local)?;
        }

        match access {
            Access::ReadOnly => {
                if fs::hard_link(&path, local).is_err() {
                    fs::copy(&path, local)?;
                }
            }
            Access::Mutable => {
                fs::copy(&path, local)?;
                let mut perms = fs::metadata(local)?.permissions();
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                fs::set_permissions(local, perms)?;
            }
        }

        Ok(())
    }

    fn size(&self, blob: &BlobRef) -> Result<u64, StoreError> {
        match fs::metadata(self.path_of(&blob.id)?) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(blob.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn contains(&self, blob: &BlobRef) -> bool {
        self.path_of(&blob.id).is_ok_and(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::testing::utf8;

    #[test]
    fn test_put_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let store = LocalBlobStore::open(root.join("store")).unwrap();

        fs::write(root.join("a.fa"), ">chr1\nACGT\n").unwrap();
        fs::write(root.join("b.fa"), ">chr1\nACGT\n").unwrap();

        let a = store.put(&root.join("a.fa"), None).unwrap();
        let b = store.put(&root.join("b.fa"), Some(TaskId(7))).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.size_bytes, 11);
        assert_eq!(b.origin, Some(TaskId(7)));
        assert_eq!(store.size(&a).unwrap(), 11);
    }

    #[test]
    fn test_mutable_copy_does_not_touch_blob() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let store = LocalBlobStore::open(root.join("store")).unwrap();

        fs::write(root.join("in.paf"), "q\t10\n").unwrap();
        let blob = store.put(&root.join("in.paf"), None).unwrap();

        let copy = root.join("work/edit.paf");
        store.get(&blob, &copy, Access::Mutable).unwrap();
        fs::write(&copy, "changed").unwrap();

        let again = root.join("work/again.paf");
        store.get(&blob, &again, Access::ReadOnly).unwrap();
        assert_eq!(fs::read_to_string(again).unwrap(), "q\t10\n");
    }

    #[test]
    fn test_missing_blob_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let store = LocalBlobStore::open(root.join("store")).unwrap();

        let ghost = BlobRef {
            id: BlobId(Hash32::of_bytes(b"ghost").to_hex()),
            size_bytes: 5,
            origin: None,
        };

        assert!(!store.contains(&ghost));
        assert!(matches!(store.size(&ghost), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.get(&ghost, &root.join("x"), Access::ReadOnly),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_put_if_present_branches_on_presence() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let store = LocalBlobStore::open(root.join("store")).unwrap();

        let absent = store
            .put_if_present(&root.join("chr1.paf.secondary"), None)
            .unwrap();
        assert!(absent.is_none());

        fs::write(root.join("chr1.paf.secondary"), "sec").unwrap();
        let present = store
            .put_if_present(&root.join("chr1.paf.secondary"), None)
            .unwrap();
        assert_eq!(present.map(|b| b.size_bytes), Some(3));
    }

    #[test]
    fn test_malformed_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let store = LocalBlobStore::open(root.join("store")).unwrap();

        for id in ["a", "ü", "../../etc", &"A".repeat(64)] {
            let blob: BlobRef = serde_json::from_value(serde_json::json!({
                "id": id,
                "size_bytes": 1,
                "origin": null,
            }))
            .unwrap();

            assert!(!store.contains(&blob));
            assert!(matches!(store.size(&blob), Err(StoreError::InvalidId(_))));
            assert!(matches!(
                store.get(&blob, &root.join("x"), Access::ReadOnly),
                Err(StoreError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn test_blobs_in_nested_results() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let store = LocalBlobStore::open(root.join("store")).unwrap();

        fs::write(root.join("chr1.hal"), "hal").unwrap();
        fs::write(root.join("chr1.vg"), "vg").unwrap();
        let hal = store.put(&root.join("chr1.hal"), Some(TaskId(3))).unwrap();
        let vg = store.put(&root.join("chr1.vg"), None).unwrap();

        let result = BTreeMap::from([
            ("chr1".to_string(), (hal.clone(), Some(vg.clone()))),
            ("chr2".to_string(), (hal.clone(), None)),
        ]);
        let value = Value::serialized(&result).unwrap();

        assert_eq!(blobs_in(&value), [hal.clone(), vg, hal]);
        assert!(blobs_in(&Value::serialized(&42u64).unwrap()).is_empty());
    }
}
