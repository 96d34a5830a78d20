//! On-disk cache store shared between runs and processes.
//!
//! Entries are pretty-printed JSON files written through a temp file and a
//! rename, so readers never observe a partial entry. File IO runs on the
//! blocking pool; the async methods only await it.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::store::{CacheStore, CasOutcome};
use super::{CacheError, CacheKey, CachedValue, Result};

/// Filesystem-backed cache store with 2-char fingerprint sharding.
///
/// Layout: `<root>/<namespace>/<prompt version>/<fp[..2]>/<fp[2..]>.json`
pub struct FsCacheStore {
    root: PathBuf,
    /// Serializes compare-and-set with an expected value within this process.
    replace_lock: Arc<Mutex<()>>,
}

impl FsCacheStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            replace_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.fingerprint.as_str();
        let (shard, rest) = match (hex.get(..2), hex.get(2..)) {
            (Some(shard), Some(rest)) if !rest.is_empty() => (shard, rest),
            _ => ("__", hex),
        };
        self.root
            .join(key.namespace.as_str())
            .join(sanitize(&key.prompt_version))
            .join(shard)
            .join(format!("{rest}.json"))
    }
}

async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| CacheError::Store(format!("cache io task failed: {e}")))?
}

fn read_entry(path: &Path) -> Result<Option<CachedValue>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::Io(e)),
    }
}

fn staged(path: &Path, value: &CachedValue) -> Result<NamedTempFile> {
    let shard_dir = path
        .parent()
        .ok_or_else(|| CacheError::Store(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(shard_dir)?;
    let mut tmp = NamedTempFile::new_in(shard_dir)?;
    tmp.write_all(&serde_json::to_vec_pretty(value)?)?;
    tmp.flush()?;
    Ok(tmp)
}

fn replace_entry(path: &Path, value: &CachedValue) -> Result<()> {
    staged(path, value)?
        .persist(path)
        .map_err(|e| CacheError::Io(e.error))?;
    Ok(())
}

/// Keep prompt versions usable as a single path component.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedValue>> {
        let path = self.entry_path(key);
        blocking(move || read_entry(&path)).await
    }

    async fn put(&self, key: &CacheKey, value: &CachedValue) -> Result<()> {
        let path = self.entry_path(key);
        let value = value.clone();
        blocking(move || replace_entry(&path, &value)).await
    }

    async fn compare_and_set(
        &self,
        key: &CacheKey,
        expected: Option<&CachedValue>,
        value: &CachedValue,
    ) -> Result<CasOutcome> {
        let path = self.entry_path(key);
        let value = value.clone();

        let Some(expected) = expected.cloned() else {
            // Insert-if-absent is atomic across processes via no-clobber rename.
            return blocking(move || match staged(&path, &value)?.persist_noclobber(&path) {
                Ok(_) => Ok(CasOutcome::Swapped),
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                    Ok(CasOutcome::Mismatch(read_entry(&path)?))
                }
                Err(e) => Err(CacheError::Io(e.error)),
            })
            .await;
        };

        let replace_lock = Arc::clone(&self.replace_lock);
        blocking(move || {
            let _guard = replace_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let current = read_entry(&path)?;
            if current.as_ref() != Some(&expected) {
                return Ok(CasOutcome::Mismatch(current));
            }
            replace_entry(&path, &value)?;
            Ok(CasOutcome::Swapped)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_case::TestArtifact;
    use crate::domain::unit::Fingerprint;
    use crate::syntax::Language;

    fn make_store() -> (tempfile::TempDir, FsCacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache")).unwrap();
        (dir, store)
    }

    fn key() -> CacheKey {
        CacheKey::test(&Fingerprint::from_hex("ab".repeat(32)), "v1/beta")
    }

    fn artifact(source: &str) -> CachedValue {
        CachedValue::Test(TestArtifact {
            file_name: "test_f_abababab.py".to_string(),
            language: Some(Language::Python),
            source: source.to_string(),
        })
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_and_layout() {
        let (_dir, store) = make_store();
        store.put(&key(), &artifact("assert True\n")).await.unwrap();
        assert_eq!(
            store.get(&key()).await.unwrap(),
            Some(artifact("assert True\n"))
        );

        let expected = store
            .root()
            .join("test")
            .join("v1_beta")
            .join("ab")
            .join(format!("{}.json", "ab".repeat(31)));
        assert!(expected.exists(), "missing {}", expected.display());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, store) = make_store();
        assert!(store.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_if_absent_does_not_clobber() {
        let (_dir, store) = make_store();
        assert_eq!(
            store
                .compare_and_set(&key(), None, &artifact("a"))
                .await
                .unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(
            store
                .compare_and_set(&key(), None, &artifact("b"))
                .await
                .unwrap(),
            CasOutcome::Mismatch(Some(artifact("a")))
        );
        assert_eq!(store.get(&key()).await.unwrap(), Some(artifact("a")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_inserts_have_one_winner() {
        let (_dir, store) = make_store();
        let store = Arc::new(store);
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .compare_and_set(&key(), None, &artifact(&format!("v{i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut swapped = 0;
        for task in tasks {
            if task.await.unwrap() == CasOutcome::Swapped {
                swapped += 1;
            }
        }
        assert_eq!(swapped, 1);
        assert!(store.get(&key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_short_fingerprint_goes_to_fallback_shard() {
        let (_dir, store) = make_store();
        let short = CacheKey::test(&Fingerprint::from_hex("é"), "v1");
        store.put(&short, &artifact("x")).await.unwrap();
        assert_eq!(store.get(&short).await.unwrap(), Some(artifact("x")));
        assert!(store.root().join("test").join("v1").join("__").exists());
    }

    #[tokio::test]
    async fn test_replace_requires_expected_value() {
        let (_dir, store) = make_store();
        store.put(&key(), &artifact("a")).await.unwrap();
        assert!(matches!(
            store
                .compare_and_set(&key(), Some(&artifact("x")), &artifact("b"))
                .await
                .unwrap(),
            CasOutcome::Mismatch(_)
        ));
        assert_eq!(
            store
                .compare_and_set(&key(), Some(&artifact("a")), &artifact("b"))
                .await
                .unwrap(),
            CasOutcome::Swapped
        );
    }
}
