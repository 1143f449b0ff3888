//! Detail stores: where untruncated producer output and merged artifacts live.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::unit::UnitId;
use crate::digest::DetailRef;
use crate::error::{Error, Result};

/// What a stored blob belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetailKey {
    pub unit: UnitId,
    /// Stream name, or "artifact" for the merged unit artifact.
    pub name: String,
}

impl DetailKey {
    pub fn new(unit: UnitId, name: &str) -> Self {
        Self {
            unit,
            name: name.to_string(),
        }
    }

    pub fn artifact(unit: UnitId) -> Self {
        Self::new(unit, "artifact")
    }

    /// File-system safe form of the name.
    ///
    /// Names made only of lowercase ASCII letters, digits, `_` and `-` are
    /// used as-is. Anything else is rewritten and suffixed with a hash of
    /// the raw name, so two distinct names never share a slug.
    fn slug(&self) -> String {
        let safe = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-';
        if !self.name.is_empty() && self.name.chars().all(safe) {
            return self.name.clone();
        }

        let readable: String = self
            .name
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if safe(c) {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let hash = Uuid::new_v5(&Uuid::NAMESPACE_OID, self.name.as_bytes()).simple().to_string();
        let prefix = if readable.is_empty() { "detail" } else { readable.as_str() };
        format!("{}-{}", prefix, &hash[..8])
    }
}

/// Storage collaborator for full detail.
///
/// The core only ever holds the returned [`DetailRef`]s.
#[async_trait]
pub trait DetailStore: Send + Sync {
    async fn put(&self, key: &DetailKey, body: Vec<u8>) -> Result<DetailRef>;

    async fn get(&self, reference: &DetailRef) -> Result<Vec<u8>>;
}

/// In-process store for tests and short runs.
///
/// Every put adds a new entry and nothing is evicted, so memory grows with
/// each stream and artifact of each run. Call [`clear`](Self::clear) between
/// runs, or configure a `detail_dir` for long-lived coordinators.
#[derive(Debug, Default)]
pub struct MemoryDetailStore {
    entries: RwLock<HashMap<DetailRef, Vec<u8>>>,
}

impl MemoryDetailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every stored blob. References handed out earlier stop resolving.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl DetailStore for MemoryDetailStore {
    async fn put(&self, key: &DetailKey, body: Vec<u8>) -> Result<DetailRef> {
        let reference = DetailRef::new(format!("mem:{}/{}/{}", key.unit, key.slug(), Uuid::new_v4()));
        self.entries.write().await.insert(reference.clone(), body);
        Ok(reference)
    }

    async fn get(&self, reference: &DetailRef) -> Result<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::DetailNotFound(reference.to_string()))
    }
}

/// Writes each blob to `<root>/unit-<id>/<name>.json`.
///
/// A later put for the same key overwrites the file, so a resumed run
/// replaces stale detail from an interrupted attempt.
#[derive(Debug, Clone)]
pub struct FileDetailStore {
    root: PathBuf,
}

impl FileDetailStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &DetailKey) -> PathBuf {
        self.root
            .join(format!("unit-{}", key.unit))
            .join(format!("{}.json", key.slug()))
    }
}

#[async_trait]
impl DetailStore for FileDetailStore {
    async fn put(&self, key: &DetailKey, body: Vec<u8>) -> Result<DetailRef> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        tracing::trace!(path = %path.display(), "detail written");
        Ok(DetailRef::new(path.to_string_lossy().into_owned()))
    }

    async fn get(&self, reference: &DetailRef) -> Result<Vec<u8>> {
        let path = Path::new(reference.as_str());
        if !path.starts_with(&self.root) {
            return Err(Error::DetailNotFound(reference.to_string()));
        }
        match tokio::fs::read(path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::DetailNotFound(reference.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}
