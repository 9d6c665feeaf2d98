//! Dedup guard over the known-files index
//!
//! Readers take a cheap `Arc` snapshot. Writers are serialised, build the next snapshot,
//! persist it, and only then publish it, so a reader never sees a half-applied update. The
//! snapshot is published even when persisting fails: a file the server already has stays
//! known for the rest of the run.

use std::sync::Arc;

use anyhow::Result;
use kura_core::models::{CollectionId, ExtractedMetadata, IndexedFile};
use tokio::sync::{Mutex, RwLock};

use crate::local_index::LocalFileIndex;

/// Same type, capture time, modification time and title
pub fn is_same_file(a: &ExtractedMetadata, b: &ExtractedMetadata) -> bool {
    a.file_type == b.file_type
        && a.creation_time == b.creation_time
        && a.modification_time == b.modification_time
        && a.title == b.title
}

pub struct KnownFiles {
    snapshot: RwLock<Arc<Vec<IndexedFile>>>,
    write_lock: Mutex<()>,
    store: Arc<dyn LocalFileIndex>,
}

impl KnownFiles {
    pub async fn load(store: Arc<dyn LocalFileIndex>) -> Result<Self> {
        let files = store.load().await?;
        tracing::debug!(known_files = files.len(), "Loaded known-files index");
        Ok(Self {
            snapshot: RwLock::new(Arc::new(files)),
            write_lock: Mutex::new(()),
            store,
        })
    }

    pub async fn snapshot(&self) -> Arc<Vec<IndexedFile>> {
        self.snapshot.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// An already-known file in `collection_id` matching `metadata`
    pub async fn find_duplicate(
        &self,
        collection_id: CollectionId,
        metadata: &ExtractedMetadata,
    ) -> Option<IndexedFile> {
        self.snapshot()
            .await
            .iter()
            .find(|f| f.collection_id == collection_id && is_same_file(&f.metadata, metadata))
            .cloned()
    }

    /// Latest `updation_time` seen for a collection, 0 when none
    pub async fn latest_update(&self, collection_id: CollectionId) -> i64 {
        self.snapshot()
            .await
            .iter()
            .filter(|f| f.collection_id == collection_id)
            .map(|f| f.updation_time)
            .max()
            .unwrap_or(0)
    }

    /// Upsert `files` (matched by id and collection) and drop the ids in `removed`.
    /// An `Err` only means persisting failed; the in-memory update has been applied.
    pub async fn apply(
        &self,
        files: Vec<IndexedFile>,
        removed: &[(CollectionId, i64)],
    ) -> Result<()> {
        if files.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let current = self.snapshot().await;
        let mut next: Vec<IndexedFile> = current
            .iter()
            .filter(|f| {
                !removed.contains(&(f.collection_id, f.id))
                    && !files
                        .iter()
                        .any(|n| n.id == f.id && n.collection_id == f.collection_id)
            })
            .cloned()
            .collect();
        next.extend(files);

        let persisted = self.store.persist(&next).await;
        *self.snapshot.write().await = Arc::new(next);
        persisted
    }

    pub async fn insert(&self, file: IndexedFile) -> Result<()> {
        self.apply(vec![file], &[]).await
    }
}
