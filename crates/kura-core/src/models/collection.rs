use crate::encryption::SymmetricKey;

use super::CollectionId;

/// Destination collection. Owned by the caller; the pipeline only reads it.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: CollectionId,
    pub key: SymmetricKey,
    pub name: String,
}
