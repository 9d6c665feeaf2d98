//! Wire records exchanged with the metadata service

use serde::{Deserialize, Serialize};

use super::{CollectionId, ExtractedMetadata};

/// Uploaded object reference plus the header needed to decrypt it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    pub object_key: String,
    pub decryption_header: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Encrypted metadata travels inline, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataAttributes {
    pub encrypted_data: String,
    pub decryption_header: String,
}

/// Body of the file registration call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileRequest {
    #[serde(rename = "collectionID")]
    pub collection_id: CollectionId,
    pub encrypted_key: String,
    pub key_decryption_nonce: String,
    pub file: FileAttributes,
    pub thumbnail: FileAttributes,
    pub metadata: MetadataAttributes,
}

/// File record as returned by the metadata service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: i64,
    #[serde(rename = "collectionID")]
    pub collection_id: CollectionId,
    #[serde(rename = "ownerID", default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub encrypted_key: String,
    #[serde(default)]
    pub key_decryption_nonce: String,
    #[serde(default)]
    pub metadata: Option<MetadataAttributes>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub updation_time: i64,
}

/// One page of changes in a collection since a given time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDiff {
    #[serde(default)]
    pub diff: Vec<RemoteFile>,
    #[serde(default)]
    pub has_more: bool,
}

/// Entry of the local known-files index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedFile {
    pub id: i64,
    pub collection_id: CollectionId,
    pub metadata: ExtractedMetadata,
    pub updation_time: i64,
}
