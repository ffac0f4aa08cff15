use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// persisted session descriptor, one per upload directory
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: usize,
    #[serde(default)]
    pub chunk_size: u64,
    /// client-provided expected hashes, one per chunk
    #[serde(default)]
    pub chunk_hashes: Vec<String>,
    /// expected hash of the assembled file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    /// capability token for reads and room membership
    pub share_id: String,
}

impl SessionDescriptor {
    /// declared hash for one chunk; a hash list of the wrong length counts as absent
    pub fn expected_chunk_hash(&self, index: usize) -> Option<&str> {
        if self.chunk_hashes.len() != self.total_chunks {
            return None;
        }
        self.chunk_hashes
            .get(index)
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    pub fn expected_file_hash(&self) -> Option<&str> {
        self.file_hash.as_deref().filter(|h| !h.is_empty())
    }

    /// rough size while chunks are still arriving
    pub fn estimated_size(&self) -> u64 {
        (self.total_chunks as u64).saturating_mul(self.chunk_size)
    }
}

// request to create an upload session
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct NewSession {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: usize,
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub chunk_hashes: Option<Vec<String>>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub share_id: Option<String>,
}

// response for session creation
#[derive(Serialize, Deserialize, Debug)]
pub struct NewSessionResponse {
    pub upload_id: String,
    pub share_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Received,
    AlreadyReceived,
}

// outcome of a single chunk upload
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChunkUploadResponse {
    pub status: ChunkStatus,
    pub index: usize,
    pub received_bytes: u64,
    pub chunk_hash: String,
}

// response for the status endpoint
#[derive(Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    pub upload_id: String,
    pub received_chunks: Vec<usize>,
    pub total_chunks: usize,
    pub complete: bool,
}

// response for a successful assembly
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AssembleResponse {
    pub status: String,
    pub file_path: String,
    pub file_hash: String,
    pub file_size: u64,
    pub download_url: String,
}

// response for session cleanup
#[derive(Serialize, Deserialize, Debug)]
pub struct CleanupResponse {
    pub message: String,
    pub upload_id: String,
}

/// Progress of one upload as pushed to its subscribers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: usize,
    pub received_chunks: Vec<usize>,
    pub received_count: usize,
    pub completed_percent: u32,
    pub complete: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomEventKind {
    UploadStart,
    ChunkReceived,
    UploadComplete,
    RoomState,
}

/// Event fanned out to everyone watching a room.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: RoomEventKind,
    pub share_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl RoomEvent {
    pub fn new(kind: RoomEventKind, share_id: impl Into<String>) -> Self {
        Self {
            kind,
            share_id: share_id.into(),
            upload_id: None,
            filename: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn upload(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

// point-in-time view of every upload sharing a share_id
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoomState {
    pub share_id: String,
    pub active_uploads: Vec<ActiveUpload>,
    pub completed_files: Vec<CompletedFile>,
    pub last_updated: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// seconds until expiry
    pub expires_in: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActiveUpload {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: usize,
    pub received_chunks: usize,
    pub completion_percent: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompletedFile {
    pub upload_id: String,
    pub filename: String,
    pub file_size: u64,
    pub completed_at: DateTime<Utc>,
}

// information about one upload for share-gated listings
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileInfo {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: usize,
    pub received_chunks: usize,
    pub file_size: u64,
    pub upload_time: DateTime<Utc>,
    pub status: String,
    pub completion_percentage: f64,
}

// response for file listing endpoint
#[derive(Serialize, Deserialize, Debug)]
pub struct FileListResponse {
    pub files: Vec<FileInfo>,
    pub count: usize,
}

// `?share_id=` on share-gated reads
#[derive(Deserialize, Debug, Default)]
pub struct ShareQuery {
    pub share_id: Option<String>,
}

// generic error response
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

impl ErrorResponse {
    pub fn new(code: &str, error: String) -> Self {
        Self {
            error,
            code: code.to_string(),
            chunk_index: None,
            expected: None,
            actual: None,
            missing_chunks: None,
            received_count: None,
            total_chunks: None,
        }
    }
}

/// integer completion percentage, 0 for an empty plan
pub fn percent(received: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((received.min(total) * 100) / total) as u32
}
