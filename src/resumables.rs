//! Resumable uploads: per-upload chunk state, ordered merge, finalization.
//!
//! Each in-progress upload is materialized as a working directory under the
//! tenant directory, keyed by the server-minted upload id:
//!
//! ```text
//! <tenant_dir>/<upload_id>/
//!   .meta.json                   owner, group, merge progress, chunk digests
//!   <name>.chunk.<N>             received chunk awaiting merge
//!   <name>.data                  growing merged file
//! ```
//!
//! All coordination is through the filesystem; the only cross-request
//! serialization needed (two writers racing on one chunk) happens via the
//! staged-file rename in the ingestion handler.

use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

const META_FILE: &str = ".meta.json";
const MERGE_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ResumableError {
    /// Unknown upload id, foreign owner, or filename mismatch. Foreign
    /// ownership is deliberately indistinguishable from absence.
    #[error("no such resumable")]
    NotFound,
    #[error("invalid chunk parameter")]
    BadChunk,
    #[error("chunk out of order")]
    OutOfOrder,
    #[error("corrupt resumable metadata: {0}")]
    Meta(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Chunk designator from the query string: a 1-based number or the
/// finalization sentinel `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkId {
    Num(u64),
    End,
}

impl ChunkId {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "end" {
            return Some(ChunkId::End);
        }
        match s.parse::<u64>() {
            Ok(n) if n >= 1 => Some(ChunkId::Num(n)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkId::Num(n) => write!(f, "{}", n),
            ChunkId::End => write!(f, "end"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRecord {
    num: u64,
    size: u64,
    md5: String,
}

/// Persisted upload state, sufficient to resume after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResumableMeta {
    filename: String,
    upload_id: String,
    owner: String,
    group: String,
    /// Highest chunk number merged into the growing file.
    last_merged: u64,
    /// Size of the growing file; always the sum of merged chunk sizes.
    merged_size: u64,
    chunks: Vec<ChunkRecord>,
}

/// Resume information reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ResumableInfo {
    pub filename: String,
    pub id: String,
    /// Size of the most recently merged chunk.
    pub chunk_size: Option<u64>,
    pub max_chunk: u64,
    /// md5 of the most recently merged chunk.
    pub md5: Option<String>,
    pub previous_offset: u64,
    pub next_offset: u64,
}

/// Outcome of preparing one chunk request.
#[derive(Debug)]
pub struct ChunkPrep {
    pub chunk: ChunkId,
    pub upload_id: String,
    pub is_final: bool,
    /// False when the chunk number is not the next expected one; the
    /// request must merge nothing.
    pub order_ok: bool,
    /// Where the chunk body should be written (absent for finalization).
    pub chunk_path: Option<PathBuf>,
}

/// Chunked-upload engine for one tenant directory, acting as one requestor.
pub struct ResumableStore {
    tenant_dir: PathBuf,
    requestor: String,
}

impl ResumableStore {
    pub fn new(tenant_dir: PathBuf, requestor: impl Into<String>) -> Self {
        Self {
            tenant_dir,
            requestor: requestor.into(),
        }
    }

    fn workdir(&self, upload_id: &str) -> PathBuf {
        self.tenant_dir.join(upload_id)
    }

    async fn load_meta(&self, upload_id: &str) -> Result<ResumableMeta, ResumableError> {
        let path = self.workdir(upload_id).join(META_FILE);
        let bytes = fs::read(&path).await.map_err(|_| ResumableError::NotFound)?;
        let meta: ResumableMeta =
            serde_json::from_slice(&bytes).map_err(|e| ResumableError::Meta(e.to_string()))?;
        if meta.owner != self.requestor {
            // foreign resumables do not exist as far as this caller knows
            return Err(ResumableError::NotFound);
        }
        Ok(meta)
    }

    async fn save_meta(&self, meta: &ResumableMeta) -> Result<(), ResumableError> {
        let dir = self.workdir(&meta.upload_id);
        let tmp = dir.join(format!("{}.tmp", META_FILE));
        let bytes =
            serde_json::to_vec(meta).map_err(|e| ResumableError::Meta(e.to_string()))?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, dir.join(META_FILE)).await?;
        Ok(())
    }

    /// Validate the chunk request and set up on-disk state for it.
    ///
    /// The first chunk of a new upload arrives without an id; the store
    /// mints one and echoes it back for all subsequent chunks. A chunk
    /// number other than `last_merged + 1` yields `order_ok = false` with
    /// no side effect.
    pub async fn prepare(
        &self,
        filename: &str,
        chunk_param: &str,
        upload_id: Option<&str>,
        group: &str,
    ) -> Result<ChunkPrep, ResumableError> {
        let chunk = ChunkId::parse(chunk_param).ok_or(ResumableError::BadChunk)?;
        match chunk {
            ChunkId::End => {
                let upload_id = upload_id.ok_or(ResumableError::BadChunk)?;
                let meta = self.load_meta(upload_id).await?;
                if meta.filename != filename {
                    return Err(ResumableError::NotFound);
                }
                Ok(ChunkPrep {
                    chunk,
                    upload_id: upload_id.to_string(),
                    is_final: true,
                    order_ok: true,
                    chunk_path: None,
                })
            }
            ChunkId::Num(n) => match upload_id {
                None => {
                    if n != 1 {
                        return Ok(ChunkPrep {
                            chunk,
                            upload_id: String::new(),
                            is_final: false,
                            order_ok: false,
                            chunk_path: None,
                        });
                    }
                    let upload_id = Uuid::new_v4().to_string();
                    let workdir = self.workdir(&upload_id);
                    fs::create_dir_all(&workdir).await?;
                    let meta = ResumableMeta {
                        filename: filename.to_string(),
                        upload_id: upload_id.clone(),
                        owner: self.requestor.clone(),
                        group: group.to_string(),
                        last_merged: 0,
                        merged_size: 0,
                        chunks: Vec::new(),
                    };
                    self.save_meta(&meta).await?;
                    tracing::info!(
                        target: "resumables",
                        upload_id = %upload_id,
                        filename = %filename,
                        requestor = %self.requestor,
                        "New resumable upload"
                    );
                    Ok(ChunkPrep {
                        chunk,
                        chunk_path: Some(workdir.join(format!("{}.chunk.{}", filename, n))),
                        upload_id,
                        is_final: false,
                        order_ok: true,
                    })
                }
                Some(upload_id) => {
                    let meta = self.load_meta(upload_id).await?;
                    if meta.filename != filename {
                        return Err(ResumableError::NotFound);
                    }
                    let order_ok = n == meta.last_merged + 1;
                    let chunk_path = order_ok.then(|| {
                        self.workdir(upload_id)
                            .join(format!("{}.chunk.{}", filename, n))
                    });
                    Ok(ChunkPrep {
                        chunk,
                        upload_id: upload_id.to_string(),
                        is_final: false,
                        order_ok,
                        chunk_path,
                    })
                }
            },
        }
    }

    /// Append a fully received chunk file to the growing merged file.
    ///
    /// On success the chunk file is deleted and the metadata advanced. If
    /// the append fails midway, the growing file is truncated back to its
    /// recorded size and the chunk file is kept for a later retry.
    pub async fn merge_chunk(
        &self,
        chunk_path: &Path,
        upload_id: &str,
    ) -> Result<u64, ResumableError> {
        let mut meta = self.load_meta(upload_id).await?;
        let chunk_name = chunk_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(ResumableError::BadChunk)?;
        let num: u64 = chunk_name
            .rsplit(".chunk.")
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(ResumableError::BadChunk)?;
        if num != meta.last_merged + 1 {
            return Err(ResumableError::OutOfOrder);
        }

        let data_path = self
            .workdir(upload_id)
            .join(format!("{}.data", meta.filename));
        let mut data = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .await?;
        // restore point in case the append fails partway
        let base_len = data.seek(std::io::SeekFrom::End(0)).await?;

        let mut chunk = fs::File::open(chunk_path).await?;
        let mut digest = Md5Context::new();
        let mut buf = vec![0u8; MERGE_BUF_SIZE];
        let mut copied: u64 = 0;
        let copy_result: Result<(), std::io::Error> = async {
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
                data.write_all(&buf[..n]).await?;
                copied += n as u64;
            }
            data.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = copy_result {
            tracing::error!(
                target: "resumables",
                upload_id = %upload_id,
                chunk = num,
                error = %e,
                "Merge failed, truncating growing file back"
            );
            let _ = data.set_len(base_len).await;
            return Err(e.into());
        }

        meta.last_merged = num;
        meta.merged_size = base_len + copied;
        meta.chunks.push(ChunkRecord {
            num,
            size: copied,
            md5: format!("{:x}", digest.compute()),
        });
        self.save_meta(&meta).await?;
        if let Err(e) = fs::remove_file(chunk_path).await {
            tracing::warn!(
                target: "resumables",
                chunk = %chunk_path.display(),
                error = %e,
                "Merged chunk file could not be removed"
            );
        }
        tracing::debug!(
            target: "resumables",
            upload_id = %upload_id,
            chunk = num,
            merged_size = meta.merged_size,
            "Chunk merged"
        );
        Ok(num)
    }

    /// Promote the growing file to the target filename and tear down the
    /// upload's working directory. Returns the settled path.
    pub async fn finalize(
        &self,
        filename: &str,
        upload_id: &str,
    ) -> Result<PathBuf, ResumableError> {
        let meta = self.load_meta(upload_id).await?;
        if meta.filename != filename {
            return Err(ResumableError::NotFound);
        }
        let data_path = self.workdir(upload_id).join(format!("{}.data", filename));
        if fs::metadata(&data_path).await.is_err() {
            return Err(ResumableError::NotFound);
        }
        let target = self.tenant_dir.join(filename);
        self.remove_staged_twins(filename).await?;
        fs::rename(&data_path, &target).await?;
        fs::remove_dir_all(self.workdir(upload_id)).await?;
        tracing::info!(
            target: "resumables",
            upload_id = %upload_id,
            path = %target.display(),
            size = meta.merged_size,
            chunks = meta.last_merged,
            "Resumable upload finalized"
        );
        Ok(target)
    }

    /// Remove leftover `<name>.<uuid>.part` files before settling the name.
    async fn remove_staged_twins(&self, filename: &str) -> Result<(), ResumableError> {
        let mut entries = fs::read_dir(&self.tenant_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if crate::staging::is_staged_twin(name, filename) {
                    let _ = fs::remove_file(entry.path()).await;
                }
            }
        }
        Ok(())
    }

    /// Resume information for one known upload id.
    pub async fn info(
        &self,
        filename: &str,
        upload_id: &str,
    ) -> Result<ResumableInfo, ResumableError> {
        let meta = self.load_meta(upload_id).await?;
        if meta.filename != filename {
            return Err(ResumableError::NotFound);
        }
        Ok(Self::info_from_meta(&meta))
    }

    /// All resumables owned by the requestor, optionally filtered to one
    /// target filename. Clients resuming by name pick the most complete
    /// candidate and delete the rest.
    pub async fn list_matching(
        &self,
        filename: Option<&str>,
    ) -> Result<Vec<ResumableInfo>, ResumableError> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(&self.tenant_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(found),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if Uuid::parse_str(name).is_err() {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match self.load_meta(name).await {
                Ok(meta) => {
                    if filename.map(|f| f == meta.filename).unwrap_or(true) {
                        found.push(Self::info_from_meta(&meta));
                    }
                }
                Err(ResumableError::NotFound) => {} // foreign or vanished
                Err(e) => {
                    tracing::warn!(
                        target: "resumables",
                        upload_id = name,
                        error = %e,
                        "Skipping unreadable resumable"
                    );
                }
            }
        }
        Ok(found)
    }

    /// Drop an in-progress upload and all its on-disk state.
    pub async fn delete(&self, filename: &str, upload_id: &str) -> Result<bool, ResumableError> {
        let meta = self.load_meta(upload_id).await?;
        if meta.filename != filename {
            return Err(ResumableError::NotFound);
        }
        fs::remove_dir_all(self.workdir(upload_id)).await?;
        tracing::info!(
            target: "resumables",
            upload_id = %upload_id,
            filename = %filename,
            requestor = %self.requestor,
            "Resumable deleted"
        );
        Ok(true)
    }

    fn info_from_meta(meta: &ResumableMeta) -> ResumableInfo {
        let last = meta.chunks.last();
        let last_size = last.map(|c| c.size);
        ResumableInfo {
            filename: meta.filename.clone(),
            id: meta.upload_id.clone(),
            chunk_size: last_size,
            max_chunk: meta.last_merged,
            md5: last.map(|c| c.md5.clone()),
            previous_offset: meta.merged_size - last_size.unwrap_or(0),
            next_offset: meta.merged_size,
        }
    }
}
