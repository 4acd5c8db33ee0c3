pub mod archive;

pub use archive::{validate_archive, ArchiveEntry, ArchiveSummary};

use crate::broker::SessionSender;
use crate::commands::{as_root, with_remote_lock};
use crate::executor::{RemoteExec, SshError, SshSession};
use crate::pipeline::RateGate;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("another transfer is already running for this session")]
    Busy,

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("SFTP failure: {0}")]
    Sftp(String),

    #[error("{0}")]
    InvalidArchive(String),

    #[error("archive too large: {size} bytes exceeds the {max} byte ceiling")]
    TooLarge { size: u64, max: u64 },

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("import failed, previous data restored: {0}")]
    RollbackApplied(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub export_ttl: Duration,
    pub import_max_bytes: u64,
    pub snapshot_retention: Duration,
    pub staging_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            export_ttl: Duration::from_secs(3600),
            import_max_bytes: 2 * 1024 * 1024 * 1024,
            snapshot_retention: Duration::from_secs(24 * 3600),
            staging_dir: std::env::temp_dir().join("stgate"),
        }
    }
}

/// A finished export waiting to be picked up over HTTP. Tokens are
/// one-time and session-bound.
pub struct ExportArtifact {
    pub token: String,
    pub session_id: SessionId,
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub compressed_size: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    downloaded: AtomicBool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimError {
    /// 404
    NotFound,
    /// 410
    Expired,
    /// 401
    Forbidden,
}

#[derive(Default)]
pub struct ArtifactStore {
    artifacts: DashMap<String, Arc<ExportArtifact>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, artifact: ExportArtifact) -> Arc<ExportArtifact> {
        let artifact = Arc::new(artifact);
        self.artifacts
            .insert(artifact.token.clone(), artifact.clone());
        artifact
    }

    /// Claim for download: token must exist, be fresh, belong to the
    /// session, and not have been used. A successful claim consumes it.
    pub fn claim(&self, token: &str, session_id: &str) -> Result<Arc<ExportArtifact>, ClaimError> {
        let artifact = self
            .artifacts
            .get(token)
            .map(|a| a.clone())
            .ok_or(ClaimError::NotFound)?;
        if artifact.session_id != session_id {
            return Err(ClaimError::Forbidden);
        }
        if artifact.expires_at < Utc::now() {
            self.artifacts.remove(token);
            return Err(ClaimError::Expired);
        }
        if artifact.downloaded.swap(true, Ordering::SeqCst) {
            return Err(ClaimError::NotFound);
        }
        self.artifacts.remove(token);
        Ok(artifact)
    }

    /// Drop expired artifacts and their files.
    pub fn sweep(&self) {
        let now = Utc::now();
        let expired: Vec<(String, PathBuf)> = self
            .artifacts
            .iter()
            .filter(|e| e.value().expires_at < now)
            .map(|e| (e.key().clone(), e.value().path.clone()))
            .collect();
        for (token, path) in expired {
            self.artifacts.remove(&token);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("could not remove expired artifact {}: {}", path.display(), e);
            }
            tracing::info!(token = %token, "export artifact expired");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        });
    }
}

struct BusyGuard {
    busy: Arc<DashMap<SessionId, ()>>,
    session_id: SessionId,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.remove(&self.session_id);
    }
}

/// Moves application data between the target server and the gateway:
/// zipped exports with tokenized downloads, validated imports with
/// snapshot/rollback. One transfer per session at a time.
pub struct DataTransferService {
    config: TransferConfig,
    outbound: Arc<dyn SessionSender>,
    store: Arc<ArtifactStore>,
    busy: Arc<DashMap<SessionId, ()>>,
}

impl DataTransferService {
    pub fn new(
        config: TransferConfig,
        outbound: Arc<dyn SessionSender>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            config,
            outbound,
            store,
            busy: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<ArtifactStore> {
        self.store.clone()
    }

    fn acquire(&self, session_id: &str) -> Result<BusyGuard, TransferError> {
        match self.busy.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransferError::Busy),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(BusyGuard {
                    busy: self.busy.clone(),
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    async fn export_progress(&self, session_id: &str, stage: &str, message: String, sent: Option<u64>, total: Option<u64>) {
        let mut payload = json!({"stage": stage, "message": message});
        if let Some(sent) = sent {
            payload["bytesSent"] = json!(sent);
        }
        if let Some(total) = total {
            payload["total"] = json!(total);
        }
        self.outbound
            .send_to_session(session_id, "data/export-progress", payload, false)
            .await;
    }

    async fn import_progress(&self, session_id: &str, stage: &str, message: String) {
        self.outbound
            .send_to_session(
                session_id,
                "data/import-progress",
                json!({"stage": stage, "message": message}),
                false,
            )
            .await;
    }

    /// Resolve the container's data directory from its mount table.
    async fn resolve_data_dir(
        &self,
        exec: &Arc<dyn RemoteExec>,
        container_name: &str,
    ) -> Result<String, TransferError> {
        let inspect = format!(
            "docker inspect -f '{{{{range .Mounts}}}}{{{{if eq .Destination \"/home/node/app/data\"}}}}{{{{.Source}}}}{{{{end}}}}{{{{end}}}}' {}",
            container_name
        );
        let out = exec.exec(&as_root(&inspect)).await?;
        let path = out.stdout_trimmed();
        if !out.is_success() || path.is_empty() {
            return Err(TransferError::Remote(format!(
                "could not resolve data directory of container '{}': {}",
                container_name,
                out.stderr_tail(3)
            )));
        }
        Ok(path)
    }

    /// Recursively list regular files below `dir` over SFTP.
    async fn list_remote_files(
        sftp: &russh_sftp::client::SftpSession,
        dir: &str,
    ) -> Result<Vec<(String, u64)>, TransferError> {
        let mut files = Vec::new();
        let mut stack = vec![dir.to_string()];
        while let Some(current) = stack.pop() {
            let entries = sftp
                .read_dir(current.as_str())
                .await
                .map_err(|e| TransferError::Sftp(e.to_string()))?;
            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let full = format!("{}/{}", current.trim_end_matches('/'), name);
                let meta = entry.metadata();
                if meta.is_dir() {
                    stack.push(full);
                } else {
                    files.push((full, meta.size.unwrap_or(0)));
                }
            }
        }
        Ok(files)
    }

    /// Export the container's data directory into a local zip and hand the
    /// client a one-time download token.
    pub async fn export(
        &self,
        session_id: &str,
        session: Arc<SshSession>,
        container_name: &str,
        cancel: CancellationToken,
    ) -> Result<Arc<ExportArtifact>, TransferError> {
        let _guard = self.acquire(session_id)?;
        let exec: Arc<dyn RemoteExec> = session.clone();

        self.export_progress(session_id, "resolve", "locating data directory".to_string(), None, None)
            .await;
        let data_dir = self.resolve_data_dir(&exec, container_name).await?;

        let sftp = session.open_sftp().await?;
        let files = Self::list_remote_files(&sftp, &data_dir).await?;
        let total: u64 = files.iter().map(|(_, size)| size).sum();

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        let filename = format!(
            "{}-data-{}.zip",
            container_name,
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let local_path = self.config.staging_dir.join(format!("{}.zip", Uuid::new_v4()));
        let zip_file = std::fs::File::create(&local_path)?;
        let mut zip = zip::ZipWriter::new(zip_file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let mut sent = 0u64;
        let mut gate = RateGate::new(10);
        let prefix = format!("{}/", data_dir.trim_end_matches('/'));
        for (remote_path, size) in &files {
            if cancel.is_cancelled() {
                drop(zip);
                let _ = std::fs::remove_file(&local_path);
                return Err(TransferError::Cancelled);
            }

            let mut remote_file = sftp
                .open(remote_path.as_str())
                .await
                .map_err(|e| TransferError::Sftp(e.to_string()))?;
            let mut content = Vec::with_capacity(*size as usize);
            remote_file
                .read_to_end(&mut content)
                .await
                .map_err(|e| TransferError::Sftp(e.to_string()))?;

            let entry_name = format!(
                "data/{}",
                remote_path.strip_prefix(&prefix).unwrap_or(remote_path)
            );
            zip = tokio::task::spawn_blocking(move || -> Result<_, TransferError> {
                use std::io::Write;
                zip.start_file(&entry_name, options)
                    .map_err(|e| TransferError::InvalidArchive(e.to_string()))?;
                zip.write_all(&content)?;
                Ok(zip)
            })
            .await
            .map_err(|e| TransferError::Remote(e.to_string()))??;

            sent += size;
            if gate.ready() {
                self.export_progress(
                    session_id,
                    "download",
                    format!("exporting {}", remote_path),
                    Some(sent),
                    Some(total),
                )
                .await;
            }
        }

        tokio::task::spawn_blocking(move || zip.finish())
            .await
            .map_err(|e| TransferError::Remote(e.to_string()))?
            .map_err(|e| TransferError::InvalidArchive(e.to_string()))?;

        let compressed_size = tokio::fs::metadata(&local_path).await?.len();
        let digest = {
            let bytes = tokio::fs::read(&local_path).await?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        };

        let now = Utc::now();
        let artifact = self.store.register(ExportArtifact {
            token: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            filename: filename.clone(),
            path: local_path,
            size_bytes: total,
            compressed_size,
            sha256: digest,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.config.export_ttl).unwrap_or_default(),
            downloaded: AtomicBool::new(false),
        });

        self.outbound
            .send_to_session(
                session_id,
                "data/export-ready",
                json!({
                    "downloadUrl": format!("/download/{}", artifact.token),
                    "filename": artifact.filename,
                    "sizeBytes": artifact.size_bytes,
                    "compressedSize": artifact.compressed_size,
                    "sha256": artifact.sha256,
                    "expiresAt": artifact.expires_at,
                }),
                true,
            )
            .await;

        tracing::info!(session = %session_id, file = %filename,
            bytes = artifact.compressed_size, "export ready");
        Ok(artifact)
    }

    /// Import an uploaded archive into the container's data directory with
    /// snapshot/rollback semantics.
    pub async fn import(
        &self,
        session_id: &str,
        session: Arc<SshSession>,
        container_name: &str,
        archive_path: &Path,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let _guard = self.acquire(session_id)?;
        let exec: Arc<dyn RemoteExec> = session.clone();

        self.import_progress(session_id, "validate", "validating archive".to_string())
            .await;
        let summary = {
            let path = archive_path.to_path_buf();
            let max = self.config.import_max_bytes;
            tokio::task::spawn_blocking(move || validate_archive(&path, max))
                .await
                .map_err(|e| TransferError::Remote(e.to_string()))??
        };

        let data_dir = self.resolve_data_dir(&exec, container_name).await?;
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let snapshot = format!("{}.bak.{}", data_dir.trim_end_matches('/'), stamp);
        let staging = format!("{}.staging.{}", data_dir.trim_end_matches('/'), stamp);

        self.import_progress(session_id, "snapshot", "snapshotting current data".to_string())
            .await;
        let snap_cmd = as_root(&with_remote_lock(&format!(
            "cp -a {} {}",
            data_dir, snapshot
        )));
        let out = exec.exec_with_timeout(&snap_cmd, Duration::from_secs(300)).await?;
        if !out.is_success() {
            return Err(TransferError::Remote(format!(
                "snapshot failed: {}",
                out.stderr_tail(3)
            )));
        }

        self.import_progress(session_id, "stop", "stopping container".to_string())
            .await;
        let out = exec
            .exec_with_timeout(
                &as_root(&format!("docker stop {}", container_name)),
                Duration::from_secs(120),
            )
            .await?;
        if !out.is_success() {
            let _ = exec.exec(&as_root(&format!("rm -rf {}", snapshot))).await;
            return Err(TransferError::Remote(format!(
                "could not stop container: {}",
                out.stderr_tail(3)
            )));
        }

        match self
            .apply_import(session_id, &session, &summary, archive_path, &data_dir, &staging, &cancel)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                self.import_progress(session_id, "rollback", "restoring snapshot".to_string())
                    .await;
                self.restore_snapshot(&exec, &data_dir, &snapshot, &staging, container_name)
                    .await;
                return Err(TransferError::RollbackApplied(e.to_string()));
            }
        }

        self.import_progress(session_id, "start", "starting container".to_string())
            .await;
        let started = exec
            .exec_with_timeout(
                &as_root(&format!("docker start {}", container_name)),
                Duration::from_secs(120),
            )
            .await;
        let healthy = match started {
            Ok(out) if out.is_success() => {
                let probe = format!(
                    "docker ps --filter name=^{}$ --format '{{{{.Names}}}}'",
                    container_name
                );
                matches!(exec.exec(&as_root(&probe)).await, Ok(out) if out.contains(container_name))
            }
            _ => false,
        };
        if !healthy {
            self.import_progress(session_id, "rollback", "health check failed, restoring snapshot".to_string())
                .await;
            self.restore_snapshot(&exec, &data_dir, &snapshot, &staging, container_name)
                .await;
            return Err(TransferError::RollbackApplied(
                "container did not come back healthy".to_string(),
            ));
        }

        // Snapshot lingers for the retention period, then goes.
        {
            let exec = exec.clone();
            let retention = self.config.snapshot_retention;
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                let _ = exec.exec(&as_root(&format!("rm -rf {}", snapshot))).await;
            });
        }

        self.import_progress(session_id, "complete", "import finished".to_string())
            .await;
        tracing::info!(session = %session_id, container = %container_name,
            files = summary.files.len(), "import applied");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_import(
        &self,
        session_id: &str,
        session: &Arc<SshSession>,
        summary: &ArchiveSummary,
        archive_path: &Path,
        data_dir: &str,
        staging: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let exec: Arc<dyn RemoteExec> = session.clone();
        let sftp = session.open_sftp().await?;

        self.import_progress(session_id, "extract", "uploading new data".to_string())
            .await;
        let out = exec
            .exec(&as_root(&format!("mkdir -p {}", staging)))
            .await?;
        if !out.is_success() {
            return Err(TransferError::Remote(format!(
                "could not create staging directory: {}",
                out.stderr_tail(3)
            )));
        }

        for entry in &summary.files {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let content = {
                let archive_path = archive_path.to_path_buf();
                let name = entry.relative_path.clone();
                tokio::task::spawn_blocking(move || archive::read_archive_file(&archive_path, &name))
                    .await
                    .map_err(|e| TransferError::Remote(e.to_string()))??
            };

            let remote = format!("{}/{}", staging, entry.relative_path);
            if let Some(parent) = Path::new(&remote).parent() {
                let out = exec
                    .exec(&as_root(&format!("mkdir -p {}", parent.display())))
                    .await?;
                if !out.is_success() {
                    return Err(TransferError::Remote("mkdir in staging failed".to_string()));
                }
            }

            let mut remote_file = sftp
                .open_with_flags(
                    remote.as_str(),
                    russh_sftp::protocol::OpenFlags::CREATE
                        | russh_sftp::protocol::OpenFlags::WRITE
                        | russh_sftp::protocol::OpenFlags::TRUNCATE,
                )
                .await
                .map_err(|e| TransferError::Sftp(e.to_string()))?;
            remote_file
                .write_all(&content)
                .await
                .map_err(|e| TransferError::Sftp(e.to_string()))?;
            remote_file
                .flush()
                .await
                .map_err(|e| TransferError::Sftp(e.to_string()))?;
        }

        self.import_progress(session_id, "swap", "swapping data directories".to_string())
            .await;
        let swap = as_root(&with_remote_lock(&format!(
            "rm -rf {staging_old} && mv {live} {staging_old} && mv {staging} {live}",
            live = data_dir,
            staging = staging,
            staging_old = format!("{}.old", staging),
        )));
        let out = exec.exec(&swap).await?;
        if !out.is_success() {
            return Err(TransferError::Remote(format!(
                "directory swap failed: {}",
                out.stderr_tail(3)
            )));
        }
        Ok(())
    }

    /// Best-effort rollback: put the snapshot back as the live directory
    /// and restart the container.
    async fn restore_snapshot(
        &self,
        exec: &Arc<dyn RemoteExec>,
        data_dir: &str,
        snapshot: &str,
        staging: &str,
        container_name: &str,
    ) {
        let restore = as_root(&with_remote_lock(&format!(
            "rm -rf {staging} {staging}.old; if [ -d {snap} ]; then rm -rf {live}; mv {snap} {live}; fi",
            staging = staging,
            snap = snapshot,
            live = data_dir,
        )));
        if let Err(e) = exec.exec(&restore).await {
            tracing::error!("rollback restore failed: {}", e);
        }
        if let Err(e) = exec
            .exec(&as_root(&format!("docker start {}", container_name)))
            .await
        {
            tracing::error!("rollback restart failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(token: &str, session: &str, expires_in_secs: i64) -> ExportArtifact {
        let now = Utc::now();
        ExportArtifact {
            token: token.to_string(),
            session_id: session.to_string(),
            filename: "app-data.zip".to_string(),
            path: PathBuf::from("/tmp/nonexistent.zip"),
            size_bytes: 10,
            compressed_size: 5,
            sha256: "abc".to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(expires_in_secs),
            downloaded: AtomicBool::new(false),
        }
    }

    #[test]
    fn claim_is_one_time() {
        let store = ArtifactStore::new();
        store.register(artifact("t1", "s1", 3600));
        assert!(store.claim("t1", "s1").is_ok());
        assert!(matches!(store.claim("t1", "s1"), Err(ClaimError::NotFound)));
    }

    #[test]
    fn claim_enforces_session_ownership() {
        let store = ArtifactStore::new();
        store.register(artifact("t1", "s1", 3600));
        assert!(matches!(store.claim("t1", "s2"), Err(ClaimError::Forbidden)));
        // the rightful owner can still fetch it afterwards
        assert!(store.claim("t1", "s1").is_ok());
    }

    #[test]
    fn expired_artifacts_answer_gone() {
        let store = ArtifactStore::new();
        store.register(artifact("t1", "s1", -10));
        assert!(matches!(store.claim("t1", "s1"), Err(ClaimError::Expired)));
        // and are removed on the way out
        assert!(matches!(store.claim("t1", "s1"), Err(ClaimError::NotFound)));
    }

    #[test]
    fn unknown_token_is_not_found() {
        let store = ArtifactStore::new();
        assert!(matches!(store.claim("nope", "s1"), Err(ClaimError::NotFound)));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let store = ArtifactStore::new();
        store.register(artifact("old", "s1", -10));
        store.register(artifact("fresh", "s1", 3600));
        store.sweep();
        assert!(matches!(store.claim("old", "s1"), Err(ClaimError::NotFound)));
        assert!(store.claim("fresh", "s1").is_ok());
    }
}
