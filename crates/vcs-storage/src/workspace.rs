//! Job workspace on disk.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/uploads/<uuid>.<ext>     staged client payloads
//! <root>/<job_id>/output.<ext>    job outputs
//! ```
//!
//! Server-side inputs are only accepted from below an explicitly configured
//! source root.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use vcs_models::{Job, JobId};

use crate::error::{StorageError, StorageResult};

const UPLOADS_DIR: &str = "uploads";
const MAX_EXTENSION_LEN: usize = 16;

/// Input file ready for admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    pub path: PathBuf,
    pub bytes: u64,
    /// Whether the file was written by the workspace (and is deleted with the job)
    pub owned: bool,
}

/// Root of all job files.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    source_root: Option<PathBuf>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            source_root: None,
        }
    }

    /// Allow jobs to read existing files below `root`.
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    /// Create the root and uploads directories.
    pub async fn init(&self) -> StorageResult<()> {
        fs::create_dir_all(self.uploads_dir()).await?;
        debug!(root = %self.root.display(), "Workspace initialized");
        Ok(())
    }

    /// Delete uploads left behind by a previous run.
    ///
    /// Jobs do not survive a restart, so nothing can still refer to them.
    pub async fn purge_stale_uploads(&self) -> StorageResult<usize> {
        let mut entries = match fs::read_dir(self.uploads_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Stale uploads removed");
        }
        Ok(removed)
    }

    /// Write an uploaded payload to the uploads directory.
    pub async fn stage_upload(&self, payload: &[u8], extension: &str) -> StorageResult<StagedInput> {
        let mut reader = payload;
        self.stage_stream(&mut reader, payload.len() as u64, extension)
            .await
    }

    /// Copy exactly `len` bytes from `reader` into the uploads directory.
    ///
    /// A short read or a failed write removes the partial file.
    pub async fn stage_stream<R>(
        &self,
        reader: &mut R,
        len: u64,
        extension: &str,
    ) -> StorageResult<StagedInput>
    where
        R: AsyncRead + Unpin,
    {
        let name = format!("{}.{}", Uuid::new_v4(), sanitize_extension(extension));
        let path = self.uploads_dir().join(name);
        fs::create_dir_all(self.uploads_dir()).await?;

        if let Err(e) = copy_exact(&path, reader, len).await {
            if let Err(cleanup) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %cleanup, "Failed to remove partial upload");
            }
            return Err(e);
        }

        debug!(path = %path.display(), bytes = len, "Upload staged");
        Ok(StagedInput {
            path,
            bytes: len,
            owned: true,
        })
    }

    /// Use a file below the source root as job input.
    ///
    /// Relative paths are resolved against the source root. Every rejection
    /// returns the same error; the reason is only logged.
    pub async fn existing_source(&self, requested: impl AsRef<Path>) -> StorageResult<StagedInput> {
        let Some(source_root) = &self.source_root else {
            return Err(StorageError::invalid_path("server-side sources are disabled"));
        };
        let requested = requested.as_ref();

        match resolve_source(source_root, requested).await {
            Ok(input) => Ok(input),
            Err(reason) => {
                debug!(requested = %requested.display(), reason, "Source rejected");
                Err(StorageError::invalid_path("source is not an available media file"))
            }
        }
    }

    /// Remove a staged upload whose job was not admitted.
    pub async fn discard_staged(&self, staged: &StagedInput) {
        if !staged.owned {
            return;
        }
        if let Err(e) = fs::remove_file(&staged.path).await {
            warn!(path = %staged.path.display(), error = %e, "Failed to remove staged upload");
        }
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    /// Create the job directory and return it.
    pub async fn prepare_job_dir(&self, job_id: &JobId) -> StorageResult<PathBuf> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub fn output_path(&self, job_id: &JobId, extension: &str) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("output.{}", sanitize_extension(extension)))
    }

    /// Whether `path` is a staged upload owned by this workspace.
    pub fn is_staged(&self, path: &Path) -> bool {
        path.parent() == Some(self.uploads_dir().as_path())
    }

    /// Delete everything the workspace holds for a job.
    ///
    /// Server-side sources are never touched. Missing files are not an error.
    pub async fn remove_job_files(&self, job: &Job) -> StorageResult<()> {
        let dir = self.job_dir(&job.id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(job_id = %job.id, dir = %dir.display(), "Job directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if self.is_staged(&job.input_path) {
            match fs::remove_file(&job.input_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

async fn copy_exact<R>(path: &Path, reader: &mut R, len: u64) -> StorageResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut file = fs::File::create(path).await?;
    let received = tokio::io::copy(&mut (&mut *reader).take(len), &mut file).await?;
    if received < len {
        return Err(StorageError::Truncated {
            expected: len,
            received,
        });
    }
    file.flush().await?;
    Ok(())
}

async fn resolve_source(root: &Path, requested: &Path) -> Result<StagedInput, String> {
    let root = fs::canonicalize(root)
        .await
        .map_err(|e| format!("source root unavailable: {e}"))?;
    let path = fs::canonicalize(root.join(requested))
        .await
        .map_err(|e| e.to_string())?;
    if !path.starts_with(&root) {
        return Err("outside the source root".to_string());
    }

    let metadata = fs::metadata(&path).await.map_err(|e| e.to_string())?;
    if !metadata.is_file() {
        return Err("not a regular file".to_string());
    }

    Ok(StagedInput {
        path,
        bytes: metadata.len(),
        owned: false,
    })
}

/// Delete a staged upload whose job has ended.
///
/// Blocking, a single unlink. Missing files are ignored.
pub fn remove_staged_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Staged upload removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staged upload"),
    }
}

/// Restrict a client-supplied extension to a short alphanumeric token.
fn sanitize_extension(extension: &str) -> String {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        "bin".to_string()
    } else {
        ext
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use vcs_models::JobParameters;

    fn job_with_input(input: &Path) -> Job {
        Job::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            JobParameters::Compress,
            input,
            4,
            Utc::now(),
        )
    }

    #[test]
    fn test_sanitize_extension() {
        assert_eq!(sanitize_extension("MP4"), "mp4");
        assert_eq!(sanitize_extension(".mov"), "mov");
        assert_eq!(sanitize_extension("../../etc"), "bin");
        assert_eq!(sanitize_extension(""), "bin");
    }

    #[tokio::test]
    async fn test_stage_and_discard_upload() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path());
        workspace.init().await.unwrap();

        let staged = workspace.stage_upload(b"data", "mp4").await.unwrap();
        assert_eq!(staged.bytes, 4);
        assert!(staged.owned);
        assert!(workspace.is_staged(&staged.path));
        assert_eq!(fs::read(&staged.path).await.unwrap(), b"data");

        workspace.discard_staged(&staged).await;
        assert!(!staged.path.exists());
    }

    #[tokio::test]
    async fn test_stage_stream_takes_exactly_len_bytes() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path());

        let mut reader: &[u8] = b"payloadNEXT";
        let staged = workspace.stage_stream(&mut reader, 7, "mov").await.unwrap();
        assert_eq!(staged.bytes, 7);
        assert_eq!(fs::read(&staged.path).await.unwrap(), b"payload");
        assert_eq!(reader, b"NEXT");
    }

    #[tokio::test]
    async fn test_short_stream_leaves_no_partial_upload() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path());

        let mut reader: &[u8] = b"abc";
        let err = workspace
            .stage_stream(&mut reader, 10, "mp4")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Truncated {
                expected: 10,
                received: 3
            }
        ));

        let mut uploads = fs::read_dir(tmp.path().join(UPLOADS_DIR)).await.unwrap();
        assert!(uploads.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_stale_uploads() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path());
        assert_eq!(workspace.purge_stale_uploads().await.unwrap(), 0);

        let first = workspace.stage_upload(b"a", "mp4").await.unwrap();
        let second = workspace.stage_upload(b"b", "mp4").await.unwrap();
        assert_eq!(workspace.purge_stale_uploads().await.unwrap(), 2);
        assert!(!first.path.exists());
        assert!(!second.path.exists());
    }

    #[tokio::test]
    async fn test_existing_source_is_never_removed() {
        let tmp = TempDir::new().unwrap();
        let library = tmp.path().join("library");
        fs::create_dir_all(&library).await.unwrap();
        let workspace = Workspace::new(tmp.path().join("work")).with_source_root(&library);
        workspace.init().await.unwrap();

        let source = library.join("source.mp4");
        fs::write(&source, b"video").await.unwrap();

        let input = workspace.existing_source("source.mp4").await.unwrap();
        assert_eq!(input.path, std::fs::canonicalize(&source).unwrap());
        assert_eq!(input.bytes, 5);
        assert!(!input.owned);

        workspace.discard_staged(&input).await;
        let job = job_with_input(&source);
        workspace.prepare_job_dir(&job.id).await.unwrap();
        workspace.remove_job_files(&job).await.unwrap();
        assert!(source.exists());
        assert!(!workspace.job_dir(&job.id).exists());
    }

    #[tokio::test]
    async fn test_existing_source_rejects_missing_and_directories() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path()).with_source_root(tmp.path());

        let missing = workspace.existing_source(tmp.path().join("nope.mp4")).await;
        assert!(matches!(missing, Err(StorageError::InvalidPath(_))));

        let dir = workspace.existing_source(tmp.path()).await;
        assert!(matches!(dir, Err(StorageError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_existing_source_is_confined_to_source_root() {
        let tmp = TempDir::new().unwrap();
        let library = tmp.path().join("library");
        fs::create_dir_all(&library).await.unwrap();
        let secret = tmp.path().join("secret.txt");
        fs::write(&secret, b"secret").await.unwrap();

        let disabled = Workspace::new(tmp.path().join("work"));
        assert!(matches!(
            disabled.existing_source(&secret).await,
            Err(StorageError::InvalidPath(_))
        ));

        let workspace = Workspace::new(tmp.path().join("work")).with_source_root(&library);
        let outside = workspace.existing_source(&secret).await.unwrap_err();
        let traversal = workspace.existing_source("../secret.txt").await.unwrap_err();
        let missing = workspace.existing_source("missing.mp4").await.unwrap_err();

        // Identical errors, with no trace of the requested path.
        assert_eq!(outside.to_string(), missing.to_string());
        assert_eq!(traversal.to_string(), missing.to_string());
        assert!(!outside.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn test_remove_job_files_deletes_output_and_upload() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path());
        workspace.init().await.unwrap();

        let staged = workspace.stage_upload(b"data", "mp4").await.unwrap();
        let job = job_with_input(&staged.path);
        workspace.prepare_job_dir(&job.id).await.unwrap();

        let output = workspace.output_path(&job.id, "gif");
        assert_eq!(output.file_name().unwrap(), "output.gif");
        fs::write(&output, b"gif").await.unwrap();

        workspace.remove_job_files(&job).await.unwrap();
        assert!(!output.exists());
        assert!(!staged.path.exists());

        // Second removal finds nothing and succeeds.
        workspace.remove_job_files(&job).await.unwrap();
    }
}
