use std::io::{Cursor, Read};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::shared::config::LimitsConfig;
use crate::worker::runtime::ContainerRuntime;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("invalid filename '{0}'")]
    InvalidFilename(String),
    #[error("file exceeds maximum size of {0} bytes")]
    TooLarge(u64),
    #[error("workspace file count limit of {0} reached")]
    TooManyFiles(u64),
    #[error("workspace quota of {0} bytes exceeded")]
    WorkspaceFull(u64),
    #[error("file not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct UploadedFile {
    pub filename: String,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified: String,
    pub permissions: String,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceListing {
    pub files: Vec<FileEntry>,
    pub total_files: u64,
    pub total_bytes: u64,
}

/// Workspace file I/O for one worker: archives in and out of containers,
/// quota enforcement on the way in.
pub struct WorkspaceFiles {
    runtime: Arc<dyn ContainerRuntime>,
    sandbox_user: String,
    workspace_dir: String,
    limits: LimitsConfig,
}

impl WorkspaceFiles {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sandbox_user: String,
        workspace_dir: String,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            runtime,
            sandbox_user,
            workspace_dir,
            limits,
        }
    }

    pub async fn upload(
        &self,
        container_id: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<UploadedFile, FileError> {
        check_filename(filename)?;

        let max_file_size = self.limits.max_file_size();
        if data.len() as u64 > max_file_size {
            return Err(FileError::TooLarge(max_file_size));
        }

        // Quota checks against the live workspace, in order: count then bytes
        let (total_files, total_bytes) = self.workspace_usage(container_id).await?;
        if total_files >= self.limits.max_total_files {
            return Err(FileError::TooManyFiles(self.limits.max_total_files));
        }
        let max_workspace = self.limits.max_workspace_size();
        if total_bytes + data.len() as u64 > max_workspace {
            return Err(FileError::WorkspaceFull(max_workspace));
        }

        let archive = single_entry_tar(filename, data)?;
        self.runtime
            .put_archive(container_id, &self.workspace_dir, archive)
            .await?;

        // The archive lands root-owned; hand it to the sandbox user. A name
        // with a path separator chowns the whole top-level directory.
        let owner = format!("{user}:{user}", user = self.sandbox_user);
        let chown = match filename.split_once('/') {
            Some((top, _)) => vec![
                "chown".to_string(),
                "-R".to_string(),
                owner,
                format!("{}/{}", self.workspace_dir, top),
            ],
            None => vec![
                "chown".to_string(),
                owner,
                format!("{}/{}", self.workspace_dir, filename),
            ],
        };
        self.runtime
            .exec(container_id, chown, Some("root"), None)
            .await?;

        info!("Uploaded {} ({} bytes)", filename, data.len());
        Ok(UploadedFile {
            filename: filename.to_string(),
            path: format!("{}/{}", self.workspace_dir, filename),
            size_bytes: data.len() as u64,
        })
    }

    pub async fn download(&self, container_id: &str, filename: &str) -> Result<Vec<u8>, FileError> {
        check_filename(filename)?;

        let path = format!("{}/{}", self.workspace_dir, filename);
        let probe = self
            .runtime
            .exec(
                container_id,
                vec!["test".to_string(), "-f".to_string(), path.clone()],
                Some(&self.sandbox_user),
                None,
            )
            .await?;
        if probe.exit_code != 0 {
            return Err(FileError::NotFound);
        }

        let archive = self.runtime.get_archive(container_id, &path).await?;
        let bytes = extract_single_entry(&archive)?;
        Ok(bytes)
    }

    pub async fn list(&self, container_id: &str) -> Result<WorkspaceListing, FileError> {
        let listing = self
            .runtime
            .exec(
                container_id,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("ls -la --time-style=iso {}", self.workspace_dir),
                ],
                Some(&self.sandbox_user),
                None,
            )
            .await?;
        if listing.exit_code != 0 {
            return Err(FileError::Internal(anyhow!(
                "workspace listing failed: {}",
                listing.stderr.trim()
            )));
        }

        let mut files = parse_ls_listing(&listing.stdout);
        files.sort_by(|a, b| b.modified.cmp(&a.modified));

        let total_files = files.len() as u64;
        let total_bytes = files.iter().map(|f| f.size_bytes).sum();
        Ok(WorkspaceListing {
            files,
            total_files,
            total_bytes,
        })
    }

    /// Current file count and byte usage of the workspace.
    async fn workspace_usage(&self, container_id: &str) -> Result<(u64, u64), FileError> {
        let count = self
            .runtime
            .exec(
                container_id,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("find {} -type f | wc -l", self.workspace_dir),
                ],
                Some(&self.sandbox_user),
                None,
            )
            .await?;
        let total_files: u64 = count.stdout.trim().parse().unwrap_or(0);

        let usage = self
            .runtime
            .exec(
                container_id,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("du -sb {}", self.workspace_dir),
                ],
                Some(&self.sandbox_user),
                None,
            )
            .await?;
        let total_bytes: u64 = usage
            .stdout
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok((total_files, total_bytes))
    }
}

fn check_filename(filename: &str) -> Result<(), FileError> {
    if filename.is_empty() || filename.contains("..") || filename.starts_with('/') {
        return Err(FileError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// Build a tar archive holding exactly one file.
fn single_entry_tar(filename: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, filename, data)
        .context("append file to archive")?;
    builder.into_inner().context("finish archive")
}

/// Pull the single member out of a downloaded archive.
fn extract_single_entry(archive: &[u8]) -> Result<Vec<u8>, FileError> {
    let mut entries = tar::Archive::new(Cursor::new(archive));
    let mut entries = entries.entries().context("read archive")?;
    let entry = entries.next().ok_or(FileError::NotFound)?;
    let mut bytes = Vec::new();
    entry
        .context("read archive entry")?
        .read_to_end(&mut bytes)
        .context("extract archive entry")?;
    Ok(bytes)
}

/// Parse `ls -la --time-style=iso` output, dropping the `total` line and the
/// `.`/`..` entries.
fn parse_ls_listing(output: &str) -> Vec<FileEntry> {
    let mut files = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 || parts[0] == "total" {
            continue;
        }
        let name = parts[7..].join(" ");
        if name == "." || name == ".." {
            continue;
        }
        files.push(FileEntry {
            name,
            size_bytes: parts[4].parse().unwrap_or(0),
            modified: format!("{} {}", parts[5], parts[6]),
            permissions: parts[0].to_string(),
        });
    }
    files
}
