use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::shared::config::ContainerOptions;

/// Demuxed result of a container exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Thin seam over the container engine. The pool and session manager only
/// ever talk to this trait, which keeps them testable without a daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a sandbox container; returns the engine's id.
    async fn create_container(&self) -> Result<String>;

    async fn exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        user: Option<&str>,
        workdir: Option<&str>,
    ) -> Result<ExecOutput>;

    /// Stream a tar archive into `path` inside the container.
    async fn put_archive(&self, container_id: &str, path: &str, archive: Vec<u8>) -> Result<()>;

    /// Stream `path` out of the container as a tar archive.
    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Stop and remove a container. Missing containers count as removed.
    async fn remove_container(&self, container_id: &str) -> Result<()>;
}

/// Docker implementation over bollard.
pub struct DockerRuntime {
    docker: Docker,
    options: ContainerOptions,
    memory_bytes: i64,
}

impl DockerRuntime {
    pub fn new(docker: Docker, options: ContainerOptions) -> Result<Self> {
        let memory_bytes = options.memory_bytes()?;
        Ok(Self {
            docker,
            options,
            memory_bytes,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self) -> Result<String> {
        let container_name = format!("sbx_sandbox_{}", &Uuid::new_v4().to_string()[..8]);

        let config = Config {
            image: Some(self.options.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            user: Some(self.options.sandbox_user.clone()),
            working_dir: Some(self.options.workspace_dir.clone()),
            host_config: Some(HostConfig {
                memory: Some(self.memory_bytes),
                memory_swap: Some(self.memory_bytes),
                cpu_quota: Some(self.options.cpu_quota),
                cpu_period: Some(100_000),
                network_mode: Some(self.options.network_mode.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.clone(),
            ..Default::default()
        };

        let container = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container::<String>(&container.id, None)
            .await?;

        info!("Created sandbox container {}", container_name);
        Ok(container.id)
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        user: Option<&str>,
        workdir: Option<&str>,
    ) -> Result<ExecOutput> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            user: user.map(|u| u.to_string()),
            working_dir: workdir.map(|w| w.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(anyhow!("exec unexpectedly detached"));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn put_archive(&self, container_id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let mut stream = self.docker.download_from_container(container_id, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        Ok(archive)
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let _ = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 2 }))
            .await;

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("404") || e.to_string().contains("No such container") => {
                warn!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(anyhow!("Failed to remove container {}: {}", container_id, e)),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory engine double for pool and session tests. Exec results are
    /// served from a queue so multi-step operations can be scripted.
    #[derive(Default)]
    pub struct MockRuntime {
        next_id: AtomicUsize,
        pub fail_creates: AtomicBool,
        pub removed: Mutex<Vec<String>>,
        pub execs: Mutex<Vec<(String, Vec<String>)>>,
        pub exec_results: Mutex<VecDeque<ExecOutput>>,
        pub archives: Mutex<Vec<(String, String, Vec<u8>)>>,
        pub archive_to_serve: Mutex<Option<Vec<u8>>>,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn removed_ids(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }

        pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
            self.execs.lock().unwrap().clone()
        }

        pub fn push_exec_result(&self, output: ExecOutput) {
            self.exec_results.lock().unwrap().push_back(output);
        }

        pub fn serve_archive(&self, archive: Vec<u8>) {
            *self.archive_to_serve.lock().unwrap() = Some(archive);
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn create_container(&self) -> Result<String> {
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(anyhow!("engine unavailable"));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("mock-{id}"))
        }

        async fn exec(
            &self,
            container_id: &str,
            cmd: Vec<String>,
            _user: Option<&str>,
            _workdir: Option<&str>,
        ) -> Result<ExecOutput> {
            self.execs
                .lock()
                .unwrap()
                .push((container_id.to_string(), cmd));
            Ok(self
                .exec_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }

        async fn put_archive(
            &self,
            container_id: &str,
            path: &str,
            archive: Vec<u8>,
        ) -> Result<()> {
            self.archives
                .lock()
                .unwrap()
                .push((container_id.to_string(), path.to_string(), archive));
            Ok(())
        }

        async fn get_archive(&self, _container_id: &str, _path: &str) -> Result<Vec<u8>> {
            Ok(self
                .archive_to_serve
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_default())
        }

        async fn remove_container(&self, container_id: &str) -> Result<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }
    }
}
