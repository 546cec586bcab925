/// Docker-backed container runtime
///
/// **Isolation rules applied to every container:**
/// - Network disabled (`network_mode = none`)
/// - Memory ceiling with swap disabled, CPU quota, PID cap
/// - Read-only root filesystem, writable tmpfs `/tmp` only
/// - Staged code bind-mounted read-only under `/sandbox`
/// - All capabilities dropped, no privilege escalation
///
/// Images are pulled on first use (image cache check), under `IMAGE_PULL_TIMEOUT`.

use crate::error::SandboxError;
use crate::runner::CappedOutput;
use crate::sandbox::{ContainerOutput, ContainerRuntime, SandboxRequest, SANDBOX_MOUNT_DIR};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{CreateImageInfo, HostConfig};
use bollard::Docker;
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const PIDS_LIMIT: i64 = 64;
const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,size=64m";
const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Drive a pull's progress stream to the end, or fail once `limit` passes
async fn finish_pull<S>(image: &str, progress: S, limit: Duration) -> Result<(), SandboxError>
where
    S: Stream<Item = Result<CreateImageInfo, bollard::errors::Error>> + Unpin,
{
    let drain = async {
        let mut progress = progress;
        while let Some(step) = progress.next().await {
            step?;
        }
        Ok::<_, SandboxError>(())
    };

    tokio::time::timeout(limit, drain).await.map_err(|_| {
        SandboxError::Runtime(format!("pulling image {} timed out after {}s", image, limit.as_secs()))
    })?
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Pull the image if it is not cached locally
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let stream = self.docker.create_image(options, None, None);
        finish_pull(image, stream, IMAGE_PULL_TIMEOUT).await?;

        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn container_config(request: &SandboxRequest, host_path: &str) -> Config<String> {
        let mut cmd = vec![request.command.clone()];
        cmd.extend(request.arguments.iter().cloned());

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), TMPFS_OPTIONS.to_string());

        Config {
            image: Some(request.image.clone()),
            cmd: Some(cmd),
            entrypoint: Some(vec![]),
            env: Some(vec!["HOME=/tmp".to_string()]),
            working_dir: Some(SANDBOX_MOUNT_DIR.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(request.memory_limit_bytes),
                memory_swap: Some(request.memory_limit_bytes),
                nano_cpus: Some(request.cpu_quota_nanos),
                pids_limit: Some(PIDS_LIMIT),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                binds: Some(vec![format!("{}:{}:ro", host_path, request.container_path)]),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, request: &SandboxRequest) -> Result<String, SandboxError> {
        self.ensure_image(&request.image).await?;

        // Bind mounts need an absolute host path
        let host_path = tokio::fs::canonicalize(&request.host_path).await?;
        let config = Self::container_config(request, &host_path.to_string_lossy());

        let name = format!("quizgrade-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container = self.docker.create_container(Some(options), config).await?;
        for warning in &container.warnings {
            warn!(container = %name, warning = %warning, "Docker create warning");
        }

        Ok(container.id)
    }

    async fn execute(&self, container_id: &str, input: &[String]) -> Result<ContainerOutput, SandboxError> {
        // Attach before start so no early output is lost
        let AttachContainerResults { mut output, input: mut stdin } = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await?;

        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;

        let lines = input.to_vec();
        let feeder = async move {
            for line in &lines {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await?;
            stdin.shutdown().await
        };

        // Keep draining past the cap; the deadline ends a runaway writer
        let collector = async {
            let mut stdout = CappedOutput::default();
            let mut stderr = CappedOutput::default();
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => stdout.push(&message),
                    LogOutput::StdErr { message } => stderr.push(&message),
                    _ => {}
                }
            }
            Ok::<_, SandboxError>((stdout, stderr))
        };

        let (fed, collected) = tokio::join!(feeder, collector);
        if let Err(e) = fed {
            // Programs may exit before consuming their input
            debug!(container_id = %container_id, error = %e, "Failed to write container stdin");
        }
        let (stdout, stderr) = collected?;

        let mut wait = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(SandboxError::Runtime("no wait response from container".to_string())),
        };

        let truncated = stdout.is_truncated() || stderr.is_truncated();
        if truncated {
            warn!(container_id = %container_id, "Container output exceeded limit");
        }

        Ok(ContainerOutput {
            exit_code,
            stdout: stdout.text(),
            stderr: stderr.text(),
            truncated,
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}
