/// Docker and Docker Compose integration
///
/// Structured inspection (status, health, image identity) goes through the
/// Docker API via bollard; lifecycle operations go through `docker compose`
/// and the `docker` CLI, which own the compose file semantics.

use anyhow::{anyhow, Context, Result};
use bollard::Docker;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::utils::ContainerState;

/// Container health as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// The container declares no health check.
    None,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub state: ContainerState,
    pub health: HealthStatus,
}

/// Narrow runtime interface the orchestrators are written against.
///
/// The orchestration logic never parses CLI text output itself; it sees
/// typed states through this trait. `DockerManager` is the real driver,
/// tests substitute a scripted double.
pub trait ContainerRuntime {
    /// Pull the configured image for a compose service.
    async fn pull(&self, service: &str) -> Result<()>;

    /// Image reference configured for a service in the compose file.
    async fn configured_image(&self, service: &str) -> Result<String>;

    /// Image id (digest) a reference currently resolves to locally.
    async fn image_id(&self, image_ref: &str) -> Result<Option<String>>;

    /// Image id the named container was created from.
    async fn container_image_id(&self, container: &str) -> Result<Option<String>>;

    async fn status(&self, container: &str) -> Result<ContainerState>;
    async fn health(&self, container: &str) -> Result<HealthStatus>;

    /// Stop a compose service (keeps the container).
    async fn stop_service(&self, service: &str) -> Result<()>;

    /// Create/start a compose service under its managed name.
    async fn up_service(&self, service: &str) -> Result<()>;

    /// Start an existing container by name.
    async fn start_container(&self, container: &str) -> Result<()>;

    async fn stop_container(&self, container: &str) -> Result<()>;
    async fn remove_container(&self, container: &str) -> Result<()>;
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Commit a container's filesystem to an image tag.
    async fn commit(&self, container: &str, image_tag: &str) -> Result<()>;

    async fn rename(&self, container: &str, new_name: &str) -> Result<()>;

    /// Run a command inside a service container, capturing stdout.
    async fn exec(&self, service: &str, user: Option<&str>, cmd: &[&str]) -> Result<String>;
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
    project_root: PathBuf,
    compose_file: PathBuf,
    project: String,
}

impl DockerManager {
    /// Connect to the local daemon and locate the compose file.
    pub fn new(project_root: impl Into<PathBuf>, project: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        let project_root = project_root.into();
        let compose_file = project_root.join(crate::utils::constants::DEFAULT_COMPOSE_FILE);
        if !compose_file.exists() {
            return Err(anyhow!(
                "docker-compose.yml not found at {}",
                compose_file.display()
            ));
        }

        Ok(Self {
            docker,
            project_root,
            compose_file,
            project: project.to_string(),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Check if the Docker daemon is accessible
    pub async fn check_docker(&self) -> Result<bool> {
        match self.docker.ping().await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Execute a docker compose command
    fn compose_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("--project-name")
            .arg(&self.project)
            .args(args)
            .current_dir(&self.project_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .context("Failed to execute docker compose command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("docker compose {} failed: {}", args.join(" "), stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Execute a plain docker CLI command
    fn docker_command(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("Failed to execute docker command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("docker {} failed: {}", args.join(" "), stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Inspect one container by name.
    pub async fn inspect(&self, container: &str) -> Result<Option<ContainerInfo>> {
        use bollard::container::InspectContainerOptions;

        let inspect = match self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(i) => i,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = inspect.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let health = match state.and_then(|s| s.health.as_ref()).and_then(|h| h.status) {
            Some(bollard::models::HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(bollard::models::HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            Some(bollard::models::HealthStatusEnum::STARTING) => HealthStatus::Starting,
            _ => HealthStatus::None,
        };

        Ok(Some(ContainerInfo {
            id: inspect.id.unwrap_or_default(),
            name: container.to_string(),
            image: inspect
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            image_id: inspect.image.unwrap_or_default(),
            state: ContainerState::from(status.as_str()),
            health,
        }))
    }

    /// Images configured per service in docker-compose.yml.
    pub fn compose_images(&self) -> Result<HashMap<String, String>> {
        use serde_yaml::Value;

        let content = std::fs::read_to_string(&self.compose_file)
            .context("Failed to read docker-compose.yml")?;
        let yaml: Value =
            serde_yaml::from_str(&content).context("Failed to parse docker-compose.yml")?;

        let mut images = HashMap::new();
        if let Some(services) = yaml.get("services").and_then(|s| s.as_mapping()) {
            for (name, config) in services {
                if let (Some(name), Some(image)) =
                    (name.as_str(), config.get("image").and_then(|i| i.as_str()))
                {
                    images.insert(name.to_string(), image.to_string());
                }
            }
        }

        Ok(images)
    }

    /// Get logs for a service
    pub fn logs(&self, service: &str, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        self.compose_command(&["logs", "--no-color", "--tail", &tail, service])
    }

    pub fn restart_service(&self, service: &str) -> Result<()> {
        self.compose_command(&["restart", service])?;
        Ok(())
    }

    pub fn start_all(&self) -> Result<()> {
        self.compose_command(&["up", "-d"])?;
        Ok(())
    }

    pub fn stop_all(&self) -> Result<()> {
        self.compose_command(&["stop"])?;
        Ok(())
    }

    /// Run a command in a service container and stream its stdout through
    /// gzip into `dest`. The exit status of the in-container command and a
    /// cleanly closed stream are both required; on any failure the partial
    /// output file is removed.
    pub fn exec_to_gzip(&self, service: &str, cmd: &[&str], dest: &Path) -> Result<()> {
        let mut args: Vec<&str> = vec!["compose", "--project-name", &self.project, "exec", "-T", service];
        args.extend_from_slice(cmd);

        let run = || -> Result<()> {
            let mut child = Command::new("docker")
                .args(&args)
                .current_dir(&self.project_root)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .context("Failed to spawn docker compose exec")?;

            let stdout = child.stdout.take().expect("stdout piped");
            let mut reader = BufReader::new(stdout);

            let dest_file = File::create(dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            let mut encoder = GzEncoder::new(dest_file, Compression::new(6));
            io::copy(&mut reader, &mut encoder).context("Dump stream interrupted")?;
            encoder.finish().context("Failed to finish gzip stream")?;

            let status = child.wait()?;
            if !status.success() {
                return Err(anyhow!(
                    "command {:?} in service {} exited with {}",
                    cmd,
                    service,
                    status
                ));
            }
            Ok(())
        };

        run().inspect_err(|_| {
            let _ = std::fs::remove_file(dest);
        })
    }

    /// Copy a file out of a service container.
    pub fn copy_from(&self, service: &str, container_path: &str, dest: &Path) -> Result<()> {
        let src = format!("{}:{}", service, container_path);
        let dest_str = dest.to_string_lossy();
        self.compose_command(&["cp", &src, &dest_str])?;
        Ok(())
    }

    /// Copy a file into a service container.
    pub fn copy_to(&self, service: &str, src: &Path, container_path: &str) -> Result<()> {
        let src_str = src.to_string_lossy();
        let dest = format!("{}:{}", service, container_path);
        self.compose_command(&["cp", &src_str, &dest])?;
        Ok(())
    }

    /// Run a command in a service container, feeding it the gunzipped
    /// contents of `src` on stdin.
    pub fn exec_from_gzip(&self, service: &str, cmd: &[&str], src: &Path) -> Result<()> {
        use flate2::read::GzDecoder;

        let mut args: Vec<&str> = vec![
            "compose",
            "--project-name",
            &self.project,
            "exec",
            "-T",
            service,
        ];
        args.extend_from_slice(cmd);

        let mut child = Command::new("docker")
            .args(&args)
            .current_dir(&self.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn docker compose exec")?;

        {
            let mut stdin = child.stdin.take().expect("stdin piped");
            let file = File::open(src)
                .with_context(|| format!("Failed to open {}", src.display()))?;
            let mut decoder = GzDecoder::new(BufReader::new(file));
            io::copy(&mut decoder, &mut stdin).context("Restore stream interrupted")?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(anyhow!(
                "command {:?} in service {} exited with {}",
                cmd,
                service,
                status
            ));
        }
        Ok(())
    }

    pub fn volume_exists(&self, volume: &str) -> Result<bool> {
        Ok(self.docker_command(&["volume", "inspect", volume]).is_ok())
    }

    pub fn create_volume(&self, volume: &str) -> Result<()> {
        self.docker_command(&["volume", "create", volume])?;
        Ok(())
    }

    /// Tar a named volume's contents into `{backup_dir}/{archive_name}`
    /// using a throwaway container.
    pub fn archive_volume(&self, volume: &str, backup_dir: &Path, archive_name: &str) -> Result<()> {
        let backup_dir = backup_dir
            .canonicalize()
            .with_context(|| format!("Backup dir {} not accessible", backup_dir.display()))?;
        let vol_mount = format!("{}:/source:ro", volume);
        let backup_mount = format!("{}:/backup", backup_dir.display());
        let archive = format!("/backup/{}", archive_name);

        self.docker_command(&[
            "run", "--rm", "-v", &vol_mount, "-v", &backup_mount, "alpine", "tar", "czf",
            &archive, "-C", "/source", ".",
        ])?;
        Ok(())
    }

    /// Replace a named volume's entire contents from a tar.gz archive.
    pub fn restore_volume(&self, volume: &str, archive: &Path) -> Result<()> {
        let archive = archive
            .canonicalize()
            .with_context(|| format!("Archive {} not accessible", archive.display()))?;
        let dir = archive
            .parent()
            .ok_or_else(|| anyhow!("archive has no parent directory"))?;
        let name = archive
            .file_name()
            .ok_or_else(|| anyhow!("archive has no file name"))?
            .to_string_lossy()
            .to_string();

        let vol_mount = format!("{}:/target", volume);
        let backup_mount = format!("{}:/backup:ro", dir.display());
        let script = format!(
            "find /target -mindepth 1 -delete && tar xzf /backup/{} -C /target",
            name
        );

        self.docker_command(&[
            "run", "--rm", "-v", &vol_mount, "-v", &backup_mount, "alpine", "sh", "-c", &script,
        ])?;
        Ok(())
    }
}

impl ContainerRuntime for DockerManager {
    async fn pull(&self, service: &str) -> Result<()> {
        self.compose_command(&["pull", service])?;
        Ok(())
    }

    async fn configured_image(&self, service: &str) -> Result<String> {
        self.compose_images()?
            .remove(service)
            .ok_or_else(|| anyhow!("service '{}' has no image in docker-compose.yml", service))
    }

    async fn image_id(&self, image_ref: &str) -> Result<Option<String>> {
        match self.docker.inspect_image(image_ref).await {
            Ok(image) => Ok(image.id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_image_id(&self, container: &str) -> Result<Option<String>> {
        Ok(self.inspect(container).await?.map(|c| c.image_id))
    }

    async fn status(&self, container: &str) -> Result<ContainerState> {
        Ok(self
            .inspect(container)
            .await?
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }

    async fn health(&self, container: &str) -> Result<HealthStatus> {
        Ok(self
            .inspect(container)
            .await?
            .map(|c| c.health)
            .unwrap_or(HealthStatus::None))
    }

    async fn stop_service(&self, service: &str) -> Result<()> {
        self.compose_command(&["stop", service])?;
        Ok(())
    }

    async fn up_service(&self, service: &str) -> Result<()> {
        self.compose_command(&["up", "-d", "--no-deps", service])?;
        Ok(())
    }

    async fn start_container(&self, container: &str) -> Result<()> {
        self.docker_command(&["start", container])?;
        Ok(())
    }

    async fn stop_container(&self, container: &str) -> Result<()> {
        self.docker_command(&["stop", container])?;
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.docker_command(&["rm", "-f", container])?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.docker_command(&["rmi", image])?;
        Ok(())
    }

    async fn commit(&self, container: &str, image_tag: &str) -> Result<()> {
        self.docker_command(&["commit", container, image_tag])?;
        Ok(())
    }

    async fn rename(&self, container: &str, new_name: &str) -> Result<()> {
        self.docker_command(&["rename", container, new_name])?;
        Ok(())
    }

    async fn exec(&self, service: &str, user: Option<&str>, cmd: &[&str]) -> Result<String> {
        let mut args = vec!["exec", "-T"];
        if let Some(user) = user {
            args.push("--user");
            args.push(user);
        }
        args.push(service);
        args.extend_from_slice(cmd);
        self.compose_command(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_docker_manager_requires_compose_file() {
        let dir = tempfile::tempdir().unwrap();
        // No docker-compose.yml in an empty directory; construction must
        // fail regardless of daemon availability.
        if Docker::connect_with_local_defaults().is_ok() {
            assert!(DockerManager::new(dir.path(), "nextcloud").is_err());
        }
    }
}
