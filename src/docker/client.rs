use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    ResizeContainerTtyOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{
    DeviceMapping as BollardDevice, HostConfig, Mount, MountTypeEnum, MountVolumeOptions,
    MountVolumeOptionsDriverConfig,
};
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info};

use super::engine::{
    AttachSpec, ContainerInfo, ContainerSpec, EngineClient, ExecSpec, ExecStatus,
    HijackedConnection,
};
use super::stdcopy::{encode_frame, StdStream};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// `EngineClient` backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects using the `docker:` section of the configuration and checks
    /// that the daemon answers.
    pub async fn new(config: &HarnessConfig) -> Result<Self> {
        let docker = connect(config)?;

        let version = docker
            .version()
            .await
            .map_err(|e| HarnessError::engine("version", &config.host, e))?;
        info!(
            "Connected to Docker daemon version: {}",
            version.version.unwrap_or_default()
        );

        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

fn client_version(config: &HarnessConfig) -> Result<ClientVersion> {
    if config.api_version == "default" || config.api_version.is_empty() {
        return Ok(API_DEFAULT_VERSION.clone());
    }
    let invalid = || HarnessError::Config(format!("invalid API version {:?}", config.api_version));
    let (major, minor) = config.api_version.split_once('.').ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}

/// TLS material lives in `cert_path`, or in `~/.docker` when only
/// `tls_verify` is set.
fn cert_dir(config: &HarnessConfig) -> Option<PathBuf> {
    match &config.cert_path {
        Some(path) => Some(PathBuf::from(path)),
        None if config.tls_verify => dirs::home_dir().map(|home| home.join(".docker")),
        None => None,
    }
}

fn connect(config: &HarnessConfig) -> Result<Docker> {
    let connect_err = |e: BollardError| HarnessError::engine("connect", &config.host, e);

    if config.uses_default_host() {
        return Docker::connect_with_local_defaults().map_err(connect_err);
    }

    let version = client_version(config)?;
    let host = config.host.as_str();
    if let Some(socket) = host.strip_prefix("unix://") {
        return Docker::connect_with_socket(socket, CONNECT_TIMEOUT_SECS, &version)
            .map_err(connect_err);
    }

    match cert_dir(config) {
        Some(certs) => {
            let certs = certs.as_path();
            Docker::connect_with_ssl(
                host,
                &certs.join("key.pem"),
                &certs.join("cert.pem"),
                &certs.join("ca.pem"),
                CONNECT_TIMEOUT_SECS,
                &version,
            )
            .map_err(connect_err)
        }
        None => Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, &version).map_err(connect_err),
    }
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let host = &spec.host;
    let devices = host
        .devices
        .iter()
        .map(|d| BollardDevice {
            path_on_host: Some(d.path_on_host.clone()),
            path_in_container: Some(d.path_in_container.clone()),
            cgroup_permissions: Some(d.cgroup_permissions.clone()),
        })
        .collect();
    let mounts = host
        .mounts
        .iter()
        .map(|m| Mount {
            source: Some(m.source.clone()),
            target: Some(m.target.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(m.read_only),
            volume_options: Some(MountVolumeOptions {
                driver_config: m.driver.as_ref().map(|name| MountVolumeOptionsDriverConfig {
                    name: Some(name.clone()),
                    options: None,
                }),
                labels: Some(m.labels.clone().into_iter().collect()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    HostConfig {
        privileged: Some(host.privileged),
        memory: Some(host.memory),
        memory_swap: Some(host.memory_swap),
        devices: Some(devices),
        cap_drop: Some(host.cap_drop.clone()),
        binds: Some(host.binds.clone()),
        mounts: Some(mounts),
        readonly_rootfs: Some(host.readonly_rootfs),
        runtime: host.runtime.clone(),
        ..Default::default()
    }
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    (!v.is_empty()).then(|| v.to_vec())
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let volumes: HashMap<String, HashMap<(), ()>> = spec
        .volumes
        .iter()
        .map(|v| (v.clone(), HashMap::new()))
        .collect();

    Config {
        hostname: Some(spec.hostname.clone()),
        image: Some(spec.image.clone()),
        user: Some(spec.user.clone()),
        entrypoint: non_empty(&spec.entrypoint),
        cmd: non_empty(&spec.cmd),
        shell: non_empty(&spec.shell),
        env: Some(spec.env.clone()),
        working_dir: Some(spec.working_dir.clone()),
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        attach_stdin: Some(spec.attach_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(spec.network_disabled),
        stop_signal: Some(spec.stop_signal.clone()),
        volumes: Some(volumes),
        labels: Some(spec.labels.clone().into_iter().collect()),
        host_config: Some(host_config(spec)),
        ..Default::default()
    }
}

/// Turns bollard's decoded log stream back into a byte stream. Without a TTY
/// the bytes are re-framed so callers always see the engine's wire format.
fn output_reader<S>(output: S, tty: bool) -> Box<dyn tokio::io::AsyncRead + Send + Unpin>
where
    S: Stream<Item = std::result::Result<LogOutput, BollardError>> + Send + Unpin + 'static,
{
    let bytes = output.map(move |item| {
        let item = item.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok::<Bytes, io::Error>(match item {
            LogOutput::StdOut { message } if !tty => encode_frame(StdStream::Stdout, &message),
            LogOutput::StdErr { message } if !tty => encode_frame(StdStream::Stderr, &message),
            LogOutput::StdIn { message } if !tty => encode_frame(StdStream::Stdin, &message),
            LogOutput::Console { message } if !tty => encode_frame(StdStream::Stdout, &message),
            other => other.into_bytes(),
        })
    });
    Box::new(StreamReader::new(bytes))
}

#[async_trait]
impl EngineClient for DockerClient {
    async fn has_image(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(HarnessError::engine("inspect_image", image, e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling Docker image: {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    error!("Error pulling image: {}", e);
                    return Err(HarnessError::engine("pull_image", image, e));
                }
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| HarnessError::engine("list_images", "local", e))?;
        Ok(images.into_iter().flat_map(|i| i.repo_tags).collect())
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_image(image, Some(options), None)
            .await
            .map_err(|e| HarnessError::engine("remove_image", image, e))?;
        info!("Removed image: {}", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = spec.name.as_deref().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });
        let response = self
            .docker
            .create_container(options, container_config(spec))
            .await
            .map_err(|e| HarnessError::engine("create_container", &spec.image, e))?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| HarnessError::engine("start_container", id, e))
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal }))
            .await
            .map_err(|e| HarnessError::engine("kill_container", id, e))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| HarnessError::engine("remove_container", id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| HarnessError::engine("inspect_container", id, e))?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerInfo {
            id: response.id.unwrap_or_else(|| id.to_string()),
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn attach_container(
        &self,
        id: &str,
        attach: AttachSpec,
        tty: bool,
    ) -> Result<HijackedConnection> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(attach.stdin),
            stdout: Some(attach.stdout),
            stderr: Some(attach.stderr),
            stream: Some(true),
            logs: Some(attach.logs),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| HarnessError::engine("attach_container", id, e))?;

        Ok(HijackedConnection {
            output: output_reader(output, tty),
            input: Box::new(input),
        })
    }

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            user: Some(spec.user.clone()),
            privileged: Some(spec.privileged),
            tty: Some(spec.tty),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(|e| HarnessError::engine("create_exec", container_id, e))?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<HijackedConnection> {
        let options = StartExecOptions {
            detach: false,
            tty,
            output_capacity: None,
        };
        let started = self
            .docker
            .start_exec(exec_id, Some(options))
            .await
            .map_err(|e| HarnessError::engine("start_exec", exec_id, e))?;

        match started {
            StartExecResults::Attached { output, input } => Ok(HijackedConnection {
                output: output_reader(output, tty),
                input: Box::new(input),
            }),
            StartExecResults::Detached => Err(HarnessError::engine(
                "start_exec",
                exec_id,
                "engine started the exec detached",
            )),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        let response = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| HarnessError::engine("inspect_exec", exec_id, e))?;
        Ok(ExecStatus {
            running: response.running.unwrap_or(false),
            exit_code: response.exit_code,
        })
    }

    async fn resize_container(&self, id: &str, height: u16, width: u16) -> Result<()> {
        self.docker
            .resize_container_tty(id, ResizeContainerTtyOptions { width, height })
            .await
            .map_err(|e| HarnessError::engine("resize_container", id, e))
    }

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
        self.docker
            .resize_exec(exec_id, ResizeExecOptions { height, width })
            .await
            .map_err(|e| HarnessError::engine("resize_exec", exec_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::engine::{DeviceMapping, HostSpec, VolumeMount};
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;

    #[test]
    fn api_version_parses() {
        let mut config = HarnessConfig::default();
        config.api_version = "1.43".to_string();
        let version = client_version(&config).unwrap();
        assert_eq!((version.major_version, version.minor_version), (1, 43));

        config.api_version = "latest".to_string();
        assert!(matches!(client_version(&config), Err(HarnessError::Config(_))));
    }

    #[test]
    fn cert_dir_prefers_explicit_path() {
        let mut config = HarnessConfig::default();
        assert_eq!(cert_dir(&config), None);

        config.tls_verify = true;
        config.cert_path = Some("/etc/docker/certs".to_string());
        assert_eq!(cert_dir(&config), Some(PathBuf::from("/etc/docker/certs")));
    }

    #[test]
    fn container_config_carries_host_settings() {
        let spec = ContainerSpec {
            image: "ubuntu".to_string(),
            entrypoint: vec!["/bin/sh".to_string()],
            volumes: vec!["/data".to_string()],
            host: HostSpec {
                memory: 1024,
                memory_swap: -1,
                devices: vec![DeviceMapping::passthrough("/dev/nvidia0")],
                mounts: vec![VolumeMount {
                    source: "nvidia-driver_1".to_string(),
                    target: "/usr/local/nvidia".to_string(),
                    read_only: true,
                    driver: Some("nvidia-driver".to_string()),
                    labels: BTreeMap::new(),
                }],
                ..Default::default()
            },
            ..Default::default()
        };

        let config = container_config(&spec);
        assert_eq!(config.cmd, None);
        assert!(config.volumes.unwrap().contains_key("/data"));

        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(1024));
        assert_eq!(host.devices.unwrap()[0].path_on_host.as_deref(), Some("/dev/nvidia0"));
        let mount = &host.mounts.unwrap()[0];
        assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mount.read_only, Some(true));
    }

    #[tokio::test]
    async fn non_tty_output_is_reframed() {
        let items = vec![
            Ok(LogOutput::StdOut {
                message: Bytes::from_static(b"out"),
            }),
            Ok(LogOutput::StdErr {
                message: Bytes::from_static(b"err"),
            }),
        ];
        let mut reader = output_reader(stream::iter(items), false);
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();

        let mut expected = encode_frame(StdStream::Stdout, b"out").to_vec();
        expected.extend_from_slice(&encode_frame(StdStream::Stderr, b"err"));
        assert_eq!(raw, expected);
    }

    #[tokio::test]
    async fn tty_output_is_passed_through() {
        let items = vec![Ok(LogOutput::Console {
            message: Bytes::from_static(b"$ "),
        })];
        let mut reader = output_reader(stream::iter(items), true);
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"$ ");
    }
}
