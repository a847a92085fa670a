use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A raw bidirectional byte stream obtained by upgrading an attach or exec-start
/// request. `output` carries what the process writes (multiplexed frames unless
/// the session has a TTY), `input` is forwarded to the process's stdin.
pub struct HijackedConnection {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for HijackedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedConnection").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

impl DeviceMapping {
    pub fn passthrough(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path_on_host: path.clone(),
            path_in_container: path,
            cgroup_permissions: "rwm".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub driver: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub privileged: bool,
    pub memory: i64,
    pub memory_swap: i64,
    pub devices: Vec<DeviceMapping>,
    pub cap_drop: Vec<String>,
    pub binds: Vec<String>,
    pub mounts: Vec<VolumeMount>,
    pub readonly_rootfs: bool,
    pub runtime: Option<String>,
}

/// Everything the engine needs to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub hostname: String,
    pub image: String,
    pub user: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub shell: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub tty: bool,
    pub open_stdin: bool,
    pub attach_stdin: bool,
    pub network_disabled: bool,
    pub stop_signal: String,
    pub volumes: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub host: HostSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: String,
    pub privileged: bool,
    pub tty: bool,
    pub attach_stdin: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachSpec {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// The remote container engine, as seen by the harness. Implementations must
/// be safe for concurrent use; the harness shares one through an `Arc`.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn has_image(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn list_images(&self) -> Result<Vec<String>>;

    async fn remove_image(&self, image: &str, force: bool) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    async fn attach_container(
        &self,
        id: &str,
        attach: AttachSpec,
        tty: bool,
    ) -> Result<HijackedConnection>;

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String>;

    /// Starts the exec with its streams hijacked.
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<HijackedConnection>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus>;

    async fn resize_container(&self, id: &str, height: u16, width: u16) -> Result<()>;

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()>;
}
