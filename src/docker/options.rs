use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::{ContainerSpec, DeviceMapping, HostSpec, VolumeMount};
use super::gpu::{GpuAllocator, GpuLease};
use super::streams::{InputStream, SharedSink};
use super::terminal::{HostTerminal, Terminal};
use crate::config::HarnessConfig;
use crate::error::Result;

pub const DEVICE_CTL: &str = "/dev/nvidiactl";
pub const DEVICE_UVM: &str = "/dev/nvidia-uvm";
pub const DEVICE_UVM_TOOLS: &str = "/dev/nvidia-uvm-tools";

pub const CONTAINER_SOURCE_DIR: &str = "/src";
pub const CONTAINER_DATA_DIR: &str = "/data";
pub const CONTAINER_BUILD_DIR: &str = "/build";

const NVIDIA_VOLUME_DRIVER: &str = "nvidia-driver";

// Capabilities a build sandbox never needs.
const DEFAULT_CAP_DROP: &[&str] = &[
    "chown",
    "dac_override",
    "fowner",
    "fsetid",
    "setgid",
    "setuid",
    "setpcap",
    "net_bind_service",
    "net_raw",
    "sys_chroot",
    "mknod",
    "audit_write",
    "setfcap",
];

fn default_env(config: &HarnessConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |k: &str, v: &str| {
        env.insert(k.to_string(), v.to_string());
    };
    set("CI", &config.app_name);
    set("HARNESS_ARCH", &format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH));
    set("HARNESS_USER", &config.username);
    set("SOURCE_DIR", CONTAINER_SOURCE_DIR);
    set("DATA_DIR", CONTAINER_DATA_DIR);
    set("BUILD_DIR", CONTAINER_BUILD_DIR);
    set("TERM", "xterm");
    set(
        "PATH",
        "/usr/local/cuda/bin:/usr/local/nvidia/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    );
    set("LD_LIBRARY_PATH", "/usr/local/cuda/lib64:/usr/local/nvidia/lib64");
    set("SHELL", "/bin/bash");
    env
}

/// Named options accepted by `ContainerOptions::with`.
pub enum ContainerOption {
    Name(String),
    Image(String),
    User(String),
    Entrypoint(Vec<String>),
    Cmd(Vec<String>),
    Shell(Vec<String>),
    Env(String, String),
    WorkingDir(String),
    Hostname(String),
    Memory(i64),
    Devices(Vec<DeviceMapping>),
    CudaDevice(usize),
    Gpus { allocator: Arc<GpuAllocator>, count: usize },
    Tty(bool),
    OpenStdin(bool),
    NetworkDisabled(bool),
    ReadonlyRootfs(bool),
    Privileged(bool),
    Runtime(String),
    Volume(String),
    NvidiaVolume(String),
    TimeLimit(Duration),
    Stdin(InputStream),
    Stdout(SharedSink),
    Stderr(SharedSink),
    Terminal(Arc<dyn Terminal>),
    Parent(CancellationToken),
}

impl fmt::Debug for ContainerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerOption::Name(v) => write!(f, "Name({v})"),
            ContainerOption::Image(v) => write!(f, "Image({v})"),
            ContainerOption::User(v) => write!(f, "User({v})"),
            ContainerOption::Entrypoint(v) => write!(f, "Entrypoint({v:?})"),
            ContainerOption::Cmd(v) => write!(f, "Cmd({v:?})"),
            ContainerOption::Shell(v) => write!(f, "Shell({v:?})"),
            ContainerOption::Env(k, v) => write!(f, "Env({k}={v})"),
            ContainerOption::WorkingDir(v) => write!(f, "WorkingDir({v})"),
            ContainerOption::Hostname(v) => write!(f, "Hostname({v})"),
            ContainerOption::Memory(v) => write!(f, "Memory({v})"),
            ContainerOption::Devices(v) => write!(f, "Devices({v:?})"),
            ContainerOption::CudaDevice(v) => write!(f, "CudaDevice({v})"),
            ContainerOption::Gpus { count, .. } => write!(f, "Gpus({count})"),
            ContainerOption::Tty(v) => write!(f, "Tty({v})"),
            ContainerOption::OpenStdin(v) => write!(f, "OpenStdin({v})"),
            ContainerOption::NetworkDisabled(v) => write!(f, "NetworkDisabled({v})"),
            ContainerOption::ReadonlyRootfs(v) => write!(f, "ReadonlyRootfs({v})"),
            ContainerOption::Privileged(v) => write!(f, "Privileged({v})"),
            ContainerOption::Runtime(v) => write!(f, "Runtime({v})"),
            ContainerOption::Volume(v) => write!(f, "Volume({v})"),
            ContainerOption::NvidiaVolume(v) => write!(f, "NvidiaVolume({v})"),
            ContainerOption::TimeLimit(v) => write!(f, "TimeLimit({v:?})"),
            ContainerOption::Stdin(_) => f.write_str("Stdin(..)"),
            ContainerOption::Stdout(_) => f.write_str("Stdout(..)"),
            ContainerOption::Stderr(_) => f.write_str("Stderr(..)"),
            ContainerOption::Terminal(_) => f.write_str("Terminal(..)"),
            ContainerOption::Parent(_) => f.write_str("Parent(..)"),
        }
    }
}

pub fn cuda_devices(device: usize) -> Vec<DeviceMapping> {
    vec![
        DeviceMapping::passthrough(DEVICE_CTL),
        DeviceMapping::passthrough(DEVICE_UVM),
        DeviceMapping::passthrough(DEVICE_UVM_TOOLS),
        DeviceMapping::passthrough(format!("/dev/nvidia{device}")),
    ]
}

/// Accumulates everything `Container::new` needs. Only the time limit can
/// change once the container exists.
pub struct ContainerOptions {
    pub(crate) spec: ContainerSpec,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) time_limit: Duration,
    pub(crate) gpus: Option<(Arc<GpuAllocator>, usize)>,
    pub(crate) stdin: Option<InputStream>,
    pub(crate) stdout: Option<SharedSink>,
    pub(crate) stderr: Option<SharedSink>,
    pub(crate) terminal: Arc<dyn Terminal>,
    pub(crate) parent: CancellationToken,
}

impl fmt::Debug for ContainerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerOptions")
            .field("spec", &self.spec)
            .field("env", &self.env)
            .field("time_limit", &self.time_limit)
            .field("gpus", &self.gpus.as_ref().map(|(_, n)| *n))
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

impl ContainerOptions {
    pub fn new(config: &HarnessConfig) -> Result<Self> {
        let mut env = default_env(config);
        env.extend(config.env.clone());

        let spec = ContainerSpec {
            hostname: format!("{}-run-{}", config.app_name, Uuid::new_v4()),
            image: config.image.clone(),
            user: config.username.clone(),
            entrypoint: vec!["/bin/sh".to_string()],
            working_dir: CONTAINER_BUILD_DIR.to_string(),
            tty: true,
            network_disabled: true,
            stop_signal: "SIGKILL".to_string(),
            host: HostSpec {
                memory: config.memory_limit_bytes()?,
                memory_swap: -1,
                cap_drop: DEFAULT_CAP_DROP.iter().map(|c| c.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        };

        Ok(Self {
            spec,
            env,
            time_limit: config.time_limit(),
            gpus: None,
            stdin: None,
            stdout: Some(SharedSink::discard()),
            stderr: Some(SharedSink::discard()),
            terminal: HostTerminal::shared(),
            parent: CancellationToken::new(),
        })
    }

    pub fn with(mut self, option: ContainerOption) -> Self {
        self.apply(option);
        self
    }

    pub fn with_all(mut self, options: impl IntoIterator<Item = ContainerOption>) -> Self {
        for option in options {
            self.apply(option);
        }
        self
    }

    pub fn apply(&mut self, option: ContainerOption) {
        match option {
            ContainerOption::Name(name) => self.spec.name = Some(name),
            ContainerOption::Image(image) => self.spec.image = image,
            ContainerOption::User(user) => self.spec.user = user,
            ContainerOption::Entrypoint(e) => self.spec.entrypoint = e,
            ContainerOption::Cmd(c) => self.spec.cmd = c,
            ContainerOption::Shell(s) => self.spec.shell = s,
            ContainerOption::Env(k, v) => {
                self.env.insert(k, v);
            }
            ContainerOption::WorkingDir(dir) => self.spec.working_dir = dir,
            ContainerOption::Hostname(h) => self.spec.hostname = h,
            ContainerOption::Memory(n) => self.spec.host.memory = n,
            ContainerOption::Devices(devices) => self.add_devices(devices),
            ContainerOption::CudaDevice(n) => self.add_devices(cuda_devices(n)),
            ContainerOption::Gpus { allocator, count } => self.gpus = Some((allocator, count)),
            ContainerOption::Tty(b) => self.spec.tty = b,
            ContainerOption::OpenStdin(b) => self.spec.open_stdin = b,
            ContainerOption::NetworkDisabled(b) => self.spec.network_disabled = b,
            ContainerOption::ReadonlyRootfs(b) => self.spec.host.readonly_rootfs = b,
            ContainerOption::Privileged(b) => self.spec.host.privileged = b,
            ContainerOption::Runtime(r) => self.spec.host.runtime = Some(r),
            ContainerOption::Volume(dir) => {
                if !self.spec.volumes.contains(&dir) {
                    self.spec.volumes.push(dir);
                }
            }
            ContainerOption::NvidiaVolume(version) => {
                let name = format!("{NVIDIA_VOLUME_DRIVER}_{version}");
                self.spec.host.mounts.push(VolumeMount {
                    source: name.clone(),
                    target: "/usr/local/nvidia".to_string(),
                    read_only: true,
                    driver: Some(NVIDIA_VOLUME_DRIVER.to_string()),
                    labels: BTreeMap::from([("name".to_string(), name)]),
                });
            }
            ContainerOption::TimeLimit(d) => self.time_limit = d,
            ContainerOption::Stdin(s) => self.stdin = Some(s),
            ContainerOption::Stdout(s) => self.stdout = Some(s),
            ContainerOption::Stderr(s) => self.stderr = Some(s),
            ContainerOption::Terminal(t) => self.terminal = t,
            ContainerOption::Parent(token) => self.parent = token,
        }
    }

    fn add_devices(&mut self, devices: Vec<DeviceMapping>) {
        let existing = &mut self.spec.host.devices;
        for device in devices {
            if !existing.contains(&device) {
                existing.push(device);
            }
        }
    }

    /// Maps the leased devices into the container. Device indices inside the
    /// container start from zero regardless of the host index.
    pub(crate) fn bind_gpus(&mut self, leases: &[GpuLease]) {
        let mut devices: Vec<usize> = Vec::new();
        for lease in leases {
            if !devices.contains(&lease.device()) {
                devices.push(lease.device());
            }
        }

        for device in &devices {
            self.add_devices(cuda_devices(*device));
        }
        let visible: Vec<String> = (0..devices.len()).map(|i| i.to_string()).collect();
        self.env
            .insert("CUDA_VISIBLE_DEVICES".to_string(), visible.join(","));
    }

    /// The engine-facing spec with the environment and stdin flags resolved.
    pub fn spec(&self) -> ContainerSpec {
        let mut spec = self.spec.clone();
        spec.env = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if self.stdin.is_some() {
            spec.attach_stdin = true;
            spec.open_stdin = true;
        }
        spec
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn image(&self) -> &str {
        &self.spec.image
    }

    pub fn tty(&self) -> bool {
        self.spec.tty
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }
}
