//! Containers and the commands run inside them.

mod client;
mod container;
mod engine;
mod exec;
mod gpu;
mod hijack;
mod options;
#[cfg(unix)]
mod signals;
mod stdcopy;
mod streams;
mod terminal;
mod tty;

pub use client::DockerClient;
pub use container::{Container, ContainerState};
pub use engine::{
    AttachSpec, ContainerInfo, ContainerSpec, DeviceMapping, EngineClient, ExecSpec, ExecStatus,
    HijackedConnection, HostSpec, VolumeMount,
};
pub use exec::{Execution, ExecutionState, PipeReader, PipeWriter};
pub use gpu::{GpuAllocator, GpuInfo, GpuInfoProvider, GpuLease, NvidiaSmi, StaticGpuInfo};
pub use hijack::{hold_hijacked_connection, RelayEnd, StreamBinding};
pub use options::{
    cuda_devices, ContainerOption, ContainerOptions, CONTAINER_BUILD_DIR, CONTAINER_DATA_DIR,
    CONTAINER_SOURCE_DIR, DEVICE_CTL, DEVICE_UVM, DEVICE_UVM_TOOLS,
};
#[cfg(unix)]
pub use signals::SignalForwarder;
pub use stdcopy::{demux, encode_frame, StdStream};
pub use streams::{InputStream, OutputStream, SharedBuffer, SharedSink};
pub use terminal::{HostTerminal, Terminal, TerminalSize};
pub use tty::{monitor_tty_size, monitor_tty_size_with, ResizeTarget, TtyMonitor, WatchMode};
