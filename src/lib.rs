//! Run commands inside short-lived, resource-limited containers.
//!
//! A [`Container`] is created from [`ContainerOptions`], started, and then
//! used to run any number of [`Execution`]s, each behaving much like
//! `std::process::Command`. Every container has a time limit after which it
//! is killed and removed, and can hold leases on GPU slots handed out fairly
//! by a shared [`GpuAllocator`].

pub mod config;
pub mod docker;
pub mod error;
pub mod shared;

pub use config::HarnessConfig;
pub use docker::{
    Container, ContainerOption, ContainerOptions, DockerClient, EngineClient, Execution,
    GpuAllocator,
};
pub use error::{ExitError, HarnessError, Result};
