//! Fair assignment of GPU device slots to containers.
//!
//! Each physical device exposes `hyper_q` logical slots. The pool hands out the
//! oldest-inserted slots first and puts released slots at the back, so under
//! sustained load work is spread round-robin across devices.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuInfo {
    pub device_count: usize,
    pub hyper_q: usize,
}

#[async_trait]
pub trait GpuInfoProvider: Send + Sync {
    async fn detect(&self) -> Result<GpuInfo>;
}

/// A fixed device layout, useful for hosts where detection is not wanted.
#[derive(Debug, Clone, Copy)]
pub struct StaticGpuInfo(pub GpuInfo);

#[async_trait]
impl GpuInfoProvider for StaticGpuInfo {
    async fn detect(&self) -> Result<GpuInfo> {
        Ok(self.0)
    }
}

/// Counts devices reported by `nvidia-smi -L`.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    pub hyper_q: usize,
}

#[async_trait]
impl GpuInfoProvider for NvidiaSmi {
    async fn detect(&self) -> Result<GpuInfo> {
        let output = Command::new("nvidia-smi").arg("-L").output().await?;
        if !output.status.success() {
            return Err(HarnessError::NoGpuDevices);
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        let device_count = listing
            .lines()
            .filter(|l| l.trim_start().starts_with("GPU "))
            .count();
        debug!("nvidia-smi reported {} devices", device_count);
        Ok(GpuInfo {
            device_count,
            hyper_q: self.hyper_q,
        })
    }
}

/// A capability token for one logical slot on one device. Dropping it does not
/// return it to the pool; hand it back through `GpuAllocator::release`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct GpuLease {
    device: usize,
    slot: usize,
}

impl GpuLease {
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn key(&self) -> String {
        format!("dev[{}];hyperq[{}]", self.device, self.slot)
    }
}

impl fmt::Display for GpuLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

struct LeasePool {
    capacity: usize,
    queue: VecDeque<GpuLease>,
}

pub struct GpuAllocator {
    provider: Arc<dyn GpuInfoProvider>,
    pool: OnceCell<Mutex<LeasePool>>,
}

impl fmt::Debug for GpuAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuAllocator")
            .field("initialized", &self.pool.initialized())
            .finish()
    }
}

impl GpuAllocator {
    /// Devices are enumerated on the first allocation, not here.
    pub fn new(provider: Arc<dyn GpuInfoProvider>) -> Self {
        Self {
            provider,
            pool: OnceCell::new(),
        }
    }

    /// Detects devices with `nvidia-smi`, using the configured slots per device.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(Arc::new(NvidiaSmi {
            hyper_q: config.hyper_q,
        }))
    }

    pub fn with_devices(device_count: usize, hyper_q: usize) -> Self {
        Self::new(Arc::new(StaticGpuInfo(GpuInfo {
            device_count,
            hyper_q,
        })))
    }

    async fn pool(&self) -> Result<&Mutex<LeasePool>> {
        self.pool
            .get_or_try_init(|| async {
                let info = self.provider.detect().await?;
                if info.device_count == 0 || info.hyper_q == 0 {
                    return Err(HarnessError::NoGpuDevices);
                }

                let mut queue = VecDeque::with_capacity(info.device_count * info.hyper_q);
                for slot in 0..info.hyper_q {
                    for device in 0..info.device_count {
                        queue.push_back(GpuLease { device, slot });
                    }
                }
                info!(
                    "GPU pool initialized with {} devices x {} slots",
                    info.device_count, info.hyper_q
                );
                Ok(Mutex::new(LeasePool {
                    capacity: queue.len(),
                    queue,
                }))
            })
            .await
    }

    /// Takes the `count` oldest leases, or none at all if fewer are available.
    pub async fn allocate(&self, count: usize) -> Result<Vec<GpuLease>> {
        let pool = self.pool().await?;
        let mut pool = pool.lock();

        let available = pool.queue.len();
        if available < count {
            return Err(HarnessError::ResourceExhausted {
                requested: count,
                available,
            });
        }

        let leases: Vec<GpuLease> = pool.queue.drain(..count).collect();
        debug!(
            "Allocated GPU leases [{}], {} remaining",
            leases.iter().map(GpuLease::key).collect::<Vec<_>>().join(", "),
            pool.queue.len()
        );
        Ok(leases)
    }

    pub fn release(&self, leases: Vec<GpuLease>) {
        if leases.is_empty() {
            return;
        }
        // Leases only come from `allocate`, so the pool exists.
        let Some(pool) = self.pool.get() else {
            return;
        };
        let mut pool = pool.lock();
        for lease in leases {
            debug!("Released GPU lease {}", lease);
            pool.queue.push_back(lease);
        }
    }

    /// Leases currently in the pool; zero before the first allocation.
    pub fn available(&self) -> usize {
        self.pool.get().map(|p| p.lock().queue.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.pool.get().map(|p| p.lock().capacity).unwrap_or(0)
    }
}
