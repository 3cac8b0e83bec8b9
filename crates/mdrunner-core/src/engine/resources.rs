use super::error::EngineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// The bounded thread pool a rank runs its kernels on.
pub struct ComputePool {
    threads: usize,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for ComputePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePool")
            .field("threads", &self.threads)
            .finish()
    }
}

impl ComputePool {
    pub fn new(rank: usize, threads: usize) -> Result<Self, EngineError> {
        let threads = threads.max(1);
        #[cfg(feature = "parallel")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("rank-{}-worker-{}", rank, i))
            .build()
            .map_err(|e| {
                EngineError::Resource(format!(
                    "could not start {} worker threads for rank {}: {}",
                    threads, rank, e
                ))
            })?;
        #[cfg(not(feature = "parallel"))]
        let _ = rank;

        Ok(Self {
            threads,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `f` with this pool as the current rayon pool.
    pub fn install<T: Send>(&self, f: impl FnOnce() -> T + Send) -> T {
        #[cfg(feature = "parallel")]
        {
            self.pool.install(f)
        }
        #[cfg(not(feature = "parallel"))]
        {
            f()
        }
    }
}

/// Tracks which accelerators are held by which ranks of this process.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    holders: Mutex<HashMap<usize, Vec<usize>>>,
    granted: AtomicUsize,
}

impl DeviceRegistry {
    /// Registers `rank` as a user of `device` until the lease is dropped.
    pub fn acquire(&self, device: usize, rank: usize) -> DeviceLease<'_> {
        let mut holders = self.holders.lock();
        let users = holders.entry(device).or_default();
        users.push(rank);
        self.granted.fetch_add(1, Ordering::Relaxed);
        debug!(device, rank, sharing = users.len(), "Acquired accelerator.");
        DeviceLease {
            registry: self,
            device,
            rank,
        }
    }

    /// Ranks currently holding `device`.
    pub fn holders(&self, device: usize) -> Vec<usize> {
        self.holders
            .lock()
            .get(&device)
            .cloned()
            .unwrap_or_default()
    }

    pub fn leased_devices(&self) -> usize {
        self.holders.lock().len()
    }

    /// Leases handed out since the registry was created, released or not.
    pub fn leases_granted(&self) -> usize {
        self.granted.load(Ordering::Relaxed)
    }

    fn release(&self, device: usize, rank: usize) {
        let mut holders = self.holders.lock();
        if let Some(users) = holders.get_mut(&device) {
            if let Some(pos) = users.iter().position(|&r| r == rank) {
                users.remove(pos);
            }
            if users.is_empty() {
                holders.remove(&device);
            }
        }
        debug!(device, rank, "Released accelerator.");
    }
}

/// A rank's hold on an accelerator. Released on drop.
#[derive(Debug)]
pub struct DeviceLease<'a> {
    registry: &'a DeviceRegistry,
    device: usize,
    rank: usize,
}

impl DeviceLease<'_> {
    pub fn device(&self) -> usize {
        self.device
    }
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        self.registry.release(self.device, self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_are_released_on_drop() {
        let registry = DeviceRegistry::default();
        let a = registry.acquire(0, 0);
        let b = registry.acquire(0, 2);
        assert_eq!(registry.holders(0), vec![0, 2]);
        drop(a);
        assert_eq!(registry.holders(0), vec![2]);
        assert_eq!(b.device(), 0);
        drop(b);
        assert_eq!(registry.leased_devices(), 0);
        assert_eq!(registry.leases_granted(), 2);
    }

    #[test]
    fn pool_runs_work_with_requested_threads() {
        let pool = ComputePool::new(0, 2).unwrap();
        assert_eq!(pool.threads(), 2);
        let sum: usize = pool.install(|| (1..=10).sum());
        assert_eq!(sum, 55);
    }
}
