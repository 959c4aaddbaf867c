// ABOUTME: Host port pool for case containers with owned release tokens
// ABOUTME: Allocates discrete port slots from a bounded range and guarantees single release

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PortPoolError {
    #[error("Port pool exhausted: all {capacity} ports in {start}-{end} are in use")]
    Exhausted { start: u16, end: u16, capacity: usize },
    #[error("Invalid port range: {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
}

pub type Result<T> = std::result::Result<T, PortPoolError>;

/// Bounded pool of host ports handed out to running case containers.
///
/// Ports are tracked as an arena of slots. `allocate` returns a [`PortLease`]
/// that owns the slot; the slot returns to the pool exactly once, either via
/// an explicit [`PortLease::release`] or when the lease is dropped.
pub struct PortPool {
    start: u16,
    end: u16,
    slots: Arc<Mutex<Vec<bool>>>,
}

impl PortPool {
    /// Create a pool over the half-open range `[start, end)`.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if end <= start {
            return Err(PortPoolError::InvalidRange { start, end });
        }

        Ok(Self {
            start,
            end,
            slots: Arc::new(Mutex::new(vec![false; (end - start) as usize])),
        })
    }

    /// Allocate the lowest free port in the range.
    pub fn allocate(&self) -> Result<PortLease> {
        let mut slots = lock_slots(&self.slots);

        for (index, taken) in slots.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                let port = self.start + index as u16;
                debug!("Allocated port {} (slot {})", port, index);
                return Ok(PortLease {
                    port,
                    slot: index,
                    slots: Arc::clone(&self.slots),
                    released: false,
                });
            }
        }

        warn!("Port pool exhausted: {}-{}", self.start, self.end);
        Err(PortPoolError::Exhausted {
            start: self.start,
            end: self.end,
            capacity: slots.len(),
        })
    }

    /// Number of ports currently leased out.
    pub fn occupancy(&self) -> usize {
        lock_slots(&self.slots).iter().filter(|taken| **taken).count()
    }

    /// Total number of slots in the pool.
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize
    }
}

/// Owned token for one allocated port.
///
/// The lease is the only way a port leaves the pool and the only way it comes
/// back: `release` consumes the lease, and dropping an unreleased lease frees
/// the slot as well, so failure paths cannot leak a port and no code path can
/// free the same slot twice.
pub struct PortLease {
    port: u16,
    slot: usize,
    slots: Arc<Mutex<Vec<bool>>>,
    released: bool,
}

impl PortLease {
    /// The leased host port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the port to the pool.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut slots = lock_slots(&self.slots);
        slots[self.slot] = false;
        debug!("Released port {} (slot {})", self.port, self.slot);
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

fn lock_slots(slots: &Mutex<Vec<bool>>) -> std::sync::MutexGuard<'_, Vec<bool>> {
    slots.lock().unwrap_or_else(|poisoned| {
        warn!("Port pool mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_range() {
        assert!(PortPool::new(9000, 9000).is_err());
        assert!(PortPool::new(9010, 9000).is_err());
    }

    #[test]
    fn test_allocates_distinct_ports() {
        let pool = PortPool::new(9000, 9004).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();

        assert_ne!(a.port(), b.port());
        assert_ne!(b.port(), c.port());
        assert_eq!(pool.occupancy(), 3);
    }

    #[test]
    fn test_exhaustion() {
        let pool = PortPool::new(9000, 9002).unwrap();
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();

        match pool.allocate() {
            Err(PortPoolError::Exhausted { capacity, .. }) => assert_eq!(capacity, 2),
            other => panic!("expected exhaustion, got {:?}", other.map(|l| l.port())),
        }
    }

    #[test]
    fn test_release_returns_port_to_pool() {
        let pool = PortPool::new(9000, 9001).unwrap();
        let lease = pool.allocate().unwrap();
        let port = lease.port();
        assert_eq!(pool.occupancy(), 1);

        lease.release();
        assert_eq!(pool.occupancy(), 0);

        let again = pool.allocate().unwrap();
        assert_eq!(again.port(), port);
    }

    #[test]
    fn test_drop_releases_port() {
        let pool = PortPool::new(9000, 9001).unwrap();
        {
            let _lease = pool.allocate().unwrap();
            assert_eq!(pool.occupancy(), 1);
        }
        assert_eq!(pool.occupancy(), 0);
    }

    #[test]
    fn test_occupancy_returns_to_baseline_after_many_cycles() {
        let pool = PortPool::new(9000, 9008).unwrap();

        for _ in 0..10 {
            let leases: Vec<_> = (0..pool.capacity())
                .map(|_| pool.allocate().unwrap())
                .collect();
            assert_eq!(pool.occupancy(), pool.capacity());
            drop(leases);
            assert_eq!(pool.occupancy(), 0);
        }
    }
}
