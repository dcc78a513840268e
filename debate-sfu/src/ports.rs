//! Loopback port allocation for recording relays
//!
//! Every relay transport sends RTP to `127.0.0.1:<port>` where a recorder
//! process listens. Ports come from one process-wide range shared by all
//! rooms, so allocation is guarded by a mutex and never blocks on I/O.

use parking_lot::Mutex;
use rand::RngExt;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::{Result, SfuError};

/// Random draws attempted before falling back to a linear scan
const MAX_RANDOM_ATTEMPTS: usize = 32;

pub struct PortAllocator {
    min: u16,
    max: u16,
    taken: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Allocator over the inclusive range `min..=max`
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            taken: Mutex::new(HashSet::new()),
        }
    }

    /// Number of ports in the range
    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.taken.lock().len()
    }

    #[must_use]
    pub fn is_held(&self, port: u16) -> bool {
        self.taken.lock().contains(&port)
    }

    /// Take a free port.
    ///
    /// Random draws keep consecutive relays from reusing the same socket
    /// while the range is sparsely used; once those keep colliding a scan
    /// from a random offset either finds the remaining free port or proves
    /// the range is exhausted.
    pub fn acquire(&self) -> Result<u16> {
        let mut taken = self.taken.lock();
        if taken.len() >= self.capacity() {
            warn!(min = self.min, max = self.max, "Recorder port range exhausted");
            return Err(SfuError::ResourceExhausted {
                min: self.min,
                max: self.max,
            });
        }

        let mut rng = rand::rng();
        for _ in 0..MAX_RANDOM_ATTEMPTS {
            let port = rng.random_range(self.min..=self.max);
            if taken.insert(port) {
                debug!(port, in_use = taken.len(), "Acquired recorder port");
                return Ok(port);
            }
        }

        let span = self.capacity();
        let offset = rng.random_range(0..span);
        let found = (0..span)
            .filter_map(|i| u16::try_from((offset + i) % span).ok())
            .map(|delta| self.min + delta)
            .find(|port| !taken.contains(port));

        match found {
            Some(port) => {
                taken.insert(port);
                debug!(port, in_use = taken.len(), "Acquired recorder port after scan");
                Ok(port)
            }
            None => Err(SfuError::ResourceExhausted {
                min: self.min,
                max: self.max,
            }),
        }
    }

    /// Return a port to the pool. Returns false if it was not held.
    pub fn release(&self, port: u16) -> bool {
        let released = self.taken.lock().remove(&port);
        if released {
            debug!(port, "Released recorder port");
        } else {
            warn!(port, "Released a recorder port that was not held");
        }
        released
    }
}
