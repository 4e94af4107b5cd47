//! Thread-safe bounded resource pool with lease semantics and idle eviction
//!
//! This module provides a generic pool that hands out at most `max_size` resources at a
//! time. Callers block in FIFO order when the pool is exhausted, leases return their
//! resource on drop, and resources left idle longer than the configured timeout are
//! evicted either on the next access or by an [`IdleReaper`] thread.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Pool sizing and timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live resources (idle + leased)
    pub max_size: usize,
    /// Idle resources older than this are dropped
    pub idle_timeout: Duration,
    /// How long a checkout waits in the queue before giving up (`None` waits forever)
    pub checkout_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 3,
            idle_timeout: Duration::from_secs(30),
            checkout_timeout: Some(Duration::from_secs(2)),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError<E> {
    #[error("Timed out waiting for a pooled resource")]
    Timeout,
    #[error("Failed to create pooled resource: {0}")]
    Create(E),
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub waiting: usize,
    pub max_size: usize,
}

pub struct ResourcePool<T> {
    inner: Mutex<PoolInner<T>>,
    available: Condvar,
    config: PoolConfig,
}

struct IdleEntry<T> {
    resource: T,
    since: Instant,
}

struct PoolInner<T> {
    idle: VecDeque<IdleEntry<T>>,
    leased: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

impl<T> ResourcePool<T> {
    /// Create an empty pool; resources are created lazily on checkout
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                leased: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            available: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lease a resource, reusing the most recently returned idle one or creating a new
    /// one with `create` while under `max_size`. Waits in FIFO order when exhausted.
    pub fn checkout_with<E>(
        &self,
        create: impl FnOnce() -> Result<T, E>,
    ) -> Result<Lease<'_, T>, PoolError<E>> {
        let deadline = self.config.checkout_timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.waiters.push_back(ticket);

        loop {
            if inner.waiters.front() == Some(&ticket) {
                let evicted = inner.take_expired(self.config.idle_timeout);

                if let Some(entry) = inner.idle.pop_back() {
                    inner.waiters.pop_front();
                    inner.leased += 1;
                    self.available.notify_all();
                    drop(inner);
                    drop(evicted);
                    return Ok(Lease::new(self, entry.resource));
                }

                if inner.leased < self.config.max_size {
                    inner.waiters.pop_front();
                    inner.leased += 1;
                    self.available.notify_all();
                    drop(inner);
                    drop(evicted);
                    return match create() {
                        Ok(resource) => Ok(Lease::new(self, resource)),
                        Err(e) => {
                            self.release_slot();
                            Err(PoolError::Create(e))
                        }
                    };
                }
            }

            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut inner, deadline).timed_out() {
                        inner.waiters.retain(|t| *t != ticket);
                        self.available.notify_all();
                        return Err(PoolError::Timeout);
                    }
                }
                None => self.available.wait(&mut inner),
            }
        }
    }

    /// Drop idle resources older than the idle timeout, returning how many were evicted
    pub fn evict_idle(&self) -> usize {
        let evicted = self.inner.lock().take_expired(self.config.idle_timeout);
        let count = evicted.len();
        // Resources are dropped here, outside the lock
        drop(evicted);
        count
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            idle: inner.idle.len(),
            leased: inner.leased,
            waiting: inner.waiters.len(),
            max_size: self.config.max_size,
        }
    }

    fn give_back(&self, resource: T) {
        let mut inner = self.inner.lock();
        inner.leased = inner.leased.saturating_sub(1);
        inner.idle.push_back(IdleEntry {
            resource,
            since: Instant::now(),
        });
        self.available.notify_all();
    }

    fn release_slot(&self) {
        let mut inner = self.inner.lock();
        inner.leased = inner.leased.saturating_sub(1);
        self.available.notify_all();
    }
}

impl<T> PoolInner<T> {
    fn take_expired(&mut self, idle_timeout: Duration) -> Vec<T> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for entry in self.idle.drain(..) {
            if now.duration_since(entry.since) >= idle_timeout {
                expired.push(entry.resource);
            } else {
                kept.push_back(entry);
            }
        }
        self.idle = kept;
        expired
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResourcePool")
            .field("idle", &inner.idle.len())
            .field("leased", &inner.leased)
            .field("waiting", &inner.waiters.len())
            .field("max_size", &self.config.max_size)
            .finish()
    }
}

/// Exclusive lease on a pooled resource; returned to the pool when dropped
pub struct Lease<'a, T> {
    pool: &'a ResourcePool<T>,
    resource: ManuallyDrop<T>,
    discarded: bool,
}

impl<'a, T> Lease<'a, T> {
    fn new(pool: &'a ResourcePool<T>, resource: T) -> Self {
        Self {
            pool,
            resource: ManuallyDrop::new(resource),
            discarded: false,
        }
    }

    /// Destroy the resource instead of returning it (e.g. after a device loss)
    pub fn discard(mut self) {
        self.discarded = true;
    }
}

impl<T> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.resource
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `resource` is taken exactly once, here, and never read again
        let resource = unsafe { ManuallyDrop::take(&mut self.resource) };
        if self.discarded {
            drop(resource);
            self.pool.release_slot();
        } else {
            self.pool.give_back(resource);
        }
    }
}

/// Background thread that periodically evicts idle pool resources.
///
/// Holds only a weak reference, so it exits on its own once the pool is dropped.
pub struct IdleReaper {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IdleReaper {
    pub fn spawn<T: Send + 'static>(
        pool: &Arc<ResourcePool<T>>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let weak: Weak<ResourcePool<T>> = Arc::downgrade(pool);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("pool-reaper".into())
            .spawn(move || loop {
                thread::park_timeout(interval);
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                match weak.upgrade() {
                    Some(pool) => {
                        let evicted = pool.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle pooled resources");
                        }
                    }
                    None => break,
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}
