use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, Semaphore};

use crate::{
    config::NETNS_POOL_ACQUIRE_TIMEOUT,
    net::{self, NetnsSlot, MAX_SUBNET_INDEX},
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A bounded FIFO pool of pre-provisioned netns slots.
///
/// The pool removes netns/veth/tap construction from the create critical
/// path: at steady state a create pops a warm slot in microseconds. Slots are
/// keyed by subnet indices `1..=size`, owned by the pool for the process
/// lifetime, and flagged `pooled` so release returns them instead of tearing
/// them down.
#[derive(Debug)]
pub struct NetnsPool {
    size: usize,
    available: Semaphore,
    slots: Mutex<VecDeque<NetnsSlot>>,
}

/// Slot acquisition for sandbox bring-up: warm pool first, on-demand
/// provisioning as graceful degradation when the pool runs dry.
#[derive(Debug)]
pub struct NetnsManager {
    pool: Option<NetnsPool>,
    next_subnet: AtomicU32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetnsPool {
    /// Provisions `size` slots for subnet indices `1..=size`.
    ///
    /// Init is idempotent across crashed runs: any leftover namespace or veth
    /// carrying a slot's deterministic names is torn down before the slot is
    /// rebuilt.
    pub async fn init(size: usize) -> MantaResult<Self> {
        let start = Instant::now();
        let mut slots = VecDeque::with_capacity(size);

        for subnet in 1..=size as u32 {
            let tag = pool_tag(subnet);

            let stale = NetnsSlot::for_subnet(&tag, subnet)?;
            if let Err(err) = net::teardown(&stale).await {
                tracing::debug!(subnet, %err, "pre-init netns cleanup (expected on first run)");
            }

            let mut slot = net::provision(&tag, subnet).await.map_err(|err| {
                MantaError::provisioning(format!("init netns pool entry {}: {}", subnet, err))
            })?;
            slot.pooled = true;
            slots.push_back(slot);
        }

        tracing::info!(size, took = ?start.elapsed(), "netns pool ready");

        Ok(Self {
            size,
            available: Semaphore::new(size),
            slots: Mutex::new(slots),
        })
    }

    /// The configured pool size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pops a warm slot, waiting at most `timeout`; `None` on exhaustion.
    pub async fn acquire(&self, timeout: Duration) -> Option<NetnsSlot> {
        let permit = tokio::time::timeout(timeout, self.available.acquire())
            .await
            .ok()?
            .ok()?;
        permit.forget();

        let slot = self.slots.lock().await.pop_front();
        debug_assert!(slot.is_some(), "semaphore permit without a queued slot");
        slot
    }

    /// Returns a slot to the pool. The caller guarantees the VM that used it
    /// is gone; the namespace stays configured and ready.
    pub async fn release(&self, slot: NetnsSlot) {
        self.slots.lock().await.push_back(slot);
        self.available.add_permits(1);
    }

    /// Tears down every currently pooled slot at shutdown.
    pub async fn destroy(&self) {
        let drained: Vec<NetnsSlot> = self.slots.lock().await.drain(..).collect();
        for slot in drained {
            if let Err(err) = net::teardown(&slot).await {
                tracing::warn!(subnet = slot.subnet, %err, "pool slot teardown failed");
            }
        }
    }
}

impl NetnsManager {
    /// Builds the manager, pre-provisioning `pool_size` slots when non-zero.
    pub async fn init(pool_size: usize) -> MantaResult<Self> {
        let pool = if pool_size > 0 {
            Some(NetnsPool::init(pool_size).await?)
        } else {
            None
        };

        Ok(Self {
            pool,
            next_subnet: AtomicU32::new(pool_size as u32),
        })
    }

    /// Acquires a slot for the sandbox `tag`.
    ///
    /// Pool exhaustion is a soft error: after a short bounded wait the
    /// manager falls back to on-demand provisioning with a freshly allocated
    /// subnet index past the pooled range.
    pub async fn acquire(&self, tag: &str) -> MantaResult<NetnsSlot> {
        if let Some(pool) = &self.pool {
            if let Some(slot) = pool.acquire(NETNS_POOL_ACQUIRE_TIMEOUT).await {
                return Ok(slot);
            }
            tracing::warn!(tag, "netns pool exhausted; falling back to on-demand netns");
        }

        let subnet = self.next_subnet.fetch_add(1, Ordering::SeqCst) + 1;
        if subnet > MAX_SUBNET_INDEX {
            return Err(MantaError::provisioning(format!(
                "subnet index space exhausted (index {} > {})",
                subnet, MAX_SUBNET_INDEX
            )));
        }

        net::provision(tag, subnet).await
    }

    /// Releases a slot: pooled slots go back to the pool, on-demand slots are
    /// destroyed.
    pub async fn release(&self, slot: NetnsSlot) {
        if slot.pooled {
            if let Some(pool) = &self.pool {
                pool.release(slot).await;
                return;
            }
        }
        if let Err(err) = net::teardown(&slot).await {
            tracing::warn!(subnet = slot.subnet, %err, "netns teardown failed");
        }
    }

    /// Shuts the pool down.
    pub async fn destroy(&self) {
        if let Some(pool) = &self.pool {
            pool.destroy().await;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The stable namespace tag for pooled subnet index `i`.
pub fn pool_tag(subnet: u32) -> String {
    format!("pool-{:03}", subnet)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn warm_pool(size: usize) -> NetnsPool {
        let mut slots = VecDeque::new();
        for subnet in 1..=size as u32 {
            let mut slot = NetnsSlot::for_subnet(&pool_tag(subnet), subnet).unwrap();
            slot.pooled = true;
            slots.push_back(slot);
        }
        NetnsPool {
            size,
            available: Semaphore::new(size),
            slots: Mutex::new(slots),
        }
    }

    #[tokio::test]
    async fn test_pool_acquire_is_fifo() {
        let pool = warm_pool(3);

        let first = pool.acquire(Duration::from_millis(5)).await.unwrap();
        let second = pool.acquire(Duration::from_millis(5)).await.unwrap();
        assert_eq!(first.subnet, 1);
        assert_eq!(second.subnet, 2);

        pool.release(first).await;
        let third = pool.acquire(Duration::from_millis(5)).await.unwrap();
        let recycled = pool.acquire(Duration::from_millis(5)).await.unwrap();
        assert_eq!(third.subnet, 3);
        assert_eq!(recycled.subnet, 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        let pool = warm_pool(1);

        let only = pool.acquire(Duration::from_millis(5)).await.unwrap();
        assert!(pool.acquire(Duration::from_millis(5)).await.is_none());

        pool.release(only).await;
        assert!(pool.acquire(Duration::from_millis(5)).await.is_some());
    }

    #[tokio::test]
    async fn test_pool_release_wakes_waiter() {
        let pool = std::sync::Arc::new(warm_pool(1));

        let held = pool.acquire(Duration::from_millis(5)).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(1)).await })
        };

        pool.release(held).await;
        let got = waiter.await.unwrap();
        assert!(got.is_some());
    }

    #[test]
    fn test_pool_tag_layout() {
        assert_eq!(pool_tag(1), "pool-001");
        assert_eq!(pool_tag(64), "pool-064");
    }
}
