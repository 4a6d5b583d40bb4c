//! Decoder pool with lease-based exclusive checkout.
//!
//! Handle poisoning is a pool-level property: a poisoned handle stays busy for the
//! rest of the process and is never handed out again. A pool whose handles are all
//! poisoned can serve nobody; [`DecoderPool::healthy`] reaching zero is fatal to
//! the server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;

use super::handle::{DecoderHandle, HandleId};
use crate::engine::{EngineConfig, EngineError, EngineFactory, ModelPaths};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of engine instances, fixed for the life of the pool.
    pub size: usize,
    pub model: ModelPaths,
    pub engine: EngineConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("decoder pool needs at least one handle")]
    Empty,
    #[error("invalid model configuration: {0}")]
    Model(#[source] EngineError),
    #[error("decoder {index} failed to start: {source}")]
    Handle {
        index: usize,
        #[source]
        source: EngineError,
    },
}

/// Point-in-time occupancy, logged with capacity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub busy: usize,
    pub available: usize,
    pub poisoned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Held,
    Released,
    Poisoned,
}

/// Exclusive use of one handle, obtained from [`DecoderPool::acquire`].
///
/// Must end in `release()` or `poison()`. A lease dropped while still held is
/// released on drop and logged, since that means a teardown path was skipped.
#[must_use = "a lease holds a decoder until released"]
pub struct DecoderLease {
    pool: Arc<DecoderPool>,
    id: HandleId,
    state: LeaseState,
}

impl DecoderLease {
    fn new(pool: Arc<DecoderPool>, id: HandleId) -> Self {
        Self {
            pool,
            id,
            state: LeaseState::Held,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn is_held(&self) -> bool {
        self.state == LeaseState::Held
    }

    /// Decode a chunk on the leased engine. Blocking.
    pub fn decode(&self, samples: &[f32]) -> Result<String, EngineError> {
        if !self.is_held() {
            return Err(EngineError::Closed);
        }
        self.pool.handle(self.id).decode(samples)
    }

    /// Drain and reset the engine, then hand the handle back. Blocking.
    ///
    /// Only the first call has an effect; returns whether this call released.
    pub fn release(&mut self) -> bool {
        if self.state != LeaseState::Held {
            return false;
        }
        self.state = LeaseState::Released;
        self.pool.reset_and_release(self.id);
        true
    }

    /// Retire the handle without returning it to the pool.
    pub fn poison(&mut self) -> bool {
        if self.state != LeaseState::Held {
            return false;
        }
        self.state = LeaseState::Poisoned;
        self.pool.poison(self.id);
        true
    }
}

impl Drop for DecoderLease {
    fn drop(&mut self) {
        if self.state != LeaseState::Held {
            return;
        }
        tracing::error!(handle = %self.id, "DecoderLease dropped without release");
        self.state = LeaseState::Released;

        // Draining is blocking engine work; keep it off async worker threads.
        let pool = Arc::clone(&self.pool);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || pool.reset_and_release(id));
            }
            Err(_) => pool.reset_and_release(id),
        }
    }
}

impl std::fmt::Debug for DecoderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderLease")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// Fixed-size pool of decoder handles.
///
/// All engines are created up front so acquisition never waits on model loading.
pub struct DecoderPool {
    handles: Vec<DecoderHandle>,
    /// Rotating scan start so load spreads across handles.
    cursor: AtomicUsize,
    closed: AtomicBool,
}

impl DecoderPool {
    /// Create every engine. Fails on the first one that cannot start.
    pub fn new(config: &PoolConfig, factory: &dyn EngineFactory) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::Empty);
        }
        config.model.validate().map_err(PoolError::Model)?;

        let mut handles = Vec::with_capacity(config.size);
        for index in 0..config.size {
            tracing::debug!(handle = index, "Starting decoder");
            let handle = DecoderHandle::open(index, factory, &config.model, &config.engine)
                .map_err(|source| PoolError::Handle { index, source })?;
            handles.push(handle);
        }
        tracing::info!(size = config.size, "Decoder pool ready");

        Ok(Self {
            handles,
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn handle(&self, id: HandleId) -> &DecoderHandle {
        &self.handles[id.index()]
    }

    /// Claim a free handle, or `None` when every handle is busy.
    pub fn acquire(self: &Arc<Self>) -> Option<DecoderLease> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let n = self.handles.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let handle = &self.handles[(start + offset) % n];
            if handle.try_claim() {
                tracing::trace!(handle = %handle.id(), "Decoder acquired");
                return Some(DecoderLease::new(Arc::clone(self), handle.id()));
            }
        }
        None
    }

    /// Drain and reset a leased engine, then free its handle, or poison it when
    /// the reset fails. Blocking.
    fn reset_and_release(&self, id: HandleId) {
        match self.handle(id).reset() {
            Ok(()) => self.release(id),
            Err(e) => {
                tracing::warn!(handle = %id, error = %e, "Decoder reset failed, poisoning handle");
                self.poison(id);
            }
        }
    }

    /// Mark a handle free. Releasing a free or poisoned handle is a no-op.
    ///
    /// Takes a bare id, so only lease teardown may call it.
    pub(crate) fn release(&self, id: HandleId) {
        let handle = self.handle(id);
        if handle.is_poisoned() {
            tracing::debug!(handle = %id, "Not releasing poisoned decoder");
            return;
        }
        if handle.unclaim() {
            tracing::trace!(handle = %id, "Decoder released");
        } else {
            tracing::debug!(handle = %id, "Decoder already free");
        }
    }

    /// Retire a handle, whether idle or leased. Idempotent.
    pub(crate) fn poison(&self, id: HandleId) {
        if self.handle(id).mark_poisoned() {
            let healthy = self.healthy();
            tracing::warn!(
                handle = %id,
                available = self.available(),
                healthy,
                "Decoder poisoned - capacity reduced"
            );
            if healthy == 0 {
                tracing::error!(capacity = self.capacity(), "Every decoder is poisoned");
            }
        }
    }

    pub fn is_poisoned(&self, id: HandleId) -> bool {
        self.handle(id).is_poisoned()
    }

    pub fn capacity(&self) -> usize {
        self.handles.len()
    }

    /// Handles not poisoned, whether or not they are leased right now.
    pub fn healthy(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_poisoned()).count()
    }

    pub fn available(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_busy()).count()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut busy = 0;
        let mut poisoned = 0;
        for handle in &self.handles {
            if handle.is_poisoned() {
                poisoned += 1;
            } else if handle.is_busy() {
                busy += 1;
            }
        }
        PoolSnapshot {
            capacity: self.handles.len(),
            busy,
            available: self.handles.len() - busy - poisoned,
            poisoned,
        }
    }

    /// Tear down: stop handing out leases and close every engine. Blocking.
    ///
    /// Call after all sessions have released. Returns how many engines were closed.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut closed = 0;
        for handle in &self.handles {
            if handle.is_busy() && !handle.is_poisoned() {
                tracing::warn!(handle = %handle.id(), "Closing decoder that is still leased");
            }
            if handle.close() {
                closed += 1;
            }
        }
        tracing::info!(closed, "Decoder pool closed");
        closed
    }
}

impl Drop for DecoderPool {
    fn drop(&mut self) {
        // Leases keep the pool alive, so nothing is leased by now.
        self.close();
    }
}

impl std::fmt::Debug for DecoderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderPool")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFactory, fake_pool, model_dir};
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn acquire_until_exhausted() {
        for size in 1..=4 {
            let (_dir, pool) = fake_pool(size, &FakeFactory::default());

            let leases: Vec<_> = (0..size).map(|_| pool.acquire().unwrap()).collect();
            let ids: HashSet<_> = leases.iter().map(|l| l.id()).collect();
            assert_eq!(ids.len(), size);
            assert!(pool.acquire().is_none());

            let mut leases = leases;
            leases[0].release();
            assert!(pool.acquire().is_some_and(|mut l| l.release()));
            for lease in &mut leases {
                lease.release();
            }
        }
    }

    #[test]
    fn release_is_idempotent() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(2, &factory);

        let mut lease = pool.acquire().unwrap();
        let index = lease.id().index();
        assert!(lease.release());
        let once = pool.snapshot();

        assert!(!lease.release());
        assert!(!lease.poison());
        drop(lease);
        assert_eq!(pool.snapshot(), once);
        assert_eq!(once.available, 2);
        assert_eq!(factory.log(index).lock().unwrap().resets, 1);
    }

    #[test]
    fn release_does_not_free_someone_elses_handle() {
        let (_dir, pool) = fake_pool(1, &FakeFactory::default());

        let mut first = pool.acquire().unwrap();
        first.release();
        let mut second = pool.acquire().unwrap();

        // A late second release or poison from the first holder must not touch
        // the handle now leased to someone else.
        assert!(!first.release());
        assert!(!first.poison());
        drop(first);
        assert!(second.is_held());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.snapshot().poisoned, 0);
        second.release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn release_resets_engine_for_next_session() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(1, &factory);

        let mut lease = pool.acquire().unwrap();
        assert_eq!(lease.decode(&[0.1; 10]).unwrap(), "10");
        lease.release();

        let mut lease = pool.acquire().unwrap();
        assert_eq!(lease.decode(&[0.1; 10]).unwrap(), "10");
        lease.release();

        let log = factory.log(0);
        assert_eq!(log.lock().unwrap().resets, 2);
    }

    #[test]
    fn acquire_rotates_start() {
        let (_dir, pool) = fake_pool(3, &FakeFactory::default());

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let mut lease = pool.acquire().unwrap();
            seen.insert(lease.id());
            lease.release();
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn dropped_lease_returns_handle() {
        let (_dir, pool) = fake_pool(1, &FakeFactory::default());
        {
            let _lease = pool.acquire().unwrap();
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lease_dropped_on_runtime_drains_on_blocking_pool() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(1, &factory);

        drop(pool.acquire().unwrap());
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.available() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let log = factory.log(0);
        let log = log.lock().unwrap();
        assert_eq!(log.resets, 1);
        assert_ne!(log.reset_thread, Some(std::thread::current().id()));
    }

    #[test]
    fn dropped_lease_outside_runtime_releases_inline() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(1, &factory);

        drop(pool.acquire().unwrap());
        assert_eq!(pool.available(), 1);
        assert_eq!(factory.log(0).lock().unwrap().reset_thread, Some(std::thread::current().id()));
    }

    #[test]
    fn poisoning_every_handle_leaves_nothing_healthy() {
        let (_dir, pool) = fake_pool(2, &FakeFactory::default());
        let mut first = pool.acquire().unwrap();
        let mut second = pool.acquire().unwrap();

        first.poison();
        assert_eq!(pool.healthy(), 1);
        second.poison();
        assert_eq!(pool.healthy(), 0);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn poisoned_lease_is_not_returned() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(2, &factory);

        let mut lease = pool.acquire().unwrap();
        let id = lease.id();
        assert!(lease.poison());
        assert!(!lease.release());
        drop(lease);

        assert!(pool.is_poisoned(id));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.healthy(), 1);

        let mut other = pool.acquire().unwrap();
        assert_ne!(other.id(), id);
        assert!(pool.acquire().is_none());
        other.release();
    }

    #[test]
    fn poison_idle_handle_is_skipped() {
        let (_dir, pool) = fake_pool(2, &FakeFactory::default());
        let mut lease = pool.acquire().unwrap();
        let free = HandleId(1 - lease.id().index());
        lease.release();

        pool.poison(free);
        pool.poison(free);

        let mut a = pool.acquire().unwrap();
        assert_ne!(a.id(), free);
        assert!(pool.acquire().is_none());
        a.release();
    }

    #[test]
    fn snapshot_counts_states() {
        let (_dir, pool) = fake_pool(3, &FakeFactory::default());
        let mut held = pool.acquire().unwrap();
        let mut doomed = pool.acquire().unwrap();
        doomed.poison();

        insta::assert_json_snapshot!(pool.snapshot(), @r#"
        {
          "capacity": 3,
          "busy": 1,
          "available": 1,
          "poisoned": 1
        }
        "#);
        held.release();
    }

    #[test]
    fn exclusive_under_contention() {
        let (_dir, pool) = fake_pool(3, &FakeFactory::default());
        let holders: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();
        let max_seen = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let Some(mut lease) = pool.acquire() else {
                            std::thread::yield_now();
                            continue;
                        };
                        let slot = &holders[lease.id().index()];
                        let now = slot.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        lease.decode(&[0.0; 4]).unwrap();
                        slot.fetch_sub(1, Ordering::SeqCst);
                        lease.release();
                    }
                });
            }
        });

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn zero_size_is_rejected() {
        let (_dir, model) = model_dir();
        let config = PoolConfig {
            size: 0,
            model,
            engine: EngineConfig::default(),
        };
        let err = DecoderPool::new(&config, &FakeFactory::default()).unwrap_err();
        assert!(matches!(err, PoolError::Empty));
    }

    #[test]
    fn invalid_model_fails_before_any_engine() {
        let factory = FakeFactory::default();
        let config = PoolConfig {
            size: 2,
            model: ModelPaths::default(),
            engine: EngineConfig::default(),
        };
        let err = DecoderPool::new(&config, &factory).unwrap_err();
        assert!(matches!(
            err,
            PoolError::Model(EngineError::EmptyModelPath { name: "tokens" })
        ));
        assert!(factory.logs.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_engine_aborts_construction() {
        let (_dir, model) = model_dir();
        let factory = FakeFactory {
            fail_create_at: Some(1),
            ..FakeFactory::default()
        };
        let config = PoolConfig {
            size: 3,
            model,
            engine: EngineConfig::default(),
        };
        let err = DecoderPool::new(&config, &factory).unwrap_err();
        assert!(matches!(err, PoolError::Handle { index: 1, .. }));
        // The engine that did start is closed again.
        assert!(factory.log(0).lock().unwrap().closed);
    }

    #[test]
    fn close_tears_down_all_engines() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(2, &factory);

        assert_eq!(pool.close(), 2);
        assert_eq!(pool.close(), 0);
        assert!(pool.acquire().is_none());
        for index in 0..2 {
            let log = factory.log(index);
            let log = log.lock().unwrap();
            assert!(log.closed);
            assert_eq!(log.input_finished, 1);
        }
    }

    #[test]
    fn dropping_the_pool_closes_engines() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(2, &factory);

        let mut lease = pool.acquire().unwrap();
        lease.release();
        drop(lease);
        drop(pool);

        for index in 0..2 {
            let log = factory.log(index);
            let log = log.lock().unwrap();
            assert!(log.closed);
        }
    }

    #[test]
    fn drop_after_close_does_not_drain_twice() {
        let factory = FakeFactory::default();
        let (_dir, pool) = fake_pool(1, &factory);

        assert_eq!(pool.close(), 1);
        drop(pool);
        assert_eq!(factory.log(0).lock().unwrap().input_finished, 1);
    }
}
