//! The virtual-user pool.
//!
//! One [`VuPool`] exists per run and is shared by every scenario. Each
//! scenario takes a [`VuReservation`] with its own `preAllocatedVUs` and
//! `maxVUs`; VUs created for a reservation stay with it, so one scenario
//! can never starve another of its pre-allocated VUs.
//!
//! All pool state sits behind one mutex, which serializes acquire, release
//! and scale operations across scenarios. The lock is never held across an
//! await point.
//!
//! VUs are created eagerly up to `preAllocatedVUs`, then on demand up to
//! `maxVUs`. Released VUs are parked, not destroyed, until [`VuPool::teardown`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::PoolError;
use crate::http::{ClientFactory, HttpClient};

/// Whether a VU is parked in the pool or running an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    Idle,
    Running,
}

/// One execution context: an id, a connection slot, and its state.
///
/// Moved out of the pool by value on acquire and back in on release, so a
/// VU can only ever run one iteration at a time.
pub struct VirtualUser {
    id: u64,
    client: Arc<dyn HttpClient>,
    state: VuState,
    iterations: u64,
}

impl VirtualUser {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> Arc<dyn HttpClient> {
        Arc::clone(&self.client)
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    /// Iterations this VU has started over its lifetime.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Claim the next iteration number for this VU.
    pub(crate) fn next_iteration(&mut self) -> u64 {
        let n = self.iterations;
        self.iterations += 1;
        n
    }
}

impl std::fmt::Debug for VirtualUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualUser")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("iterations", &self.iterations)
            .finish()
    }
}

/// Pool-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// VUs created so far (never decreases until teardown).
    pub allocated: u64,
    /// VUs currently running an iteration loop.
    pub active: u64,
    /// Sum of every reservation's `maxVUs`.
    pub reserved: u64,
    pub capacity: u64,
}

struct Slot {
    scenario: String,
    max_vus: u64,
    allocated: u64,
    active: u64,
    idle: Vec<VirtualUser>,
}

struct PoolInner {
    next_id: u64,
    reserved: u64,
    slots: Vec<Slot>,
}

/// The run-wide pool of virtual users.
pub struct VuPool {
    inner: Mutex<PoolInner>,
    released: Notify,
    factory: ClientFactory,
    capacity: u64,
}

impl VuPool {
    /// A pool that can hold at most `capacity` VUs across all reservations.
    pub fn new(capacity: u64, factory: ClientFactory) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                next_id: 1,
                reserved: 0,
                slots: Vec::new(),
            }),
            released: Notify::new(),
            factory,
            capacity,
        })
    }

    /// Reserve up to `max_vus` VUs for `scenario`, creating `pre_allocated`
    /// of them immediately.
    pub fn reserve(
        self: &Arc<Self>,
        scenario: &str,
        pre_allocated: u64,
        max_vus: u64,
    ) -> Result<VuReservation, PoolError> {
        let max_vus = max_vus.max(pre_allocated);
        let mut inner = self.inner.lock();
        if inner.reserved.saturating_add(max_vus) > self.capacity {
            return Err(PoolError::CapacityExceeded {
                requested: max_vus,
                reserved: inner.reserved,
                capacity: self.capacity,
            });
        }
        inner.reserved += max_vus;
        inner.slots.push(Slot {
            scenario: scenario.to_string(),
            max_vus,
            allocated: 0,
            active: 0,
            idle: Vec::new(),
        });
        let slot = inner.slots.len() - 1;
        self.grow(&mut inner, slot, pre_allocated);
        drop(inner);

        tracing::debug!(scenario, pre_allocated, max_vus, "Reserved VUs");
        Ok(VuReservation {
            pool: Arc::clone(self),
            slot,
        })
    }

    /// Create idle VUs in `slot` until it holds `target` (capped at `maxVUs`).
    fn grow(&self, inner: &mut PoolInner, slot: usize, target: u64) -> u64 {
        let target = target.min(inner.slots[slot].max_vus);
        while inner.slots[slot].allocated < target {
            let vu = self.create(inner);
            let s = &mut inner.slots[slot];
            s.allocated += 1;
            s.idle.push(vu);
        }
        inner.slots[slot].allocated
    }

    fn create(&self, inner: &mut PoolInner) -> VirtualUser {
        let id = inner.next_id;
        inner.next_id += 1;
        VirtualUser {
            id,
            client: (self.factory)(id),
            state: VuState::Idle,
            iterations: 0,
        }
    }

    fn try_acquire(&self, slot: usize) -> Result<VirtualUser, PoolError> {
        let mut inner = self.inner.lock();
        let vu = match inner.slots[slot].idle.pop() {
            Some(vu) => vu,
            None => {
                let s = &inner.slots[slot];
                if s.allocated >= s.max_vus {
                    return Err(PoolError::Exhausted {
                        scenario: s.scenario.clone(),
                        max_vus: s.max_vus,
                    });
                }
                let vu = self.create(&mut inner);
                inner.slots[slot].allocated += 1;
                vu
            },
        };
        inner.slots[slot].active += 1;
        Ok(VirtualUser {
            state: VuState::Running,
            ..vu
        })
    }

    async fn acquire(&self, slot: usize, cancel: &CancellationToken) -> Option<VirtualUser> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return None;
            }
            if let Ok(vu) = self.try_acquire(slot) {
                return Some(vu);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    fn release(&self, slot: usize, mut vu: VirtualUser) {
        vu.state = VuState::Idle;
        let mut inner = self.inner.lock();
        let s = &mut inner.slots[slot];
        s.active = s.active.saturating_sub(1);
        s.idle.push(vu);
        drop(inner);
        self.released.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            allocated: inner.slots.iter().map(|s| s.allocated).sum(),
            active: inner.slots.iter().map(|s| s.active).sum(),
            reserved: inner.reserved,
            capacity: self.capacity,
        }
    }

    /// Destroy every parked VU. Returns how many VUs the run created.
    pub fn teardown(&self) -> u64 {
        let mut inner = self.inner.lock();
        let mut created = 0;
        for slot in &mut inner.slots {
            if slot.active > 0 {
                tracing::warn!(
                    scenario = %slot.scenario,
                    active = slot.active,
                    "Tearing down pool with VUs still active"
                );
            }
            created += slot.allocated;
            slot.idle.clear();
        }
        created
    }
}

/// A scenario's share of the pool.
#[derive(Clone)]
pub struct VuReservation {
    pool: Arc<VuPool>,
    slot: usize,
}

impl VuReservation {
    /// Take an idle VU, creating one if the reservation is below `maxVUs`.
    /// Never waits: at `maxVUs` with nothing idle it returns
    /// [`PoolError::Exhausted`].
    pub fn try_acquire(&self) -> Result<VirtualUser, PoolError> {
        self.pool.try_acquire(self.slot)
    }

    /// Like [`try_acquire`](Self::try_acquire), but waits for a release
    /// instead of failing. Returns `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<VirtualUser> {
        self.pool.acquire(self.slot, cancel).await
    }

    pub fn release(&self, vu: VirtualUser) {
        self.pool.release(self.slot, vu);
    }

    /// Grow to `n` VUs (capped at `maxVUs`). Never shrinks. Returns the
    /// number of VUs now allocated.
    pub fn scale_to(&self, n: u64) -> u64 {
        let mut inner = self.pool.inner.lock();
        self.pool.grow(&mut inner, self.slot, n)
    }

    /// VUs of this reservation currently checked out.
    pub fn active(&self) -> u64 {
        self.pool.inner.lock().slots[self.slot].active
    }

    /// VUs created for this reservation.
    pub fn allocated(&self) -> u64 {
        self.pool.inner.lock().slots[self.slot].allocated
    }

    pub fn max_vus(&self) -> u64 {
        self.pool.inner.lock().slots[self.slot].max_vus
    }
}

impl std::fmt::Debug for VuReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VuReservation")
            .field("slot", &self.slot)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::HttpError;
    use crate::http::{HttpRequest, HttpResponse};
    use async_trait::async_trait;
    use std::time::Duration;

    pub(crate) struct NoopClient;

    #[async_trait]
    impl HttpClient for NoopClient {
        async fn request(&self, _request: HttpRequest) -> Result<HttpResponse, HttpError> {
            Err(HttpError::Connection {
                message: "no network in tests".to_string(),
            })
        }
    }

    pub(crate) fn noop_factory() -> ClientFactory {
        Arc::new(|_| Arc::new(NoopClient) as Arc<dyn HttpClient>)
    }

    #[test]
    fn test_reserve_pre_allocates() {
        let pool = VuPool::new(10, noop_factory());
        let res = pool.reserve("default", 3, 5).unwrap();
        assert_eq!(res.allocated(), 3);
        assert_eq!(res.active(), 0);
        assert_eq!(pool.stats().allocated, 3);
        assert_eq!(pool.stats().reserved, 5);
    }

    #[test]
    fn test_reserve_beyond_capacity_fails() {
        let pool = VuPool::new(4, noop_factory());
        pool.reserve("a", 2, 3).unwrap();
        let err = pool.reserve("b", 1, 2).unwrap_err();
        assert!(matches!(err, PoolError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_oversized_reservation_allocates_nothing() {
        let pool = VuPool::new(4, noop_factory());
        pool.reserve("a", 1, 2).unwrap();
        let err = pool.reserve("b", u64::MAX, u64::MAX).unwrap_err();
        assert!(matches!(err, PoolError::CapacityExceeded { .. }));
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().reserved, 2);
    }

    #[test]
    fn test_acquire_creates_on_demand_up_to_max() {
        let pool = VuPool::new(2, noop_factory());
        let res = pool.reserve("default", 0, 2).unwrap();
        let a = res.try_acquire().unwrap();
        let b = res.try_acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), VuState::Running);
        assert!(matches!(res.try_acquire(), Err(PoolError::Exhausted { .. })));
        assert_eq!(res.active(), 2);

        res.release(a);
        assert_eq!(res.active(), 1);
        let again = res.try_acquire().unwrap();
        assert_eq!(res.allocated(), 2);
        res.release(again);
        res.release(b);
    }

    #[test]
    fn test_released_vu_is_reused() {
        let pool = VuPool::new(3, noop_factory());
        let res = pool.reserve("default", 1, 3).unwrap();
        let mut vu = res.try_acquire().unwrap();
        let id = vu.id();
        assert_eq!(vu.next_iteration(), 0);
        res.release(vu);

        let vu = res.try_acquire().unwrap();
        assert_eq!(vu.id(), id);
        assert_eq!(vu.iterations(), 1);
        assert_eq!(res.allocated(), 1);
        res.release(vu);
    }

    #[test]
    fn test_scale_to_grows_but_never_shrinks() {
        let pool = VuPool::new(5, noop_factory());
        let res = pool.reserve("default", 1, 4).unwrap();
        assert_eq!(res.scale_to(3), 3);
        assert_eq!(res.scale_to(1), 3);
        assert_eq!(res.scale_to(10), 4);
        assert_eq!(pool.stats().allocated, 4);
    }

    #[test]
    fn test_reservations_are_isolated() {
        let pool = VuPool::new(4, noop_factory());
        let a = pool.reserve("a", 2, 2).unwrap();
        let b = pool.reserve("b", 0, 2).unwrap();
        let a1 = a.try_acquire().unwrap();
        let a2 = a.try_acquire().unwrap();
        assert!(a.try_acquire().is_err());
        let b1 = b.try_acquire().unwrap();
        assert_eq!(pool.stats().active, 3);
        a.release(a1);
        a.release(a2);
        b.release(b1);
        assert_eq!(pool.teardown(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let pool = VuPool::new(1, noop_factory());
        let res = pool.reserve("default", 1, 1).unwrap();
        let held = res.try_acquire().unwrap();

        let waiter = {
            let res = res.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                res.acquire(&cancel).await.map(|vu| vu.id())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let id = held.id();
        res.release(held);
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_acquire_returns_none_when_cancelled() {
        let pool = VuPool::new(1, noop_factory());
        let res = pool.reserve("default", 1, 1).unwrap();
        let _held = res.try_acquire().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(res.acquire(&cancel).await.is_none());
    }
}
