//! Pool of idle detection units, keyed by detector identity.
//!
//! A worker checks out a [`UnitLease`] for one instrument-session. While the
//! lease exists no other worker can use that unit; dropping the lease checks
//! the unit back in. Dead or non-reusable units are never returned to the
//! pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DetectionError, DetectionUnit, UnitFactory};
use crate::domain::DetectorId;

type IdleMap = HashMap<DetectorId, Vec<Box<dyn DetectionUnit>>>;

/// Counters for one pool's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub spawned: u64,
    pub reused: u64,
    /// Idle units that failed their health check.
    pub evicted: u64,
    /// Units shut down at checkin (dead, one-shot, or pool full).
    pub discarded: u64,
    pub spawn_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    discarded: AtomicU64,
    spawn_failures: AtomicU64,
}

pub struct UnitPool {
    idle: Mutex<IdleMap>,
    max_idle: usize,
    health_deadline: Duration,
    counters: Counters,
}

impl UnitPool {
    /// `max_idle` bounds idle units per detector.
    pub fn new(max_idle: usize, health_deadline: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle,
            health_deadline,
            counters: Counters::default(),
        }
    }

    // A panic while holding the lock cannot leave the map inconsistent:
    // every critical section is a single push or pop.
    fn lock(&self) -> MutexGuard<'_, IdleMap> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_idle(&self, id: &DetectorId) -> Option<Box<dyn DetectionUnit>> {
        self.lock().get_mut(id).and_then(Vec::pop)
    }

    /// Hand out a healthy unit, reusing an idle one when possible.
    ///
    /// Health checks run outside the lock.
    pub fn checkout<'p>(&'p self, factory: &'p dyn UnitFactory) -> Result<UnitLease<'p>, DetectionError> {
        while let Some(mut unit) = self.take_idle(factory.detector_id()) {
            if unit.is_alive() && unit.ping(self.health_deadline) {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(UnitLease { pool: self, factory, unit: Some(unit) });
            }
            debug!(detector = %factory.detector_id(), "evicting unhealthy idle unit");
            unit.shutdown();
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }
        let unit = self.spawn(factory)?;
        Ok(UnitLease { pool: self, factory, unit: Some(unit) })
    }

    fn spawn(&self, factory: &dyn UnitFactory) -> Result<Box<dyn DetectionUnit>, DetectionError> {
        match factory.spawn() {
            Ok(unit) => {
                self.counters.spawned.fetch_add(1, Ordering::Relaxed);
                Ok(unit)
            }
            Err(e) => {
                self.counters.spawn_failures.fetch_add(1, Ordering::Relaxed);
                warn!(detector = %factory.detector_id(), error = %e, "failed to start detection unit");
                Err(e)
            }
        }
    }

    /// Return a unit. Dead, non-reusable and surplus units are shut down.
    pub fn checkin(&self, mut unit: Box<dyn DetectionUnit>) {
        if unit.is_reusable() && unit.is_alive() {
            let mut idle = self.lock();
            let slot = idle.entry(unit.detector_id().clone()).or_default();
            if slot.len() < self.max_idle {
                slot.push(unit);
                return;
            }
        }
        unit.shutdown();
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Shut down every idle unit.
    pub fn drain(&self) {
        let drained: Vec<Box<dyn DetectionUnit>> = self.lock().drain().flat_map(|(_, units)| units).collect();
        let count = drained.len();
        for mut unit in drained {
            unit.shutdown();
        }
        if count > 0 {
            debug!(units = count, "unit pool drained");
        }
    }

    pub fn idle_count(&self, id: &DetectorId) -> usize {
        self.lock().get(id).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            spawn_failures: self.counters.spawn_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UnitPool {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Exclusive use of one unit until dropped.
pub struct UnitLease<'p> {
    pool: &'p UnitPool,
    factory: &'p dyn UnitFactory,
    unit: Option<Box<dyn DetectionUnit>>,
}

impl<'p> UnitLease<'p> {
    /// The leased unit, replaced first if it has died.
    pub fn unit_mut(&mut self) -> Result<&mut dyn DetectionUnit, DetectionError> {
        let alive = match self.unit.as_mut() {
            Some(unit) => unit.is_alive(),
            None => false,
        };
        if !alive {
            if let Some(mut dead) = self.unit.take() {
                debug!(detector = %dead.detector_id(), "replacing dead unit");
                dead.shutdown();
                self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
            }
            self.unit = Some(self.pool.spawn(self.factory)?);
        }
        match self.unit.as_mut() {
            Some(unit) => Ok(unit.as_mut()),
            None => Err(DetectionError::Startup("no unit available".into())),
        }
    }

    /// The leased unit as-is, without replacing it.
    pub fn current_mut(&mut self) -> Option<&mut dyn DetectionUnit> {
        match self.unit.as_mut() {
            Some(unit) => Some(unit.as_mut()),
            None => None,
        }
    }

    pub fn detector_id(&self) -> &DetectorId {
        self.factory.detector_id()
    }
}

impl Drop for UnitLease<'_> {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            self.pool.checkin(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SnapshotId;
    use crate::harness::{Detection, DetectionRequest};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Unit whose health is controlled by a shared flag.
    struct FlakyUnit {
        id: DetectorId,
        healthy: Arc<AtomicBool>,
        alive: bool,
    }

    impl DetectionUnit for FlakyUnit {
        fn detector_id(&self) -> &DetectorId {
            &self.id
        }
        fn detect(&mut self, _: &DetectionRequest<'_>, _: Duration) -> Result<Detection, DetectionError> {
            Ok(Detection::NoSignal)
        }
        fn ping(&mut self, _: Duration) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        fn release_snapshot(&mut self, _: SnapshotId, _: Duration) -> Result<(), DetectionError> {
            Ok(())
        }
        fn is_alive(&mut self) -> bool {
            self.alive
        }
        fn is_reusable(&self) -> bool {
            true
        }
        fn shutdown(&mut self) {
            self.alive = false;
        }
    }

    struct FlakyFactory {
        id: DetectorId,
        healthy: Arc<AtomicBool>,
    }

    impl UnitFactory for FlakyFactory {
        fn detector_id(&self) -> &DetectorId {
            &self.id
        }
        fn spawn(&self) -> Result<Box<dyn DetectionUnit>, DetectionError> {
            Ok(Box::new(FlakyUnit { id: self.id.clone(), healthy: Arc::clone(&self.healthy), alive: true }))
        }
    }

    fn factory() -> (FlakyFactory, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(true));
        (FlakyFactory { id: DetectorId::new("flaky"), healthy: Arc::clone(&healthy) }, healthy)
    }

    #[test]
    fn lease_returns_unit_on_drop_and_reuses_it() {
        let (factory, _) = factory();
        let pool = UnitPool::new(4, Duration::from_millis(10));
        {
            let _lease = pool.checkout(&factory).unwrap();
            assert_eq!(pool.idle_count(factory.detector_id()), 0);
        }
        assert_eq!(pool.idle_count(factory.detector_id()), 1);
        let _lease = pool.checkout(&factory).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.spawned, 1);
        assert_eq!(stats.reused, 1);
    }

    #[test]
    fn concurrent_leases_get_distinct_units() {
        let (factory, _) = factory();
        let pool = UnitPool::new(4, Duration::from_millis(10));
        let a = pool.checkout(&factory).unwrap();
        let b = pool.checkout(&factory).unwrap();
        assert_eq!(pool.stats().spawned, 2);
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(factory.detector_id()), 2);
    }

    #[test]
    fn unhealthy_idle_unit_is_evicted() {
        let (factory, healthy) = factory();
        let pool = UnitPool::new(4, Duration::from_millis(10));
        drop(pool.checkout(&factory).unwrap());
        healthy.store(false, Ordering::SeqCst);
        let _lease = pool.checkout(&factory).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.spawned, 2);
    }

    #[test]
    fn dead_unit_is_not_pooled_and_is_replaced() {
        let (factory, _) = factory();
        let pool = UnitPool::new(4, Duration::from_millis(10));
        let mut lease = pool.checkout(&factory).unwrap();
        lease.current_mut().unwrap().shutdown();
        // Next use spawns a replacement.
        assert!(lease.unit_mut().unwrap().is_alive());
        assert_eq!(pool.stats().spawned, 2);
        lease.current_mut().unwrap().shutdown();
        drop(lease);
        assert_eq!(pool.idle_count(factory.detector_id()), 0);
    }

    #[test]
    fn surplus_units_discarded_beyond_max_idle() {
        let (factory, _) = factory();
        let pool = UnitPool::new(1, Duration::from_millis(10));
        let a = pool.checkout(&factory).unwrap();
        let b = pool.checkout(&factory).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(factory.detector_id()), 1);
        assert_eq!(pool.stats().discarded, 1);
        pool.drain();
        assert_eq!(pool.idle_count(factory.detector_id()), 0);
    }
}
