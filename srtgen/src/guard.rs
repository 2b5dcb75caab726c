//! Mutual exclusion around model residency.
//!
//! Every stage runner that touches a model holds a [`ModelLease`] for that
//! model's family. Leases are bounded by `Settings::device_slots`; taking a
//! lease for one family first reclaims every idle family still loaded.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::{debug, info};

use crate::engines::ModelFamily;
use crate::settings::SettingsStore;

/// Releases the memory held by a model family.
#[async_trait]
pub trait Reclaim: Send + Sync {
    async fn reclaim(&self, family: ModelFamily);
}

#[derive(Debug, Default)]
struct Ledger {
    loaded: HashSet<ModelFamily>,
    active: HashMap<ModelFamily, usize>,
    reclaims: u64,
}

impl Ledger {
    fn active_total(&self) -> usize {
        self.active.values().sum()
    }

    fn active(&self, family: ModelFamily) -> usize {
        self.active.get(&family).copied().unwrap_or(0)
    }
}

struct Inner {
    settings: Arc<SettingsStore>,
    family_locks: HashMap<ModelFamily, Arc<tokio::sync::Mutex<()>>>,
    switch: tokio::sync::Mutex<()>,
    ledger: Mutex<Ledger>,
    released: Notify,
}

impl Inner {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone)]
pub struct ResourceGuard {
    inner: Arc<Inner>,
}

/// Snapshot of what the guard believes is resident.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Residency {
    pub loaded: Vec<ModelFamily>,
    pub active: usize,
    pub reclaims: u64,
}

impl ResourceGuard {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        let family_locks = ModelFamily::ALL
            .iter()
            .map(|f| (*f, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();

        Self {
            inner: Arc::new(Inner {
                settings,
                family_locks,
                switch: tokio::sync::Mutex::new(()),
                ledger: Mutex::new(Ledger::default()),
                released: Notify::new(),
            }),
        }
    }

    /// Wait until `family` may be resident, reclaiming idle families first.
    ///
    /// Same-family callers are serialized; other callers wait for a free
    /// device slot instead of failing.
    pub async fn acquire(&self, family: ModelFamily, reclaimer: &dyn Reclaim) -> ModelLease {
        let family_lock = Arc::clone(&self.inner.family_locks[&family]);
        let family_guard = family_lock.lock_owned().await;

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let _switch = self.inner.switch.lock().await;
                let slots = self.inner.settings.get().device_slots.max(1);

                let evict: Option<Vec<ModelFamily>> = {
                    let ledger = self.inner.ledger();
                    (ledger.active_total() < slots).then(|| {
                        ledger
                            .loaded
                            .iter()
                            .copied()
                            .filter(|f| *f != family && ledger.active(*f) == 0)
                            .collect()
                    })
                };

                if let Some(evict) = evict {
                    for other in evict {
                        info!(from = %other, to = %family, "switching model family");
                        reclaimer.reclaim(other).await;
                        let mut ledger = self.inner.ledger();
                        ledger.loaded.remove(&other);
                        ledger.active.remove(&other);
                        ledger.reclaims += 1;
                    }

                    let mut ledger = self.inner.ledger();
                    ledger.loaded.insert(family);
                    *ledger.active.entry(family).or_default() += 1;
                    debug!(%family, active = ledger.active_total(), "model lease granted");

                    return ModelLease {
                        family,
                        inner: Arc::clone(&self.inner),
                        _family: family_guard,
                    };
                }
            }

            debug!(%family, "waiting for a free device slot");
            released.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn residency(&self) -> Residency {
        let ledger = self.inner.ledger();
        let mut loaded: Vec<_> = ledger.loaded.iter().copied().collect();
        loaded.sort_by_key(|f| *f as u8);
        Residency {
            loaded,
            active: ledger.active_total(),
            reclaims: ledger.reclaims,
        }
    }
}

/// Exclusive right to use one model family; released on drop.
pub struct ModelLease {
    family: ModelFamily,
    inner: Arc<Inner>,
    _family: OwnedMutexGuard<()>,
}

impl ModelLease {
    #[cfg(test)]
    pub(crate) fn family(&self) -> ModelFamily {
        self.family
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        {
            let mut ledger = self.inner.ledger();
            if let Some(n) = ledger.active.get_mut(&self.family) {
                *n = n.saturating_sub(1);
            }
        }
        self.inner.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::settings::Settings;

    #[derive(Default)]
    struct Recorder {
        reclaimed: Mutex<Vec<ModelFamily>>,
    }

    #[async_trait]
    impl Reclaim for Recorder {
        async fn reclaim(&self, family: ModelFamily) {
            self.reclaimed.lock().unwrap().push(family);
        }
    }

    fn guard(slots: usize) -> ResourceGuard {
        ResourceGuard::new(Arc::new(SettingsStore::in_memory(Settings {
            device_slots: slots,
            ..Settings::default()
        })))
    }

    #[tokio::test]
    async fn test_switching_family_reclaims_previous() {
        let guard = guard(1);
        let rec = Recorder::default();

        drop(guard.acquire(ModelFamily::Speech, &rec).await);
        assert_eq!(guard.residency().loaded, vec![ModelFamily::Speech]);

        // Same family again: nothing to reclaim.
        drop(guard.acquire(ModelFamily::Speech, &rec).await);
        assert!(rec.reclaimed.lock().unwrap().is_empty());

        let lease = guard.acquire(ModelFamily::Translation, &rec).await;
        assert_eq!(lease.family(), ModelFamily::Translation);
        assert_eq!(*rec.reclaimed.lock().unwrap(), vec![ModelFamily::Speech]);
        let residency = guard.residency();
        assert_eq!(residency.loaded, vec![ModelFamily::Translation]);
        assert_eq!(residency.active, 1);
        assert_eq!(residency.reclaims, 1);
    }

    #[tokio::test]
    async fn test_second_family_waits_for_slot() {
        let guard = guard(1);
        let rec = Arc::new(Recorder::default());

        let speech = guard.acquire(ModelFamily::Speech, rec.as_ref()).await;

        let g = guard.clone();
        let r = Arc::clone(&rec);
        let waiter = tokio::spawn(async move {
            let lease = g.acquire(ModelFamily::Refinement, r.as_ref()).await;
            lease.family()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert!(rec.reclaimed.lock().unwrap().is_empty());

        drop(speech);
        let family = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(family, ModelFamily::Refinement);
        assert_eq!(*rec.reclaimed.lock().unwrap(), vec![ModelFamily::Speech]);
    }

    #[tokio::test]
    async fn test_same_family_is_serialized() {
        let guard = guard(4);
        let rec = Arc::new(Recorder::default());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (g, r, c, p) = (guard.clone(), Arc::clone(&rec), Arc::clone(&concurrent), Arc::clone(&peak));
            tasks.push(tokio::spawn(async move {
                let _lease = g.acquire(ModelFamily::Speech, r.as_ref()).await;
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                c.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_family_is_not_reclaimed() {
        let guard = guard(2);
        let rec = Recorder::default();

        let speech = guard.acquire(ModelFamily::Speech, &rec).await;
        let translation = guard.acquire(ModelFamily::Translation, &rec).await;
        assert!(rec.reclaimed.lock().unwrap().is_empty());
        assert_eq!(guard.residency().active, 2);

        drop(speech);
        drop(translation);
        assert_eq!(guard.residency().active, 0);
    }
}
