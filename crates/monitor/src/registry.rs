use chrono::{DateTime, Utc};
use common::{InstanceId, Lease};
use dashmap::DashMap;

/// Last-seen time of every instance that has heartbeated and not yet been
/// reaped.
///
/// Entries are sharded, so heartbeats for different instances do not
/// contend with each other. Callers only see `touch`, `remove` and `sweep`;
/// each is atomic per instance.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    leases: DashMap<InstanceId, DateTime<Utc>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heartbeat now. Returns `true` if the lease is new.
    pub fn touch(&self, id: &InstanceId) -> bool {
        self.touch_at(id, Utc::now())
    }

    /// Records a heartbeat at `at`. `last_seen` never moves backwards.
    pub fn touch_at(&self, id: &InstanceId, at: DateTime<Utc>) -> bool {
        let mut created = false;
        self.leases
            .entry(id.clone())
            .and_modify(|seen| {
                if at > *seen {
                    *seen = at;
                }
            })
            .or_insert_with(|| {
                created = true;
                at
            });
        created
    }

    /// Returns `true` if a lease was present.
    pub fn remove(&self, id: &InstanceId) -> bool {
        self.leases.remove(id).is_some()
    }

    /// Removes and returns every lease last seen before `cutoff`.
    ///
    /// Each candidate is re-checked under its shard lock at removal time, so
    /// a heartbeat that lands between the scan and the removal keeps its
    /// lease.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> Vec<InstanceId> {
        self.sweep_with(cutoff, |_| {})
    }

    /// `sweep`, running `after_scan` between collecting candidates and
    /// removing them.
    fn sweep_with(
        &self,
        cutoff: DateTime<Utc>,
        after_scan: impl FnOnce(&Self),
    ) -> Vec<InstanceId> {
        let candidates: Vec<InstanceId> = self
            .leases
            .iter()
            .filter(|entry| *entry.value() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        after_scan(self);

        candidates
            .into_iter()
            .filter_map(|id| {
                self.leases
                    .remove_if(&id, |_, seen| *seen < cutoff)
                    .map(|(id, _)| id)
            })
            .collect()
    }

    pub fn last_seen(&self, id: &InstanceId) -> Option<DateTime<Utc>> {
        self.leases.get(id).map(|seen| *seen)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Point-in-time copy, ordered by instance id.
    pub fn snapshot(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .leases
            .iter()
            .map(|entry| Lease {
                instance_id: entry.key().clone(),
                last_seen: *entry.value(),
            })
            .collect();
        leases.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        leases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn id(s: &str) -> InstanceId {
        InstanceId::from(s)
    }

    #[test]
    fn sweep_returns_only_touched_ids() {
        let registry = LeaseRegistry::new();
        registry.touch(&id("a"));
        let evicted = registry.sweep(Utc::now() + Duration::seconds(60));
        assert_eq!(evicted, vec![id("a")]);
        assert!(registry.sweep(Utc::now() + Duration::seconds(60)).is_empty());
    }

    #[test]
    fn lease_survives_cutoff_at_or_before_last_seen() {
        let registry = LeaseRegistry::new();
        let t = Utc::now();
        registry.touch_at(&id("a"), t);

        assert!(registry.sweep(t).is_empty());
        assert!(registry.sweep(t - Duration::seconds(1)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lease_is_evicted_exactly_once_after_cutoff() {
        let registry = LeaseRegistry::new();
        let t = Utc::now();
        registry.touch_at(&id("a"), t);

        let cutoff = t + Duration::milliseconds(1);
        assert_eq!(registry.sweep(cutoff), vec![id("a")]);
        assert!(registry.sweep(cutoff).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn touch_twice_keeps_one_entry_with_later_time() {
        let registry = LeaseRegistry::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(2);

        assert!(registry.touch_at(&id("a"), t0));
        assert!(!registry.touch_at(&id("a"), t1));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.last_seen(&id("a")), Some(t1));
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let registry = LeaseRegistry::new();
        let t0 = Utc::now();
        registry.touch_at(&id("a"), t0);
        registry.touch_at(&id("a"), t0 - Duration::seconds(5));
        assert_eq!(registry.last_seen(&id("a")), Some(t0));
    }

    #[test]
    fn touch_between_scan_and_removal_keeps_lease() {
        let registry = LeaseRegistry::new();
        let now = Utc::now();
        registry.touch_at(&id("racing"), now - Duration::seconds(10));
        registry.touch_at(&id("dead"), now - Duration::seconds(10));

        let evicted = registry.sweep_with(now - Duration::seconds(9), |registry| {
            registry.touch_at(&id("racing"), now);
        });

        assert_eq!(evicted, vec![id("dead")]);
        assert_eq!(registry.last_seen(&id("racing")), Some(now));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_never_evicts_fresh_leases_under_contention() {
        let registry = Arc::new(LeaseRegistry::new());
        let start = Utc::now();
        let cutoff = start - Duration::seconds(9);
        for i in 0..100 {
            registry.touch_at(&InstanceId::new(format!("old{i}")), start - Duration::seconds(30));
        }

        let toucher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for round in 0..50 {
                    for i in 0..100 {
                        registry.touch(&InstanceId::new(format!("old{i}")));
                        registry.touch(&InstanceId::new(format!("fresh{i}")));
                    }
                    if round % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut evicted = Vec::new();
        for _ in 0..50 {
            evicted.extend(registry.sweep(cutoff));
            tokio::task::yield_now().await;
        }
        toucher.await.unwrap();

        assert!(evicted.iter().all(|id| id.as_str().starts_with("old")));
        let unique: std::collections::HashSet<_> = evicted.iter().collect();
        assert_eq!(unique.len(), evicted.len());
        // the final touch round re-registers anything evicted earlier
        assert_eq!(registry.len(), 200);
        for lease in registry.snapshot() {
            assert!(lease.last_seen >= cutoff);
        }
    }

    #[test]
    fn remove_is_noop_for_unknown_id() {
        let registry = LeaseRegistry::new();
        assert!(!registry.remove(&id("missing")));
        registry.touch(&id("a"));
        assert!(registry.remove(&id("a")));
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_only_takes_expired_leases() {
        let registry = LeaseRegistry::new();
        let now = Utc::now();
        registry.touch_at(&id("old"), now - Duration::seconds(10));
        registry.touch_at(&id("fresh"), now);

        let evicted = registry.sweep(now - Duration::seconds(9));
        assert_eq!(evicted, vec![id("old")]);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.snapshot()[0].instance_id, id("fresh"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_touches_on_distinct_ids() {
        let registry = Arc::new(LeaseRegistry::new());
        let handles: Vec<_> = (0..200)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.touch(&InstanceId::new(format!("c{i}"))) })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(registry.len(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_touches_on_same_id() {
        let registry = Arc::new(LeaseRegistry::new());
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.touch(&id("shared")) })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
    }
}
