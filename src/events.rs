use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::trace;

use crate::health::HealthStatus;
use crate::workload::{PoolId, WorkloadClass};

/// Notifications for external observability collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    HealthChanged {
        pool: PoolId,
        from: HealthStatus,
        to: HealthStatus,
    },
    SlowQuery {
        pool: PoolId,
        elapsed: Duration,
    },
    Failover {
        class: WorkloadClass,
        from: PoolId,
        to: PoolId,
        attempt: u32,
    },
    PoolClosed {
        pool: PoolId,
        forced: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

/// 事件订阅表
/// Explicit subscriber registry owned by one pool manager.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: DashMap<u64, Listener>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));
        SubscriptionId(id)
    }

    /// Returns false when the id was not (or no longer) registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id.0).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn emit(&self, event: PoolEvent) {
        // Clone out first so a listener may (un)subscribe without deadlocking a shard.
        let listeners: Vec<Listener> = self.listeners.iter().map(|e| e.value().clone()).collect();
        trace!(?event, subscribers = listeners.len(), "emit pool event");
        for listener in listeners {
            listener(&event);
        }
    }

    pub(crate) fn clear(&self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        let pool = PoolId::new(WorkloadClass::Read, 0);

        bus.emit(PoolEvent::PoolClosed { pool, forced: false });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(PoolEvent::PoolClosed { pool, forced: true });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], PoolEvent::PoolClosed { pool, forced: false });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
