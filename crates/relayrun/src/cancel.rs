//! # Cancel Service
//!
//! Maps each running invocation to the listeners that want to hear about its
//! cancellation.
//!
//! ## Invariants
//!
//! - Check-and-insert and check-and-remove on one id are atomic; they run
//!   under the map's shard lock.
//! - Listeners are never called while that lock is held.
//! - Each listener is notified at most once.
//! - Registering a listener for an id that is not registered (never was,
//!   already canceled, or already unregistered) notifies it immediately, on
//!   the caller's thread.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relayrpc::InvocationId;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

/// Hears that an invocation was canceled.
pub trait CancelListener: Send + Sync + 'static {
    fn canceled(&self);
}

impl<F> CancelListener for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn canceled(&self) {
        self()
    }
}

/// A listener that cancels `token`.
pub fn token_listener(token: CancellationToken) -> Arc<dyn CancelListener> {
    Arc::new(move || token.cancel())
}

#[derive(Default)]
pub struct CancelService {
    listeners: DashMap<InvocationId, Vec<Arc<dyn CancelListener>>>,
}

impl CancelService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as running. Returns false, and changes nothing, when it
    /// already was.
    pub fn register_invocation(&self, id: InvocationId) -> bool {
        match self.listeners.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Vec::new());
                true
            }
        }
    }

    /// Adds `listener` to a running invocation, or notifies it right away
    /// when `id` is not running.
    pub fn register_cancel_listener(&self, id: InvocationId, listener: Arc<dyn CancelListener>) {
        let rejected = match self.listeners.get_mut(&id) {
            Some(mut entry) => {
                entry.push(listener);
                None
            }
            None => Some(listener),
        };

        if let Some(listener) = rejected {
            trace!(invocation = %id, "listener for an idle invocation, notifying now");
            listener.canceled();
        }
    }

    /// Removes `id` and notifies its listeners. Returns how many were
    /// notified; an unknown id notifies nobody.
    pub fn canceled(&self, id: InvocationId) -> usize {
        let Some((_, listeners)) = self.listeners.remove(&id) else {
            debug!(invocation = %id, "cancel for an idle invocation");
            return 0;
        };

        debug!(invocation = %id, listeners = listeners.len(), "canceling");
        for listener in &listeners {
            listener.canceled();
        }
        listeners.len()
    }

    /// Removes `id` without notifying anyone. Returns whether it was running.
    pub fn unregister_invocation(&self, id: InvocationId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: InvocationId) -> bool {
        self.listeners.contains_key(&id)
    }

    /// Number of running invocations.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn CancelListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener: Arc<dyn CancelListener> = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn test_cancel_notifies_each_listener_once() {
        let service = CancelService::new();
        let id = InvocationId::random();
        service.register_invocation(id);

        let (a, listener_a) = counter();
        let (b, listener_b) = counter();
        service.register_cancel_listener(id, listener_a);
        service.register_cancel_listener(id, listener_b);
        assert_eq!(a.load(Ordering::SeqCst), 0);

        assert_eq!(service.canceled(id), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        // second cancel reaches nobody
        assert_eq!(service.canceled(id), 0);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert!(service.is_empty());
    }

    #[test]
    fn test_late_listener_fires_immediately() {
        let service = CancelService::new();
        let id = InvocationId::random();
        service.register_invocation(id);
        service.canceled(id);

        let (count, listener) = counter();
        service.register_cancel_listener(id, listener);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_behaves_like_canceled() {
        let service = CancelService::new();
        let id = InvocationId::random();
        service.register_invocation(id);

        let (before, listener) = counter();
        service.register_cancel_listener(id, listener);
        assert!(service.unregister_invocation(id));
        assert_eq!(before.load(Ordering::SeqCst), 0);
        assert!(!service.unregister_invocation(id));

        let (after, listener) = counter();
        service.register_cancel_listener(id, listener);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_invocation_is_idempotent() {
        let service = CancelService::new();
        let id = InvocationId::random();
        assert!(service.register_invocation(id));
        let (count, listener) = counter();
        service.register_cancel_listener(id, listener);

        assert!(!service.register_invocation(id));
        assert_eq!(service.len(), 1);
        assert_eq!(service.canceled(id), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_listener() {
        let service = CancelService::new();
        let id = InvocationId::random();
        service.register_invocation(id);

        let token = CancellationToken::new();
        service.register_cancel_listener(id, token_listener(token.clone()));
        assert!(!token.is_cancelled());
        service.canceled(id);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_listener_may_reenter_service() {
        let service = Arc::new(CancelService::new());
        let id = InvocationId::random();
        let other = InvocationId::random();
        service.register_invocation(id);
        service.register_invocation(other);

        let inner = service.clone();
        service.register_cancel_listener(
            id,
            Arc::new(move || {
                inner.canceled(other);
            }),
        );

        service.canceled(id);
        assert!(!service.is_registered(other));
    }

    #[test]
    fn test_concurrent_register_invocation_admits_one() {
        let service = Arc::new(CancelService::new());
        let id = InvocationId::random();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                std::thread::spawn(move || service.register_invocation(id))
            })
            .collect();
        let admitted = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .filter(|fresh| *fresh)
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn test_concurrent_register_and_cancel() {
        let service = Arc::new(CancelService::new());
        let id = InvocationId::random();
        service.register_invocation(id);
        let (count, listener) = counter();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let service = service.clone();
                let listener = listener.clone();
                std::thread::spawn(move || {
                    if i == 4 {
                        service.canceled(id);
                    } else {
                        service.register_cancel_listener(id, listener);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        service.canceled(id);

        // every registration was notified exactly once, early or late
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }
}
