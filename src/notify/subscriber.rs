//! Subscriber-based event notifications.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// An event that can be published through a [`SubscriberRegistry`].
///
/// Every event reports the kind it belongs to; subscribers register for a kind
/// and only see events of that kind.
pub trait Event: Send + Sync + 'static {
    /// Discriminant used to route the event to subscribers.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// The kind of this event.
    fn kind(&self) -> Self::Kind;
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Internal subscriber registry state.
struct SubscriberRegistryInner<E: Event> {
    subscribers: HashMap<E::Kind, Vec<(usize, Callback<E>)>>,
    next_id: usize,
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

impl<E: Event> Unsubscribe for Mutex<SubscriberRegistryInner<E>> {
    fn unsubscribe(&self, id: usize) {
        let mut inner = self.lock();
        for subscribers in inner.subscribers.values_mut() {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

/// Handle for a subscription that can be dropped to unsubscribe.
///
/// When the handle is dropped, the subscription is removed before `drop`
/// returns. Use [`SubscriptionHandle::detach`] to keep the subscription alive
/// for as long as the registry exists.
#[must_use = "dropping the handle immediately unsubscribes"]
pub struct SubscriptionHandle {
    id: usize,
    registry: Option<Weak<dyn Unsubscribe>>,
}

impl SubscriptionHandle {
    /// Keep the subscription registered without holding on to the handle.
    pub fn detach(mut self) {
        self.registry = None;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.unsubscribe(self.id);
        }
    }
}

/// Registry mapping each event kind to an ordered list of subscribers.
///
/// Publishing is synchronous: [`notify`](Self::notify) returns after every
/// subscriber of the event's kind has run, in the order they subscribed.
/// Callbacks run outside the registry lock, so a callback may subscribe or
/// unsubscribe without deadlocking.
///
/// # Examples
///
/// ```rust
/// use confsync::notify::{Event, SubscriberRegistry};
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum Kind { Tick }
///
/// struct Tick;
///
/// impl Event for Tick {
///     type Kind = Kind;
///     fn kind(&self) -> Kind { Kind::Tick }
/// }
///
/// let registry = SubscriberRegistry::new();
/// let handle = registry.subscribe(Kind::Tick, |_: &Tick| println!("tick"));
///
/// registry.notify(&Tick);
///
/// // Unsubscribe by dropping the handle
/// drop(handle);
/// ```
pub struct SubscriberRegistry<E: Event> {
    inner: Arc<Mutex<SubscriberRegistryInner<E>>>,
}

impl<E: Event> SubscriberRegistry<E> {
    /// Create a new subscriber registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubscriberRegistryInner {
                subscribers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Subscribe to events of the given kind.
    ///
    /// Returns a handle that unsubscribes when dropped.
    pub fn subscribe<F>(&self, kind: E::Kind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscribers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));

        let registry: Arc<dyn Unsubscribe> = self.inner.clone();
        SubscriptionHandle {
            id,
            registry: Some(Arc::downgrade(&registry)),
        }
    }

    /// Notify all subscribers of the event's kind.
    ///
    /// Returns the number of subscribers that were invoked.
    pub fn notify(&self, event: &E) -> usize {
        let callbacks: Vec<Callback<E>> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .get(&event.kind())
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };

        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    /// Get the number of active subscribers for a kind.
    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Remove every subscriber.
    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }
}

impl<E: Event> Default for SubscriberRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Clone for SubscriberRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestKind {
        Opened,
        Closed,
    }

    #[derive(Debug)]
    enum TestEvent {
        Opened(u32),
        Closed,
    }

    impl Event for TestEvent {
        type Kind = TestKind;

        fn kind(&self) -> TestKind {
            match self {
                TestEvent::Opened(_) => TestKind::Opened,
                TestEvent::Closed => TestKind::Closed,
            }
        }
    }

    #[test]
    fn test_subscribe_and_notify() {
        let registry = SubscriberRegistry::<TestEvent>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let _handle = registry.subscribe(TestKind::Opened, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.notify(&TestEvent::Opened(1)), 1);
        registry.notify(&TestEvent::Opened(2));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_only_matching_kind_is_notified() {
        let registry = SubscriberRegistry::<TestEvent>::new();
        let closed = Arc::new(AtomicUsize::new(0));

        let closed_clone = Arc::clone(&closed);
        let _handle = registry.subscribe(TestKind::Closed, move |_| {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.notify(&TestEvent::Opened(7)), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        registry.notify(&TestEvent::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribers_run_in_registration_order() {
        let registry = SubscriberRegistry::<TestEvent>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..3 {
            let order = Arc::clone(&order);
            handles.push(registry.subscribe(TestKind::Opened, move |event| {
                if let TestEvent::Opened(value) = event {
                    order.lock().push((n, *value));
                }
            }));
        }

        registry.notify(&TestEvent::Opened(9));
        assert_eq!(*order.lock(), vec![(0, 9), (1, 9), (2, 9)]);
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let registry = SubscriberRegistry::<TestEvent>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let handle = registry.subscribe(TestKind::Closed, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify(&TestEvent::Closed);
        drop(handle);
        registry.notify(&TestEvent::Closed);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscriber_count(TestKind::Closed), 0);
    }

    #[test]
    fn test_detach_keeps_subscription() {
        let registry = SubscriberRegistry::<TestEvent>::new();
        registry.subscribe(TestKind::Closed, |_| {}).detach();
        assert_eq!(registry.subscriber_count(TestKind::Closed), 1);

        registry.clear();
        assert_eq!(registry.subscriber_count(TestKind::Closed), 0);
    }

    #[test]
    fn test_callback_may_subscribe_during_notify() {
        let registry = SubscriberRegistry::<TestEvent>::new();
        let registry_clone = registry.clone();

        let _handle = registry.subscribe(TestKind::Opened, move |_| {
            registry_clone.subscribe(TestKind::Closed, |_| {}).detach();
        });

        registry.notify(&TestEvent::Opened(1));
        assert_eq!(registry.subscriber_count(TestKind::Closed), 1);
    }

    #[test]
    fn test_handle_outliving_registry() {
        let registry = SubscriberRegistry::<TestEvent>::new();
        let handle = registry.subscribe(TestKind::Opened, |_| {});
        drop(registry);
        drop(handle);
    }
}
