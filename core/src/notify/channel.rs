use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use dashmap::DashMap;

type Listener = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// A named channel carrying serialized messages. Listeners run synchronously inside `send`.
#[derive(Clone)]
pub struct Channel(Arc<Inner>);

struct Inner {
    name: String,
    listeners: RwLock<HashMap<usize, Listener>>,
    next_id: AtomicUsize,
}

/// Keeps a listener subscribed until dropped.
pub struct ListenerGuard {
    inner: Weak<Inner>,
    id: usize,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("name", &self.0.name).field("listeners", &self.listener_count()).finish()
    }
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(Inner { name: name.into(), listeners: RwLock::new(HashMap::new()), next_id: AtomicUsize::new(0) }))
    }

    pub fn name(&self) -> &str { &self.0.name }

    pub fn send(&self, message: &str) {
        // Clone the listeners to avoid holding the lock during callback execution
        let listeners = {
            let listeners = self.0.listeners.read().expect("Failed to lock channel listeners");
            listeners.values().cloned().collect::<Vec<_>>()
        };
        for listener in listeners {
            listener(message);
        }
    }

    pub fn listen<F>(&self, listener: F) -> ListenerGuard
    where F: Fn(&str) + Send + Sync + 'static {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().expect("Failed to lock channel listeners").insert(id, Arc::new(listener));
        ListenerGuard { inner: Arc::downgrade(&self.0), id }
    }

    pub fn listener_count(&self) -> usize { self.0.listeners.read().expect("Failed to lock channel listeners").len() }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.write().expect("Failed to lock channel listeners").remove(&self.id);
        }
    }
}

/// Channels by name. Every handle to a hub opens the same channel for the same name, the way
/// same-origin contexts share a broadcast channel.
#[derive(Clone, Default)]
pub struct ChannelHub(Arc<DashMap<String, Channel>>);

impl ChannelHub {
    pub fn new() -> Self { Self::default() }

    /// The process-wide hub.
    pub fn global() -> &'static ChannelHub {
        static HUB: OnceLock<ChannelHub> = OnceLock::new();
        HUB.get_or_init(ChannelHub::new)
    }

    pub fn channel(&self, name: &str) -> Channel { self.0.entry(name.to_owned()).or_insert_with(|| Channel::new(name)).clone() }
}
