//! MetadataRouter: type-tag subscriptions over routed metadata.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{ChannelId, MetadataMessage};

type Callback = Box<dyn Fn(&MetadataMessage) + Send + Sync>;

struct Route {
    key: u64,
    subscriber_id: String,
    /// `None` matches every type.
    types: Option<HashSet<String>>,
    channel: Option<ChannelId>,
    active: AtomicBool,
    callback: Callback,
}

impl Route {
    fn matches(&self, message: &MetadataMessage) -> bool {
        let type_ok = self
            .types
            .as_ref()
            .is_none_or(|types| types.contains(&message.message_type));
        let channel_ok = self
            .channel
            .as_ref()
            .is_none_or(|channel| *channel == message.channel);
        type_ok && channel_ok
    }
}

#[derive(Default)]
struct RouterInner {
    routes: RwLock<Vec<Arc<Route>>>,
    next_key: AtomicU64,
}

impl RouterInner {
    fn remove(&self, key: u64) {
        let mut routes = self.routes.write();
        if let Some(pos) = routes.iter().position(|r| r.key == key) {
            let route = routes.remove(pos);
            route.active.store(false, Ordering::SeqCst);
            debug!(subscriber = %route.subscriber_id, "metadata subscription removed");
        }
    }
}

/// Dispatches metadata messages to subscribers by type tag and channel.
///
/// Cloning yields another handle to the same routing table.
#[derive(Clone, Default)]
pub struct MetadataRouter {
    inner: Arc<RouterInner>,
}

impl MetadataRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given message types, optionally only on `channel`.
    pub fn subscribe<I, S, F>(
        &self,
        subscriber_id: impl Into<String>,
        message_types: I,
        channel: Option<ChannelId>,
        callback: F,
    ) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&MetadataMessage) + Send + Sync + 'static,
    {
        let types = message_types.into_iter().map(Into::into).collect();
        self.insert(subscriber_id.into(), Some(types), channel, Box::new(callback))
    }

    /// Subscribe to every routed message, optionally only on `channel`.
    /// Untyped messages delivered through `route_untyped` also arrive here.
    pub fn subscribe_all<F>(
        &self,
        subscriber_id: impl Into<String>,
        channel: Option<ChannelId>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&MetadataMessage) + Send + Sync + 'static,
    {
        self.insert(subscriber_id.into(), None, channel, Box::new(callback))
    }

    fn insert(
        &self,
        subscriber_id: String,
        types: Option<HashSet<String>>,
        channel: Option<ChannelId>,
        callback: Callback,
    ) -> Subscription {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = %subscriber_id, types = ?types, channel = ?channel, "metadata subscription added");
        self.inner.routes.write().push(Arc::new(Route {
            key,
            subscriber_id,
            types,
            channel,
            active: AtomicBool::new(true),
            callback,
        }));
        Subscription {
            key,
            router: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Deliver `message` to every matching live subscription, in
    /// subscription order. Returns how many callbacks ran.
    pub fn route_message(&self, message: &MetadataMessage) -> usize {
        self.dispatch(message, |r| r.matches(message))
    }

    /// Deliver a message whose type could not be resolved. Only wildcard
    /// subscriptions (`subscribe_all`) see it; type subscriptions never do.
    pub fn route_untyped(&self, message: &MetadataMessage) -> usize {
        self.dispatch(message, |r| r.types.is_none() && r.matches(message))
    }

    fn dispatch(&self, message: &MetadataMessage, accept: impl Fn(&Route) -> bool) -> usize {
        let matched: Vec<Arc<Route>> = self
            .inner
            .routes
            .read()
            .iter()
            .filter(|r| accept(r))
            .cloned()
            .collect();

        let mut delivered = 0;
        for route in matched {
            // An earlier callback may have unsubscribed this one.
            if !route.active.load(Ordering::SeqCst) {
                continue;
            }
            (route.callback)(message);
            delivered += 1;
        }
        delivered
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.routes.read().len()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    key: u64,
    router: Weak<RouterInner>,
    active: bool,
}

impl Subscription {
    /// Stop delivery. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(router) = self.router.upgrade() {
            router.remove(self.key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}
