//! Topic-based event bus with history and a dead-letter queue.
//!
//! Every handler subscribed to an event's type, plus every `*` subscriber,
//! runs as its own tokio task. `publish` waits for all of them before it
//! returns. A handler that errors or panics fails only its own delivery; the
//! event is then dead-lettered once, with one failure entry per failed
//! handler.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;
use meshkit_core::{ClockSource, DeadLetter, DeliveryFailure, EventMessage, NewEvent};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Topic that receives every published event.
pub const WILDCARD_TOPIC: &str = "*";

/// Receives events published to a subscribed topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// An `Err` marks this delivery failed and dead-letters the event.
    async fn handle(&self, event: &EventMessage) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &EventMessage) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

type Subscribers = HashMap<String, Vec<(u64, Arc<dyn EventHandler>)>>;

struct BusInner {
    subscribers: RwLock<Subscribers>,
    next_subscription: AtomicU64,
    history: Mutex<VecDeque<EventMessage>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    clock: Arc<dyn ClockSource>,
    history_capacity: usize,
    dead_letter_capacity: usize,
}

impl BusInner {
    fn remove_subscription(&self, topic: &str, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(handlers) = subscribers.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subscribers.remove(topic);
        }
        removed
    }
}

/// Token returned by [`EventBus::subscribe`].
///
/// Dropping the token leaves the subscription in place; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    bus: Weak<BusInner>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes the handler. `false` if the bus is gone or it was already
    /// removed.
    pub fn unsubscribe(self) -> bool {
        let removed = self
            .bus
            .upgrade()
            .is_some_and(|bus| bus.remove_subscription(&self.topic, self.id));
        if removed {
            debug!(topic = %self.topic, subscription_id = self.id, "unsubscribed");
        }
        removed
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

/// Publish/subscribe bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    #[must_use]
    pub fn new(
        clock: Arc<dyn ClockSource>,
        history_capacity: usize,
        dead_letter_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                history: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                clock,
                history_capacity,
                dead_letter_capacity,
            }),
        }
    }

    /// Subscribes `handler` to `topic` (`*` for every event).
    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        info!(topic = %topic, subscription_id = id, "subscribed to event");
        Subscription {
            id,
            topic: topic.to_string(),
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribes an async closure.
    pub fn subscribe_fn<F, Fut>(&self, topic: &str, f: F) -> Subscription
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(topic, Arc::new(FnHandler(f)))
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn handlers_for(&self, event_type: &str) -> Vec<(u64, String, Arc<dyn EventHandler>)> {
        let subscribers = self.inner.subscribers.read();
        let mut topics = vec![event_type];
        if event_type != WILDCARD_TOPIC {
            topics.push(WILDCARD_TOPIC);
        }
        topics
            .into_iter()
            .filter_map(|topic| subscribers.get(topic).map(|hs| (topic, hs)))
            .flat_map(|(topic, hs)| {
                hs.iter()
                    .map(move |(id, h)| (*id, topic.to_string(), Arc::clone(h)))
            })
            .collect()
    }

    /// Stamps an id and timestamp on `draft`, records it in the history and
    /// delivers it. Resolves once every handler has finished; returns the
    /// event id.
    pub async fn publish(&self, draft: NewEvent) -> String {
        let id = Uuid::new_v4().to_string();
        let event = Arc::new(draft.into_message(id.clone(), self.inner.clock.now()));

        {
            let mut history = self.inner.history.lock();
            history.push_back(EventMessage::clone(&event));
            while history.len() > self.inner.history_capacity {
                history.pop_front();
            }
        }
        metrics::counter!("meshkit_events_published_total").increment(1);

        let handlers = self.handlers_for(&event.event_type);
        debug!(
            event_type = %event.event_type,
            event_id = %id,
            subscribers = handlers.len(),
            "publishing event"
        );

        let deliveries = handlers.into_iter().map(|(subscription_id, topic, handler)| {
            let event = Arc::clone(&event);
            let task = tokio::spawn(async move { handler.handle(&event).await });
            async move {
                let error = match task.await {
                    Ok(Ok(())) => return None,
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(join) if join.is_panic() => "handler panicked".to_string(),
                    Err(_) => "handler cancelled".to_string(),
                };
                Some(DeliveryFailure {
                    subscription_id,
                    topic,
                    error,
                })
            }
        });
        let failures: Vec<DeliveryFailure> = join_all(deliveries).await.into_iter().flatten().collect();

        if !failures.is_empty() {
            for failure in &failures {
                warn!(
                    event_type = %event.event_type,
                    event_id = %id,
                    subscription_id = failure.subscription_id,
                    error = %failure.error,
                    "event handler failed"
                );
            }
            self.dead_letter(EventMessage::clone(&event), failures);
        }
        id
    }

    fn dead_letter(&self, event: EventMessage, failures: Vec<DeliveryFailure>) {
        let mut queue = self.inner.dead_letters.lock();
        queue.push_back(DeadLetter {
            event,
            failures,
            dead_lettered_at: self.inner.clock.now(),
        });
        while queue.len() > self.inner.dead_letter_capacity {
            queue.pop_front();
        }
        metrics::counter!("meshkit_events_dead_lettered_total").increment(1);
    }

    /// The most recent `limit` events, oldest first, optionally of one type.
    #[must_use]
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<EventMessage> {
        let history = self.inner.history.lock();
        let matching: Vec<&EventMessage> = history
            .iter()
            .filter(|e| match event_type {
                Some(t) => e.event_type == t,
                None => true,
            })
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn dead_letter_len(&self) -> usize {
        self.inner.dead_letters.lock().len()
    }

    #[must_use]
    pub fn get_dead_letter(&self, event_id: &str) -> Option<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .iter()
            .find(|d| d.event.id == event_id)
            .cloned()
    }

    /// Removes a dead-lettered event and publishes a copy with a new id whose
    /// causation id is the original id. Resolves after the new delivery and
    /// returns the new id, or `None` if no dead letter has `event_id`.
    pub async fn retry(&self, event_id: &str) -> Option<String> {
        let entry = {
            let mut queue = self.inner.dead_letters.lock();
            let index = queue.iter().position(|d| d.event.id == event_id)?;
            queue.remove(index)?
        };
        let draft = entry.event.to_draft().with_causation_id(event_id);
        let new_id = self.publish(draft).await;
        info!(event_id = %event_id, new_event_id = %new_id, "dead letter retried");
        Some(new_id)
    }

    /// Empties the dead-letter queue, returning how many entries it held.
    pub fn clear_dead_letters(&self) -> usize {
        let mut queue = self.inner.dead_letters.lock();
        let count = queue.len();
        queue.clear();
        count
    }
}
