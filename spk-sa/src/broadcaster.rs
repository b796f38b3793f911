//! Event Broadcaster
//!
//! One [`EventBus`] per session fans orchestrator events out to any number of SSE
//! subscribers. A subscription registers its live receiver first and only then reads the
//! stage cache, so every resolved stage reaches the subscriber exactly once: either as a
//! `cached: true` replay or as a live event, never neither. Live resolutions of stages
//! already replayed are suppressed.
//!
//! Channels opened by a pipeline run are pinned until [`Broadcaster::close`]. Channels
//! created by a subscriber alone are dropped when their last subscriber leaves.

use spk_common::events::{EventBus, EventType, ProgressEvent, StageName};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::StageCache;

/// Subscription failure
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("Session {session_id} already has {limit} subscribers")]
    TooManySubscribers { session_id: Uuid, limit: usize },

    #[error(transparent)]
    Cache(#[from] spk_common::Error),
}

struct Channel {
    bus: EventBus,
    /// Held open by a pipeline run
    pinned: bool,
}

type ChannelMap = Arc<Mutex<HashMap<Uuid, Channel>>>;

#[derive(Clone)]
pub struct Broadcaster {
    channels: ChannelMap,
    cache: StageCache,
    capacity: usize,
    max_subscribers: usize,
}

fn lock(channels: &ChannelMap) -> MutexGuard<'_, HashMap<Uuid, Channel>> {
    // Map stays consistent even if a holder panicked; no invariant spans the lock
    channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Broadcaster {
    pub fn new(cache: StageCache, capacity: usize, max_subscribers: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            cache,
            capacity,
            max_subscribers,
        }
    }

    /// Open (or pin an existing) channel for a pipeline run
    pub fn open(&self, session_id: Uuid) -> EventBus {
        let mut channels = lock(&self.channels);
        let channel = channels.entry(session_id).or_insert_with(|| Channel {
            bus: EventBus::new(self.capacity),
            pinned: false,
        });
        channel.pinned = true;
        debug!(session_id = %session_id, "Broadcast channel opened");
        channel.bus.clone()
    }

    /// Publish a live event; returns the number of receivers it reached
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let bus = lock(&self.channels)
            .get(&event.session_id)
            .map(|channel| channel.bus.clone());

        match bus {
            Some(bus) => {
                let session_id = event.session_id;
                let event_type = event.event_type;
                match bus.emit(event) {
                    Ok(count) => count,
                    Err(_) => {
                        debug!(session_id = %session_id, event_type = %event_type, "No subscribers for event");
                        0
                    }
                }
            }
            None => 0,
        }
    }

    /// Send `connection_closing` and tear the channel down
    pub fn close(&self, session_id: Uuid, progress: u8) {
        let removed = lock(&self.channels).remove(&session_id);
        if let Some(channel) = removed {
            let reached = channel
                .bus
                .emit(ProgressEvent::connection_closing(session_id, progress))
                .unwrap_or(0);
            info!(session_id = %session_id, subscribers = reached, "Broadcast channel closed");
        }
    }

    pub fn is_open(&self, session_id: Uuid) -> bool {
        lock(&self.channels).contains_key(&session_id)
    }

    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        lock(&self.channels)
            .get(&session_id)
            .map(|channel| channel.bus.subscriber_count())
            .unwrap_or(0)
    }

    /// Number of channels currently held
    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Attach a subscriber: live receiver first, then cached replay
    pub async fn subscribe(&self, session_id: Uuid) -> Result<Subscription, SubscribeError> {
        let rx = {
            let mut channels = lock(&self.channels);
            let channel = channels.entry(session_id).or_insert_with(|| Channel {
                bus: EventBus::new(self.capacity),
                pinned: false,
            });
            if channel.bus.subscriber_count() >= self.max_subscribers {
                warn!(session_id = %session_id, limit = self.max_subscribers, "Subscriber cap reached");
                return Err(SubscribeError::TooManySubscribers {
                    session_id,
                    limit: self.max_subscribers,
                });
            }
            channel.bus.subscribe()
        };

        // From here on the guard releases the channel on every exit path
        let mut subscription = Subscription {
            session_id,
            replay: VecDeque::new(),
            replayed: HashSet::new(),
            rx: Some(rx),
            channels: Arc::clone(&self.channels),
            done: false,
        };

        let cached = self.cache.load(session_id).await?;
        for result in cached {
            subscription.replayed.insert(result.stage);
            subscription
                .replay
                .push_back(result.to_event(result.stage.checkpoint()).as_cached());
        }

        debug!(
            session_id = %session_id,
            replayed = subscription.replayed.len(),
            subscribers = self.subscriber_count(session_id),
            "Subscriber attached"
        );

        Ok(subscription)
    }
}

/// One subscriber's view of a session channel
///
/// Yields cached replays, then live events, and ends after `connection_closing` or when
/// the channel is torn down.
pub struct Subscription {
    session_id: Uuid,
    replay: VecDeque<ProgressEvent>,
    replayed: HashSet<StageName>,
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    channels: ChannelMap,
    done: bool,
}

impl Subscription {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Stages delivered from the cache
    pub fn replayed_stages(&self) -> &HashSet<StageName> {
        &self.replayed
    }

    /// Take the pending cached replay, leaving only live events
    pub fn take_replay(&mut self) -> Vec<ProgressEvent> {
        self.replay.drain(..).collect()
    }

    /// Next event, `None` once the stream has ended
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        if self.done {
            return None;
        }

        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => {
                    if let Some(stage) = event.resolved_stage() {
                        if self.replayed.contains(&stage) {
                            debug!(session_id = %self.session_id, stage = %stage, "Suppressing duplicate of replayed stage");
                            continue;
                        }
                    }
                    if event.event_type == EventType::ConnectionClosing {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %self.session_id, skipped, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Convert into a stream of events
    pub fn into_stream(mut self) -> impl futures::Stream<Item = ProgressEvent> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Receiver goes first so the count below no longer includes it
        self.rx.take();

        let mut channels = lock(&self.channels);
        let idle = channels
            .get(&self.session_id)
            .map(|channel| !channel.pinned && channel.bus.subscriber_count() == 0)
            .unwrap_or(false);
        if idle {
            channels.remove(&self.session_id);
            debug!(session_id = %self.session_id, "Idle broadcast channel released");
        }
    }
}
