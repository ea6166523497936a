//! Per-task event channels with multi-subscriber fan-out
//!
//! The broker assigns each published event the next sequence number of its
//! task under the channel lock, so every subscription observes events in
//! publish order. Publishing never waits for subscribers: each subscriber
//! reads from a bounded buffer and the configured [`LagPolicy`] decides what
//! happens when it overflows.
//!
//! A terminal event closes the channel. Closed channels are reclaimed once
//! their last subscriber detaches (when no replay is configured) or after
//! `closed_linger` via [`EventBroker::reclaim_expired`].

use crate::config::{BrokerConfig, LagPolicy};
use crate::error::{EngineError, Result};
use crate::event::{Event, EventKind};
use chrono::Utc;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

struct Channel {
    next_sequence: u64,
    sender: Option<broadcast::Sender<Event>>,
    replay: VecDeque<Event>,
    subscribers: HashSet<u64>,
    closed_at: Option<Instant>,
}

impl Channel {
    fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

struct Shared {
    config: BrokerConfig,
    channels: Mutex<HashMap<String, Channel>>,
    next_subscription: AtomicU64,
}

impl Shared {
    fn detach(&self, task_id: &str, subscription: u64) -> bool {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(task_id) else {
            return false;
        };
        let removed = channel.subscribers.remove(&subscription);
        if channel.is_closed() && channel.subscribers.is_empty() && self.config.replay_buffer == 0 {
            channels.remove(task_id);
            debug!(task_id, "Reclaimed event stream after last subscriber left");
        }
        removed
    }
}

/// Publish/subscribe hub for task events
#[derive(Clone)]
pub struct EventBroker {
    shared: Arc<Shared>,
}

impl EventBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                channels: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Create the channel for a task; ids cannot be reused while the channel exists
    pub fn open(&self, task_id: &str) -> Result<()> {
        let mut channels = self.shared.channels.lock();
        if channels.contains_key(task_id) {
            return Err(EngineError::DuplicateTask(task_id.to_string()));
        }
        let (sender, _) = broadcast::channel(self.shared.config.subscriber_buffer);
        channels.insert(
            task_id.to_string(),
            Channel {
                next_sequence: 0,
                sender: Some(sender),
                replay: VecDeque::with_capacity(self.shared.config.replay_buffer),
                subscribers: HashSet::new(),
                closed_at: None,
            },
        );
        trace!(task_id, "Opened event stream");
        Ok(())
    }

    /// Publish the next event for a task
    ///
    /// Fails with `NotFound` for an unknown task and `StreamClosed` once a
    /// terminal event has been published.
    pub fn publish(&self, task_id: &str, kind: EventKind, payload: Value) -> Result<Event> {
        let replay_buffer = self.shared.config.replay_buffer;
        let mut channels = self.shared.channels.lock();
        let channel = channels
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("event stream {task_id}")))?;
        if channel.is_closed() {
            return Err(EngineError::StreamClosed(task_id.to_string()));
        }

        let event = Event {
            task_id: task_id.to_string(),
            sequence: channel.next_sequence,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        channel.next_sequence += 1;

        // No live receivers is not an error: late subscribers rely on replay.
        let delivered = channel
            .sender
            .as_ref()
            .map_or(0, |sender| sender.send(event.clone()).unwrap_or(0));

        if replay_buffer > 0 {
            if channel.replay.len() == replay_buffer {
                channel.replay.pop_front();
            }
            channel.replay.push_back(event.clone());
        }

        trace!(task_id, sequence = event.sequence, kind = ?kind, delivered, "Published event");

        if kind.is_terminal() {
            channel.sender = None;
            channel.closed_at = Some(Instant::now());
            if channel.subscribers.is_empty() && replay_buffer == 0 {
                channels.remove(task_id);
                debug!(task_id, "Reclaimed event stream with no subscribers");
            }
        }

        Ok(event)
    }

    /// Attach a subscriber to a task's stream
    ///
    /// The subscription first yields the replay tail (if configured) and then
    /// every event published after this call.
    pub fn subscribe(&self, task_id: &str) -> Result<Subscription> {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.shared.channels.lock();
        let channel = channels
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("event stream {task_id}")))?;

        let backlog = channel.replay.clone();
        let receiver = channel.sender.as_ref().map(broadcast::Sender::subscribe);
        channel.subscribers.insert(id);
        debug!(task_id, subscription = id, replayed = backlog.len(), "Subscriber attached");

        Ok(Subscription {
            id,
            task_id: task_id.to_string(),
            backlog,
            receiver,
            lag_policy: self.shared.config.lag_policy,
            finished: false,
            detached: false,
            broker: Arc::downgrade(&self.shared),
        })
    }

    /// Detach a subscription; the task keeps running
    pub fn unsubscribe(&self, mut subscription: Subscription) -> Result<()> {
        subscription.detached = true;
        if self.shared.detach(&subscription.task_id, subscription.id) {
            debug!(task_id = %subscription.task_id, subscription = subscription.id, "Subscriber detached");
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("subscription {}", subscription.id)))
        }
    }

    /// Number of attached subscriptions for a task
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.shared
            .channels
            .lock()
            .get(task_id)
            .map_or(0, |channel| channel.subscribers.len())
    }

    /// Whether the task has a channel that still accepts events
    pub fn is_open(&self, task_id: &str) -> bool {
        self.shared
            .channels
            .lock()
            .get(task_id)
            .is_some_and(|channel| !channel.is_closed())
    }

    /// Whether any channel, open or closed, exists for the task
    pub fn contains(&self, task_id: &str) -> bool {
        self.shared.channels.lock().contains_key(task_id)
    }

    /// Number of channels currently held
    pub fn stream_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    /// Drop a task's channel regardless of state
    pub fn remove(&self, task_id: &str) -> bool {
        self.shared.channels.lock().remove(task_id).is_some()
    }

    /// Reclaim closed channels older than `closed_linger`
    pub fn reclaim_expired(&self) -> usize {
        let linger = self.shared.config.closed_linger;
        let now = Instant::now();
        let mut channels = self.shared.channels.lock();
        let before = channels.len();
        channels.retain(|_, channel| {
            channel
                .closed_at
                .is_none_or(|closed| now.saturating_duration_since(closed) < linger)
        });
        let reclaimed = before - channels.len();
        if reclaimed > 0 {
            debug!(reclaimed, "Reclaimed closed event streams");
        }
        reclaimed
    }
}

/// Live consumer of one task's events
///
/// Dropping the subscription detaches it from the broker.
pub struct Subscription {
    id: u64,
    task_id: String,
    backlog: VecDeque<Event>,
    receiver: Option<broadcast::Receiver<Event>>,
    lag_policy: LagPolicy,
    finished: bool,
    detached: bool,
    broker: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Whether the sequence has ended
    pub fn is_finished(&self) -> bool {
        self.finished && self.backlog.is_empty()
    }

    fn finish(&mut self) {
        self.finished = true;
        self.receiver = None;
    }

    /// Next event in sequence order, `None` once the stream has ended
    ///
    /// Under [`LagPolicy::Disconnect`] an overflow yields one `Lagging` error
    /// and ends the sequence.
    pub async fn next(&mut self) -> Option<Result<Event>> {
        if let Some(event) = self.backlog.pop_front() {
            if event.is_terminal() {
                self.finish();
            }
            return Some(Ok(event));
        }
        if self.finished {
            return None;
        }

        loop {
            let Some(receiver) = self.receiver.as_mut() else {
                self.finish();
                return None;
            };
            match receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finish();
                    }
                    return Some(Ok(event));
                }
                Err(RecvError::Lagged(skipped)) => match self.lag_policy {
                    LagPolicy::DropOldest => {
                        warn!(task_id = %self.task_id, subscription = self.id, skipped, "Subscriber lagged, dropped oldest events");
                    }
                    LagPolicy::Disconnect => {
                        warn!(task_id = %self.task_id, subscription = self.id, skipped, "Subscriber lagged, disconnecting");
                        self.finish();
                        return Some(Err(EngineError::Lagging { skipped }));
                    }
                },
                Err(RecvError::Closed) => {
                    self.finish();
                    return None;
                }
            }
        }
    }

    /// Lazy stream over the remaining events
    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            let item = subscription.next().await?;
            Some((item, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(shared) = self.broker.upgrade() {
            shared.detach(&self.task_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn broker(config: BrokerConfig) -> EventBroker {
        let broker = EventBroker::new(config);
        broker.open("t1").unwrap();
        broker
    }

    fn sequences(events: &[Event]) -> Vec<u64> {
        events.iter().map(|event| event.sequence).collect()
    }

    #[tokio::test]
    async fn test_fan_out_in_order_and_terminal_closes() {
        let broker = broker(BrokerConfig::new(LagPolicy::Disconnect));
        let first = broker.subscribe("t1").unwrap();
        let second = broker.subscribe("t1").unwrap();

        broker.publish("t1", EventKind::Started, json!({})).unwrap();
        for i in 0..3 {
            broker.publish("t1", EventKind::Progress, json!({"step": i})).unwrap();
        }
        broker.publish("t1", EventKind::Completed, json!({"ok": true})).unwrap();

        let err = broker.publish("t1", EventKind::Progress, json!({})).unwrap_err();
        assert!(matches!(err, EngineError::StreamClosed(_)));

        for subscription in [first, second] {
            let events: Vec<Event> = subscription
                .into_stream()
                .map(|item| item.unwrap())
                .collect()
                .await;
            assert_eq!(sequences(&events), vec![0, 1, 2, 3, 4]);
            assert_eq!(events[0].kind, EventKind::Started);
            assert_eq!(events[4].kind, EventKind::Completed);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_without_replay() {
        let broker = broker(BrokerConfig::new(LagPolicy::Disconnect));
        broker.publish("t1", EventKind::Started, json!({})).unwrap();
        broker.publish("t1", EventKind::Progress, json!({"p": 1})).unwrap();

        let mut late = broker.subscribe("t1").unwrap();
        broker.publish("t1", EventKind::Progress, json!({"p": 2})).unwrap();
        broker.publish("t1", EventKind::Failed, json!({})).unwrap();

        let event = late.next().await.unwrap().unwrap();
        assert_eq!(event.sequence, 2);
        assert_eq!(event.payload, json!({"p": 2}));
        assert_eq!(late.next().await.unwrap().unwrap().kind, EventKind::Failed);
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_replay_buffer_serves_recent_events() {
        let broker = broker(BrokerConfig::new(LagPolicy::Disconnect).with_replay(2));
        for _ in 0..3 {
            broker.publish("t1", EventKind::Progress, json!({})).unwrap();
        }

        let mut late = broker.subscribe("t1").unwrap();
        broker.publish("t1", EventKind::Chunk, json!({"text": "hi"})).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(late.next().await.unwrap().unwrap());
        }
        assert_eq!(sequences(&seen), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_subscription_alive() {
        let broker = broker(BrokerConfig::new(LagPolicy::DropOldest).with_subscriber_buffer(2));
        let mut slow = broker.subscribe("t1").unwrap();

        for i in 0..5 {
            broker.publish("t1", EventKind::Progress, json!({"i": i})).unwrap();
        }
        broker.publish("t1", EventKind::Completed, json!({})).unwrap();

        let mut seen = Vec::new();
        while let Some(item) = slow.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(sequences(&seen), vec![4, 5]);
        assert_eq!(seen[1].kind, EventKind::Completed);
    }

    #[tokio::test]
    async fn test_disconnect_policy_only_affects_lagging_subscriber() {
        let broker = broker(BrokerConfig::new(LagPolicy::Disconnect).with_subscriber_buffer(2));
        let mut fast = broker.subscribe("t1").unwrap();
        let mut slow = broker.subscribe("t1").unwrap();

        let mut fast_seen = Vec::new();
        for i in 0..5 {
            broker.publish("t1", EventKind::Progress, json!({"i": i})).unwrap();
            fast_seen.push(fast.next().await.unwrap().unwrap());
        }
        assert_eq!(sequences(&fast_seen), vec![0, 1, 2, 3, 4]);

        match slow.next().await {
            Some(Err(EngineError::Lagging { skipped })) => assert_eq!(skipped, 3),
            other => panic!("Expected Lagging, got {other:?}"),
        }
        assert!(slow.next().await.is_none());

        broker.publish("t1", EventKind::Completed, json!({})).unwrap();
        assert_eq!(fast.next().await.unwrap().unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_unknown_task() {
        let broker = broker(BrokerConfig::new(LagPolicy::Disconnect));
        let subscription = broker.subscribe("t1").unwrap();
        assert_eq!(broker.subscriber_count("t1"), 1);

        broker.unsubscribe(subscription).unwrap();
        assert_eq!(broker.subscriber_count("t1"), 0);
        assert!(broker.publish("t1", EventKind::Progress, json!({})).is_ok());

        assert!(matches!(broker.subscribe("nope"), Err(EngineError::NotFound(_))));
        assert!(matches!(
            broker.publish("nope", EventKind::Started, json!({})),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(broker.open("t1"), Err(EngineError::DuplicateTask(_))));
    }

    #[tokio::test]
    async fn test_closed_stream_reclaimed_after_last_subscriber() {
        let broker = broker(BrokerConfig::new(LagPolicy::Disconnect));
        let mut subscription = broker.subscribe("t1").unwrap();
        broker.publish("t1", EventKind::Cancelled, json!({})).unwrap();

        assert!(broker.contains("t1"));
        assert!(!broker.is_open("t1"));
        assert_eq!(subscription.next().await.unwrap().unwrap().kind, EventKind::Cancelled);
        drop(subscription);

        assert!(!broker.contains("t1"));
        assert_eq!(broker.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribing_to_closed_stream_is_finished() {
        let broker = broker(BrokerConfig::new(LagPolicy::Disconnect));
        let _watcher = broker.subscribe("t1").unwrap();
        broker.publish("t1", EventKind::Completed, json!({})).unwrap();
        assert!(broker.contains("t1"));

        let mut late = broker.subscribe("t1").unwrap();
        assert!(!late.is_finished());
        assert!(late.next().await.is_none());
        assert!(late.is_finished());
        assert!(late.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_tail_lingers_until_timeout() {
        let config = BrokerConfig::new(LagPolicy::DropOldest)
            .with_replay(4)
            .with_closed_linger(Duration::from_secs(30));
        let broker = broker(config);
        broker.publish("t1", EventKind::Started, json!({})).unwrap();
        broker.publish("t1", EventKind::Completed, json!({"done": true})).unwrap();

        let mut reconnect = broker.subscribe("t1").unwrap();
        assert_eq!(reconnect.next().await.unwrap().unwrap().kind, EventKind::Started);
        assert_eq!(reconnect.next().await.unwrap().unwrap().kind, EventKind::Completed);
        assert!(reconnect.next().await.is_none());
        drop(reconnect);

        assert_eq!(broker.reclaim_expired(), 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(broker.reclaim_expired(), 1);
        assert!(matches!(broker.subscribe("t1"), Err(EngineError::NotFound(_))));
    }
}
