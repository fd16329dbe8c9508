//! Named pub/sub channels between plugins.
//!
//! A channel exists only while explicitly open. Its creator receives a
//! capability handle scoped to (channel, actor); other plugins obtain the
//! same shape via `get`, subject to compatibility with the creator. Message
//! history is a newest-first ring buffer; fan-out isolates each subscriber's
//! failure so one bad callback cannot block delivery to the rest.

use crate::error::{Result, RuntimeError};
use crate::reporter::ErrorReporter;
use chrono::{DateTime, Utc};
use daybook_types::{topics, ConflictLookup, EventBus, MessageId, RingLog};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// How much history a new subscriber is handed synchronously on subscribe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryReplay {
    #[default]
    None,
    /// Only the single most recent message.
    Latest,
    /// The full retained buffer, newest-first.
    Full,
}

/// Per-channel configuration, fixed at creation.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelOptions {
    /// Retained message cap.
    pub max_messages: usize,
    /// Whether non-subscribers may publish.
    pub allow_any_publisher: bool,
    /// Whether plugins other than the creator may close the channel.
    pub allow_any_close: bool,
    /// History handed to new subscribers.
    pub replay: HistoryReplay,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_messages: 100,
            allow_any_publisher: false,
            allow_any_close: false,
            replay: HistoryReplay::None,
        }
    }
}

/// One message on a channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMessage {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub publisher_id: String,
    pub channel: String,
    pub content: Value,
}

/// Subscriber callbacks may fail; failures are isolated per subscriber.
pub type SubscriberCallback = Arc<dyn Fn(&ChannelMessage) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    plugin_id: String,
    callback: SubscriberCallback,
    subscribed_at: DateTime<Utc>,
    last_message_id: Option<MessageId>,
}

struct Channel {
    name: String,
    creator_id: String,
    created_at: DateTime<Utc>,
    /// Insertion order is delivery order.
    subscribers: Vec<Subscription>,
    messages: RingLog<ChannelMessage>,
    options: ChannelOptions,
}

/// Public summary of an open channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub subscribers_count: usize,
    pub message_count: usize,
}

/// All open channels. Owned by the communication hub.
pub struct ChannelSet {
    conflicts: Arc<dyn ConflictLookup>,
    reporter: Arc<ErrorReporter>,
    bus: Arc<dyn EventBus>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelSet {
    #[must_use]
    pub fn new(
        conflicts: Arc<dyn ConflictLookup>,
        reporter: Arc<ErrorReporter>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            conflicts,
            reporter,
            bus,
            channels: Mutex::new(HashMap::new()),
        }
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    /// Opens a channel. Names are globally unique while open.
    pub fn create(&self, name: &str, creator_id: &str, options: ChannelOptions) -> Result<()> {
        if name.is_empty() {
            return Err(RuntimeError::InvalidArgument("channel name is empty".into()));
        }

        let mut channels = self.channels.lock().expect("channel lock poisoned");
        if channels.contains_key(name) {
            return Err(RuntimeError::ChannelExists(name.to_string()));
        }
        let max_messages = options.max_messages;
        channels.insert(
            name.to_string(),
            Channel {
                name: name.to_string(),
                creator_id: creator_id.to_string(),
                created_at: Utc::now(),
                subscribers: Vec::new(),
                messages: RingLog::new(max_messages),
                options,
            },
        );
        drop(channels);

        info!(channel = %name, creator = %creator_id, "Channel created");
        self.bus.publish(
            topics::CHANNEL_CREATED,
            json!({ "channel": name, "creator": creator_id }),
        );
        Ok(())
    }

    /// Whether a channel with this name is currently open.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels
            .lock()
            .expect("channel lock poisoned")
            .contains_key(name)
    }

    /// Closes a channel. Creator-only unless the channel allows any closer.
    /// Subscribers are notified before the channel is removed irrevocably.
    pub fn close(&self, name: &str, plugin_id: &str) -> Result<()> {
        let (notify, creator) = {
            let mut channels = self.channels.lock().expect("channel lock poisoned");
            let channel = channels
                .get(name)
                .ok_or_else(|| RuntimeError::ChannelNotFound(name.to_string()))?;
            if channel.creator_id != plugin_id && !channel.options.allow_any_close {
                return Err(RuntimeError::CloseDenied {
                    plugin_id: plugin_id.to_string(),
                    channel: name.to_string(),
                });
            }
            let channel = channels.remove(name).expect("checked above");
            let notify: Vec<(String, SubscriberCallback)> = channel
                .subscribers
                .iter()
                .map(|s| (s.plugin_id.clone(), Arc::clone(&s.callback)))
                .collect();
            (notify, channel.creator_id)
        };

        // Close notification, delivered after the channel is already gone so
        // callbacks cannot publish into it. Failures degrade to diagnostics.
        let farewell = ChannelMessage {
            id: MessageId::new(),
            timestamp: Utc::now(),
            publisher_id: plugin_id.to_string(),
            channel: name.to_string(),
            content: json!({ "event": "channel-closed", "channel": name }),
        };
        for (subscriber_id, callback) in notify {
            if let Err(err) = callback(&farewell) {
                warn!(
                    channel = %name,
                    subscriber = %subscriber_id,
                    "Close notification failed: {err}"
                );
            }
        }

        info!(channel = %name, closed_by = %plugin_id, "Channel closed");
        self.bus.publish(
            topics::CHANNEL_CLOSED,
            json!({ "channel": name, "creator": creator, "closed_by": plugin_id }),
        );
        Ok(())
    }

    // ================================================================
    // Subscription
    // ================================================================

    /// Subscribes `plugin_id` to a channel. The subscriber must be
    /// pairwise-compatible with the channel's creator. When the channel
    /// requests history replay, retained messages are delivered
    /// synchronously before this returns.
    pub fn subscribe(
        &self,
        name: &str,
        plugin_id: &str,
        callback: SubscriberCallback,
    ) -> Result<()> {
        let replay: Vec<ChannelMessage> = {
            let mut channels = self.channels.lock().expect("channel lock poisoned");
            let channel = channels
                .get_mut(name)
                .ok_or_else(|| RuntimeError::ChannelNotFound(name.to_string()))?;

            if channel.creator_id != plugin_id {
                self.check_compatibility(plugin_id, &channel.creator_id)?;
            }

            // Re-subscribing replaces the previous callback in place.
            channel.subscribers.retain(|s| s.plugin_id != plugin_id);
            channel.subscribers.push(Subscription {
                plugin_id: plugin_id.to_string(),
                callback: Arc::clone(&callback),
                subscribed_at: Utc::now(),
                last_message_id: None,
            });

            match channel.options.replay {
                HistoryReplay::None => Vec::new(),
                HistoryReplay::Latest => {
                    channel.messages.newest().cloned().into_iter().collect()
                }
                HistoryReplay::Full => channel.messages.snapshot(None),
            }
        };

        // Replay outside the lock; a failing replay callback must not block
        // the subscription itself.
        for message in &replay {
            if let Err(err) = callback(message) {
                warn!(channel = %name, subscriber = %plugin_id, "History replay failed: {err}");
                self.reporter.report_message(
                    Some(plugin_id),
                    "channel:replay",
                    err.to_string(),
                    json!({ "channel": name }),
                );
                break;
            }
        }

        debug!(channel = %name, subscriber = %plugin_id, "Subscribed");
        self.bus.publish(
            topics::CHANNEL_SUBSCRIBED,
            json!({ "channel": name, "subscriber": plugin_id }),
        );
        Ok(())
    }

    /// Removes one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, name: &str, plugin_id: &str) -> bool {
        let removed = {
            let mut channels = self.channels.lock().expect("channel lock poisoned");
            match channels.get_mut(name) {
                Some(channel) => {
                    let before = channel.subscribers.len();
                    channel.subscribers.retain(|s| s.plugin_id != plugin_id);
                    channel.subscribers.len() != before
                }
                None => false,
            }
        };
        if removed {
            debug!(channel = %name, subscriber = %plugin_id, "Unsubscribed");
            self.bus.publish(
                topics::CHANNEL_UNSUBSCRIBED,
                json!({ "channel": name, "subscriber": plugin_id }),
            );
        }
        removed
    }

    // ================================================================
    // Publishing
    // ================================================================

    /// Publishes to a channel on behalf of `publisher_id`. The publisher
    /// must be the creator, an existing subscriber, or the channel must
    /// allow any publisher. Fan-out follows subscription order; a failing
    /// callback is logged and reported but never blocks the others.
    pub fn publish(&self, name: &str, publisher_id: &str, content: Value) -> Result<MessageId> {
        let (message, targets) = {
            let mut channels = self.channels.lock().expect("channel lock poisoned");
            let channel = channels
                .get_mut(name)
                .ok_or_else(|| RuntimeError::ChannelNotFound(name.to_string()))?;

            let authorized = publisher_id == channel.creator_id
                || channel.options.allow_any_publisher
                || channel.subscribers.iter().any(|s| s.plugin_id == publisher_id);
            if !authorized {
                return Err(RuntimeError::PublishDenied {
                    publisher: publisher_id.to_string(),
                    channel: name.to_string(),
                });
            }

            let message = ChannelMessage {
                id: MessageId::new(),
                timestamp: Utc::now(),
                publisher_id: publisher_id.to_string(),
                channel: name.to_string(),
                content,
            };
            channel.messages.push(message.clone());

            let targets: Vec<(String, SubscriberCallback)> = channel
                .subscribers
                .iter()
                .map(|s| (s.plugin_id.clone(), Arc::clone(&s.callback)))
                .collect();
            (message, targets)
        };

        // Deliver outside the lock so callbacks may re-enter the channel set.
        let mut delivered = 0usize;
        for (subscriber_id, callback) in &targets {
            match callback(&message) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        channel = %name,
                        subscriber = %subscriber_id,
                        "Subscriber callback failed: {err}"
                    );
                    self.reporter.report_message(
                        Some(subscriber_id),
                        "channel:deliver",
                        err.to_string(),
                        json!({ "channel": name, "message_id": message.id.to_string() }),
                    );
                }
            }
        }

        // Record the delivery high-water mark for subscribers still present.
        {
            let mut channels = self.channels.lock().expect("channel lock poisoned");
            if let Some(channel) = channels.get_mut(name) {
                for subscription in channel.subscribers.iter_mut() {
                    if targets.iter().any(|(id, _)| id == &subscription.plugin_id) {
                        subscription.last_message_id = Some(message.id);
                    }
                }
            }
        }

        debug!(
            channel = %name,
            publisher = %publisher_id,
            subscribers = targets.len(),
            delivered = delivered,
            "Message published"
        );
        Ok(message.id)
    }

    // ================================================================
    // Queries
    // ================================================================

    /// Retained messages, newest-first, optionally limited.
    pub fn history(&self, name: &str, limit: Option<usize>) -> Result<Vec<ChannelMessage>> {
        let channels = self.channels.lock().expect("channel lock poisoned");
        let channel = channels
            .get(name)
            .ok_or_else(|| RuntimeError::ChannelNotFound(name.to_string()))?;
        Ok(channel.messages.snapshot(limit))
    }

    pub fn info(&self, name: &str) -> Result<ChannelInfo> {
        let channels = self.channels.lock().expect("channel lock poisoned");
        let channel = channels
            .get(name)
            .ok_or_else(|| RuntimeError::ChannelNotFound(name.to_string()))?;
        Ok(ChannelInfo {
            name: channel.name.clone(),
            created_by: channel.creator_id.clone(),
            created_at: channel.created_at,
            subscribers_count: channel.subscribers.len(),
            message_count: channel.messages.len(),
        })
    }

    /// Summaries of all open channels, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ChannelInfo> {
        let channels = self.channels.lock().expect("channel lock poisoned");
        let mut infos: Vec<ChannelInfo> = channels
            .values()
            .map(|c| ChannelInfo {
                name: c.name.clone(),
                created_by: c.creator_id.clone(),
                created_at: c.created_at,
                subscribers_count: c.subscribers.len(),
                message_count: c.messages.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// The subscriber's recorded subscription time, if subscribed.
    #[must_use]
    pub fn subscribed_at(&self, name: &str, plugin_id: &str) -> Option<DateTime<Utc>> {
        let channels = self.channels.lock().expect("channel lock poisoned");
        channels.get(name).and_then(|c| {
            c.subscribers
                .iter()
                .find(|s| s.plugin_id == plugin_id)
                .map(|s| s.subscribed_at)
        })
    }

    /// The id of the last message delivered to a subscriber, if any.
    #[must_use]
    pub fn last_delivered(&self, name: &str, plugin_id: &str) -> Option<MessageId> {
        let channels = self.channels.lock().expect("channel lock poisoned");
        channels.get(name).and_then(|c| {
            c.subscribers
                .iter()
                .find(|s| s.plugin_id == plugin_id)
                .and_then(|s| s.last_message_id)
        })
    }

    // ================================================================
    // Bulk teardown
    // ================================================================

    /// Releases everything a plugin holds: unsubscribes it from every
    /// channel and cascade-closes every channel it created.
    pub fn clear_plugin(&self, plugin_id: &str) {
        let (subscribed, owned): (Vec<String>, Vec<String>) = {
            let channels = self.channels.lock().expect("channel lock poisoned");
            let subscribed = channels
                .values()
                .filter(|c| {
                    c.creator_id != plugin_id
                        && c.subscribers.iter().any(|s| s.plugin_id == plugin_id)
                })
                .map(|c| c.name.clone())
                .collect();
            let owned = channels
                .values()
                .filter(|c| c.creator_id == plugin_id)
                .map(|c| c.name.clone())
                .collect();
            (subscribed, owned)
        };

        for name in subscribed {
            self.unsubscribe(&name, plugin_id);
        }
        for name in owned {
            if let Err(err) = self.close(&name, plugin_id) {
                warn!(channel = %name, plugin_id = %plugin_id, "Cascade close failed: {err}");
            }
        }
    }

    fn check_compatibility(&self, a: &str, b: &str) -> Result<()> {
        if let Some(info) = self.conflicts.conflict_info(a) {
            if let Some(entry) = info.involving(b) {
                return Err(RuntimeError::Incompatible {
                    a: a.to_string(),
                    b: b.to_string(),
                    reason: entry.reason().unwrap_or("declared conflict").to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Capability handle over one channel, scoped to the actor it was issued to.
#[derive(Clone)]
pub struct ChannelHandle {
    name: String,
    actor_id: String,
    set: Arc<ChannelSet>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("actor_id", &self.actor_id)
            .finish_non_exhaustive()
    }
}

impl ChannelHandle {
    pub(crate) fn new(name: &str, actor_id: &str, set: Arc<ChannelSet>) -> Self {
        Self {
            name: name.to_string(),
            actor_id: actor_id.to_string(),
            set,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, content: Value) -> Result<MessageId> {
        self.set.publish(&self.name, &self.actor_id, content)
    }

    pub fn subscribe(&self, callback: SubscriberCallback) -> Result<SubscriptionHandle> {
        self.set.subscribe(&self.name, &self.actor_id, callback)?;
        Ok(SubscriptionHandle::new(
            &self.name,
            &self.actor_id,
            Arc::clone(&self.set),
        ))
    }

    pub fn close(&self) -> Result<()> {
        self.set.close(&self.name, &self.actor_id)
    }

    pub fn history(&self, limit: Option<usize>) -> Result<Vec<ChannelMessage>> {
        self.set.history(&self.name, limit)
    }

    pub fn info(&self) -> Result<ChannelInfo> {
        self.set.info(&self.name)
    }
}

/// Returned by `subscribe`; revokes that subscription.
pub struct SubscriptionHandle {
    channel: String,
    plugin_id: String,
    set: Arc<ChannelSet>,
}

impl SubscriptionHandle {
    pub(crate) fn new(channel: &str, plugin_id: &str, set: Arc<ChannelSet>) -> Self {
        Self {
            channel: channel.to_string(),
            plugin_id: plugin_id.to_string(),
            set,
        }
    }

    /// The channel this subscription belongs to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Removes the subscription. Returns whether it was still present.
    pub fn unsubscribe(self) -> bool {
        self.set.unsubscribe(&self.channel, &self.plugin_id)
    }
}
