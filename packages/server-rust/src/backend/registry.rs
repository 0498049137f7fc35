use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use switchboard_core::topic;

use super::error::RegistrationError;
use super::handler::{Handler, HandlerKind, Subscription, SubscriptionId};

// ---------------------------------------------------------------------------
// NewSubscription
// ---------------------------------------------------------------------------

/// Registration request, validated by [`SubscriptionRegistry::add`].
pub struct NewSubscription {
    /// Full transport topic.
    pub topic: String,
    pub kind: HandlerKind,
    pub handler: Arc<dyn Handler>,
    pub exclusive: bool,
    pub exclusive_group: Option<String>,
    pub execution_timeout: Duration,
    pub isolate: bool,
}

// ---------------------------------------------------------------------------
// SubscriptionRegistry
// ---------------------------------------------------------------------------

/// Topic -> handlers table.
///
/// Owned by the dispatch task, which is its only writer; every other context
/// reaches it through registry commands. Handlers on a topic keep their
/// registration order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, Vec<Arc<Subscription>>>,
    next_id: u64,
}

/// Result of a successful [`SubscriptionRegistry::add`].
#[derive(Debug)]
pub struct Added {
    pub subscription: Arc<Subscription>,
    /// `true` when this is the first handler on the topic, meaning the
    /// transport subscription must be created.
    pub first_on_topic: bool,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a subscription.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::InvalidTopic`] for an empty or multi-wildcard topic
    /// - [`RegistrationError::MissingExclusiveGroup`] for an exclusive handler without a group
    /// - [`RegistrationError::DuplicateExclusiveHandler`] when the topic already
    ///   has an exclusive handler in the same group
    pub fn add(&mut self, new: NewSubscription) -> Result<Added, RegistrationError> {
        topic::validate(&new.topic)?;

        let exclusive_group = if new.exclusive {
            match new.exclusive_group {
                Some(group) if !group.is_empty() => Some(group),
                _ => {
                    return Err(RegistrationError::MissingExclusiveGroup { topic: new.topic });
                }
            }
        } else {
            None
        };

        if let Some(group) = &exclusive_group {
            let duplicate = self.topics.get(&new.topic).is_some_and(|subs| {
                subs.iter()
                    .any(|s| s.exclusive_group.as_deref() == Some(group.as_str()))
            });
            if duplicate {
                return Err(RegistrationError::DuplicateExclusiveHandler {
                    topic: new.topic,
                    group: group.clone(),
                });
            }
        }

        self.next_id += 1;
        let subscription = Arc::new(Subscription {
            id: SubscriptionId(self.next_id),
            topic: new.topic.clone(),
            kind: new.kind,
            handler: new.handler,
            exclusive_group,
            execution_timeout: new.execution_timeout,
            isolate: new.isolate,
        });

        let subs = self.topics.entry(new.topic).or_default();
        let first_on_topic = subs.is_empty();
        subs.push(Arc::clone(&subscription));
        Ok(Added {
            subscription,
            first_on_topic,
        })
    }

    /// Removes one handler (`Some(id)`) or every handler (`None`) on a topic.
    ///
    /// Returns `true` if the topic has no handlers left afterwards and was
    /// known before, meaning the transport subscription should be dropped.
    pub fn remove(&mut self, topic: &str, id: Option<SubscriptionId>) -> bool {
        let Some(subs) = self.topics.get_mut(topic) else {
            return false;
        };
        match id {
            Some(id) => subs.retain(|s| s.id != id),
            None => subs.clear(),
        }
        if subs.is_empty() {
            self.topics.remove(topic);
            true
        } else {
            false
        }
    }

    /// Handlers registered under an exact subscription key.
    #[must_use]
    pub fn get(&self, subscription: &str) -> Vec<Arc<Subscription>> {
        self.topics.get(subscription).cloned().unwrap_or_default()
    }

    /// Active topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Removes everything, returning the topics that were active.
    pub fn drain(&mut self) -> Vec<String> {
        let topics = self.topics();
        self.topics.clear();
        topics
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
