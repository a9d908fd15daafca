//! Live subscription plumbing shared by the storage adapters.
//!
//! Each subscriber receives complete per-user snapshots in the order the
//! adapter publishes them. Adapters publish while holding their write
//! ordering guard, so snapshot order matches write order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use study_core::model::{Plan, UserId};
use tokio::sync::mpsc;

/// Receiving end of a plan subscription.
///
/// The first snapshot is delivered immediately on subscribe. `next_snapshot`
/// returns `None` once the store drops the connection.
#[derive(Debug)]
pub struct PlanSubscription {
    user_id: UserId,
    receiver: mpsc::UnboundedReceiver<Vec<Plan>>,
}

impl PlanSubscription {
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Wait for the next snapshot of the user's plans.
    pub async fn next_snapshot(&mut self) -> Option<Vec<Plan>> {
        self.receiver.recv().await
    }

    /// Take a snapshot if one is already queued.
    pub fn try_next_snapshot(&mut self) -> Option<Vec<Plan>> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
struct Subscriber {
    user_id: UserId,
    sender: mpsc::UnboundedSender<Vec<Plan>>,
}

/// Fan-out of per-user snapshots to open subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscriberHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl SubscriberHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber and queue `initial` as its first snapshot.
    #[must_use]
    pub fn subscribe(&self, user_id: UserId, initial: Vec<Plan>) -> PlanSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        // A fresh receiver is alive, so this send cannot fail.
        let _ = sender.send(initial);
        self.lock().push(Subscriber {
            user_id: user_id.clone(),
            sender,
        });
        log::debug!("subscription opened for user {user_id}");
        PlanSubscription { user_id, receiver }
    }

    /// Push a snapshot to every open subscription of `user_id`.
    ///
    /// Subscriptions whose receiver was dropped are pruned.
    pub fn publish(&self, user_id: &UserId, snapshot: &[Plan]) {
        let mut guard = self.lock();
        guard.retain(|sub| {
            if &sub.user_id != user_id {
                return !sub.sender.is_closed();
            }
            sub.sender.send(snapshot.to_vec()).is_ok()
        });
    }

    #[must_use]
    pub fn subscriber_count(&self, user_id: &UserId) -> usize {
        self.lock()
            .iter()
            .filter(|sub| &sub.user_id == user_id && !sub.sender.is_closed())
            .count()
    }

    /// Drop every open subscription, as a lost connection would.
    pub fn disconnect_all(&self) {
        let dropped = std::mem::take(&mut *self.lock());
        if !dropped.is_empty() {
            log::info!("dropped {} live subscriptions", dropped.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_gets_initial_then_published_snapshots() {
        let hub = SubscriberHub::new();
        let user = UserId::new("u1");
        let mut sub = hub.subscribe(user.clone(), Vec::new());

        assert_eq!(sub.next_snapshot().await, Some(Vec::new()));
        hub.publish(&UserId::new("other"), &[]);
        assert!(sub.try_next_snapshot().is_none());

        hub.publish(&user, &[]);
        assert_eq!(sub.next_snapshot().await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn disconnect_closes_stream() {
        let hub = SubscriberHub::new();
        let user = UserId::new("u1");
        let mut sub = hub.subscribe(user.clone(), Vec::new());
        let _ = sub.next_snapshot().await;

        hub.disconnect_all();

        assert_eq!(sub.next_snapshot().await, None);
        assert_eq!(hub.subscriber_count(&user), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let hub = SubscriberHub::new();
        let user = UserId::new("u1");
        let sub = hub.subscribe(user.clone(), Vec::new());
        assert_eq!(hub.subscriber_count(&user), 1);
        drop(sub);
        hub.publish(&user, &[]);
        assert_eq!(hub.subscriber_count(&user), 0);
    }
}
