//! FIFO-under-lock-count notification queue (§4.5, §5, §8 invariant 6, §9).
//!
//! Notifications are queued into a manager-owned queue and only delivered
//! once the lock counter reaches zero. This is what lets a task switch
//! enqueue several notifications atomically (locking while it mutates
//! state) and guarantees no subscriber ever observes an intermediate
//! state mid-switch: the queue drains strictly in the order entries were
//! pushed, even when draining one entry's callback triggers further state
//! changes that push more entries onto the same queue.

use std::collections::VecDeque;

use crate::error::CoreError;
use crate::ids::WorkspaceId;
use crate::workspace::state::{CurrentTask, LoginStatus};

/// Connection status transitions a subscriber cares about (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerConnState {
    Disconnecting,
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum Notification {
    ServerConnChange(ServerConnState, Option<CoreError>),
    LoginChange(LoginStatus, Option<CoreError>),
    EventsUpToDate,
    TaskSwitch(CurrentTask, Option<CoreError>),
    AppStatusChange(crate::workspace::apps::App),
}

/// A queued notification plus the workspace it originated from, so the
/// manager can route it to that workspace's subscriber list without
/// threading the workspace id through every call site.
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub workspace: WorkspaceId,
    pub notification: Notification,
}

/// Subscribers are identified by an opaque id the owner chooses (a core
/// operation's own id, or a UI channel id) — never by pointer, since the
/// object graph is arena-addressed (§9).
pub type SubscriberId = u64;

/// One workspace's FIFO notification queue and subscriber list, plus the
/// lock counter that defers delivery while a task switch (or any other
/// atomic multi-step mutation) is in progress.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    pending: VecDeque<Notification>,
    lock_count: u32,
    subscribers: Vec<SubscriberId>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the lock counter. While locked, `push` buffers
    /// notifications instead of handing them to `drain`.
    pub fn lock(&mut self) {
        self.lock_count += 1;
    }

    /// Decrements the lock counter. Notifications only become visible to
    /// `drain` once the count returns to zero.
    pub fn unlock(&mut self) {
        self.lock_count = self.lock_count.saturating_sub(1);
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub fn push(&mut self, notification: Notification) {
        self.pending.push_back(notification);
    }

    /// Drains every queued notification in FIFO order, but only while
    /// unlocked — returns an empty vec if still locked, so a caller can
    /// call this unconditionally after every state mutation without
    /// special-casing the locked path.
    pub fn drain(&mut self) -> Vec<Notification> {
        if self.is_locked() {
            return Vec::new();
        }
        self.pending.drain(..).collect()
    }

    pub fn subscribe(&mut self, id: SubscriberId) {
        if !self.subscribers.contains(&id) {
            self.subscribers.push(id);
        }
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.retain(|s| *s != id);
    }

    pub fn subscribers(&self) -> &[SubscriberId] {
        &self.subscribers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_push_does_not_drain() {
        let mut q = NotificationQueue::new();
        q.lock();
        q.push(Notification::EventsUpToDate);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn unlock_releases_fifo_order() {
        let mut q = NotificationQueue::new();
        q.lock();
        q.push(Notification::EventsUpToDate);
        q.push(Notification::TaskSwitch(CurrentTask::WorkOnline, None));
        q.unlock();
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], Notification::EventsUpToDate));
        assert!(matches!(drained[1], Notification::TaskSwitch(CurrentTask::WorkOnline, None)));
    }

    #[test]
    fn nested_locks_require_matching_unlocks() {
        let mut q = NotificationQueue::new();
        q.lock();
        q.lock();
        q.push(Notification::EventsUpToDate);
        q.unlock();
        assert!(q.drain().is_empty(), "still locked once");
        q.unlock();
        assert_eq!(q.drain().len(), 1);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut q = NotificationQueue::new();
        q.subscribe(1);
        q.subscribe(1);
        assert_eq!(q.subscribers().len(), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_id() {
        let mut q = NotificationQueue::new();
        q.subscribe(1);
        q.subscribe(2);
        q.unsubscribe(1);
        assert_eq!(q.subscribers(), &[2]);
    }
}
