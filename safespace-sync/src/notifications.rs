//! Notification bus for user-visible outcomes.
//!
//! Every service receives the bus at construction time. Notifications are
//! kept in FIFO order, expire after their TTL, and are fanned out to
//! observers through a broadcast channel.

use crate::config::NotificationConfig;
use crate::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Follow-up the UI may offer next to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Retry,
    Reload,
    SignIn,
    Dismiss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(Uuid);

impl NotificationId {
    fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub severity: Severity,
    pub message: String,
    pub action: Option<NotificationAction>,
    /// `None` until published: the bus then applies its per-severity default.
    /// `Some(Duration::ZERO)` keeps the notification until dismissed.
    pub ttl: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: NotificationId::generate(),
            severity,
            message: message.into(),
            action: None,
            ttl: None,
            created_at: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Severity::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn sticky(self) -> Self {
        self.with_ttl(Duration::ZERO)
    }

    pub fn is_sticky(&self) -> bool {
        self.ttl == Some(Duration::ZERO)
    }
}

struct QueuedNotification {
    notification: Notification,
    expires_at: Option<Instant>,
}

struct BusInner {
    queue: Mutex<VecDeque<QueuedNotification>>,
    sender: broadcast::Sender<Notification>,
    info_ttl: Duration,
    error_ttl: Duration,
}

/// FIFO queue of transient notifications.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new(config: &NotificationConfig) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                queue: Mutex::new(VecDeque::new()),
                sender,
                info_ttl: Duration::from_millis(config.info_ttl_ms),
                error_ttl: Duration::from_millis(config.error_ttl_ms),
            }),
        }
    }

    fn default_ttl(&self, severity: Severity) -> Duration {
        match severity {
            Severity::Error => self.inner.error_ttl,
            Severity::Info | Severity::Success | Severity::Warning => self.inner.info_ttl,
        }
    }

    /// Append a notification to the queue and return its id.
    pub fn publish(&self, mut notification: Notification) -> NotificationId {
        let ttl = notification
            .ttl
            .unwrap_or_else(|| self.default_ttl(notification.severity));
        notification.ttl = Some(ttl);
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        let id = notification.id;

        debug!(
            notification_id = %id,
            severity = notification.severity.as_str(),
            message = %notification.message,
            "Publishing notification"
        );

        {
            let mut queue = lock(&self.inner.queue);
            prune(&mut queue, Instant::now());
            queue.push_back(QueuedNotification {
                notification: notification.clone(),
                expires_at,
            });
        }
        // No receivers is fine; the queue is the source of truth.
        let _ = self.inner.sender.send(notification);
        id
    }

    pub fn info(&self, message: impl Into<String>) -> NotificationId {
        self.publish(Notification::info(message))
    }

    pub fn success(&self, message: impl Into<String>) -> NotificationId {
        self.publish(Notification::success(message))
    }

    pub fn warning(&self, message: impl Into<String>) -> NotificationId {
        self.publish(Notification::warning(message))
    }

    pub fn error(&self, message: impl Into<String>) -> NotificationId {
        self.publish(Notification::error(message))
    }

    /// Remove one notification. Returns false if it had already expired or gone.
    pub fn dismiss(&self, id: NotificationId) -> bool {
        let mut queue = lock(&self.inner.queue);
        let before = queue.len();
        queue.retain(|queued| queued.notification.id != id);
        queue.len() != before
    }

    pub fn clear(&self) {
        lock(&self.inner.queue).clear();
    }

    /// Unexpired notifications, oldest first.
    pub fn active(&self) -> Vec<Notification> {
        let mut queue = lock(&self.inner.queue);
        prune(&mut queue, Instant::now());
        queue
            .iter()
            .map(|queued| queued.notification.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observe every publish from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.sender.subscribe()
    }
}

fn prune(queue: &mut VecDeque<QueuedNotification>, now: Instant) {
    queue.retain(|queued| queued.expires_at.map_or(true, |at| at > now));
}
