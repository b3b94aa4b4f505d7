use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;

use conclave_types::{AgentId, Message, MessagePriority, MessageType};

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub max_size: usize,
    /// When set, dequeued requests that are not acknowledged within
    /// `ack_timeout_ms` are re-enqueued at their original priority.
    pub redelivery: bool,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            redelivery: false,
            ack_timeout_ms: 30_000,
            max_retries: 3,
        }
    }
}

struct PendingAck {
    message: Message,
    deadline: DateTime<Utc>,
}

struct Inner {
    // One FIFO per priority, indexed by MessagePriority::index().
    queues: [VecDeque<Message>; 4],
    size: usize,
    // Dequeued-but-unacknowledged requests. An id is present here or in a
    // queue, never both.
    pending_acks: HashMap<String, PendingAck>,
    delivery_attempts: HashMap<String, u32>,
}

/// Bounded per-agent priority queue. The bus enqueues, the owning agent
/// dequeues; all state sits behind a single mutex.
pub struct Mailbox {
    agent_id: AgentId,
    config: MailboxConfig,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Mailbox {
    pub fn new(agent_id: impl Into<AgentId>, config: MailboxConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            inner: Mutex::new(Inner {
                queues: [
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ],
                size: 0,
                pending_acks: HashMap::new(),
                delivery_attempts: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mailbox poisoned").size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns false when the mailbox is at capacity.
    pub fn enqueue(&self, message: Message) -> bool {
        {
            let mut inner = self.inner.lock().expect("mailbox poisoned");
            if inner.size >= self.config.max_size {
                return false;
            }
            inner.queues[message.priority.index()].push_back(message);
            inner.size += 1;
        }
        self.notify.notify_one();
        true
    }

    pub fn dequeue(&self) -> Option<Message> {
        self.dequeue_at(Utc::now())
    }

    /// Pop the highest-priority message, silently discarding expired entries.
    pub fn dequeue_at(&self, now: DateTime<Utc>) -> Option<Message> {
        let mut inner = self.inner.lock().expect("mailbox poisoned");
        for priority in MessagePriority::ALL_DESCENDING {
            while let Some(message) = inner.queues[priority.index()].pop_front() {
                inner.size -= 1;
                if message.is_expired_at(now) {
                    tracing::debug!(
                        agent = %self.agent_id,
                        message_id = %message.id,
                        "dropping expired message on dequeue"
                    );
                    continue;
                }
                if self.config.redelivery && message.message_type == MessageType::Request {
                    let deadline = now + Duration::milliseconds(self.config.ack_timeout_ms as i64);
                    inner.pending_acks.insert(
                        message.id.clone(),
                        PendingAck {
                            message: message.clone(),
                            deadline,
                        },
                    );
                }
                return Some(message);
            }
        }
        None
    }

    pub fn dequeue_batch(&self, n: usize) -> Vec<Message> {
        let now = Utc::now();
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n {
            match self.dequeue_at(now) {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        batch
    }

    /// Non-destructive view of the next `n` deliverable messages.
    pub fn peek_batch(&self, n: usize) -> Vec<Message> {
        let now = Utc::now();
        let inner = self.inner.lock().expect("mailbox poisoned");
        let mut batch = Vec::with_capacity(n);
        for priority in MessagePriority::ALL_DESCENDING {
            for message in &inner.queues[priority.index()] {
                if batch.len() == n {
                    return batch;
                }
                if !message.is_expired_at(now) {
                    batch.push(message.clone());
                }
            }
        }
        batch
    }

    /// Cancels any pending redelivery for the message.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("mailbox poisoned");
        inner.delivery_attempts.remove(message_id);
        inner.pending_acks.remove(message_id).is_some()
    }

    /// Re-enqueue unacknowledged requests whose ack deadline has passed.
    /// Returns how many messages were redelivered.
    pub fn redeliver_due_at(&self, now: DateTime<Utc>) -> usize {
        let mut redelivered = 0;
        let mut inner = self.inner.lock().expect("mailbox poisoned");
        let due_ids: Vec<String> = inner
            .pending_acks
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due_ids {
            let Some(pending) = inner.pending_acks.remove(&id) else {
                continue;
            };
            let attempts = inner.delivery_attempts.get(&id).copied().unwrap_or(0) + 1;
            if attempts > self.config.max_retries {
                tracing::warn!(
                    agent = %self.agent_id,
                    message_id = %id,
                    attempts,
                    "dropping unacknowledged request after max retries"
                );
                inner.delivery_attempts.remove(&id);
                continue;
            }
            inner.delivery_attempts.insert(id.clone(), attempts);
            if inner.size >= self.config.max_size {
                continue;
            }
            inner.queues[pending.message.priority.index()].push_back(pending.message);
            inner.size += 1;
            redelivered += 1;
        }
        drop(inner);
        if redelivered > 0 {
            self.notify.notify_one();
        }
        redelivered
    }

    pub fn redeliver_due(&self) -> usize {
        self.redeliver_due_at(Utc::now())
    }

    /// Await the next deliverable message.
    pub async fn recv(&self) -> Message {
        loop {
            if let Some(message) = self.dequeue() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::{MessageType, Recipient};
    use serde_json::json;

    fn notification(priority: MessagePriority, tag: u64) -> Message {
        Message::new(
            "sender",
            Recipient::Agent("receiver".to_string()),
            MessageType::Notification,
            json!({ "tag": tag }),
        )
        .with_priority(priority)
    }

    #[test]
    fn higher_priority_overtakes_lower() {
        let mailbox = Mailbox::new("a1", MailboxConfig::default());
        assert!(mailbox.enqueue(notification(MessagePriority::Low, 1)));
        assert!(mailbox.enqueue(notification(MessagePriority::Critical, 2)));
        assert!(mailbox.enqueue(notification(MessagePriority::Normal, 3)));

        let order: Vec<u64> = mailbox
            .dequeue_batch(3)
            .into_iter()
            .map(|m| m.payload["tag"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn fifo_within_one_priority() {
        let mailbox = Mailbox::new("a1", MailboxConfig::default());
        for tag in 0..5 {
            mailbox.enqueue(notification(MessagePriority::Normal, tag));
        }
        let order: Vec<u64> = mailbox
            .dequeue_batch(5)
            .into_iter()
            .map(|m| m.payload["tag"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn enqueue_rejects_when_full() {
        let mailbox = Mailbox::new(
            "a1",
            MailboxConfig {
                max_size: 2,
                ..MailboxConfig::default()
            },
        );
        assert!(mailbox.enqueue(notification(MessagePriority::Normal, 1)));
        assert!(mailbox.enqueue(notification(MessagePriority::Normal, 2)));
        assert!(!mailbox.enqueue(notification(MessagePriority::Critical, 3)));
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn expired_messages_are_skipped_on_dequeue() {
        let mailbox = Mailbox::new("a1", MailboxConfig::default());
        let expired = notification(MessagePriority::Normal, 1).with_ttl_ms(10);
        let fresh = notification(MessagePriority::Normal, 2);
        let later = expired.timestamp + Duration::milliseconds(50);
        mailbox.enqueue(expired);
        mailbox.enqueue(fresh);

        let got = mailbox.dequeue_at(later).expect("fresh message");
        assert_eq!(got.payload["tag"], 2);
        assert!(mailbox.dequeue_at(later).is_none());
    }

    #[test]
    fn unacked_request_is_redelivered_until_max_retries() {
        let mailbox = Mailbox::new(
            "a1",
            MailboxConfig {
                redelivery: true,
                ack_timeout_ms: 100,
                max_retries: 2,
                ..MailboxConfig::default()
            },
        );
        let request = Message::new(
            "sender",
            Recipient::Agent("a1".to_string()),
            MessageType::Request,
            json!({}),
        );
        let t0 = Utc::now();
        mailbox.enqueue(request.clone());

        assert!(mailbox.dequeue_at(t0).is_some());
        let t1 = t0 + Duration::milliseconds(150);
        assert_eq!(mailbox.redeliver_due_at(t1), 1);
        assert!(mailbox.dequeue_at(t1).is_some());

        let t2 = t1 + Duration::milliseconds(150);
        assert_eq!(mailbox.redeliver_due_at(t2), 1);
        assert!(mailbox.dequeue_at(t2).is_some());

        // Third expiry exceeds max_retries; the request is dropped.
        let t3 = t2 + Duration::milliseconds(150);
        assert_eq!(mailbox.redeliver_due_at(t3), 0);
        assert!(mailbox.dequeue_at(t3).is_none());
    }

    #[test]
    fn acknowledge_cancels_redelivery() {
        let mailbox = Mailbox::new(
            "a1",
            MailboxConfig {
                redelivery: true,
                ack_timeout_ms: 100,
                max_retries: 2,
                ..MailboxConfig::default()
            },
        );
        let request = Message::new(
            "sender",
            Recipient::Agent("a1".to_string()),
            MessageType::Request,
            json!({}),
        );
        let t0 = Utc::now();
        mailbox.enqueue(request.clone());
        let got = mailbox.dequeue_at(t0).expect("request");
        assert!(mailbox.acknowledge(&got.id));
        assert_eq!(
            mailbox.redeliver_due_at(t0 + Duration::milliseconds(500)),
            0
        );
    }

    #[tokio::test]
    async fn recv_wakes_on_enqueue() {
        let mailbox = std::sync::Arc::new(Mailbox::new("a1", MailboxConfig::default()));
        let waiter = mailbox.clone();
        let handle = tokio::spawn(async move { waiter.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mailbox.enqueue(notification(MessagePriority::Normal, 7));
        let got = handle.await.unwrap();
        assert_eq!(got.payload["tag"], 7);
    }
}
