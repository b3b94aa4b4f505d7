use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use conclave_types::{AgentId, Error, Message, MessageType, Recipient, Result};

use crate::mailbox::{Mailbox, MailboxConfig};

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_FACTOR: u64 = 2;
const BACKOFF_CAP_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout_ms: u64,
    pub retries: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 0,
        }
    }
}

/// Handle for a topic subscription. Dropping it (or calling `unsubscribe` on
/// the bus) stops delivery.
pub struct TopicSubscription {
    pub topic: String,
    pub subscriber_id: String,
    pub receiver: mpsc::UnboundedReceiver<Message>,
}

/// Routes publishers, mailboxes, and request/response waiters.
///
/// Responses whose `correlation_id` matches a registered waiter are routed to
/// the waiter instead of a mailbox; a late response after the waiter is gone
/// is silently discarded.
pub struct MessageBus {
    mailboxes: RwLock<HashMap<AgentId, Arc<Mailbox>>>,
    topics: RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<Message>>>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_agent(
        &self,
        agent_id: impl Into<AgentId>,
        config: MailboxConfig,
    ) -> Arc<Mailbox> {
        let agent_id = agent_id.into();
        let mailbox = Arc::new(Mailbox::new(agent_id.clone(), config));
        self.mailboxes
            .write()
            .await
            .insert(agent_id, mailbox.clone());
        mailbox
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        self.mailboxes.write().await.remove(agent_id).is_some()
    }

    pub async fn mailbox(&self, agent_id: &str) -> Option<Arc<Mailbox>> {
        self.mailboxes.read().await.get(agent_id).cloned()
    }

    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        subscriber_id: impl Into<String>,
    ) -> TopicSubscription {
        let topic = topic.into();
        let subscriber_id = subscriber_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .await
            .entry(topic.clone())
            .or_default()
            .insert(subscriber_id.clone(), tx);
        TopicSubscription {
            topic,
            subscriber_id,
            receiver: rx,
        }
    }

    pub async fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> bool {
        let mut topics = self.topics.write().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(subscriber_id).is_some();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Deliver to every live subscriber of the topic. Returns the delivery
    /// count; closed subscribers are pruned.
    pub async fn publish(&self, topic: &str, message: Message) -> usize {
        let mut topics = self.topics.write().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };
        let mut delivered = 0;
        subscribers.retain(|_, tx| match tx.send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => false,
        });
        delivered
    }

    /// Enqueue into the recipient's mailbox. Returns the message id.
    pub async fn send_direct(&self, message: Message) -> Result<String> {
        if message.message_type == MessageType::Response {
            let Some(correlation_id) = message.correlation_id.clone() else {
                return Err(Error::InvalidInput(
                    "a Response must carry the correlation id of its request".to_string(),
                ));
            };
            if self.try_deliver_to_waiter(&correlation_id, &message).await {
                return Ok(message.id);
            }
            // The waiter timed out or was cancelled; the response is stale.
            tracing::debug!(correlation_id = %correlation_id, "discarding late response");
            return Ok(message.id);
        }

        let targets: Vec<AgentId> = match &message.to {
            Recipient::Agent(agent) => vec![agent.clone()],
            Recipient::Agents(agents) => agents.clone(),
            Recipient::Broadcast => {
                return Err(Error::InvalidInput(
                    "send_direct requires explicit recipients; use broadcast".to_string(),
                ))
            }
        };

        let mailboxes = self.mailboxes.read().await;
        for target in &targets {
            let mailbox = mailboxes
                .get(target)
                .ok_or_else(|| Error::NotFound(format!("no route to agent `{target}`")))?;
            if !mailbox.enqueue(message.clone()) {
                return Err(Error::CapacityExceeded(format!(
                    "mailbox for `{target}` is full"
                )));
            }
        }
        Ok(message.id)
    }

    /// Deliver to every registered mailbox except the sender's.
    pub async fn broadcast(&self, message: Message) -> usize {
        let mailboxes = self.mailboxes.read().await;
        let mut delivered = 0;
        for (agent_id, mailbox) in mailboxes.iter() {
            if *agent_id == message.from {
                continue;
            }
            if mailbox.enqueue(message.clone()) {
                delivered += 1;
            } else {
                tracing::warn!(agent = %agent_id, "broadcast dropped: mailbox full");
            }
        }
        delivered
    }

    /// Send a request and await its correlated response.
    ///
    /// Retries on timeout with exponential backoff (200 ms, x2, capped at
    /// 5 s). Cancelling via `cancel` deregisters the waiter; a late response
    /// is then discarded by `send_direct`.
    pub async fn request(
        &self,
        message: Message,
        options: RequestOptions,
        cancel: CancellationToken,
    ) -> Result<Message> {
        if message.message_type != MessageType::Request {
            return Err(Error::InvalidInput(
                "request() requires a Request message".to_string(),
            ));
        }
        let timeout = Duration::from_millis(options.timeout_ms);
        let mut attempt: u32 = 0;
        loop {
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().await.insert(message.id.clone(), tx);

            if let Err(err) = self.send_direct(message.clone()).await {
                self.waiters.lock().await.remove(&message.id);
                return Err(err);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.waiters.lock().await.remove(&message.id);
                    return Err(Error::Timeout("request cancelled".to_string()));
                }
                result = tokio::time::timeout(timeout, rx) => result,
            };

            match outcome {
                Ok(Ok(response)) => return Ok(response),
                // Waiter dropped without a send; treat as a timeout round.
                Ok(Err(_)) | Err(_) => {
                    self.waiters.lock().await.remove(&message.id);
                }
            }

            if attempt >= options.retries {
                return Err(Error::Timeout(format!(
                    "no response to request `{}` after {} attempt(s)",
                    message.id,
                    attempt + 1
                )));
            }
            let backoff = (BACKOFF_INITIAL_MS * BACKOFF_FACTOR.pow(attempt)).min(BACKOFF_CAP_MS);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            attempt += 1;
        }
    }

    async fn try_deliver_to_waiter(&self, correlation_id: &str, message: &Message) -> bool {
        let waiter = self.waiters.lock().await.remove(correlation_id);
        match waiter {
            // A closed receiver means the caller cancelled; the response is
            // dropped either way.
            Some(tx) => {
                let _ = tx.send(message.clone());
                true
            }
            None => false,
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically redelivers unacknowledged requests across all mailboxes.
pub fn spawn_redelivery_sweeper(
    bus: Arc<MessageBus>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let mailboxes: Vec<Arc<Mailbox>> =
                bus.mailboxes.read().await.values().cloned().collect();
            for mailbox in mailboxes {
                let redelivered = mailbox.redeliver_due();
                if redelivered > 0 {
                    tracing::debug!(
                        agent = mailbox.agent_id(),
                        redelivered,
                        "redelivered unacknowledged requests"
                    );
                }
            }
        }
    })
}
