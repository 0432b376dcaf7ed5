//! In-memory broker for tests and local development.
//!
//! Implements the [`Connection`]/[`Channel`] contract inside the process with
//! the AMQP semantics the messaging patterns rely on:
//! - default exchange routes by queue name, fanout exchanges copy to every
//!   bound queue
//! - exclusive queues belong to the declaring connection, auto-delete queues
//!   vanish with their last consumer
//! - per-consumer prefetch with manual ack, round-robin across consumers
//! - reject-publish overflow (nack), mandatory returns, per-message TTL
//! - deleting a queue or closing a connection ends the affected consumer
//!   streams, which is how a broker-initiated cancel looks to a client

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{
    Channel, Confirmation, Connection, Consumer, DeclaredQueue, Delivery, MessageProperties,
    QueueOptions, DEFAULT_EXCHANGE,
};
use crate::error::{Error, Result};


/// Prefix for server-generated queue names.
const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    expires_at: Option<Instant>,
    redelivered: bool,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    auto_ack: bool,
    prefetch: u16,
    unacked: usize,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
    }
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    had_consumer: bool,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

/// Broker-side state of an open channel. Removed once the channel closes.
struct ChannelState {
    connection_id: u64,
    /// Shared with the [`MemoryChannel`] handle so the reason outlives the entry.
    close_reason: Arc<Mutex<Option<String>>>,
    confirm: bool,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
    consumer_tags: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, Vec<String>>,
    /// Open connections.
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&self, channel_id: u64) -> Result<&ChannelState> {
        self.channels
            .get(&channel_id)
            .ok_or_else(|| Error::AlreadyClosed("channel closed".to_string()))
    }

    fn check_exclusive(&self, queue: &QueueState, name: &str, channel_id: u64) -> Result<()> {
        let connection_id = self.channels.get(&channel_id).map(|c| c.connection_id);
        match queue.owner {
            Some(owner) if Some(owner) != connection_id => Err(Error::Broker(format!(
                "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                name
            ))),
            _ => Ok(()),
        }
    }

    /// Hand queued messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue_name: &str) {
        let now = Instant::now();
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        queue.messages.retain(|m| !m.is_expired(now));

        loop {
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }
            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let consumer = &mut queue.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            };
            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                // Receiver went away without a cancel.
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            }

            queue.cursor = (index + 1) % count;
            if !consumer.auto_ack {
                consumer.unacked += 1;
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }
        }
    }

    /// Drop a consumer slot, ending its stream. Applies auto-delete.
    fn remove_consumer(&mut self, queue_name: &str, consumer_tag: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|c| c.tag != consumer_tag);
        if queue.cursor >= queue.consumers.len() {
            queue.cursor = 0;
        }
        if queue.options.auto_delete && queue.had_consumer && queue.consumers.is_empty() {
            debug!(queue = %queue_name, "Auto-deleting queue after last consumer left");
            self.delete_queue(queue_name);
        }
    }

    fn delete_queue(&mut self, queue_name: &str) -> u32 {
        let Some(queue) = self.queues.remove(queue_name) else {
            return 0;
        };
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|q| q != queue_name);
        }
        for consumer in &queue.consumers {
            if let Some(channel) = self.channels.get_mut(&consumer.channel_id) {
                channel.consumer_tags.retain(|t| t != &consumer.tag);
            }
        }
        // Dropping the slots drops their senders, which ends each stream.
        u32::try_from(queue.messages.len()).unwrap_or(u32::MAX)
    }

    fn queue_of_consumer(&self, consumer_tag: &str) -> Option<String> {
        self.queues
            .iter()
            .find(|(_, q)| q.consumers.iter().any(|c| c.tag == consumer_tag))
            .map(|(name, _)| name.clone())
    }

    fn close_channel(&mut self, channel_id: u64, reason: Option<String>) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };
        if reason.is_some() {
            *channel
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = reason;
        }
        let ChannelState {
            consumer_tags: tags,
            unacked,
            ..
        } = channel;

        let mut touched = Vec::new();
        for (_, entry) in unacked {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.push(entry.queue);
            }
        }
        for tag in tags {
            if let Some(queue) = self.queue_of_consumer(&tag) {
                self.remove_consumer(&queue, &tag);
                touched.push(queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection_id: u64, reason: &str) {
        if !self.connections.remove(&connection_id) {
            return;
        }
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            self.close_channel(channel_id, Some(reason.to_string()));
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.connections.insert(id);
        Arc::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    /// Ready (undelivered) messages in a queue.
    pub fn message_count(&self, name: &str) -> Option<usize> {
        lock(&self.state).queues.get(name).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.len())
    }

    /// Channels currently open across every connection.
    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Delete a queue from the broker side, cancelling its consumers.
    pub fn delete_queue(&self, name: &str) -> u32 {
        lock(&self.state).delete_queue(name)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("exchanges", &state.exchanges.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryConnection {
    /// Simulate the network dropping: every channel closes with `reason`.
    pub fn sever(&self, reason: &str) {
        lock(&self.state).close_connection(self.id, reason);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        lock(&self.state).connections.contains(&self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let mut state = lock(&self.state);
        if !state.connections.contains(&self.id) {
            return Err(Error::AlreadyClosed("connection closed".to_string()));
        }
        let id = state.next_id();
        let close_reason = Arc::new(Mutex::new(None));
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                close_reason: Arc::clone(&close_reason),
                confirm: false,
                prefetch: 0,
                next_delivery_tag: 0,
                unacked: HashMap::new(),
                consumer_tags: Vec::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
            close_reason,
        }))
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).close_connection(self.id, "connection closed by client");
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    close_reason: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        lock(&self.state).channels.contains_key(&self.id)
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<DeclaredQueue> {
        let mut state = lock(&self.state);
        let connection_id = state.open_channel(self.id)?.connection_id;

        let name = if name.is_empty() {
            format!("{}{}", GENERATED_QUEUE_PREFIX, state.next_id())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            state.check_exclusive(existing, &name, self.id)?;
            if existing.options.durable != options.durable
                || existing.options.max_length != options.max_length
            {
                return Err(Error::Broker(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    name
                )));
            }
            return Ok(DeclaredQueue {
                message_count: u32::try_from(existing.messages.len()).unwrap_or(u32::MAX),
                consumer_count: u32::try_from(existing.consumers.len()).unwrap_or(u32::MAX),
                name,
            });
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: options.exclusive.then_some(connection_id),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
                had_consumer: false,
            },
        );
        Ok(DeclaredQueue {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn queue_declare_passive(&self, name: &str) -> Result<DeclaredQueue> {
        let state = lock(&self.state);
        state.open_channel(self.id)?;
        let queue = state
            .queues
            .get(name)
            .ok_or_else(|| Error::Broker(format!("NOT_FOUND - no queue '{}'", name)))?;
        Ok(DeclaredQueue {
            name: name.to_string(),
            message_count: u32::try_from(queue.messages.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(queue.consumers.len()).unwrap_or(u32::MAX),
        })
    }

    async fn queue_delete(&self, name: &str, if_unused: bool) -> Result<u32> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        if let Some(queue) = state.queues.get(name) {
            state.check_exclusive(queue, name, self.id)?;
            if if_unused && !queue.consumers.is_empty() {
                return Err(Error::Broker(format!(
                    "PRECONDITION_FAILED - queue '{}' in use",
                    name
                )));
            }
        }
        Ok(state.delete_queue(name))
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, _routing_key: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(Error::Broker(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::Broker(format!("NOT_FOUND - no exchange '{}'", exchange)))?;
        if !bindings.iter().any(|q| q == queue) {
            bindings.push(queue.to_string());
        }
        Ok(())
    }

    async fn exchange_declare_fanout(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn exchange_delete(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        state.exchanges.remove(name);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirm = true;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
        mandatory: bool,
    ) -> Result<Confirmation> {
        let mut state = lock(&self.state);
        let confirm = state.open_channel(self.id)?.confirm;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            state
                .exchanges
                .get(exchange)
                .cloned()
                .ok_or_else(|| Error::Broker(format!("NOT_FOUND - no exchange '{}'", exchange)))?
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable");
            return Ok(match (confirm, mandatory) {
                (false, _) => Confirmation::NotRequested,
                (true, true) => Confirmation::Returned {
                    reply_text: "NO_ROUTE".to_string(),
                },
                (true, false) => Confirmation::Ack,
            });
        }

        let expires_at = properties.expiration.map(|ttl| Instant::now() + ttl);
        let mut rejected = false;
        for target in &targets {
            let Some(queue) = state.queues.get_mut(target) else {
                continue;
            };
            if let Some(max) = queue.options.max_length {
                if queue.messages.len() >= max as usize {
                    rejected = true;
                    continue;
                }
            }
            queue.messages.push_back(StoredMessage {
                body: body.to_vec(),
                properties: properties.clone(),
                expires_at,
                redelivered: false,
            });
        }
        for target in &targets {
            state.dispatch(target);
        }

        Ok(match (confirm, rejected) {
            (false, _) => Confirmation::NotRequested,
            (true, true) => Confirmation::Nack,
            (true, false) => Confirmation::Ack,
        })
    }

    async fn consume(&self, queue_name: &str, auto_ack: bool) -> Result<Consumer> {
        let mut state = lock(&self.state);
        let prefetch = state.open_channel(self.id)?.prefetch;
        let queue = state
            .queues
            .get(queue_name)
            .ok_or_else(|| Error::Broker(format!("NOT_FOUND - no queue '{}'", queue_name)))?;
        state.check_exclusive(queue, queue_name, self.id)?;

        let tag = format!("ctag-{}", state.next_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(queue) = state.queues.get_mut(queue_name) {
            queue.had_consumer = true;
            queue.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                channel_id: self.id,
                auto_ack,
                prefetch,
                unacked: 0,
                sender,
            });
        }
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.consumer_tags.push(tag.clone());
        }
        state.dispatch(queue_name);

        Ok(Consumer {
            tag,
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }

    async fn basic_get(&self, queue_name: &str) -> Result<Option<Delivery>> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        let now = Instant::now();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::Broker(format!("NOT_FOUND - no queue '{}'", queue_name)))?;
        queue.messages.retain(|m| !m.is_expired(now));
        let Some(message) = queue.messages.pop_front() else {
            return Ok(None);
        };
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| Error::AlreadyClosed("channel closed".to_string()))?;
        channel.next_delivery_tag += 1;
        Ok(Some(Delivery {
            delivery_tag: channel.next_delivery_tag,
            body: message.body,
            properties: message.properties,
            redelivered: message.redelivered,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        let entry = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                Error::Broker(format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))
            })?;
        if let Some(queue) = state.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == entry.consumer_tag)
            {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
        }
        state.dispatch(&entry.queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.consumer_tags.retain(|t| t != consumer_tag);
        }
        if let Some(queue) = state.queue_of_consumer(consumer_tag) {
            state.remove_consumer(&queue, consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.open_channel(self.id)?;
        state.close_channel(self.id, None);
        Ok(())
    }
}
