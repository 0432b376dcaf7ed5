//! RabbitMQ transport via lapin.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, ConnectionProperties, ExchangeKind,
};
use tracing::{info, warn};

use super::{
    Channel, Confirmation, Connection, Consumer, DeclaredQueue, Delivery, MessageProperties,
    QueueOptions,
};
use crate::config::AmqpConfig;
use crate::error::{Error, Result};
use crate::utils::retry::connection_backoff;

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

fn map_lapin_error(e: lapin::Error) -> Error {
    match e {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            Error::AlreadyClosed(e.to_string())
        }
        _ => Error::Broker(e.to_string()),
    }
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(expiration) = properties.expiration {
        amqp = amqp.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }
    amqp
}

fn from_amqp_properties(amqp: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: amqp.correlation_id().as_ref().map(|s| s.to_string()),
        reply_to: amqp.reply_to().as_ref().map(|s| s.to_string()),
        expiration: amqp
            .expiration()
            .as_ref()
            .and_then(|s| s.as_str().parse::<u64>().ok())
            .map(Duration::from_millis),
        content_type: amqp.content_type().as_ref().map(|s| s.to_string()),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        properties: from_amqp_properties(&delivery.properties),
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(max_length) = options.max_length {
        arguments.insert(
            "x-max-length".into(),
            AMQPValue::LongInt(i32::try_from(max_length).unwrap_or(i32::MAX)),
        );
        arguments.insert(
            "x-overflow".into(),
            AMQPValue::LongString("reject-publish".into()),
        );
    }
    arguments
}

/// An open RabbitMQ connection.
#[derive(Clone)]
pub struct AmqpConnection {
    inner: Arc<lapin::Connection>,
}

impl AmqpConnection {
    /// Connect with exponential backoff.
    ///
    /// Retries up to `config.connect_retries` times before giving up.
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let url = config.url.clone();
        let connection = (|| {
            let url = url.clone();
            async move { lapin::Connection::connect(&url, ConnectionProperties::default()).await }
        })
        .retry(connection_backoff().with_max_times(config.connect_retries))
        .notify(|err: &lapin::Error, dur: Duration| {
            warn!(url = %config.url, error = %err, delay = ?dur, "AMQP connection failed, retrying");
        })
        .await
        .map_err(map_lapin_error)?;

        info!(url = %config.url, "Connected to AMQP");
        Ok(Self::from(connection))
    }

    /// The underlying lapin connection.
    pub fn inner(&self) -> &lapin::Connection {
        &self.inner
    }
}

impl From<lapin::Connection> for AmqpConnection {
    fn from(connection: lapin::Connection) -> Self {
        Self {
            inner: Arc::new(connection),
        }
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(map_lapin_error)?;

        let close_reason = Arc::new(Mutex::new(None));
        let reason = Arc::clone(&close_reason);
        channel.on_error(move |err| {
            *reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        });

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            close_reason,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_lapin_error)
    }
}

/// A lapin channel behind the [`Channel`] contract.
pub struct AmqpChannel {
    inner: lapin::Channel,
    close_reason: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<DeclaredQueue> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                queue_arguments(&options),
            )
            .await
            .map_err(map_lapin_error)?;
        Ok(DeclaredQueue {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_declare_passive(&self, name: &str) -> Result<DeclaredQueue> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;
        Ok(DeclaredQueue {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_delete(&self, name: &str, if_unused: bool) -> Result<u32> {
        self.inner
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_unused,
                    ..Default::default()
                },
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn exchange_declare_fanout(&self, name: &str) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn exchange_delete(&self, name: &str) -> Result<()> {
        self.inner
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn confirm_select(&self) -> Result<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
        mandatory: bool,
    ) -> Result<Confirmation> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                body,
                to_amqp_properties(&properties),
            )
            .await
            .map_err(map_lapin_error)?
            .await
            .map_err(map_lapin_error)?;

        Ok(match confirm {
            publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
            publisher_confirm::Confirmation::Ack(Some(returned)) => Confirmation::Returned {
                reply_text: returned.reply_text.to_string(),
            },
            publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
            publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
        })
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Subscription {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        Ok(Consumer {
            tag: consumer.tag().to_string(),
            deliveries: consumer
                .map(|delivery| delivery.map(from_lapin_delivery).map_err(map_lapin_error))
                .boxed(),
        })
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await
            .map_err(map_lapin_error)?;
        Ok(message.map(|m| from_lapin_delivery(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_lapin_error)
    }
}
