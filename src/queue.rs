use amqprs::{
    callbacks::{ChannelCallback, DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments, BasicQosArguments, Channel,
        ConfirmSelectArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    consumer::AsyncConsumer,
    Ack, BasicProperties, Cancel, CloseChannel, Deliver, Nack, Return,
};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::config::RabbitConfig;
use crate::error::NotifyError;
use crate::models::BookingEvent;

type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

const PERSISTENT: u8 = 2;

/// Announces committed booking changes. Implementations do not retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &BookingEvent) -> Result<(), NotifyError>;
}

/// Downstream processing of a booking event (mail, SMS, ...).
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: BookingEvent) -> HandlerResult;
}

/// What the consumer tells the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Processing failed; the broker should redeliver.
    Requeue,
    /// The payload can never be processed.
    Reject,
}

pub async fn process<H: EventHandler>(handler: &H, content: &[u8]) -> Disposition {
    let event = match serde_json::from_slice::<BookingEvent>(content) {
        Ok(event) => event,
        Err(e) => {
            error!("❌ Error deserializing booking event: {:?}", e);
            return Disposition::Reject;
        }
    };

    match handler.handle(event).await {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            error!("❌ Failed to process booking event: {:?}", e);
            Disposition::Requeue
        }
    }
}

struct NotificationConsumer<H> {
    handler: H,
}

#[async_trait]
impl<H: EventHandler> AsyncConsumer for NotificationConsumer<H> {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let tag = deliver.delivery_tag();
        info!("🔄 Processing booking event delivery {}", tag);
        let result = match process(&self.handler, &content).await {
            Disposition::Ack => channel.basic_ack(BasicAckArguments::new(tag, false)).await,
            Disposition::Requeue => channel.basic_nack(BasicNackArguments::new(tag, false, true)).await,
            Disposition::Reject => channel.basic_nack(BasicNackArguments::new(tag, false, false)).await,
        };

        if let Err(e) = result {
            error!("❌ Error settling delivery {}: {:?}", tag, e);
        }
    }
}

/// Publishes awaiting a broker confirm, keyed by delivery tag.
#[derive(Clone, Default)]
struct Confirms {
    pending: Arc<StdMutex<BTreeMap<u64, oneshot::Sender<bool>>>>,
}

impl Confirms {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, tag: u64) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(tag, tx);
        rx
    }

    fn forget(&self, tag: u64) {
        self.lock().remove(&tag);
    }

    /// Resolve `tag`, or every tag up to and including it when `multiple`.
    fn settle(&self, tag: u64, multiple: bool, acked: bool) {
        let settled = {
            let mut pending = self.lock();
            if multiple {
                let rest = pending.split_off(&tag.saturating_add(1));
                std::mem::replace(&mut *pending, rest)
            } else {
                pending.remove(&tag).map(|tx| BTreeMap::from([(tag, tx)])).unwrap_or_default()
            }
        };
        for (_, tx) in settled {
            let _ = tx.send(acked);
        }
    }

    /// Drop every waiter; their publishes end up unconfirmed.
    fn abandon(&self) {
        self.lock().clear();
    }
}

/// Forwards broker acks and nacks on the publishing channel to [`Confirms`].
struct ConfirmCallback {
    confirms: Confirms,
}

#[async_trait]
impl ChannelCallback for ConfirmCallback {
    async fn close(&mut self, channel: &Channel, close: CloseChannel) -> Result<(), amqprs::error::Error> {
        error!("❌ Broker closed notification channel {}: {}", channel, close);
        self.confirms.abandon();
        Ok(())
    }

    async fn cancel(&mut self, _channel: &Channel, _cancel: Cancel) -> Result<(), amqprs::error::Error> {
        Ok(())
    }

    async fn flow(&mut self, _channel: &Channel, _active: bool) -> Result<bool, amqprs::error::Error> {
        Ok(true)
    }

    async fn publish_ack(&mut self, _channel: &Channel, ack: Ack) {
        self.confirms.settle(ack.delivery_tag(), ack.mutiple(), true);
    }

    async fn publish_nack(&mut self, channel: &Channel, nack: Nack) {
        warn!("⚠️ Broker refused delivery {} on channel {}", nack.delivery_tag(), channel);
        self.confirms.settle(nack.delivery_tag(), nack.multiple(), false);
    }

    async fn publish_return(&mut self, channel: &Channel, ret: Return, _properties: BasicProperties, _content: Vec<u8>) {
        warn!("⚠️ Broker returned a message on channel {}: {}", channel, ret);
    }
}

/// A channel in confirm mode. Tags count from 1 per channel.
struct Publisher {
    channel: Channel,
    confirms: Confirms,
    next_tag: u64,
    broken: bool,
}

impl Publisher {
    async fn open(connection: &Connection, queue: &str) -> Result<Self, NotifyError> {
        let confirms = Confirms::default();
        let channel = open_channel(connection, queue, ConfirmCallback { confirms: confirms.clone() }).await?;
        channel
            .confirm_select(ConfirmSelectArguments::default())
            .await?;

        Ok(Self { channel, confirms, next_tag: 0, broken: false })
    }

    fn usable(&self) -> bool {
        !self.broken && self.channel.is_open()
    }
}

/// Wait for the broker's verdict on one publish.
async fn confirmed(verdict: oneshot::Receiver<bool>) -> Result<(), NotifyError> {
    match verdict.await {
        Ok(true) => Ok(()),
        Ok(false) => Err(NotifyError::Nacked),
        Err(_) => Err(NotifyError::Unconfirmed),
    }
}

/// RabbitMQ publisher over one shared connection and confirm-mode channel.
pub struct AmqpNotifier {
    connection: Connection,
    publisher: Mutex<Publisher>,
    queue: String,
}

impl AmqpNotifier {
    pub async fn connect(cfg: &RabbitConfig) -> Result<Self, NotifyError> {
        info!("Connecting to RabbitMQ at {}:{}", cfg.host, cfg.port);

        let connection = Connection::open(&OpenConnectionArguments::new(
            &cfg.host,
            cfg.port,
            &cfg.username,
            &cfg.password,
        ))
        .await?;

        connection
            .register_callback(DefaultConnectionCallback)
            .await?;

        let publisher = Publisher::open(&connection, &cfg.queue).await?;

        info!("Connected to RabbitMQ and declared queue {}", cfg.queue);

        Ok(Self {
            connection,
            publisher: Mutex::new(publisher),
            queue: cfg.queue.clone(),
        })
    }

    /// Start a manual-ack consumer on the notification queue. The returned
    /// channel carries the consumer; closing it stops consumption.
    pub async fn consume<H: EventHandler>(&self, handler: H, prefetch: u16) -> Result<Channel, NotifyError> {
        let channel = open_channel(&self.connection, &self.queue, DefaultChannelCallback).await?;
        channel
            .basic_qos(BasicQosArguments::new(0, prefetch, false))
            .await?;

        let consumer_tag = format!("booking_notifications_{}", Uuid::new_v4());
        let args = BasicConsumeArguments::new(&self.queue, &consumer_tag)
            .manual_ack(true)
            .finish();

        channel
            .basic_consume(NotificationConsumer { handler }, args)
            .await?;

        info!("🚀 Consuming booking events from {} as {}", self.queue, consumer_tag);
        Ok(channel)
    }

    pub async fn close(self) {
        if let Err(e) = self.publisher.into_inner().channel.close().await {
            warn!("Error closing notification channel: {:?}", e);
        }
        if let Err(e) = self.connection.close().await {
            warn!("Error closing RabbitMQ connection: {:?}", e);
        }
    }
}

#[async_trait]
impl Notifier for AmqpNotifier {
    /// Returns once the broker has confirmed the message.
    async fn publish(&self, event: &BookingEvent) -> Result<(), NotifyError> {
        let content = serde_json::to_vec(event)?;

        let properties = BasicProperties::default()
            .with_content_type("application/json")
            .with_delivery_mode(PERSISTENT)
            .with_message_id(&Uuid::new_v4().to_string())
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
            .finish();

        let verdict = {
            let mut publisher = self.publisher.lock().await;
            if !publisher.usable() {
                warn!("⚠️ Notification channel is unusable, opening a fresh one");
                publisher.confirms.abandon();
                *publisher = Publisher::open(&self.connection, &self.queue).await?;
            }

            publisher.next_tag += 1;
            let tag = publisher.next_tag;
            let verdict = publisher.confirms.register(tag);

            let sent = publisher
                .channel
                .basic_publish(properties, content, BasicPublishArguments::new("", &self.queue))
                .await;
            if let Err(e) = sent {
                // Tag numbering is unknown after a failed send.
                publisher.confirms.forget(tag);
                publisher.broken = true;
                return Err(e.into());
            }
            verdict
        };

        confirmed(verdict).await
    }
}

async fn open_channel<C>(connection: &Connection, queue: &str, callback: C) -> Result<Channel, NotifyError>
where
    C: ChannelCallback + Send + 'static,
{
    let channel = connection.open_channel(None).await?;
    channel
        .register_callback(callback)
        .await?;

    // Durable queue + persistent messages survive a broker restart.
    channel
        .queue_declare(
            QueueDeclareArguments::new(queue)
                .durable(true)
                .finish(),
        )
        .await?;

    Ok(channel)
}

/// Handler used by the notifier process: logs each event.
pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, event: BookingEvent) -> HandlerResult {
        if event.is_cancellation() {
            info!("✅ Booking cancelled: table {} at {}", event.table_id, event.booking_time);
        } else {
            info!("✅ Booking created: user {} table {} at {}", event.user_id, event.table_id, event.booking_time);
        }
        Ok(())
    }
}
