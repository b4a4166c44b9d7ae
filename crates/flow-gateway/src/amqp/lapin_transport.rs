//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! One connection, one channel in publisher-confirm mode. Returned
//! mandatory messages arrive attached to the publish confirm; they are
//! forwarded to the link's event stream. Consumers are bridged from lapin
//! streams onto the transport's delivery channels by a forwarding task each.

use crate::amqp::transport::{
    BrokerChannel, BrokerLink, BrokerTransport, ChannelEvent, ConsumerStream, Delivery,
    ExchangeKind, ExchangeOptions, MessageProperties, OutboundMessage, QueueOptions,
    ReturnedMessage, DEAD_LETTER_EXCHANGE_ARG,
};
use crate::errors::BrokerError;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::ConsumerTag;
use futures::StreamExt;
use lapin::message::BasicReturnMessage;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::{Confirmation, PublisherConfirm};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// AMQP reply code for a normal close.
const AMQP_REPLY_SUCCESS: u16 = 200;

/// Opens connections to an AMQP broker.
pub struct LapinTransport {
    url: SecretString,
}

impl LapinTransport {
    pub fn new(url: SecretString) -> Self {
        Self { url }
    }
}

#[async_trait]
impl BrokerTransport for LapinTransport {
    #[instrument(skip_all)]
    async fn connect(&self) -> Result<BrokerLink, BrokerError> {
        let connection = Connection::connect(
            self.url.expose_secret(),
            ConnectionProperties::default(),
        )
        .await
        .map_err(|e| broker_error(&e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| broker_error(&e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| broker_error(&e))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let connection_events = events_tx.clone();
        connection.on_error(move |err| {
            let err = broker_error(&err);
            let _ = connection_events.send(ChannelEvent::ConnectionClosed {
                code: err.code,
                reason: err.message,
            });
        });
        let channel_events = events_tx.clone();
        channel.on_error(move |err| {
            let err = broker_error(&err);
            let _ = channel_events.send(ChannelEvent::ChannelClosed {
                code: err.code,
                reason: err.message,
            });
        });

        debug!(target: "gw.amqp.lapin", "AMQP connection and confirm channel open");
        Ok(BrokerLink {
            channel: Arc::new(LapinChannel {
                connection,
                channel,
                events: events_tx,
            }),
            events: events_rx,
        })
    }
}

struct LapinChannel {
    connection: Connection,
    channel: Channel,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<String, BrokerError> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &options.dead_letter_exchange {
            arguments.insert(
                ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map_err(|e| broker_error(&e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn consume(&self, queue: &str) -> Result<ConsumerStream, BrokerError> {
        let tag = ConsumerTag::new(format!("ctag-{}", Uuid::new_v4().simple()));
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                tag.as_str(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error(&e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let forward_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            consumer_tag: forward_tag.clone(),
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            redelivered: delivery.redelivered,
                            properties: from_amqp_properties(&delivery.properties),
                            payload: delivery.data,
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(target: "gw.amqp.lapin", consumer_tag = %forward_tag, error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
        });

        Ok(ConsumerStream {
            tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(tag.as_str(), BasicCancelOptions::default())
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let confirm = self.start_publish(&message).await?;
        // Returns arrive with the confirm, so it is still awaited off-task.
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = await_confirm(confirm, &events).await {
                debug!(target: "gw.amqp.lapin", error = %e, "Unconfirmed publish failed");
            }
        });
        Ok(())
    }

    async fn publish_confirmed(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let confirm = self.start_publish(&message).await?;
        await_confirm(confirm, &self.events).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Err(e) = self.channel.close(AMQP_REPLY_SUCCESS, "closing").await {
            debug!(target: "gw.amqp.lapin", error = %e, "Channel close failed");
        }
        self.connection
            .close(AMQP_REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| broker_error(&e))
    }
}

impl LapinChannel {
    async fn start_publish(&self, message: &OutboundMessage) -> Result<PublisherConfirm, BrokerError> {
        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    ..BasicPublishOptions::default()
                },
                &message.payload,
                to_amqp_properties(&message.properties),
            )
            .await
            .map_err(|e| broker_error(&e))
    }
}

async fn await_confirm(
    confirm: PublisherConfirm,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> Result<(), BrokerError> {
    match confirm.await.map_err(|e| broker_error(&e))? {
        Confirmation::Ack(returned) => {
            if let Some(returned) = returned {
                forward_return(*returned, events);
            }
            Ok(())
        }
        Confirmation::Nack(returned) => {
            if let Some(returned) = returned {
                forward_return(*returned, events);
            }
            warn!(target: "gw.amqp.lapin", "Broker nacked a published message");
            Err(BrokerError::new("message rejected by broker"))
        }
        Confirmation::NotRequested => Ok(()),
    }
}

fn forward_return(returned: BasicReturnMessage, events: &mpsc::UnboundedSender<ChannelEvent>) {
    let _ = events.send(ChannelEvent::Returned(ReturnedMessage {
        reply_code: returned.reply_code,
        reply_text: returned.reply_text.as_str().to_string(),
        exchange: returned.delivery.exchange.as_str().to_string(),
        routing_key: returned.delivery.routing_key.as_str().to_string(),
        properties: from_amqp_properties(&returned.delivery.properties),
        payload: returned.delivery.data,
    }));
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(expiration) = &properties.expiration {
        amqp = amqp.with_expiration(ShortString::from(expiration.clone()));
    }
    amqp
}

fn from_amqp_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
        expiration: properties
            .expiration()
            .as_ref()
            .map(|s| s.as_str().to_string()),
    }
}

fn broker_error(err: &lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(amqp) => BrokerError::with_code(amqp.get_id(), amqp.to_string()),
        other => BrokerError::new(other.to_string()),
    }
}
