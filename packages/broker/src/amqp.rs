//! RabbitMQ transport over `lapin`.

use std::sync::Arc;

use broker_core::ExchangeKind;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::transport::{
    BrokerError, BrokerFuture, Connector, Delivery, DeliveryStream, MessageChannel,
    MessageConnection, QueueArguments,
};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connects to `amqp://` / `amqps://` URLs.
#[derive(Debug, Default, Clone)]
pub struct AmqpConnector;

impl Connector for AmqpConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BrokerFuture<'a, Arc<dyn MessageConnection>> {
        Box::pin(async move {
            let connection = Connection::connect(url, ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::Connect(e.to_string()))?;
            Ok(Arc::new(AmqpConnection { connection }) as Arc<dyn MessageConnection>)
        })
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

impl MessageConnection for AmqpConnection {
    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn MessageChannel>> {
        Box::pin(async move {
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(format!("confirm mode: {e}")))?;
            Ok(Arc::new(AmqpChannel { channel }) as Arc<dyn MessageChannel>)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.connection
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .map_err(|e| BrokerError::Connect(e.to_string()))
        })
    }
}

/// A channel in publisher-confirm mode.
pub struct AmqpChannel {
    channel: Channel,
}

/// A publish only counts once the broker acked it and routed it somewhere.
pub(crate) fn check_confirmation(
    exchange: &str,
    routing_key: &str,
    confirmation: Confirmation,
) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) => Err(BrokerError::Publish(format!(
            "{exchange}/{routing_key}: message was returned as unroutable"
        ))),
        Confirmation::Nack(_) => Err(BrokerError::Publish(format!(
            "{exchange}/{routing_key}: broker nacked the message"
        ))),
        Confirmation::NotRequested => Err(BrokerError::Publish(format!(
            "{exchange}/{routing_key}: channel is not in confirm mode"
        ))),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// Build the `x-` argument table for a queue declaration.
pub(crate) fn queue_arguments_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(ttl) = arguments.message_ttl {
        table.insert(ShortString::from("x-message-ttl"), AMQPValue::LongUInt(ttl));
    }
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key.as_str())),
        );
    }
    if let Some(max_length) = arguments.max_length {
        table.insert(ShortString::from("x-max-length"), AMQPValue::LongUInt(max_length));
    }
    table
}

impl MessageChannel for AmqpChannel {
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let options = ExchangeDeclareOptions {
                durable,
                ..Default::default()
            };
            self.channel
                .exchange_declare(name, exchange_kind(kind), options, FieldTable::default())
                .await
                .map_err(|e| BrokerError::Declare(format!("exchange {name}: {e}")))
        })
    }

    fn declare_queue<'a>(
        &'a self,
        name: &'a str,
        durable: bool,
        arguments: &'a QueueArguments,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let options = QueueDeclareOptions {
                durable,
                ..Default::default()
            };
            self.channel
                .queue_declare(name, options, queue_arguments_table(arguments))
                .await
                .map(|_| ())
                .map_err(|e| BrokerError::Declare(format!("queue {name}: {e}")))
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        binding_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Bind(format!("{queue} -> {exchange}: {e}")))
        })
    }

    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.channel
                .basic_qos(count, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let properties = BasicProperties::default()
                .with_delivery_mode(PERSISTENT)
                .with_content_type(ShortString::from("application/json"));
            let options = BasicPublishOptions {
                mandatory: true,
                ..Default::default()
            };
            let confirmation = self
                .channel
                .basic_publish(exchange, routing_key, options, body, properties)
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
            check_confirmation(exchange, routing_key, confirmation)
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
    ) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Consume(format!("{queue}: {e}")))?;

            let queue = queue.to_string();
            let stream = consumer.map(move |delivery| match delivery {
                Ok(delivery) => Some(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    data: delivery.data,
                    redelivered: delivery.redelivered,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                }),
                Err(e) => {
                    tracing::debug!(queue = %queue, error = %e, "Consumer stream yielded an error");
                    None
                }
            });
            Ok(stream.boxed())
        })
    }

    fn ack(&self, delivery_tag: u64) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::Ack(e.to_string()))
        })
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let options = BasicNackOptions {
                multiple: false,
                requeue,
            };
            self.channel
                .basic_nack(delivery_tag, options)
                .await
                .map_err(|e| BrokerError::Ack(e.to_string()))
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.channel
                .close(REPLY_SUCCESS, "shutdown")
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_arguments_map_to_x_headers() {
        let arguments = QueueArguments {
            message_ttl: Some(60_000),
            dead_letter_exchange: Some("quant.dlx".to_string()),
            dead_letter_routing_key: Some("quant.dead".to_string()),
            max_length: Some(10_000),
        };
        let table = queue_arguments_table(&arguments);
        let inner = table.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongUInt(60_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString(LongString::from("quant.dlx")))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString(LongString::from("quant.dead")))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-max-length")),
            Some(&AMQPValue::LongUInt(10_000))
        );
    }

    #[test]
    fn unset_arguments_are_omitted() {
        let table = queue_arguments_table(&QueueArguments::default());
        assert!(table.inner().is_empty());
    }

    #[test]
    fn only_acked_publishes_succeed() {
        assert!(check_confirmation("quant.exchange", "quant.jobs", Confirmation::Ack(None)).is_ok());

        let nacked = check_confirmation("quant.exchange", "quant.jobs", Confirmation::Nack(None));
        assert!(matches!(nacked, Err(BrokerError::Publish(reason)) if reason.contains("nacked")));

        let unconfirmed = check_confirmation("quant.exchange", "quant.jobs", Confirmation::NotRequested);
        assert!(matches!(unconfirmed, Err(BrokerError::Publish(_))));
    }
}
