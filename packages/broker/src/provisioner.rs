//! Declare the exchanges and queues of a job class.

use broker_core::QueueConfig;

use crate::transport::{BrokerError, MessageChannel, QueueArguments};

/// Provisioning step that failed, with the entity it was acting on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to declare dead-letter exchange {exchange}")]
    DeadLetterExchange {
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to declare dead-letter queue {queue}")]
    DeadLetterQueue {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to bind dead-letter queue {queue} to {exchange}")]
    DeadLetterBinding {
        queue: String,
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to declare exchange {exchange}")]
    Exchange {
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to declare queue {queue}")]
    Queue {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to set prefetch {prefetch} for queue {queue}")]
    Prefetch {
        queue: String,
        prefetch: u16,
        #[source]
        source: BrokerError,
    },

    #[error("failed to bind queue {queue} to {exchange}")]
    Binding {
        queue: String,
        exchange: String,
        #[source]
        source: BrokerError,
    },
}

/// `x-` arguments that tie the primary queue to its dead-letter chain.
pub fn primary_queue_arguments(config: &QueueConfig) -> QueueArguments {
    QueueArguments {
        message_ttl: Some(config.message_ttl),
        dead_letter_exchange: Some(config.dead_letter.exchange.name.clone()),
        dead_letter_routing_key: Some(config.dead_letter_routing_key().to_string()),
        max_length: Some(config.max_length),
    }
}

/// Realizes a [`QueueConfig`] on a channel.
///
/// Every declaration is idempotent, so running it again against an already
/// provisioned broker with the same configuration is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueProvisioner;

impl QueueProvisioner {
    pub async fn setup_queue(
        &self,
        config: &QueueConfig,
        channel: &dyn MessageChannel,
    ) -> Result<(), ProvisionError> {
        let result = Self::declare(config, channel).await;
        match &result {
            Ok(()) => tracing::info!(
                queue = %config.name,
                exchange = %config.exchange.name,
                dead_letter_queue = %config.dead_letter.name,
                "Queue provisioned"
            ),
            Err(e) => tracing::error!(
                category = "provisioning",
                queue = %config.name,
                error = %e,
                "Queue provisioning failed"
            ),
        }
        result
    }

    async fn declare(config: &QueueConfig, channel: &dyn MessageChannel) -> Result<(), ProvisionError> {
        let dead_letter = &config.dead_letter;
        let dlx = &dead_letter.exchange;

        channel
            .declare_exchange(&dlx.name, dlx.kind, dlx.durable)
            .await
            .map_err(|source| ProvisionError::DeadLetterExchange {
                exchange: dlx.name.clone(),
                source,
            })?;
        channel
            .declare_queue(&dead_letter.name, dead_letter.durable, &QueueArguments::default())
            .await
            .map_err(|source| ProvisionError::DeadLetterQueue {
                queue: dead_letter.name.clone(),
                source,
            })?;
        channel
            .bind_queue(&dead_letter.name, &dlx.name, &dlx.binding_key)
            .await
            .map_err(|source| ProvisionError::DeadLetterBinding {
                queue: dead_letter.name.clone(),
                exchange: dlx.name.clone(),
                source,
            })?;

        let exchange = &config.exchange;
        channel
            .declare_exchange(&exchange.name, exchange.kind, exchange.durable)
            .await
            .map_err(|source| ProvisionError::Exchange {
                exchange: exchange.name.clone(),
                source,
            })?;

        channel
            .declare_queue(&config.name, config.durable, &primary_queue_arguments(config))
            .await
            .map_err(|source| ProvisionError::Queue {
                queue: config.name.clone(),
                source,
            })?;
        if config.prefetch > 0 {
            channel
                .set_prefetch(config.prefetch)
                .await
                .map_err(|source| ProvisionError::Prefetch {
                    queue: config.name.clone(),
                    prefetch: config.prefetch,
                    source,
                })?;
        }

        channel
            .bind_queue(&config.name, &exchange.name, &exchange.binding_key)
            .await
            .map_err(|source| ProvisionError::Binding {
                queue: config.name.clone(),
                exchange: exchange.name.clone(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use std::sync::{Arc, Mutex};

    use broker_core::{DeadLetterConfig, ExchangeConfig, ExchangeKind};

    use super::*;
    use crate::memory::MemoryBroker;
    use crate::transport::{BrokerFuture, Connector, DeliveryStream};

    fn config() -> QueueConfig {
        QueueConfig {
            name: "quant.jobs".into(),
            durable: true,
            message_ttl: 60_000,
            max_length: 100,
            prefetch: 1,
            exchange: ExchangeConfig {
                name: "quant.exchange".into(),
                kind: ExchangeKind::Direct,
                durable: true,
                binding_key: "quant.jobs".into(),
                routing_key: "quant.jobs".into(),
            },
            dead_letter: DeadLetterConfig {
                name: "quant.dlq".into(),
                exchange: ExchangeConfig {
                    name: "quant.dlx".into(),
                    kind: ExchangeKind::Direct,
                    durable: true,
                    binding_key: String::new(),
                    routing_key: String::new(),
                },
                durable: true,
            },
        }
    }

    /// Records every call and fails the one whose label equals `fail_on`.
    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingChannel {
        fn record(&self, call: String) -> Result<(), BrokerError> {
            let failed = self.fail_on.is_some_and(|label| call.starts_with(label));
            self.calls.lock().unwrap().push(call);
            if failed {
                Err(BrokerError::Declare("refused".into()))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MessageChannel for RecordingChannel {
        fn declare_exchange<'a>(
            &'a self,
            name: &'a str,
            kind: ExchangeKind,
            durable: bool,
        ) -> BrokerFuture<'a, ()> {
            let r = self.record(format!("exchange {name} {kind} {durable}"));
            Box::pin(async move { r })
        }

        fn declare_queue<'a>(
            &'a self,
            name: &'a str,
            durable: bool,
            arguments: &'a QueueArguments,
        ) -> BrokerFuture<'a, ()> {
            let dlx = arguments.dead_letter_exchange.as_deref().unwrap_or("-");
            let r = self.record(format!("queue {name} {durable} dlx={dlx}"));
            Box::pin(async move { r })
        }

        fn bind_queue<'a>(
            &'a self,
            queue: &'a str,
            exchange: &'a str,
            binding_key: &'a str,
        ) -> BrokerFuture<'a, ()> {
            let r = self.record(format!("bind {queue} {exchange} [{binding_key}]"));
            Box::pin(async move { r })
        }

        fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()> {
            let r = self.record(format!("prefetch {count}"));
            Box::pin(async move { r })
        }

        fn publish<'a>(&'a self, _: &'a str, _: &'a str, _: &'a [u8]) -> BrokerFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn consume<'a>(&'a self, _: &'a str, _: &'a str) -> BrokerFuture<'a, DeliveryStream> {
            Box::pin(async { Err(BrokerError::Closed) })
        }

        fn ack(&self, _: u64) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn nack(&self, _: u64, _: bool) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> BrokerFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn declares_dead_letter_chain_first() {
        let channel = RecordingChannel::default();
        QueueProvisioner.setup_queue(&config(), &channel).await.unwrap();

        assert_eq!(
            channel.calls(),
            vec![
                "exchange quant.dlx direct true",
                "queue quant.dlq true dlx=-",
                "bind quant.dlq quant.dlx []",
                "exchange quant.exchange direct true",
                "queue quant.jobs true dlx=quant.dlx",
                "prefetch 1",
                "bind quant.jobs quant.exchange [quant.jobs]",
            ]
        );
    }

    #[tokio::test]
    async fn failure_names_the_stage_and_stops() {
        let channel = RecordingChannel {
            fail_on: Some("queue quant.dlq"),
            ..Default::default()
        };
        let err = QueueProvisioner
            .setup_queue(&config(), &channel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::DeadLetterQueue { ref queue, .. } if queue == "quant.dlq"));
        assert_eq!(channel.calls().len(), 2);

        let channel = RecordingChannel {
            fail_on: Some("bind quant.jobs"),
            ..Default::default()
        };
        let err = QueueProvisioner
            .setup_queue(&config(), &channel)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to bind queue quant.jobs to quant.exchange"
        );
    }

    #[tokio::test]
    async fn provisioning_twice_is_idempotent() {
        let broker = MemoryBroker::new();
        let connection = broker.connector().connect("memory://").await.unwrap();
        let channel: Arc<dyn MessageChannel> = connection.create_channel().await.unwrap();
        let config = config();

        QueueProvisioner.setup_queue(&config, channel.as_ref()).await.unwrap();
        QueueProvisioner.setup_queue(&config, channel.as_ref()).await.unwrap();

        assert!(broker.has_exchange("quant.dlx").await);
        assert!(broker.is_bound("quant.exchange", "quant.jobs", "quant.jobs").await);
        assert!(broker.is_bound("quant.dlx", "quant.dlq", "").await);
        assert_eq!(
            broker.queue_arguments("quant.jobs").await,
            Some(primary_queue_arguments(&config))
        );

        // Rejected messages land in the dead-letter queue.
        channel.publish("quant.exchange", "quant.jobs", b"{}").await.unwrap();
        let mut deliveries = channel.consume("quant.jobs", "test").await.unwrap();
        let delivery = futures_util::StreamExt::next(&mut deliveries)
            .await
            .flatten()
            .unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();
        assert_eq!(broker.ready_count("quant.dlq").await, 1);
    }
}
