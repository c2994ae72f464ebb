//! Consumer actor: feeds one queue's deliveries to a [`Worker`].

use std::sync::Arc;

use futures_util::StreamExt;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::task::JoinHandle;

use crate::messages::{ConsumerMessage, ConsumerStats};
use crate::transport::MessageChannel;
use crate::worker::{DeliveryOutcome, Worker};

/// Consumer actor arguments.
pub struct ConsumerArgs {
    pub worker: Arc<Worker>,
    pub channel: Arc<dyn MessageChannel>,
    pub consumer_tag: String,
}

/// State for the consumer actor.
pub struct ConsumerState {
    worker: Arc<Worker>,
    forwarder: JoinHandle<()>,
    stats: ConsumerStats,
}

/// Consumes a queue under the channel's prefetch limit.
///
/// A forwarding task moves stream items into the mailbox; the actor handles
/// them strictly one at a time, so at most one job per consumer runs at once.
pub struct ConsumerActor;

impl Actor for ConsumerActor {
    type Msg = ConsumerMessage;
    type State = ConsumerState;
    type Arguments = ConsumerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let queue = args.worker.queue().to_string();
        let mut deliveries = args
            .channel
            .consume(&queue, &args.consumer_tag)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to consume {queue}: {e}")))?;
        tracing::info!(queue = %queue, consumer = %args.consumer_tag, "Starting consumer");

        let forwarder = tokio::spawn(async move {
            while let Some(item) = deliveries.next().await {
                if myself.send_message(ConsumerMessage::Delivery(item)).is_err() {
                    return;
                }
            }
            let _ = myself.send_message(ConsumerMessage::StreamEnded);
        });

        Ok(ConsumerState {
            worker: args.worker,
            forwarder,
            stats: ConsumerStats::default(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConsumerMessage::Delivery(delivery) => match state.worker.handle(delivery).await {
                Ok(DeliveryOutcome::Acked) => state.stats.acked += 1,
                Ok(DeliveryOutcome::DeadLettered) => state.stats.dead_lettered += 1,
                Ok(DeliveryOutcome::Requeued) => state.stats.requeued += 1,
                Ok(DeliveryOutcome::Skipped) => state.stats.skipped += 1,
                Err(e) => {
                    state.stats.errors += 1;
                    tracing::error!(
                        queue = %state.worker.queue(),
                        error = %e,
                        "Failed to settle delivery"
                    );
                }
            },

            ConsumerMessage::StreamEnded => {
                tracing::warn!(queue = %state.worker.queue(), "Consumer stream ended");
                myself.stop(Some("consumer stream ended".to_string()));
            }

            ConsumerMessage::GetStats { reply } => {
                let _ = reply.send(state.stats.clone());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.forwarder.abort();
        tracing::info!(
            queue = %state.worker.queue(),
            worker_id = %state.worker.worker_id(),
            "Consumer stopped"
        );
        Ok(())
    }
}
