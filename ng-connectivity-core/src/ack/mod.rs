//! Acknowledgement handling: per-signal aggregation, per-message response collection
//! and conversion of publish results into acknowledgements.

mod aggregator;
mod collector;
pub mod sending;

pub use aggregator::{AcknowledgementAggregator, AggregatedAcknowledgements};
pub use collector::{Collectable, CollectorOutput, ResponseCollector};

use crate::forwarder::SignalForwarder;
use ng_connectivity_models::{settings::AcksConfig, ConnectionId};
use ng_connectivity_sdk::{header_keys, ConnectivityError, Signal};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

enum StarterCommand {
    Start {
        signal: Box<Signal>,
        reply: oneshot::Sender<AggregatedAcknowledgements>,
    },
    Finished {
        correlation_id: String,
    },
}

/// Starts acknowledgement aggregators of one connection.
///
/// All starts are serialized through a single task which owns the set of in-flight
/// correlation ids. A signal whose correlation id is already being aggregated is
/// aggregated under a suffixed id; its result carries the original id again.
#[derive(Clone)]
pub struct AggregatorStarter {
    tx: mpsc::UnboundedSender<StarterCommand>,
    connection_id: ConnectionId,
}

impl AggregatorStarter {
    pub fn spawn(
        connection_id: ConnectionId,
        forwarder: Arc<dyn SignalForwarder>,
        acks: AcksConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StarterCommand>();
        let token = cancel.child_token();
        let self_tx = tx.clone();
        let task_connection_id = connection_id.clone();
        tokio::spawn(async move {
            let mut active: HashSet<String> = HashSet::new();
            loop {
                let command = tokio::select! {
                    _ = token.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                };
                match command {
                    StarterCommand::Start { signal, reply } => {
                        let mut signal = *signal;
                        let original = match signal.correlation_id() {
                            Some(id) => id.to_string(),
                            None => {
                                let id = Uuid::new_v4().to_string();
                                signal.headers_mut().insert(header_keys::CORRELATION_ID, id.clone());
                                id
                            }
                        };
                        let mut correlation_id = original.clone();
                        if active.contains(&correlation_id) {
                            correlation_id = format!("{original}_{}", Uuid::new_v4());
                            debug!(
                                connection_id = %task_connection_id,
                                correlation_id = %original,
                                aggregated_as = %correlation_id,
                                "Correlation id already in flight"
                            );
                            signal
                                .headers_mut()
                                .insert(header_keys::CORRELATION_ID, correlation_id.clone());
                        }

                        let timeout = acks.effective_timeout(signal.headers().timeout());
                        let aggregator = match AcknowledgementAggregator::for_signal(&signal, timeout) {
                            Ok(aggregator) => aggregator,
                            Err(e) => {
                                warn!(connection_id = %task_connection_id, error = %e, "Cannot aggregate acknowledgements");
                                continue;
                            }
                        };
                        active.insert(correlation_id.clone());

                        let forwarder = Arc::clone(&forwarder);
                        let done_tx = self_tx.clone();
                        tokio::spawn(async move {
                            let mut result = aggregator.run(forwarder, signal).await;
                            restore_correlation_id(&mut result, &original);
                            let _ = reply.send(result);
                            let _ = done_tx.send(StarterCommand::Finished { correlation_id });
                        });
                    }
                    StarterCommand::Finished { correlation_id } => {
                        active.remove(&correlation_id);
                    }
                }
            }
            debug!(connection_id = %task_connection_id, "Aggregator starter stopped");
        });
        Self { tx, connection_id }
    }

    /// Queues the aggregation of an ack-requesting signal.
    pub fn start(&self, signal: Signal) -> Result<oneshot::Receiver<AggregatedAcknowledgements>, ConnectivityError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StarterCommand::Start {
                signal: Box::new(signal),
                reply,
            })
            .map_err(|_| ConnectivityError::ConnectionUnavailable {
                connection_id: self.connection_id.to_string(),
            })?;
        Ok(rx)
    }
}

fn restore_correlation_id(result: &mut AggregatedAcknowledgements, original: &str) {
    result
        .acknowledgements
        .headers
        .insert(header_keys::CORRELATION_ID, original);
    for ack in result.acknowledgements.acknowledgements.iter_mut() {
        ack.headers.insert(header_keys::CORRELATION_ID, original);
    }
    if let Some(failure) = result.failure.as_mut() {
        failure.headers.insert(header_keys::CORRELATION_ID, original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ng_connectivity_sdk::{
        Acknowledgement, AcknowledgementLabel, Action, Channel, DittoHeaders, EntityId, Event,
    };
    use std::sync::Mutex;

    /// Answers every forwarded signal with a positive `custom-ack` carrying the
    /// correlation id it saw.
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SignalForwarder for Echo {
        async fn forward(&self, _: Signal) -> Result<(), ConnectivityError> {
            Ok(())
        }

        async fn forward_with_responses(&self, signal: Signal, responses: mpsc::Sender<Signal>) -> Result<(), ConnectivityError> {
            let cid = signal.correlation_id().unwrap_or_default().to_string();
            self.seen.lock().unwrap().push(cid);
            let ack = Acknowledgement::new(
                AcknowledgementLabel::parse("custom-ack").unwrap(),
                EntityId::thing("org", "t"),
                200,
                signal.headers().clone(),
            );
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                let _ = responses.send(Signal::Acknowledgement(ack)).await;
            });
            Ok(())
        }
    }

    fn event(cid: &str) -> Signal {
        Signal::Event(Event {
            entity_id: EntityId::thing("org", "t"),
            channel: Channel::Twin,
            action: Action::Modified,
            path: "/".into(),
            value: None,
            revision: None,
            timestamp: None,
            headers: DittoHeaders::new()
                .with_correlation_id(cid)
                .with(header_keys::REQUESTED_ACKS, r#"["custom-ack"]"#),
        })
    }

    #[tokio::test]
    async fn colliding_correlation_ids_are_suffixed_and_restored() {
        let echo = Arc::new(Echo::default());
        let starter = AggregatorStarter::spawn(
            ConnectionId::new("c"),
            echo.clone(),
            AcksConfig::default(),
            &CancellationToken::new(),
        );
        let first = starter.start(event("dup")).unwrap();
        let second = starter.start(event("dup")).unwrap();
        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(first.correlation_id(), Some("dup"));
        assert_eq!(second.correlation_id(), Some("dup"));

        let seen = echo.seen.lock().unwrap().clone();
        assert_eq!(seen[0], "dup");
        assert!(seen[1].starts_with("dup_"));
    }
}
