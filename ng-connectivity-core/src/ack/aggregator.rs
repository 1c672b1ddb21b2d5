use crate::forwarder::SignalForwarder;
use ng_connectivity_sdk::{
    Acknowledgement, AcknowledgementLabel, Acknowledgements, Channel, ConnectivityError, DittoHeaders,
    EntityId, ErrorResponse, Signal,
};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info};

/// Collects the acknowledgements requested by one signal.
///
/// Terminates when every requested label reported or when the timeout fires; in the
/// latter case the collected subset is reported and the missing labels are listed.
#[derive(Debug)]
pub struct AcknowledgementAggregator {
    entity_id: EntityId,
    requested: Vec<AcknowledgementLabel>,
    received: HashMap<AcknowledgementLabel, Acknowledgement>,
    headers: DittoHeaders,
    timeout: Duration,
}

/// Terminal state of an [`AcknowledgementAggregator`].
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedAcknowledgements {
    /// Collected acknowledgements, in requested order
    pub acknowledgements: Acknowledgements,
    pub missing: Vec<AcknowledgementLabel>,
    pub timed_out: bool,
    /// First failed acknowledgement in requested order
    pub failure: Option<Acknowledgement>,
    timeout: Duration,
}

impl AggregatedAcknowledgements {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.missing.is_empty()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.acknowledgements.headers.correlation_id()
    }

    /// `true` when the failure is worth redelivering: timeouts and server errors.
    pub fn is_retryable(&self) -> bool {
        if !self.missing.is_empty() {
            return true;
        }
        self.failure
            .as_ref()
            .is_some_and(|f| f.status == 408 || f.status >= 500)
    }

    /// Client-visible response: the failure if one was collected, otherwise all
    /// contributions, with missing labels reported as timeouts.
    pub fn to_response(&self) -> Signal {
        if let Some(failure) = &self.failure {
            return Signal::Acknowledgement(failure.clone());
        }
        let mut acks = self.acknowledgements.clone();
        for label in &self.missing {
            acks.acknowledgements.push(timeout_ack(label, &acks.entity_id, &acks.headers, self.timeout));
        }
        Signal::Acknowledgements(acks)
    }
}

fn timeout_ack(label: &AcknowledgementLabel, entity_id: &EntityId, headers: &DittoHeaders, timeout: Duration) -> Acknowledgement {
    let error = ConnectivityError::CommandTimeout {
        timeout_ms: timeout.as_millis() as u64,
    };
    Acknowledgement::new(label.clone(), entity_id.clone(), error.status(), headers.clone()).with_payload(json!({
        "error": error.error_code(),
        "message": error.to_string(),
    }))
}

impl AcknowledgementAggregator {
    pub fn new(entity_id: EntityId, requested: Vec<AcknowledgementLabel>, headers: DittoHeaders, timeout: Duration) -> Self {
        Self {
            entity_id,
            requested,
            received: HashMap::new(),
            headers,
            timeout,
        }
    }

    /// Aggregator for an ack-requesting signal.
    pub fn for_signal(signal: &Signal, timeout: Duration) -> Result<Self, ConnectivityError> {
        let entity_id = signal.entity_id().cloned().unwrap_or_else(EntityId::unknown);
        Ok(Self::new(
            entity_id,
            signal.acknowledgement_requests()?,
            signal.headers().clone(),
            timeout,
        ))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.correlation_id()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_complete(&self) -> bool {
        self.requested.iter().all(|l| self.received.contains_key(l))
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Records a response; returns `false` when it contributes nothing new.
    pub fn add(&mut self, response: Signal) -> bool {
        match response {
            Signal::Acknowledgement(ack) => self.add_ack(ack),
            Signal::Acknowledgements(acks) => acks
                .acknowledgements
                .into_iter()
                .fold(false, |added, ack| self.add_ack(ack) || added),
            Signal::CommandResponse(r) => {
                let label = if r.channel == Channel::Live {
                    AcknowledgementLabel::live_response()
                } else {
                    AcknowledgementLabel::twin_persisted()
                };
                let mut ack = Acknowledgement::new(label, r.entity_id, r.status, r.headers);
                ack.payload = r.value;
                self.add_ack(ack)
            }
            Signal::Message(m) => match m.status {
                Some(status) => {
                    let mut ack =
                        Acknowledgement::new(AcknowledgementLabel::live_response(), m.entity_id, status, m.headers);
                    ack.payload = m.value;
                    self.add_ack(ack)
                }
                None => false,
            },
            Signal::Error(e) => {
                // an error response to the signal fails every built-in contribution still pending
                let payload = json!({
                    "error": e.error.error_code(),
                    "message": e.error.to_string(),
                    "description": e.error.description(),
                });
                let pending: Vec<_> = self
                    .requested
                    .iter()
                    .filter(|l| l.is_built_in() && !self.received.contains_key(*l))
                    .cloned()
                    .collect();
                let mut added = false;
                for label in pending {
                    let ack = Acknowledgement::new(label, e.entity_id.clone(), e.error.status(), e.headers.clone())
                        .with_payload(payload.clone());
                    added |= self.add_ack(ack);
                }
                added
            }
            _ => false,
        }
    }

    fn add_ack(&mut self, ack: Acknowledgement) -> bool {
        if !self.requested.contains(&ack.label) || self.received.contains_key(&ack.label) {
            debug!(label = %ack.label, "Ignoring unrequested or duplicate acknowledgement");
            return false;
        }
        self.received.insert(ack.label.clone(), ack);
        true
    }

    /// First failed contribution, by requested-label order.
    pub fn first_failure(&self) -> Option<&Acknowledgement> {
        self.requested
            .iter()
            .filter_map(|l| self.received.get(l))
            .find(|a| !a.is_success())
    }

    pub fn build(mut self, timed_out: bool) -> AggregatedAcknowledgements {
        let failure = self.first_failure().cloned();
        let mut collected = Vec::with_capacity(self.received.len());
        let mut missing = Vec::new();
        for label in &self.requested {
            match self.received.remove(label) {
                Some(ack) => collected.push(ack),
                None => missing.push(label.clone()),
            }
        }
        AggregatedAcknowledgements {
            acknowledgements: Acknowledgements::new(self.entity_id, collected, self.headers),
            missing,
            timed_out,
            failure,
            timeout: self.timeout,
        }
    }

    /// Answers every label still pending with `error`.
    pub fn fail_pending(mut self, error: &ConnectivityError) -> AggregatedAcknowledgements {
        let headers = self.headers.clone();
        let entity_id = self.entity_id.clone();
        self.add(Signal::Error(ErrorResponse::new(entity_id.clone(), error.clone(), headers.clone())));
        let pending: Vec<_> = self
            .requested
            .iter()
            .filter(|l| !self.received.contains_key(*l))
            .cloned()
            .collect();
        for label in pending {
            let ack = Acknowledgement::new(label, entity_id.clone(), error.status(), headers.clone())
                .with_payload(Value::String(error.to_string()));
            self.add_ack(ack);
        }
        self.build(false)
    }

    /// Forwards `signal` and collects its responses until complete or timed out.
    pub async fn run(mut self, forwarder: Arc<dyn SignalForwarder>, signal: Signal) -> AggregatedAcknowledgements {
        let (tx, mut rx) = mpsc::channel(self.requested.len().max(1) * 2);
        if let Err(error) = forwarder.forward_with_responses(signal, tx).await {
            return self.fail_pending(&error);
        }

        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        while !self.is_complete() {
            tokio::select! {
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                response = rx.recv() => match response {
                    Some(response) => {
                        self.add(response);
                    }
                    None => break,
                },
            }
        }
        let result = self.build(timed_out);
        if timed_out {
            info!(
                correlation_id = ?result.correlation_id(),
                missing = ?result.missing,
                collected = result.acknowledgements.acknowledgements.len(),
                "Acknowledgement aggregation timed out, reporting partial result"
            );
        }
        result
    }
}
