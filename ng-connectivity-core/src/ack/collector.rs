use super::aggregator::AggregatedAcknowledgements;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};

/// Response that can be judged as success or failure.
pub trait Collectable {
    fn is_failure(&self) -> bool;
}

impl Collectable for AggregatedAcknowledgements {
    fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl<T, E> Collectable for Result<T, E> {
    fn is_failure(&self) -> bool {
        self.is_err()
    }
}

enum CollectorInput<T> {
    Count(usize),
    Response(T),
}

/// What a [`ResponseCollector`] gathered.
#[derive(Debug, Clone)]
pub struct CollectorOutput<T> {
    pub expected: Option<usize>,
    /// Responses in arrival order
    pub responses: Vec<T>,
    pub timed_out: bool,
}

impl<T> CollectorOutput<T> {
    pub fn is_complete(&self) -> bool {
        self.expected.is_some_and(|n| self.responses.len() >= n)
    }
}

impl<T: Collectable> CollectorOutput<T> {
    /// First failing response by arrival.
    pub fn first_failure(&self) -> Option<&T> {
        self.responses.iter().find(|r| r.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.is_complete() && self.first_failure().is_none()
    }
}

/// Collects a number of responses that may only become known after some arrived.
///
/// Completes once the count is set and reached, on timeout, or when every handle is
/// dropped; the last two report whatever was collected.
pub struct ResponseCollector<T> {
    tx: mpsc::UnboundedSender<CollectorInput<T>>,
}

impl<T> Clone for ResponseCollector<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Send + 'static> ResponseCollector<T> {
    pub fn spawn(timeout: Duration) -> (Self, oneshot::Receiver<CollectorOutput<T>>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CollectorInput<T>>();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut output = CollectorOutput {
                expected: None,
                responses: Vec::new(),
                timed_out: false,
            };
            let deadline = sleep(timeout);
            tokio::pin!(deadline);
            while !output.is_complete() {
                tokio::select! {
                    _ = &mut deadline => {
                        output.timed_out = true;
                        break;
                    }
                    input = rx.recv() => match input {
                        Some(CollectorInput::Count(n)) => output.expected = Some(n),
                        Some(CollectorInput::Response(r)) => output.responses.push(r),
                        None => break,
                    },
                }
            }
            let _ = done_tx.send(output);
        });
        (Self { tx }, done_rx)
    }

    pub fn set_count(&self, count: usize) {
        let _ = self.tx.send(CollectorInput::Count(count));
    }

    pub fn push(&self, response: T) {
        let _ = self.tx.send(CollectorInput::Response(response));
    }
}
