use async_trait::async_trait;
use ng_connectivity_sdk::{ConnectivityError, Signal};
use tokio::sync::mpsc;

/// Hands signals to the platform behind the connection.
#[async_trait]
pub trait SignalForwarder: Send + Sync {
    /// Forwards without waiting for any response.
    async fn forward(&self, signal: Signal) -> Result<(), ConnectivityError>;

    /// Forwards and streams every response and acknowledgement for the signal into
    /// `responses`. The sender is dropped once no further response will arrive.
    async fn forward_with_responses(
        &self,
        signal: Signal,
        responses: mpsc::Sender<Signal>,
    ) -> Result<(), ConnectivityError>;
}
