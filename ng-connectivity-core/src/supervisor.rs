//! Restart supervision of client actors.
//!
//! A supervised client is restarted with exponential backoff whenever its actor ends
//! unexpectedly. Each restart starts from the latest connection value. While no actor
//! is running, commands are answered immediately with `ConnectionUnavailable` carrying
//! the command's own headers.

use crate::{
    client::{ClientActor, ClientCommand, ClientContext, ClientExit, ClientMode, ConnectorRegistry},
    logs::ConnectionLogger,
    metrics::ConnectionMetrics,
};
use arc_swap::{ArcSwap, ArcSwapOption};
use futures::FutureExt;
use ng_connectivity_models::{settings::SupervisorConfig, Connection, ConnectionId};
use ng_connectivity_sdk::ConnectivityError;
use rand::Rng;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Doublings beyond this add nothing but overflow risk.
const MAX_EXPONENT: u32 = 30;

const MAILBOX_CAPACITY: usize = 256;

/// `min(max, min * 2^restart_count * jitter)` with the exponent capped.
pub fn backoff_delay(min: Duration, max: Duration, restart_count: u32, jitter: f64) -> Duration {
    let exponent = restart_count.min(MAX_EXPONENT);
    let factor = 2f64.powi(exponent as i32) * jitter.max(1.0);
    let millis = (min.as_millis() as f64 * factor).min(max.as_millis() as f64);
    Duration::from_millis(millis as u64).min(max)
}

/// Restart counter of one supervised client.
#[derive(Debug)]
pub struct Backoff {
    config: SupervisorConfig,
    restart_count: Arc<AtomicU32>,
}

impl Backoff {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            restart_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Acquire)
    }

    /// Delay before the next restart; advances the counter.
    pub fn next_delay(&self) -> Duration {
        let count = self.restart_count.fetch_add(1, Ordering::AcqRel);
        let jitter = if self.config.random_factor > 0.0 {
            rand::thread_rng().gen_range(1.0..1.0 + self.config.random_factor)
        } else {
            1.0
        };
        backoff_delay(
            Duration::from_millis(self.config.min_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
            count,
            jitter,
        )
    }

    pub fn reset_handle(&self) -> BackoffReset {
        BackoffReset(Arc::clone(&self.restart_count))
    }
}

/// Lets a client report a completed initialization, zeroing the restart counter.
#[derive(Debug, Clone)]
pub struct BackoffReset(Arc<AtomicU32>);

impl BackoffReset {
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// A client actor kept alive across failures.
///
/// The mailbox of the first actor exists as soon as the client is spawned, so commands
/// sent right away queue up for it. Between a failure and the restart there is no
/// mailbox and commands fail fast; commands still queued for the failed actor are
/// answered the same way.
pub struct SupervisedClient {
    connection_id: ConnectionId,
    index: usize,
    connection: Arc<ArcSwap<Connection>>,
    mailbox: Arc<ArcSwapOption<mpsc::Sender<ClientCommand>>>,
    metrics: Arc<ConnectionMetrics>,
    logger: ConnectionLogger,
    restarts: BackoffReset,
    shutdown: CancellationToken,
}

impl SupervisedClient {
    /// Starts the supervision loop for client `index` of `connection`.
    pub fn spawn(
        index: usize,
        connection: Arc<Connection>,
        registry: ConnectorRegistry,
        context: ClientContext,
        parent: &CancellationToken,
    ) -> Self {
        let connection_id = connection.id.clone();
        let connection = Arc::new(ArcSwap::new(connection));
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let mailbox = Arc::new(ArcSwapOption::from_pointee(tx));
        let metrics = Arc::new(ConnectionMetrics::default());
        let logger = ConnectionLogger::new(context.settings.connectivity.logs.capacity);
        let shutdown = parent.child_token();
        let backoff = Backoff::new(context.settings.connectivity.supervisor);
        let restarts = backoff.reset_handle();

        let supervision = Supervision {
            index,
            connection: Arc::clone(&connection),
            mailbox: Arc::clone(&mailbox),
            metrics: Arc::clone(&metrics),
            logger: logger.clone(),
            backoff,
            registry,
            context,
            token: shutdown.clone(),
        };
        tokio::spawn(supervision.run(rx));

        Self {
            connection_id,
            index,
            connection,
            mailbox,
            metrics,
            logger,
            restarts,
            shutdown,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.mailbox.load().is_some()
    }

    /// Restarts since the last successful connect.
    pub fn restart_count(&self) -> u32 {
        self.restarts.count()
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    pub fn logger(&self) -> &ConnectionLogger {
        &self.logger
    }

    /// Connection value the next restarted actor starts from.
    pub fn connection(&self) -> Arc<Connection> {
        self.connection.load_full()
    }

    pub fn update_connection(&self, connection: Arc<Connection>) {
        self.connection.store(connection);
    }

    /// Hands `command` to the running actor, or fails it right away.
    pub async fn send(&self, command: ClientCommand) {
        let Some(mailbox) = self.mailbox.load_full() else {
            command.fail(unavailable(&self.connection_id));
            return;
        };
        if let Err(e) = mailbox.send(command).await {
            e.0.fail(unavailable(&self.connection_id));
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SupervisedClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn unavailable(connection_id: &ConnectionId) -> ConnectivityError {
    ConnectivityError::ConnectionUnavailable {
        connection_id: connection_id.to_string(),
    }
}

/// State of one supervision loop.
struct Supervision {
    index: usize,
    connection: Arc<ArcSwap<Connection>>,
    mailbox: Arc<ArcSwapOption<mpsc::Sender<ClientCommand>>>,
    metrics: Arc<ConnectionMetrics>,
    logger: ConnectionLogger,
    backoff: Backoff,
    registry: ConnectorRegistry,
    context: ClientContext,
    token: CancellationToken,
}

impl Supervision {
    async fn run(self, first: mpsc::Receiver<ClientCommand>) {
        let index = self.index;
        let connection_id = self.connection.load().id.clone();
        let mut next = Some(first);
        loop {
            let mut rx = match next.take() {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
                    self.mailbox.store(Some(Arc::new(tx)));
                    rx
                }
            };
            let exit = self.run_actor(&mut rx).await;
            self.mailbox.store(None);
            rx.close();
            while let Ok(command) = rx.try_recv() {
                command.fail(unavailable(&connection_id));
            }

            if self.token.is_cancelled() {
                break;
            }
            match exit {
                ClientExit::Stopped => {
                    debug!(%connection_id, client = index, "Client actor stopped");
                    break;
                }
                ClientExit::Failed(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        %connection_id,
                        client = index,
                        restart_count = self.backoff.restart_count(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Client actor failed, restarting after backoff"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        info!(%connection_id, client = index, "Client supervision ended");
    }

    /// Runs one actor on the latest connection value until it ends.
    async fn run_actor(&self, rx: &mut mpsc::Receiver<ClientCommand>) -> ClientExit {
        let connection = self.connection.load_full();
        let connector = match self.registry.create(&connection) {
            Ok(connector) => connector,
            Err(e) => return ClientExit::Failed(e),
        };
        let actor = ClientActor::new(
            self.index,
            ClientMode::Standard,
            connection,
            connector,
            self.context.clone(),
            Arc::clone(&self.metrics),
            self.logger.clone(),
            Some(self.backoff.reset_handle()),
            self.token.child_token(),
        );
        match AssertUnwindSafe(actor.run_with(rx)).catch_unwind().await {
            Ok(exit) => exit,
            Err(_) => ClientExit::Failed(ConnectivityError::Internal {
                message: "client actor panicked".to_string(),
            }),
        }
    }
}
