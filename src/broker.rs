//! Process-wide Redis connections used by every job queue.
//!
//! A [`Broker`] is created once at process start and handed to each queue.
//! It owns three handles that share one configuration but differ in role:
//!
//! - [`CommandConnection`]: ordinary reads and writes (job hashes, lists, scripts)
//! - [`SubscriberConnection`]: pub/sub subscriptions for queue events
//! - [`PublisherConnection`]: `PUBLISH` of queue events
//!
//! Each handle only exposes the operations of its role. A connection in
//! subscribe mode cannot issue ordinary commands, so mixing roles is ruled out
//! by the types rather than checked at run time.
//!
//! # Readiness
//!
//! The command and publish handles connect lazily on first use. While the
//! server is unreachable the first command keeps retrying the handshake
//! instead of failing fast, so submissions issued during process start are
//! not lost. Once established, reconnects are handled by
//! [`redis::aio::ConnectionManager`].

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{FromRedisValue, ScriptInvocation};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// First delay between handshake attempts while the server is unreachable.
const INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for the delay between handshake attempts.
const MAX_CONNECT_DELAY: Duration = Duration::from_secs(5);

/// Shared connection provider holding the three role-specific handles.
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    commands: CommandConnection,
    subscriber: SubscriberConnection,
    publisher: PublisherConnection,
    closed: Arc<watch::Sender<bool>>,
}

impl Broker {
    /// Creates the provider. No network traffic happens until the first command.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Redis` if the configuration does not form a valid
    /// connection URL.
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.redis_url())?;
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        info!(url = %config.display_url(), prefix = %config.prefix, "Broker configured");

        Ok(Self {
            commands: CommandConnection {
                inner: LazyConnection::new("command", client.clone(), Arc::clone(&closed)),
            },
            subscriber: SubscriberConnection {
                client: client.clone(),
                closed: Arc::clone(&closed),
            },
            publisher: PublisherConnection {
                inner: LazyConnection::new("publish", client, Arc::clone(&closed)),
            },
            config: Arc::new(config),
            closed,
        })
    }

    /// Creates the provider from `REDIS_*` environment variables.
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::new(BrokerConfig::from_env()?)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Key prefix shared by all queues on this broker.
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn commands(&self) -> CommandConnection {
        self.commands.clone()
    }

    pub fn subscriber(&self) -> SubscriberConnection {
        self.subscriber.clone()
    }

    pub fn publisher(&self) -> PublisherConnection {
        self.publisher.clone()
    }

    /// Round-trips a `PING` on the command connection.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        self.commands.ping().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Closes all three handles.
    ///
    /// Pending handshakes are abandoned, later commands fail with
    /// `BrokerError::Closed` and open subscriptions end. Idempotent.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        self.commands.inner.release().await;
        self.publisher.inner.release().await;
        info!("Broker connections closed");
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("url", &self.config.display_url())
            .field("prefix", &self.config.prefix)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
///
/// Only the binary entry point should await this and close the broker;
/// library code never installs signal handlers.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// A connection manager that is established on first use.
#[derive(Clone)]
struct LazyConnection {
    role: &'static str,
    client: redis::Client,
    slot: Arc<Mutex<Option<ConnectionManager>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl LazyConnection {
    fn new(role: &'static str, client: redis::Client, closed: Arc<watch::Sender<bool>>) -> Self {
        Self {
            role,
            client,
            slot: Arc::new(Mutex::new(None)),
            closed,
        }
    }

    /// Returns a handle to the managed connection, waiting for the handshake
    /// if necessary. Concurrent callers share a single handshake.
    async fn get(&self) -> Result<ConnectionManager, BrokerError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(BrokerError::Closed);
        }

        tokio::select! {
            result = self.establish() => result,
            _ = closed.wait_for(|closed| *closed) => Err(BrokerError::Closed),
        }
    }

    async fn establish(&self) -> Result<ConnectionManager, BrokerError> {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let mut delay = INITIAL_CONNECT_DELAY;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match ConnectionManager::new(self.client.clone()).await {
                Ok(conn) => {
                    info!(role = self.role, attempt, "Broker connection ready");
                    *slot = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) if is_transient(&e) => {
                    warn!(
                        role = self.role,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker not reachable yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_CONNECT_DELAY);
                }
                Err(e) => return Err(BrokerError::Redis(e)),
            }
        }
    }

    async fn release(&self) {
        if self.slot.lock().await.take().is_some() {
            debug!(role = self.role, "Released broker connection");
        }
    }
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped()
}

/// General-purpose handle for ordinary commands.
#[derive(Clone)]
pub struct CommandConnection {
    inner: LazyConnection,
}

impl CommandConnection {
    /// Runs a single command.
    pub async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, BrokerError> {
        let mut conn = self.inner.get().await?;
        Ok(cmd.query_async(&mut conn).await?)
    }

    /// Runs a pipeline and returns its replies.
    pub async fn query_pipeline<T: FromRedisValue>(
        &self,
        pipe: &redis::Pipeline,
    ) -> Result<T, BrokerError> {
        let mut conn = self.inner.get().await?;
        Ok(pipe.query_async(&mut conn).await?)
    }

    /// Runs a Lua script, loading it on the server if needed.
    pub async fn invoke<T: FromRedisValue>(
        &self,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T, BrokerError> {
        let mut conn = self.inner.get().await?;
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        debug!(reply = %reply, "Broker ping");
        Ok(())
    }
}

/// Handle dedicated to publishing events.
#[derive(Clone)]
pub struct PublisherConnection {
    inner: LazyConnection,
}

impl PublisherConnection {
    /// Publishes a message and returns the number of subscribers that got it.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<usize, BrokerError> {
        let mut conn = self.inner.get().await?;
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }
}

/// Handle dedicated to pub/sub subscriptions.
///
/// Every subscription gets its own connection in subscribe mode, which is
/// never used for anything else.
#[derive(Clone)]
pub struct SubscriberConnection {
    client: redis::Client,
    closed: Arc<watch::Sender<bool>>,
}

impl SubscriberConnection {
    /// Opens a subscription to one channel.
    ///
    /// Also returns a receiver that flips to `true` when the broker closes,
    /// so the caller can end its stream.
    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<(redis::aio::PubSub, watch::Receiver<bool>), BrokerError> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(BrokerError::Closed);
        }

        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Subscribed to broker channel");

        Ok((pubsub, closed))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
