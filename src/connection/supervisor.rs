use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerSettings;
use crate::topology::{Topology, TopologyManager};
use crate::transport::{Channel, Connection, Connector, LifecycleEvent, LifecycleReceiver};
use crate::utils::error::BrokerError;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl From<&BrokerSettings> for SupervisorConfig {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            url: settings.url.clone(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
        }
    }
}

/// Point-in-time view of the link, for health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub connected: bool,
    pub channel_open: bool,
    pub reconnect_attempts: u32,
}

/// Restarts consumers on a fresh channel after reconnection.
#[async_trait]
pub trait Resubscribe: Send + Sync {
    async fn resubscribe(&self, channel: Arc<dyn Channel>) -> Result<(), BrokerError>;
}

#[derive(Default)]
struct Link {
    connection: Option<Arc<dyn Connection>>,
    channel: Option<Arc<dyn Channel>>,
}

struct Inner {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    topology: Topology,
    link: Mutex<Link>,
    connected: AtomicBool,
    attempts: AtomicU32,
    reconnecting: AtomicBool,
    /// Set by every failure observer, cleared by the loop that handles it.
    failure_pending: AtomicBool,
    shutdown: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    resubscriber: OnceLock<Arc<dyn Resubscribe>>,
}

/// Owns the connection and channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the reconnecting flag even if the loop task is aborted.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn next_event(events: &mut LifecycleReceiver) -> LifecycleEvent {
    loop {
        match events.recv().await {
            Ok(event) => return event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return LifecycleEvent::Closed,
        }
    }
}

impl ConnectionSupervisor {
    pub fn new(config: SupervisorConfig, connector: Arc<dyn Connector>, topology: Topology) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                topology,
                link: Mutex::new(Link::default()),
                connected: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                reconnecting: AtomicBool::new(false),
                failure_pending: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
                watcher: Mutex::new(None),
                resubscriber: OnceLock::new(),
            }),
        }
    }

    /// Registers what to restart after a reconnect. Only the first call takes effect.
    pub fn set_resubscriber(&self, resubscriber: Arc<dyn Resubscribe>) {
        if self.inner.resubscriber.set(resubscriber).is_err() {
            warn!("Resubscriber already set, ignoring");
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Opens the link and provisions topology. No-op when already connected.
    ///
    /// Failure is returned to the caller and never retried here; only a link
    /// lost after a successful connect triggers reconnection.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.inner.shutdown.store(false, Ordering::SeqCst);
        self.establish().await?;
        self.inner.attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn establish(&self) -> Result<(), BrokerError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_ready() {
            debug!("Already connected to broker");
            return Ok(());
        }

        let connection = self
            .inner
            .connector
            .connect(&self.inner.config.url)
            .await
            .map_err(BrokerError::StartupConnection)?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(BrokerError::StartupConnection(e));
            }
        };

        let connection_events = connection.lifecycle();
        let channel_events = channel.lifecycle();

        if let Err(e) = TopologyManager::declare(channel.as_ref(), &self.inner.topology).await {
            let _ = channel.close().await;
            let _ = connection.close().await;
            return Err(e);
        }

        {
            let mut link = lock(&self.inner.link);
            link.connection = Some(connection);
            link.channel = Some(channel);
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        self.spawn_watcher(connection_events, channel_events);

        info!("Connected to broker");
        Ok(())
    }

    fn spawn_watcher(&self, mut connection_events: LifecycleReceiver, mut channel_events: LifecycleReceiver) {
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            let event = tokio::select! {
                event = next_event(&mut connection_events) => event,
                event = next_event(&mut channel_events) => event,
            };
            supervisor.handle_failure(event).await;
        });

        // a previous watcher is either finished or is the task running this reconnect
        lock(&self.inner.watcher).replace(handle);
    }

    async fn handle_failure(&self, event: LifecycleEvent) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        match &event {
            LifecycleEvent::Error(reason) => {
                warn!(error = %reason, "Broker connection error")
            }
            LifecycleEvent::Closed => warn!("Broker connection closed unexpectedly"),
        }

        self.drop_link();
        self.inner.failure_pending.store(true, Ordering::SeqCst);
        self.reconnect().await;
    }

    fn drop_link(&self) {
        let mut link = lock(&self.inner.link);
        link.channel = None;
        link.connection = None;
    }

    /// Best-effort teardown of a link that came up but cannot be used.
    async fn discard_link(&self) {
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        let (channel, connection) = {
            let mut link = lock(&self.inner.link);
            (link.channel.take(), link.connection.take())
        };
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        if let Some(connection) = connection {
            let _ = connection.close().await;
        }
    }

    /// Bounded reconnection loop.
    ///
    /// Each attempt waits the fixed delay first. The attempt counter keeps
    /// climbing across an outage and is reset only once the link and the
    /// consumers are back. At the ceiling the loop stops and the broker stays
    /// disconnected until `connect` is called again.
    pub async fn reconnect(&self) {
        loop {
            if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
                debug!("Reconnection already in progress");
                return;
            }
            {
                let _guard = ReconnectGuard(&self.inner.reconnecting);
                self.reconnect_loop().await;
            }

            // a failure reported after the loop's last check found it still running
            if self.inner.shutdown.load(Ordering::SeqCst)
                || !self.inner.failure_pending.load(Ordering::SeqCst)
            {
                return;
            }
        }
    }

    async fn reconnect_loop(&self) {
        let max = self.inner.config.max_reconnect_attempts;
        let delay = self.inner.config.reconnect_delay;

        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                debug!("Supervisor closed, reconnection abandoned");
                return;
            }

            let attempts = self.inner.attempts.load(Ordering::SeqCst);
            if attempts >= max {
                self.inner.failure_pending.store(false, Ordering::SeqCst);
                error!(
                    attempts,
                    "Reconnection attempts exhausted, broker stays disconnected until restarted or reconnected manually"
                );
                return;
            }

            let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                attempt,
                max_attempts = max,
                delay_ms = delay.as_millis() as u64,
                "Scheduling broker reconnection"
            );
            tokio::time::sleep(delay).await;

            if self.inner.shutdown.load(Ordering::SeqCst) {
                debug!("Supervisor closed during reconnect delay");
                return;
            }

            self.inner.failure_pending.store(false, Ordering::SeqCst);
            match self.restore().await {
                Ok(()) if self.inner.failure_pending.load(Ordering::SeqCst) || !self.is_ready() => {
                    warn!(attempt, "Link lost again while restoring consumers");
                }
                Ok(()) => {
                    self.inner.attempts.store(0, Ordering::SeqCst);
                    info!(attempt, "Reconnected to broker");
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Reconnection attempt failed");
                }
            }
        }
    }

    async fn restore(&self) -> Result<(), BrokerError> {
        self.establish().await.map_err(BrokerError::into_transient)?;

        let (Some(resubscriber), Some(channel)) = (self.inner.resubscriber.get(), self.channel())
        else {
            return Ok(());
        };
        if let Err(e) = resubscriber.resubscribe(channel).await {
            // consumers are part of being back; tear down and retry
            self.discard_link().await;
            return Err(e);
        }
        Ok(())
    }

    /// Releases channel then connection. Liveness is false afterwards even if
    /// a release fails; the first failure is returned.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }

        let (channel, connection) = {
            let mut link = lock(&self.inner.link);
            (link.channel.take(), link.connection.take())
        };

        let mut first_error = None;
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close channel");
                first_error.get_or_insert(e);
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close connection");
                first_error.get_or_insert(e);
            }
        }

        self.inner.connected.store(false, Ordering::SeqCst);
        info!("Broker connection closed");

        match first_error {
            Some(e) => Err(BrokerError::TransientConnection(e)),
            None => Ok(()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && lock(&self.inner.link).channel.is_some()
    }

    /// The live channel, if ready. Callers must not hold it across operations
    /// without re-checking readiness.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return None;
        }
        lock(&self.inner.link).channel.clone()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected: self.inner.connected.load(Ordering::SeqCst),
            channel_open: lock(&self.inner.link).channel.is_some(),
            reconnect_attempts: self.inner.attempts.load(Ordering::SeqCst),
        }
    }
}
