//! Connection registry with bounded retry on first connect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::{ConfigError, ConfigSource, parse_or};
use crate::transport::{BrokerError, Connector, MessageChannel, MessageConnection};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Where and how persistently to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub url: String,
    pub max_attempts: u32,
    /// Fixed wait between failed attempts.
    pub backoff: Duration,
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Read `RABBITMQ_URL`, `MQ_CONNECT_MAX_ATTEMPTS` and `MQ_CONNECT_BACKOFF_SECS`.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, ConfigError> {
        let url = source.required("RABBITMQ_URL")?;
        let max_attempts = parse_or(source, "MQ_CONNECT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "MQ_CONNECT_MAX_ATTEMPTS".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let backoff_secs = parse_or(source, "MQ_CONNECT_BACKOFF_SECS", DEFAULT_BACKOFF.as_secs())?;
        Ok(Self {
            url,
            max_attempts,
            backoff: Duration::from_secs(backoff_secs),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {service} failed after {attempts} attempts")]
    RetriesExhausted {
        service: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("could not open a channel for {service}")]
    Channel {
        service: String,
        #[source]
        source: BrokerError,
    },
}

/// One memoized connection and channel per logical service name.
///
/// Owned by the composition root and shared by `Arc`; there is no
/// process-wide instance. Connecting holds only the lock of the service
/// being connected, so a broker outage retried for one service does not
/// block lookups for the others.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    connections: Mutex<HashMap<String, Arc<dyn MessageConnection>>>,
    channels: Mutex<HashMap<String, Arc<dyn MessageChannel>>>,
    service_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        Self {
            connector,
            settings,
            connections: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            service_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    async fn service_lock(&self, service: &str) -> Arc<Mutex<()>> {
        let mut locks = self.service_locks.lock().await;
        Arc::clone(locks.entry(service.to_string()).or_default())
    }

    async fn cached_connection(&self, service: &str) -> Option<Arc<dyn MessageConnection>> {
        self.connections.lock().await.get(service).cloned()
    }

    async fn cached_channel(&self, service: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.lock().await.get(service).cloned()
    }

    /// The connection for `service`, connecting on first use.
    pub async fn get_connection(
        &self,
        service: &str,
    ) -> Result<Arc<dyn MessageConnection>, ConnectionError> {
        if let Some(connection) = self.cached_connection(service).await {
            return Ok(connection);
        }
        let lock = self.service_lock(service).await;
        let _guard = lock.lock().await;
        self.connection_for(service).await
    }

    /// Caller holds the service lock.
    async fn connection_for(
        &self,
        service: &str,
    ) -> Result<Arc<dyn MessageConnection>, ConnectionError> {
        if let Some(connection) = self.cached_connection(service).await {
            return Ok(connection);
        }
        let connection = self.connect_with_retry(service).await?;
        self.connections
            .lock()
            .await
            .insert(service.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    /// The channel for `service`, opened on the service's connection on first use.
    pub async fn get_channel(
        &self,
        service: &str,
    ) -> Result<Arc<dyn MessageChannel>, ConnectionError> {
        if let Some(channel) = self.cached_channel(service).await {
            return Ok(channel);
        }
        let lock = self.service_lock(service).await;
        let _guard = lock.lock().await;
        if let Some(channel) = self.cached_channel(service).await {
            return Ok(channel);
        }

        let connection = self.connection_for(service).await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|source| ConnectionError::Channel {
                service: service.to_string(),
                source,
            })?;
        self.channels
            .lock()
            .await
            .insert(service.to_string(), Arc::clone(&channel));
        tracing::debug!(service = %service, "Opened channel");
        Ok(channel)
    }

    /// Close and forget the channel and connection of `service`, so the
    /// next lookup reconnects.
    pub async fn evict(&self, service: &str) {
        let lock = self.service_lock(service).await;
        let _guard = lock.lock().await;

        let channel = self.channels.lock().await.remove(service);
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                tracing::debug!(service = %service, error = %e, "Stale channel did not close");
            }
        }
        let connection = self.connections.lock().await.remove(service);
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                tracing::debug!(service = %service, error = %e, "Stale connection did not close");
            }
        }
        tracing::info!(service = %service, "Evicted broker connection");
    }

    async fn connect_with_retry(
        &self,
        service: &str,
    ) -> Result<Arc<dyn MessageConnection>, ConnectionError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect(&self.settings.url).await {
                Ok(connection) => {
                    tracing::info!(service = %service, attempt, "Connected to message broker");
                    return Ok(connection);
                }
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(
                        category = "connection",
                        service = %service,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Broker connection failed, retrying in {:?}",
                        self.settings.backoff
                    );
                    tokio::time::sleep(self.settings.backoff).await;
                }
                Err(source) => {
                    tracing::error!(
                        category = "connection",
                        service = %service,
                        attempts = attempt,
                        error = %source,
                        "Giving up on broker connection"
                    );
                    return Err(ConnectionError::RetriesExhausted {
                        service: service.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Close every cached channel, then every cached connection.
    ///
    /// Failures are logged and do not stop the sweep.
    pub async fn shutdown(&self) {
        let channels: Vec<(String, Arc<dyn MessageChannel>)> =
            self.channels.lock().await.drain().collect();
        for (service, channel) in channels {
            if let Err(e) = channel.close().await {
                tracing::warn!(service = %service, error = %e, "Failed to close channel");
            }
        }

        let connections: Vec<(String, Arc<dyn MessageConnection>)> =
            self.connections.lock().await.drain().collect();
        for (service, connection) in connections {
            if let Err(e) = connection.close().await {
                tracing::warn!(service = %service, error = %e, "Failed to close connection");
            }
        }
        tracing::info!("Message broker connections closed");
    }
}
