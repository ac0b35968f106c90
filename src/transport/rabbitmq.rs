#![forbid(unsafe_code)]

use crate::config::{PollSettings, SiteConfig};
use crate::retry::ConnectRetryPolicy;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_executor_trait::Tokio as TokioExecutor;
use url::Url;
use uuid::Uuid;

const TARGET: &str = "condor_monitor::rabbitmq";
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Exchange, queue and routing key shared with the producer side. There is
/// no discovery: both sides derive the names from the virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl BrokerTopology {
    pub fn for_vhost(vhost: &str) -> Self {
        Self {
            exchange: format!("{vhost}-condor-exchange"),
            queue: format!("{vhost}-condor-stats"),
            routing_key: format!("{vhost}-condor"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker for site `{site}` unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        site: String,
        attempts: u32,
        reason: String,
    },
    #[error("failed to bind `{queue}` on exchange `{exchange}`: {reason}")]
    Topology {
        exchange: String,
        queue: String,
        reason: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

impl BrokerError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Connection parameters shared by consumers and publishers.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub retry: ConnectRetryPolicy,
    pub attempt_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry: ConnectRetryPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl ConnectOptions {
    pub fn from_settings(settings: &PollSettings) -> Self {
        Self {
            retry: ConnectRetryPolicy::from_settings(settings),
            attempt_timeout: settings.connect_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SiteDelivery {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

impl From<Delivery> for SiteDelivery {
    fn from(delivery: Delivery) -> Self {
        Self {
            body: delivery.data,
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
        }
    }
}

/// Receive side of one site's queue.
#[async_trait]
pub trait SiteConsumer: Send + 'static {
    /// Waits for the next delivery. `Ok(None)` means the stream ended.
    async fn next_delivery(&mut self) -> Result<Option<SiteDelivery>, BrokerError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn close(&mut self) {}
}

/// One connection to one site's virtual host, bound to its stats queue.
pub struct BrokerSession {
    site: SiteConfig,
    topology: BrokerTopology,
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

impl BrokerSession {
    pub async fn connect(site: SiteConfig, options: ConnectOptions) -> Result<Self, BrokerError> {
        let (connection, attempts) = open_connection(&site, &options).await?;
        let topology = BrokerTopology::for_vhost(&site.virtual_host);

        let channel = connection.create_channel().await.map_err(|err| {
            BrokerError::transport(format!("failed to open channel: {err}"))
        })?;

        declare_topology(&channel, &topology).await?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|err| BrokerError::transport(format!("failed to configure prefetch: {err}")))?;

        let consumer_tag = format!("condor-monitor-{}-{}", site.name, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &topology.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::Topology {
                exchange: topology.exchange.clone(),
                queue: topology.queue.clone(),
                reason: format!("failed to start consumer: {err}"),
            })?;

        tracing::info!(
            target: TARGET,
            event = "session_connected",
            site = %site.name,
            vhost = %site.virtual_host,
            queue = %topology.queue,
            attempts = attempts
        );

        Ok(Self {
            site,
            topology,
            connection,
            channel,
            consumer,
        })
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }
}

#[async_trait]
impl SiteConsumer for BrokerSession {
    async fn next_delivery(&mut self) -> Result<Option<SiteDelivery>, BrokerError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(SiteDelivery::from(delivery))),
            Some(Err(err)) => Err(BrokerError::transport(format!(
                "consumer error on `{}`: {err}",
                self.topology.queue
            ))),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| BrokerError::transport(format!("ack failed: {err}")))
    }

    async fn close(&mut self) {
        if let Err(err) = self.connection.close(200, "poll complete").await {
            tracing::debug!(
                target: TARGET,
                event = "session_close_failed",
                site = %self.site.name,
                error = %err
            );
        }
    }
}

/// Publish side of one site's exchange.
pub struct BrokerPublisher {
    topology: BrokerTopology,
    connection: Connection,
    channel: Channel,
}

impl BrokerPublisher {
    pub async fn connect(site: SiteConfig, options: ConnectOptions) -> Result<Self, BrokerError> {
        let (connection, _) = open_connection(&site, &options).await?;
        let topology = BrokerTopology::for_vhost(&site.virtual_host);

        let channel = connection.create_channel().await.map_err(|err| {
            BrokerError::transport(format!("failed to open channel: {err}"))
        })?;

        declare_topology(&channel, &topology).await?;

        Ok(Self {
            topology,
            connection,
            channel,
        })
    }

    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }

    pub async fn publish_json(&self, payload: &serde_json::Value) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| BrokerError::Publish(format!("failed to serialise payload: {err}")))?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_content_encoding(ShortString::from("utf-8"))
            .with_delivery_mode(2);

        self.channel
            .basic_publish(
                &self.topology.exchange,
                &self.topology.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|err| BrokerError::Publish(err.to_string()))?
            .await
            .map_err(|err| BrokerError::Publish(format!("publish not confirmed: {err}")))?;

        Ok(())
    }

    pub async fn close(self) {
        if let Err(err) = self.connection.close(200, "publish complete").await {
            tracing::debug!(target: TARGET, event = "publisher_close_failed", error = %err);
        }
    }
}

async fn open_connection(
    site: &SiteConfig,
    options: &ConnectOptions,
) -> Result<(Connection, u32), BrokerError> {
    validate_url(&site.broker_url).map_err(|reason| BrokerError::Unreachable {
        site: site.name.clone(),
        attempts: 0,
        reason,
    })?;

    let mut last_attempt = 0;
    let result = options
        .retry
        .run(|attempt| {
            last_attempt = attempt;
            let url = site.broker_url.clone();
            let attempt_timeout = options.attempt_timeout;
            async move {
                let properties =
                    ConnectionProperties::default().with_executor(TokioExecutor::current());
                match timeout(attempt_timeout, Connection::connect(&url, properties)).await {
                    Ok(Ok(connection)) => Ok(connection),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(format!("connect timed out after {attempt_timeout:?}")),
                }
            }
        })
        .await;

    match result {
        Ok(connection) => Ok((connection, last_attempt)),
        Err((reason, attempts)) => {
            tracing::warn!(
                target: TARGET,
                event = "connect_failed",
                site = %site.name,
                vhost = %site.virtual_host,
                attempts = attempts,
                error = %reason
            );
            Err(BrokerError::Unreachable {
                site: site.name.clone(),
                attempts,
                reason,
            })
        }
    }
}

async fn declare_topology(channel: &Channel, topology: &BrokerTopology) -> Result<(), BrokerError> {
    let topology_error = |reason: String| BrokerError::Topology {
        exchange: topology.exchange.clone(),
        queue: topology.queue.clone(),
        reason,
    };

    channel
        .exchange_declare(
            &topology.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| topology_error(format!("exchange declare failed: {err}")))?;

    channel
        .queue_declare(
            &topology.queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| topology_error(format!("queue declare failed: {err}")))?;

    channel
        .queue_bind(
            &topology.queue,
            &topology.exchange,
            &topology.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| topology_error(format!("queue bind failed: {err}")))?;

    Ok(())
}

/// Rejects URLs lapin could never connect to, so they fail without retrying.
pub fn validate_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|err| format!("invalid broker url: {err}"))?;
    match url.scheme() {
        "amqp" | "amqps" => {}
        other => return Err(format!("unsupported broker url scheme `{other}`")),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("broker url has no host".to_string());
    }
    Ok(())
}
